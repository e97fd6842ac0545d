//! Result types handed back to callers.

use crate::error::{ErrorKind, SpoolConvError};
use crate::job::{JobId, JobKind, JobStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// What kind of file a committed artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Png,
    PlainText,
}

impl ContentType {
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Png => "image/png",
            ContentType::PlainText => "text/plain; charset=utf-8",
        }
    }

    /// Extension used for the result-store file name.
    pub fn extension(self) -> &'static str {
        match self {
            ContentType::Png => "png",
            ContentType::PlainText => "txt",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// A committed job output in the result store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub job_id: JobId,
    /// Location inside the result store. May disappear later through eviction.
    pub path: PathBuf,
    pub content_type: ContentType,
    pub size_bytes: u64,
    /// Page outputs that went into the artifact (1 when nothing was merged).
    pub page_count: usize,
    pub duration_ms: u64,
}

/// Terminal report for one job, successful or not.
///
/// This is what batch callers (and `spoolconv --json`) receive: failures are
/// values here, not early returns, so one bad file never hides the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub original_name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl JobOutcome {
    pub fn from_result(
        job_id: JobId,
        original_name: String,
        kind: JobKind,
        result: Result<ArtifactHandle, SpoolConvError>,
    ) -> Self {
        match result {
            Ok(handle) => Self {
                job_id,
                original_name,
                kind,
                status: JobStatus::Succeeded,
                artifact: Some(handle),
                error: None,
                diagnostics: None,
            },
            Err(e) => Self {
                job_id,
                original_name,
                kind,
                status: JobStatus::Failed(e.kind()),
                artifact: None,
                diagnostics: e.diagnostics().map(str::to_string),
                error: Some(e.to_string()),
            },
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            JobStatus::Failed(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_mime_and_extension() {
        assert_eq!(ContentType::Png.mime(), "image/png");
        assert_eq!(ContentType::Png.extension(), "png");
        assert!(ContentType::PlainText.mime().starts_with("text/plain"));
        assert_eq!(ContentType::PlainText.extension(), "txt");
    }

    #[test]
    fn failed_outcome_keeps_kind_and_diagnostics() {
        let outcome = JobOutcome::from_result(
            JobId::new(),
            "a.spl".into(),
            JobKind::Spool,
            Err(SpoolConvError::Conversion {
                tool: "metafile_to_png".into(),
                status: "exit code 1".into(),
                diagnostics: "bad format".into(),
            }),
        );
        assert!(!outcome.is_success());
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Conversion));
        assert_eq!(outcome.diagnostics.as_deref(), Some("bad format"));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"]["state"], "failed");
        assert!(json.get("artifact").is_none());
    }
}
