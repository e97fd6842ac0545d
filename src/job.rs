//! Job model: what was submitted, which stages it runs, and where it stands.
//!
//! A job's stage list is fixed the moment its [`JobKind`] is known. Making
//! the list an explicit `Vec<Stage>` (rather than a chain of calls that only
//! exists in control flow) lets the orchestrator run every kind through one
//! loop and lets tests assert the plan without running a converter.

use crate::error::{ErrorKind, SpoolConvError};
use crate::output::ContentType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Opaque correlation token; also the result-store file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh random id of the form `job-<uuid>`.
    pub fn new() -> Self {
        Self(format!("job-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the caller submitted and what it wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// EMF spool capture → one stacked PNG of every embedded page.
    Spool,
    /// Single enhanced metafile → PNG.
    Metafile,
    /// PDF → one stacked PNG of every page.
    Pdf,
    /// PDF → plain text.
    PdfText,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Spool,
        JobKind::Metafile,
        JobKind::Pdf,
        JobKind::PdfText,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JobKind::Spool => "spool",
            JobKind::Metafile => "metafile",
            JobKind::Pdf => "pdf",
            JobKind::PdfText => "pdf-text",
        }
    }

    /// File extensions (lowercase, without dot) accepted for this kind.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            JobKind::Spool => &["spl", "emfspool"],
            JobKind::Metafile => &["emf"],
            JobKind::Pdf | JobKind::PdfText => &["pdf"],
        }
    }

    pub fn content_type(self) -> ContentType {
        match self {
            JobKind::PdfText => ContentType::PlainText,
            _ => ContentType::Png,
        }
    }

    /// Guess the kind from a file name. PDFs default to raster output.
    pub fn infer(original_name: &str) -> Option<Self> {
        let ext = extension_of(original_name)?;
        [JobKind::Spool, JobKind::Metafile, JobKind::Pdf]
            .into_iter()
            .find(|k| k.extensions().contains(&ext.as_str()))
    }

    /// Reject a file whose extension contradicts the declared kind.
    ///
    /// Names without an extension are accepted: transports often hand over
    /// anonymous blobs, and the converter will reject real garbage anyway.
    pub fn check_name(self, original_name: &str) -> Result<(), SpoolConvError> {
        match extension_of(original_name) {
            Some(ext) if !self.extensions().contains(&ext.as_str()) => {
                Err(SpoolConvError::unsupported(format!(
                    "'{original_name}' does not look like a {} input (expected .{})",
                    self.name(),
                    self.extensions().join(" or .")
                )))
            }
            _ => Ok(()),
        }
    }

    /// The ordered stages a job of this kind runs.
    pub fn stages(self) -> Vec<Stage> {
        match self {
            JobKind::Spool => vec![
                Stage::Ingest,
                Stage::Extract,
                Stage::Convert(ConverterKind::MetafileToPng),
                Stage::Merge,
                Stage::Finalize,
            ],
            JobKind::Metafile => vec![
                Stage::Ingest,
                Stage::Convert(ConverterKind::MetafileToPng),
                Stage::Merge,
                Stage::Finalize,
            ],
            JobKind::Pdf => vec![
                Stage::Ingest,
                Stage::Convert(ConverterKind::PdfToPng),
                Stage::Merge,
                Stage::Finalize,
            ],
            JobKind::PdfText => vec![
                Stage::Ingest,
                Stage::Convert(ConverterKind::PdfToText),
                Stage::Finalize,
            ],
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = SpoolConvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spool" | "spl" | "emfspool" => Ok(JobKind::Spool),
            "metafile" | "emf" => Ok(JobKind::Metafile),
            "pdf" | "raster" => Ok(JobKind::Pdf),
            "pdf-text" | "pdf_text" | "text" => Ok(JobKind::PdfText),
            other => Err(SpoolConvError::unsupported(format!("unknown job kind '{other}'"))),
        }
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Which converter a [`Stage::Convert`] calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterKind {
    MetafileToPng,
    PdfToPng,
    PdfToText,
}

impl ConverterKind {
    pub fn name(self) -> &'static str {
        match self {
            ConverterKind::MetafileToPng => "metafile_to_png",
            ConverterKind::PdfToPng => "pdf_to_png",
            ConverterKind::PdfToText => "pdf_to_text",
        }
    }
}

/// One step of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Write the submitted bytes to the job's scratch directory.
    Ingest,
    /// Split a spool capture into its embedded metafiles.
    Extract,
    /// Run a converter once per current input.
    Convert(ConverterKind),
    /// Stack several page outputs into one; skipped for a single page.
    Merge,
    /// Make room in the result store and commit the final artifact.
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ingest => f.write_str("ingest"),
            Stage::Extract => f.write_str("extract"),
            Stage::Convert(c) => write!(f, "convert:{}", c.name()),
            Stage::Merge => f.write_str("merge"),
            Stage::Finalize => f.write_str("finalize"),
        }
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed(ErrorKind),
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed(_))
    }
}
