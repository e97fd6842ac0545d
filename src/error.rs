//! Error types for the edgequake-spool library.
//!
//! Every job ends in exactly one of two places: an
//! [`crate::output::ArtifactHandle`] in the result store, or a
//! [`SpoolConvError`]. The error carries structure, not just text:
//! [`SpoolConvError::kind`] returns a [`ErrorKind`] and
//! [`ErrorKind::category`] folds that into a coarse [`ErrorCategory`] so
//! nobody has to pattern-match on messages.
//!
//! Cleanup failures (temp artifacts, evicted store entries) are
//! absent from this enum: they are logged and swallowed and never change a
//! job's terminal status.

use crate::pipeline::spool::MalformedSpool;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All terminal errors returned by the edgequake-spool library.
#[derive(Debug, Error)]
pub enum SpoolConvError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Structural violation in the spool stream (zero-progress record,
    /// corrupt header) or a spool without any embedded metafile.
    #[error("Malformed spool data at offset {offset}: {reason}")]
    MalformedSpool { offset: usize, reason: String },

    /// Unknown job kind, or the file extension does not match the kind.
    #[error("Unsupported format: {detail}")]
    UnsupportedFormat { detail: String },

    // ── Converter errors ──────────────────────────────────────────────────
    /// An external converter exited non-zero or could not be started.
    #[error("Converter '{tool}' failed ({status}): {diagnostics}")]
    Conversion {
        tool: String,
        status: String,
        diagnostics: String,
    },

    /// An external converter exceeded its time bound and was killed.
    #[error("Converter '{tool}' timed out after {elapsed_ms}ms and was killed")]
    Timeout { tool: String, elapsed_ms: u64 },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Writing a temp artifact, the final artifact, or listing the store failed.
    #[error("Storage failure at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or capacity validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// A job task panicked or was aborted.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpoolConvError {
    /// Shorthand for wrapping an `io::Error` with the path it concerns.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpoolConvError::Storage {
            path: path.into(),
            source,
        }
    }

    pub fn unsupported(detail: impl Into<String>) -> Self {
        SpoolConvError::UnsupportedFormat {
            detail: detail.into(),
        }
    }

    /// Machine-readable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpoolConvError::MalformedSpool { .. } => ErrorKind::MalformedSpool,
            SpoolConvError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            SpoolConvError::Conversion { .. } => ErrorKind::Conversion,
            SpoolConvError::Timeout { .. } => ErrorKind::Timeout,
            SpoolConvError::Storage { .. } => ErrorKind::Storage,
            SpoolConvError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SpoolConvError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Captured converter stderr, when the error came from a converter.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            SpoolConvError::Conversion { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

impl From<MalformedSpool> for SpoolConvError {
    fn from(e: MalformedSpool) -> Self {
        SpoolConvError::MalformedSpool {
            offset: e.offset,
            reason: e.reason,
        }
    }
}

/// Classification of a [`SpoolConvError`], cheap to copy into job status
/// and serialise into reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedSpool,
    UnsupportedFormat,
    Conversion,
    Timeout,
    Storage,
    InvalidConfig,
    Internal,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::MalformedSpool | ErrorKind::UnsupportedFormat => ErrorCategory::BadInput,
            ErrorKind::Conversion => ErrorCategory::ToolFailure,
            ErrorKind::Timeout => ErrorCategory::Overload,
            ErrorKind::Storage => ErrorCategory::Storage,
            ErrorKind::InvalidConfig | ErrorKind::Internal => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MalformedSpool => "malformed_spool",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::Conversion => "conversion",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Storage => "storage",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Coarse grouping of [`ErrorKind`]s by who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The submitted bytes or declared kind are wrong; resubmitting won't help.
    BadInput,
    /// A converter rejected the input or crashed.
    ToolFailure,
    /// A converter ran past its bound.
    Overload,
    Storage,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_display_carries_diagnostics() {
        let e = SpoolConvError::Conversion {
            tool: "metafile_to_png".into(),
            status: "exit code 1".into(),
            diagnostics: "bad format".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("metafile_to_png"), "got: {msg}");
        assert!(msg.contains("bad format"), "got: {msg}");
        assert_eq!(e.diagnostics(), Some("bad format"));
        assert_eq!(e.kind(), ErrorKind::Conversion);
    }

    #[test]
    fn timeout_display() {
        let e = SpoolConvError::Timeout {
            tool: "pdf_to_png".into(),
            elapsed_ms: 60_000,
        };
        assert!(e.to_string().contains("60000ms"));
        assert_eq!(e.kind().category(), ErrorCategory::Overload);
        assert_eq!(e.diagnostics(), None);
    }

    #[test]
    fn malformed_spool_converts_from_extractor_error() {
        let e: SpoolConvError = MalformedSpool {
            offset: 24,
            reason: "record makes no forward progress".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::MalformedSpool);
        assert!(e.to_string().contains("offset 24"));
    }

    #[test]
    fn categories_separate_input_tool_and_overload() {
        assert_eq!(ErrorKind::MalformedSpool.category(), ErrorCategory::BadInput);
        assert_eq!(ErrorKind::UnsupportedFormat.category(), ErrorCategory::BadInput);
        assert_eq!(ErrorKind::Conversion.category(), ErrorCategory::ToolFailure);
        assert_eq!(ErrorKind::Timeout.category(), ErrorCategory::Overload);
    }

    #[test]
    fn error_kind_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorKind::MalformedSpool).unwrap();
        assert_eq!(json, "\"malformed_spool\"");
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
    }
}
