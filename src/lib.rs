//! # edgequake-spool
//!
//! Turn print-spool captures, metafiles and PDFs into stored PNG or text
//! artifacts by driving external converters.
//!
//! ## Why this crate?
//!
//! A Windows EMF spool file is a container: a sequence of length-prefixed
//! records, some of which hold an entire embedded metafile page. None of the
//! common converters read the container itself. This crate splits the spool
//! into its pages, runs a converter per page under a hard timeout, stacks
//! the pages into one image, and keeps the results in a size-capped store.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bytes + kind
//!  │
//!  ├─ 1. Ingest    check the name, write the upload to a private scratch dir
//!  ├─ 2. Extract   spool only: split metafile records into <base>_<i>.emf
//!  ├─ 3. Convert   one converter process per input (inkscape / pdftoppm / pdftotext)
//!  ├─ 4. Merge     more than one page: stack them in page order (magick)
//!  └─ 5. Finalize  evict old results if needed, commit <job-id>.<ext>
//! ```
//!
//! Scratch files are removed however the job ends.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_spool::{JobKind, Orchestrator, PipelineConfig, ResultStore, StoreCapacity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = ResultStore::open("results", StoreCapacity::default())?;
//!     let orchestrator = Orchestrator::new(PipelineConfig::default(), store);
//!     let bytes = std::fs::read("capture.spl")?;
//!     let handle = orchestrator.submit(JobKind::Spool, &bytes, "capture.spl").await?;
//!     println!("{} ({}, {} pages)", handle.path.display(), handle.content_type, handle.page_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `spoolconv` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-spool = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod store;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, StoreCapacity, ToolSpec, Toolchain};
pub use convert::{extract_to_dir, submit_sync, ExtractSummary, JobRequest, Orchestrator};
pub use error::{ErrorCategory, ErrorKind, SpoolConvError};
pub use job::{ConverterKind, JobId, JobKind, JobStatus, Stage};
pub use output::{ArtifactHandle, ContentType, JobOutcome};
pub use pipeline::runner::{Invocation, InvocationOutcome, ProcessRunner, TokioProcessRunner};
pub use pipeline::spool::{metafile_records, records, SizeConvention};
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback};
pub use store::{plan_eviction, EvictionPlan, EvictionReport, ResultEntry, ResultStore};
pub use stream::{submit_all, OutcomeStream};
