//! Progress-callback trait for job and stage events.
//!
//! Inject an [`Arc<dyn JobProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as jobs move through their stages.
//!
//! # Why callbacks instead of channels?
//!
//! The callback is the least-invasive integration point: callers can forward
//! events to a channel, a metrics sink, or a terminal progress bar without
//! the library knowing how the host application communicates. The trait is
//! `Send + Sync` because every job runs in its own task.
//!
//! # Example
//!
//! ```rust
//! use edgequake_spool::{JobId, JobProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Finished(AtomicUsize);
//!
//! impl JobProgressCallback for Finished {
//!     fn on_job_complete(&self, _job: &JobId, _handle: &edgequake_spool::ArtifactHandle) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(Finished(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::error::SpoolConvError;
use crate::job::{JobId, JobKind, Stage};
use crate::output::ArtifactHandle;
use std::sync::Arc;

/// Called by the orchestrator as each job progresses.
///
/// Events for one job arrive in order; events for different jobs may
/// interleave and arrive from different threads. All methods default to
/// no-ops so callers only override what they care about.
pub trait JobProgressCallback: Send + Sync {
    /// Called once, before the first stage runs.
    fn on_job_start(&self, job: &JobId, kind: JobKind, original_name: &str) {
        let _ = (job, kind, original_name);
    }

    fn on_stage_start(&self, job: &JobId, stage: Stage) {
        let _ = (job, stage);
    }

    /// Called when a stage finishes successfully.
    ///
    /// # Arguments
    /// * `artifacts`  — page outputs the stage left for the next stage
    /// * `elapsed_ms` — wall-clock time spent in the stage
    fn on_stage_complete(&self, job: &JobId, stage: Stage, artifacts: usize, elapsed_ms: u64) {
        let _ = (job, stage, artifacts, elapsed_ms);
    }

    fn on_job_complete(&self, job: &JobId, handle: &ArtifactHandle) {
        let _ = (job, handle);
    }

    /// Called once when the job fails; no further events follow for it.
    fn on_job_error(&self, job: &JobId, stage: Stage, error: &SpoolConvError) {
        let _ = (job, stage, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn JobProgressCallback>;
