//! Batch submission: many jobs, outcomes as they finish.
//!
//! ## Why a stream?
//!
//! A batch of uploads can mix a one-page metafile with a 300-page PDF.
//! [`submit_all`] starts every job in its own task immediately and yields
//! each [`JobOutcome`] the moment that job ends, so a caller can report
//! early results (or failures) without waiting for the slowest job.
//!
//! Outcomes arrive in completion order, not submission order. Match them up
//! by `original_name` or `job_id` if order matters.

use crate::convert::{JobRequest, Orchestrator};
use crate::error::SpoolConvError;
use crate::job::JobId;
use crate::output::JobOutcome;
use crate::pipeline::runner::ProcessRunner;
use futures::stream::FuturesUnordered;
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::{error, info};

/// A boxed stream of job outcomes.
pub type OutcomeStream = Pin<Box<dyn Stream<Item = JobOutcome> + Send>>;

/// Spawn one task per request and stream their outcomes.
///
/// Must be called inside a tokio runtime. Jobs start immediately and keep
/// running if the stream is dropped early; their results are still
/// committed to the store.
///
/// A job task that panics is reported as an `internal` failure for that job
/// only.
pub fn submit_all<R: ProcessRunner>(
    orchestrator: &Orchestrator<R>,
    requests: impl IntoIterator<Item = JobRequest>,
) -> OutcomeStream {
    let tasks: FuturesUnordered<_> = requests
        .into_iter()
        .map(|request| {
            let id = JobId::new();
            let kind = request.kind;
            let original_name = request.original_name.clone();
            let handle = {
                let this = orchestrator.clone();
                let id = id.clone();
                tokio::spawn(async move { this.run_as(id, request).await })
            };
            async move {
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("{id}: job task ended abnormally: {e}");
                        JobOutcome::from_result(
                            id,
                            original_name,
                            kind,
                            Err(SpoolConvError::Internal(format!("job task failed: {e}"))),
                        )
                    }
                }
            }
        })
        .collect();
    info!("submitted {} job(s)", tasks.len());
    Box::pin(tasks)
}
