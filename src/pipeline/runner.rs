//! External converter invocation with a hard time bound.
//!
//! [`ProcessRunner`] is the seam between the orchestrator and the outside
//! world: production uses [`TokioProcessRunner`], tests substitute a fake
//! that writes files directly, so every stage can be exercised without
//! inkscape or poppler installed.
//!
//! ## Outcome classification
//!
//! | Child behaviour            | Result |
//! |----------------------------|--------|
//! | exits 0                    | `Ok(InvocationOutcome)` |
//! | exits non-zero / signalled | [`SpoolConvError::Conversion`] with the stderr tail |
//! | cannot be spawned          | [`SpoolConvError::Conversion`] |
//! | still running at deadline  | process group killed, [`SpoolConvError::Timeout`] |
//!
//! ## Why a process group?
//!
//! Converters like `magick` and `inkscape` fork helpers. Killing only the
//! direct child would leave those helpers running (and holding stderr
//! open). Each child is started as the leader of a new process group and
//! the whole group receives `SIGKILL` once the invocation is over: on
//! timeout, after a normal exit, and when the run future is dropped.

use crate::error::SpoolConvError;
use crate::job::Stage;
use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tracing::{debug, warn};

/// How long to keep draining stderr after the child has exited.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A fully resolved converter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Label used in errors and logs, e.g. `metafile_to_png`.
    pub tool: String,
    /// Stage that issued the call.
    pub stage: Stage,
    pub program: String,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

/// A successful converter run.
#[derive(Debug, Clone, Default)]
pub struct InvocationOutcome {
    pub elapsed: Duration,
    /// Whatever the tool wrote to stderr (tail only), even on success.
    pub diagnostics: String,
}

/// Runs converter invocations.
///
/// Implementations must never block indefinitely: every call either
/// completes, fails, or returns [`SpoolConvError::Timeout`] within roughly
/// `invocation.timeout`.
pub trait ProcessRunner: Send + Sync + 'static {
    fn run(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<InvocationOutcome, SpoolConvError>> + Send;
}

/// Spawns real processes with tokio.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    max_diagnostic_bytes: usize,
}

impl TokioProcessRunner {
    pub fn new(max_diagnostic_bytes: usize) -> Self {
        Self {
            max_diagnostic_bytes,
        }
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new(8 * 1024)
    }
}

impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, inv: &Invocation) -> Result<InvocationOutcome, SpoolConvError> {
        debug!(
            "{}: {} {:?} (cwd {}, timeout {:?})",
            inv.tool,
            inv.program,
            inv.args,
            inv.cwd.display(),
            inv.timeout
        );
        let start = Instant::now();

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .current_dir(&inv.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| SpoolConvError::Conversion {
            tool: inv.tool.clone(),
            status: "spawn failed".into(),
            diagnostics: format!("could not start '{}': {e}", inv.program),
        })?;
        let mut group = ProcessGroup::new(child.id());

        // Drain stderr concurrently so a chatty tool can't stall on a full pipe.
        let limit = self.max_diagnostic_bytes;
        let mut stderr_task = tokio::spawn(read_tail(child.stderr.take(), limit));

        match tokio::time::timeout(inv.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                // Forked helpers still holding stderr would stall the drain.
                group.kill();
                let diagnostics = match tokio::time::timeout(STDERR_DRAIN_GRACE, &mut stderr_task).await {
                    Ok(Ok(text)) => text,
                    _ => {
                        stderr_task.abort();
                        String::new()
                    }
                };
                let elapsed = start.elapsed();
                classify(inv, status, diagnostics, elapsed)
            }
            Ok(Err(e)) => {
                stderr_task.abort();
                Err(SpoolConvError::Conversion {
                    tool: inv.tool.clone(),
                    status: "wait failed".into(),
                    diagnostics: e.to_string(),
                })
            }
            Err(_) => {
                let elapsed = start.elapsed();
                warn!(
                    "{}: no exit after {:?}; killing process group",
                    inv.tool, inv.timeout
                );
                group.kill();
                if let Err(e) = child.kill().await {
                    debug!("kill after timeout: {e}");
                }
                stderr_task.abort();
                Err(SpoolConvError::Timeout {
                    tool: inv.tool.clone(),
                    elapsed_ms: elapsed.as_millis() as u64,
                })
            }
        }
    }
}

fn classify(
    inv: &Invocation,
    status: ExitStatus,
    diagnostics: String,
    elapsed: Duration,
) -> Result<InvocationOutcome, SpoolConvError> {
    let diagnostics = diagnostics.trim().to_string();
    if status.success() {
        debug!("{}: ok in {:?}", inv.tool, elapsed);
        return Ok(InvocationOutcome {
            elapsed,
            diagnostics,
        });
    }
    let status = match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    Err(SpoolConvError::Conversion {
        tool: inv.tool.clone(),
        status,
        diagnostics,
    })
}

/// Read stderr to EOF, keeping at most the last `limit` bytes.
async fn read_tail(stderr: Option<ChildStderr>, limit: usize) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// The child's process group, killed at most once, on drop at the latest.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl ProcessGroup {
    /// The child leads its own group (`process_group(0)`), so pgid == pid.
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // ESRCH just means every member has already exited.
            unsafe {
                libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
