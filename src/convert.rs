//! Job orchestration: ingest, extract, convert, merge, finalize.
//!
//! ## Lifecycle of one job
//!
//! ```text
//! bytes ─▶ Ingest ─▶ [Extract] ─▶ Convert ─▶ [Merge] ─▶ Finalize ─▶ ArtifactHandle
//!            │           │            │          │           │
//!            └───────────┴─── ArtifactSet (scratch dir) ─────┘──▶ deleted on exit
//! ```
//!
//! Stages run strictly in order inside a single task; the first failing
//! stage ends the job. Independent jobs run in independent tasks and share
//! only the [`ResultStore`], whose commit path is serialized internally.
//!
//! The orchestrator is generic over [`ProcessRunner`] so tests can swap the
//! real tokio runner for a fake that writes files directly.

use crate::config::{PipelineConfig, ToolSpec};
use crate::error::SpoolConvError;
use crate::job::{ConverterKind, JobId, JobKind, JobStatus, Stage};
use crate::output::{ArtifactHandle, JobOutcome};
use crate::pipeline::artifacts::{Artifact, ArtifactSet};
use crate::pipeline::runner::{Invocation, ProcessRunner, TokioProcessRunner};
use crate::pipeline::spool::{self, SizeConvention};
use crate::pipeline::tools::{self, ToolVars};
use crate::progress::JobProgressCallback;
use crate::store::ResultStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything needed to start one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub bytes: Vec<u8>,
    /// Name the caller knows the input by; drives extension checks and the
    /// base name of extracted files.
    pub original_name: String,
}

impl JobRequest {
    pub fn new(kind: JobKind, bytes: impl Into<Vec<u8>>, original_name: impl Into<String>) -> Self {
        Self {
            kind,
            bytes: bytes.into(),
            original_name: original_name.into(),
        }
    }
}

/// Runs conversion jobs against a shared result store.
///
/// Cheap to clone: configuration, runner and store are reference-counted.
pub struct Orchestrator<R: ProcessRunner = TokioProcessRunner> {
    config: Arc<PipelineConfig>,
    runner: Arc<R>,
    store: Arc<ResultStore>,
}

impl<R: ProcessRunner> Clone for Orchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            runner: Arc::clone(&self.runner),
            store: Arc::clone(&self.store),
        }
    }
}

impl Orchestrator<TokioProcessRunner> {
    /// Orchestrator that spawns real converter processes.
    pub fn new(config: PipelineConfig, store: impl Into<Arc<ResultStore>>) -> Self {
        let runner = TokioProcessRunner::new(config.max_diagnostic_bytes);
        Self::with_runner(config, runner, store)
    }
}

impl<R: ProcessRunner> Orchestrator<R> {
    pub fn with_runner(config: PipelineConfig, runner: R, store: impl Into<Arc<ResultStore>>) -> Self {
        Self {
            config: Arc::new(config),
            runner: Arc::new(runner),
            store: store.into(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Convert `bytes` and commit the result to the store.
    ///
    /// # Errors
    /// The first failing stage's error. Temporary files are removed either way.
    pub async fn submit(
        &self,
        kind: JobKind,
        bytes: &[u8],
        original_name: &str,
    ) -> Result<ArtifactHandle, SpoolConvError> {
        self.execute(JobId::new(), kind, bytes, original_name).await
    }

    /// Run `request` to completion and report the outcome as a value.
    pub async fn run(&self, request: JobRequest) -> JobOutcome {
        self.run_as(JobId::new(), request).await
    }

    pub(crate) async fn run_as(&self, id: JobId, request: JobRequest) -> JobOutcome {
        let result = self
            .execute(id.clone(), request.kind, &request.bytes, &request.original_name)
            .await;
        JobOutcome::from_result(id, request.original_name, request.kind, result)
    }

    /// Start `request` in its own task.
    ///
    /// Aborting the returned handle drops the job: a running converter is
    /// killed and the job's temporary files are removed.
    pub fn spawn(&self, request: JobRequest) -> JoinHandle<JobOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.run(request).await })
    }

    async fn execute(
        &self,
        id: JobId,
        kind: JobKind,
        bytes: &[u8],
        original_name: &str,
    ) -> Result<ArtifactHandle, SpoolConvError> {
        info!("{id}: {kind} job for '{original_name}' ({} bytes)", bytes.len());
        self.notify(|cb| cb.on_job_start(&id, kind, original_name));

        let mut job = match ConversionJob::new(id.clone(), kind, original_name, self.config.work_dir.as_deref()) {
            Ok(job) => job,
            Err(e) => {
                self.notify(|cb| cb.on_job_error(&id, Stage::Ingest, &e));
                return Err(e);
            }
        };
        job.transition(JobStatus::Running);

        for stage in job.stages.clone() {
            self.notify(|cb| cb.on_stage_start(&id, stage));
            let stage_start = Instant::now();
            let result = match stage {
                Stage::Ingest => self.ingest(&mut job, bytes),
                Stage::Extract => self.extract(&mut job, bytes),
                Stage::Convert(converter) => self.convert(&mut job, converter).await,
                Stage::Merge => self.merge(&mut job).await,
                Stage::Finalize => self.finalize(&mut job).await,
            };
            let elapsed_ms = stage_start.elapsed().as_millis() as u64;
            match result {
                Ok(()) => {
                    debug!("{id}: {stage} done in {elapsed_ms}ms ({} outputs)", job.inputs.len());
                    self.notify(|cb| cb.on_stage_complete(&id, stage, job.inputs.len(), elapsed_ms));
                }
                Err(e) => {
                    warn!("{id}: {stage} failed: {e}");
                    job.transition(JobStatus::Failed(e.kind()));
                    self.notify(|cb| cb.on_job_error(&id, stage, &e));
                    job.finish();
                    return Err(e);
                }
            }
        }

        let handle = job.handle()?;
        job.transition(JobStatus::Succeeded);
        info!(
            "{id}: committed {} ({} bytes, {} page(s)) in {}ms",
            handle.path.display(),
            handle.size_bytes,
            handle.page_count,
            handle.duration_ms
        );
        self.notify(|cb| cb.on_job_complete(&id, &handle));
        job.finish();
        Ok(handle)
    }

    // ── Stages ───────────────────────────────────────────────────────────

    fn ingest(&self, job: &mut ConversionJob, bytes: &[u8]) -> Result<(), SpoolConvError> {
        job.kind.check_name(&job.original_name)?;
        if bytes.is_empty() {
            return Err(SpoolConvError::unsupported(format!(
                "'{}' is empty",
                job.original_name
            )));
        }
        let name = format!("upload.{}", job.kind.extensions()[0]);
        let upload = job
            .artifacts
            .write(&name, bytes, Stage::Ingest)
            .map_err(|e| SpoolConvError::storage(job.artifacts.dir().join(&name), e))?;
        job.inputs = vec![upload];
        Ok(())
    }

    fn extract(&self, job: &mut ConversionJob, bytes: &[u8]) -> Result<(), SpoolConvError> {
        let (blobs, truncated, end) = collect_metafiles(bytes, self.config.size_convention)?;
        if truncated {
            warn!(
                "{}: spool truncated at offset {end}; keeping {} complete metafile(s)",
                job.id,
                blobs.len()
            );
        }
        if blobs.is_empty() {
            return Err(SpoolConvError::MalformedSpool {
                offset: end,
                reason: "no embedded metafile records".into(),
            });
        }

        let base = tools::base_name(&job.original_name);
        let mut extracted = Vec::with_capacity(blobs.len());
        for (i, blob) in blobs.iter().enumerate() {
            let name = format!("{base}_{i}.emf");
            let artifact = job
                .artifacts
                .write(&name, blob, Stage::Extract)
                .map_err(|e| SpoolConvError::storage(job.artifacts.dir().join(&name), e))?;
            extracted.push(artifact);
        }
        debug!("{}: extracted {} metafile(s)", job.id, extracted.len());
        job.inputs = extracted;
        Ok(())
    }

    async fn convert(&self, job: &mut ConversionJob, converter: ConverterKind) -> Result<(), SpoolConvError> {
        let stage = Stage::Convert(converter);
        let toolchain = &self.config.toolchain;
        match converter {
            ConverterKind::MetafileToPng => {
                let inputs = std::mem::take(&mut job.inputs);
                let mut pages = Vec::with_capacity(inputs.len());
                for (i, input) in inputs.iter().enumerate() {
                    let output = job.artifacts.claim(&format!("page-{:05}.png", i + 1), stage);
                    let sources = [input.path.clone()];
                    let vars = ToolVars {
                        inputs: &sources,
                        output: Some(&output.path),
                        ..self.vars(job)
                    };
                    self.invoke(job, stage, converter.name(), &toolchain.metafile_to_png, &vars, &output.path)
                        .await?;
                    pages.push(output);
                }
                job.inputs = pages;
            }
            ConverterKind::PdfToPng => {
                let sources = job.input_paths();
                let prefix = job.artifacts.dir().join("page");
                let vars = ToolVars {
                    inputs: &sources,
                    output_prefix: Some(&prefix),
                    ..self.vars(job)
                };
                let inv = self.invocation(job, stage, converter.name(), &toolchain.pdf_to_png, &vars);
                let outcome = self.runner.run(&inv).await?;

                let dir = job.artifacts.dir().to_path_buf();
                let numbered = tools::collect_numbered_outputs(&dir, "page", "png")
                    .map_err(|e| SpoolConvError::storage(&dir, e))?;
                if numbered.is_empty() {
                    return Err(missing_output(converter.name(), &prefix, outcome.diagnostics));
                }
                job.inputs = numbered
                    .into_iter()
                    .map(|(_, path)| job.artifacts.register(path, stage))
                    .collect();
            }
            ConverterKind::PdfToText => {
                let sources = job.input_paths();
                let output = job.artifacts.claim("document.txt", stage);
                let vars = ToolVars {
                    inputs: &sources,
                    output: Some(&output.path),
                    ..self.vars(job)
                };
                self.invoke(job, stage, converter.name(), &toolchain.pdf_to_text, &vars, &output.path)
                    .await?;
                job.inputs = vec![output];
            }
        }
        job.page_count = job.inputs.len();
        Ok(())
    }

    async fn merge(&self, job: &mut ConversionJob) -> Result<(), SpoolConvError> {
        if job.inputs.len() <= 1 {
            debug!("{}: single page, merge skipped", job.id);
            return Ok(());
        }
        let sources = job.input_paths();
        let output = job.artifacts.claim("merged.png", Stage::Merge);
        let vars = ToolVars {
            inputs: &sources,
            output: Some(&output.path),
            ..self.vars(job)
        };
        self.invoke(job, Stage::Merge, "merge_png", &self.config.toolchain.merge_png, &vars, &output.path)
            .await?;
        job.inputs = vec![output];
        Ok(())
    }

    async fn finalize(&self, job: &mut ConversionJob) -> Result<(), SpoolConvError> {
        let [last] = job.inputs.as_slice() else {
            return Err(SpoolConvError::Internal(format!(
                "{}: expected one final output, found {}",
                job.id,
                job.inputs.len()
            )));
        };
        let ext = job.kind.content_type().extension();
        let entry = self.store.commit(&job.id, &last.path, ext).await?;
        job.committed = Some((entry.path, entry.size_bytes));
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn vars<'a>(&self, job: &'a ConversionJob) -> ToolVars<'a> {
        ToolVars {
            output_dir: Some(job.artifacts.dir()),
            dpi: self.config.dpi,
            ..Default::default()
        }
    }

    fn invocation(
        &self,
        job: &ConversionJob,
        stage: Stage,
        tool: &str,
        spec: &ToolSpec,
        vars: &ToolVars<'_>,
    ) -> Invocation {
        Invocation {
            tool: tool.to_string(),
            stage,
            program: spec.program.clone(),
            args: tools::expand_args(spec, vars),
            cwd: job.artifacts.dir().to_path_buf(),
            timeout: self.config.invocation_timeout(),
        }
    }

    /// Run one converter and require that it produced `expected`.
    async fn invoke(
        &self,
        job: &ConversionJob,
        stage: Stage,
        tool: &str,
        spec: &ToolSpec,
        vars: &ToolVars<'_>,
        expected: &Path,
    ) -> Result<(), SpoolConvError> {
        let inv = self.invocation(job, stage, tool, spec, vars);
        let outcome = self.runner.run(&inv).await?;
        if !expected.is_file() {
            return Err(missing_output(tool, expected, outcome.diagnostics));
        }
        Ok(())
    }

    fn notify(&self, f: impl FnOnce(&dyn JobProgressCallback)) {
        if let Some(ref cb) = self.config.progress_callback {
            f(cb.as_ref());
        }
    }
}

/// Mutable state of one job while it runs.
struct ConversionJob {
    id: JobId,
    kind: JobKind,
    original_name: String,
    stages: Vec<Stage>,
    status: JobStatus,
    /// Ordered outputs of the last completed stage, inputs to the next.
    inputs: Vec<Artifact>,
    artifacts: ArtifactSet,
    page_count: usize,
    committed: Option<(PathBuf, u64)>,
    started: Instant,
}

impl ConversionJob {
    fn new(id: JobId, kind: JobKind, original_name: &str, work_dir: Option<&Path>) -> Result<Self, SpoolConvError> {
        let artifacts = ArtifactSet::new(&id, work_dir).map_err(|e| {
            let dir = work_dir.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
            SpoolConvError::storage(dir, e)
        })?;
        Ok(Self {
            id,
            kind,
            original_name: original_name.to_string(),
            stages: kind.stages(),
            status: JobStatus::Pending,
            inputs: Vec::new(),
            artifacts,
            page_count: 0,
            committed: None,
            started: Instant::now(),
        })
    }

    fn transition(&mut self, next: JobStatus) {
        debug!("{}: {:?} -> {:?}", self.id, self.status, next);
        self.status = next;
    }

    fn input_paths(&self) -> Vec<PathBuf> {
        self.inputs.iter().map(|a| a.path.clone()).collect()
    }

    fn handle(&self) -> Result<ArtifactHandle, SpoolConvError> {
        let Some((path, size_bytes)) = self.committed.clone() else {
            return Err(SpoolConvError::Internal(format!("{}: finished without a commit", self.id)));
        };
        Ok(ArtifactHandle {
            job_id: self.id.clone(),
            path,
            content_type: self.kind.content_type(),
            size_bytes,
            page_count: self.page_count,
            duration_ms: self.started.elapsed().as_millis() as u64,
        })
    }

    /// Remove every temporary artifact of the job.
    fn finish(self) {
        debug_assert!(self.status.is_terminal());
        let id = self.id.clone();
        let removed = self.artifacts.release();
        debug!("{id}: removed {removed} temporary file(s)");
    }
}

fn missing_output(tool: &str, expected: &Path, diagnostics: String) -> SpoolConvError {
    let mut detail = format!("expected output {} was not produced", expected.display());
    if !diagnostics.is_empty() {
        detail.push('\n');
        detail.push_str(&diagnostics);
    }
    SpoolConvError::Conversion {
        tool: tool.to_string(),
        status: "exit code 0".into(),
        diagnostics: detail,
    }
}

/// Split a spool buffer into metafile payloads.
///
/// Returns the payloads, whether the buffer was cut short, and the offset
/// where reading stopped.
fn collect_metafiles(bytes: &[u8], convention: SizeConvention) -> Result<(Vec<&[u8]>, bool, usize), SpoolConvError> {
    let mut records = spool::metafile_records(bytes, convention);
    let mut blobs = Vec::new();
    for record in records.by_ref() {
        blobs.push(record?);
    }
    Ok((blobs, records.is_truncated(), records.offset()))
}

/// Result of [`extract_to_dir`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub count: usize,
    pub files: Vec<PathBuf>,
    /// The spool ended mid-record; everything before that point was written.
    pub truncated: bool,
}

/// Split a spool file into `<base>_<i>.emf` files under `out_dir`.
///
/// The whole spool is validated before anything is written, so a malformed
/// file leaves `out_dir` untouched.
pub fn extract_to_dir(
    spool_path: impl AsRef<Path>,
    out_dir: impl AsRef<Path>,
    convention: SizeConvention,
) -> Result<ExtractSummary, SpoolConvError> {
    let spool_path = spool_path.as_ref();
    let out_dir = out_dir.as_ref();
    let bytes = std::fs::read(spool_path).map_err(|e| SpoolConvError::storage(spool_path, e))?;
    let (blobs, truncated, end) = collect_metafiles(&bytes, convention)?;
    if truncated {
        warn!("{}: truncated at offset {end}", spool_path.display());
    }

    std::fs::create_dir_all(out_dir).map_err(|e| SpoolConvError::storage(out_dir, e))?;
    let base = tools::base_name(&spool_path.to_string_lossy());
    let mut files = Vec::with_capacity(blobs.len());
    for (i, blob) in blobs.iter().enumerate() {
        let path = out_dir.join(format!("{base}_{i}.emf"));
        std::fs::write(&path, blob).map_err(|e| SpoolConvError::storage(&path, e))?;
        info!("saved metafile record {i} to {}", path.display());
        files.push(path);
    }
    Ok(ExtractSummary {
        count: files.len(),
        files,
        truncated,
    })
}

/// Synchronous wrapper around [`Orchestrator::submit`].
///
/// Creates a temporary tokio runtime internally.
pub fn submit_sync(
    config: PipelineConfig,
    store: ResultStore,
    kind: JobKind,
    bytes: &[u8],
    original_name: &str,
) -> Result<ArtifactHandle, SpoolConvError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| SpoolConvError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(async {
            let orchestrator = Orchestrator::new(config, store);
            orchestrator.submit(kind, bytes, original_name).await
        })
}
