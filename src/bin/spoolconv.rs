//! CLI binary for edgequake-spool.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, submits one job per input file, and prints outcomes.

use anyhow::{bail, Context, Result};
use clap::Parser;
use edgequake_spool::{
    extract_to_dir, submit_all, ArtifactHandle, JobId, JobKind, JobOutcome, JobProgressCallback,
    JobRequest, Orchestrator, PipelineConfig, ProgressCallback, ResultStore, SizeConvention,
    SpoolConvError, Stage, StoreCapacity, Toolchain,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const MIB: u64 = 1024 * 1024;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar across the whole batch, plus a log line per finished job.
struct CliProgressCallback {
    bar: ProgressBar,
    names: Mutex<HashMap<JobId, String>>,
}

impl CliProgressCallback {
    fn new(total_jobs: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total_jobs as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} jobs  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            names: Mutex::new(HashMap::new()),
        })
    }

    fn take_name(&self, job: &JobId) -> String {
        self.names
            .lock()
            .ok()
            .and_then(|mut names| names.remove(job))
            .unwrap_or_else(|| job.to_string())
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, job: &JobId, _kind: JobKind, original_name: &str) {
        if let Ok(mut names) = self.names.lock() {
            names.insert(job.clone(), original_name.to_string());
        }
    }

    fn on_stage_start(&self, _job: &JobId, stage: Stage) {
        self.bar.set_message(stage.to_string());
    }

    fn on_job_complete(&self, job: &JobId, handle: &ArtifactHandle) {
        let name = self.take_name(job);
        self.bar.println(format!(
            "  {} {:<32} {}  {}",
            green("✓"),
            name,
            dim(&format!("{} page(s), {:.1}s", handle.page_count, handle.duration_ms as f64 / 1000.0)),
            handle.path.display(),
        ));
        self.bar.inc(1);
    }

    fn on_job_error(&self, job: &JobId, stage: Stage, error: &SpoolConvError) {
        let name = self.take_name(job);
        let msg = error.to_string();
        let msg = match msg.char_indices().nth(100) {
            Some((cut, _)) => format!("{}\u{2026}", &msg[..cut]),
            None => msg,
        };
        self.bar.println(format!(
            "  {} {:<32} {}  {}",
            red("✗"),
            name,
            dim(&stage.to_string()),
            red(&msg),
        ));
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a spool capture into one stacked PNG
  spoolconv capture.spl

  # Batch conversion; kinds inferred from extensions
  spoolconv jobs/*.spl scans/*.pdf --store /var/lib/spoolconv

  # PDF to plain text
  spoolconv --kind pdf-text report.pdf

  # Only split a spool into its embedded metafiles
  spoolconv --extract-only out/ capture.spl

  # Machine-readable outcomes
  spoolconv --json --no-progress *.spl > outcomes.json

CONVERTERS (defaults; override with --toolchain FILE):
  metafile_to_png  inkscape {input} --export-type=png --export-dpi={dpi} --export-filename={output}
  pdf_to_png       pdftoppm -png -r {dpi} {input} {output_prefix}
  pdf_to_text      pdftotext -layout {input} {output}
  merge_png        magick {inputs} -append {output}

ENVIRONMENT VARIABLES:
  SPOOLCONV_STORE   Result store directory
  RUST_LOG          Log filter (overrides -v / -q)
"#;

/// Convert spool captures, metafiles and PDFs with external converters.
#[derive(Parser, Debug)]
#[command(
    name = "spoolconv",
    version,
    about = "Convert spool captures, metafiles and PDFs into stored PNG or text artifacts",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Input files; one job per file.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Job kind; `auto` infers it from each file's extension.
    #[arg(long, env = "SPOOLCONV_KIND", value_enum, default_value = "auto")]
    kind: KindArg,

    /// Result store directory.
    #[arg(long, env = "SPOOLCONV_STORE", default_value = "results")]
    store: PathBuf,

    /// Evict once the store would exceed this many MiB.
    #[arg(long, env = "SPOOLCONV_STORE_CAP_MB", default_value_t = 5120)]
    store_cap_mb: u64,

    /// Evict down to this many MiB.
    #[arg(long, env = "SPOOLCONV_STORE_TARGET_MB", default_value_t = 4096)]
    store_target_mb: u64,

    /// Per-converter timeout in seconds.
    #[arg(long, env = "SPOOLCONV_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// Raster DPI (72–600).
    #[arg(long, env = "SPOOLCONV_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// JSON file overriding converter programs and arguments.
    #[arg(long, env = "SPOOLCONV_TOOLCHAIN")]
    toolchain: Option<PathBuf>,

    /// Parent directory for per-job scratch directories.
    #[arg(long, env = "SPOOLCONV_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Spool record sizes include the 8-byte record header.
    #[arg(long)]
    size_includes_header: bool,

    /// Split spool inputs into <name>_<i>.emf files in DIR; no conversion.
    #[arg(long, value_name = "DIR")]
    extract_only: Option<PathBuf>,

    /// Print job outcomes as JSON on stdout.
    #[arg(long, env = "SPOOLCONV_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "SPOOLCONV_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SPOOLCONV_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SPOOLCONV_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Auto,
    Spool,
    Metafile,
    Pdf,
    PdfText,
}

impl KindArg {
    fn resolve(self, path: &Path) -> Result<JobKind> {
        Ok(match self {
            KindArg::Spool => JobKind::Spool,
            KindArg::Metafile => JobKind::Metafile,
            KindArg::Pdf => JobKind::Pdf,
            KindArg::PdfText => JobKind::PdfText,
            KindArg::Auto => match JobKind::infer(&path.to_string_lossy()) {
                Some(kind) => kind,
                None => bail!(
                    "cannot infer job kind for {}; pass --kind",
                    path.display()
                ),
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && cli.extract_only.is_none();
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let convention = if cli.size_includes_header {
        SizeConvention::IncludesHeader
    } else {
        SizeConvention::PayloadOnly
    };

    // ── Extract-only mode ────────────────────────────────────────────────
    if let Some(ref out_dir) = cli.extract_only {
        let mut total = 0;
        for input in &cli.inputs {
            let summary = extract_to_dir(input, out_dir, convention)
                .with_context(|| format!("Failed to extract {}", input.display()))?;
            total += summary.count;
            if !cli.quiet {
                eprintln!(
                    "{} {}: {} metafile(s){}",
                    green("✔"),
                    input.display(),
                    bold(&summary.count.to_string()),
                    if summary.truncated { " (truncated)" } else { "" }
                );
            }
        }
        if !cli.quiet {
            eprintln!("{} {} file(s) written to {}", dim("→"), total, out_dir.display());
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress = if show_progress {
        Some(CliProgressCallback::new(cli.inputs.len()))
    } else {
        None
    };
    let config = build_config(&cli, convention, progress.clone().map(|cb| cb as ProgressCallback)).await?;

    let capacity = StoreCapacity::new(cli.store_cap_mb * MIB, cli.store_target_mb * MIB)
        .context("Invalid store capacity")?;
    let store = ResultStore::open(&cli.store, capacity)
        .with_context(|| format!("Failed to open result store {}", cli.store.display()))?;
    let orchestrator = Orchestrator::new(config, store);

    // ── Read inputs ──────────────────────────────────────────────────────
    let mut requests = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let kind = cli.kind.resolve(input)?;
        let bytes = tokio::fs::read(input)
            .await
            .with_context(|| format!("Failed to read {}", input.display()))?;
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string());
        requests.push(JobRequest::new(kind, bytes, name));
    }

    // ── Run jobs ─────────────────────────────────────────────────────────
    let outcomes: Vec<JobOutcome> = submit_all(&orchestrator, requests).collect().await;
    if let Some(ref cb) = progress {
        cb.finish();
    }

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    if cli.json {
        let json = serde_json::to_string_pretty(&outcomes).context("Failed to serialise outcomes")?;
        println!("{json}");
    } else if !cli.quiet {
        if !show_progress {
            for outcome in &outcomes {
                print_outcome(outcome);
            }
        }
        let ok = outcomes.len() - failed;
        eprintln!(
            "{} {}/{} job(s) converted",
            if failed == 0 { green("✔") } else { red("✘") },
            bold(&ok.to_string()),
            outcomes.len()
        );
    }

    if failed > 0 {
        bail!("{failed} of {} job(s) failed", outcomes.len());
    }
    Ok(())
}

fn print_outcome(outcome: &JobOutcome) {
    match (&outcome.artifact, &outcome.error) {
        (Some(handle), _) => eprintln!(
            "  {} {}  →  {}",
            green("✓"),
            outcome.original_name,
            handle.path.display()
        ),
        (None, error) => {
            eprintln!(
                "  {} {}  {}",
                red("✗"),
                outcome.original_name,
                red(error.as_deref().unwrap_or("failed"))
            );
            if let Some(ref diag) = outcome.diagnostics {
                for line in diag.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
                    eprintln!("      {}", dim(line));
                }
            }
        }
    }
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(
    cli: &Cli,
    convention: SizeConvention,
    progress: Option<ProgressCallback>,
) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .invocation_timeout_secs(cli.timeout)
        .dpi(cli.dpi)
        .size_convention(convention);

    if let Some(ref path) = cli.toolchain {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read toolchain from {:?}", path))?;
        builder = builder.toolchain(Toolchain::from_json(&json).context("Invalid toolchain file")?);
    }
    if let Some(ref dir) = cli.work_dir {
        builder = builder.work_dir(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}
