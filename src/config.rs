//! Configuration types for the spool conversion pipeline.
//!
//! Pipeline behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Result-store bounds live in [`StoreCapacity`]
//! and are injected into [`crate::store::ResultStore`] rather than read from
//! ambient state, so two stores with different limits can coexist in one
//! process (and in one test binary).
//!
//! # Design choice: builder over constructor
//! Most callers only want to change a timeout or point one converter at a
//! different binary. The builder lets them set exactly that and rely on
//! documented defaults for the rest.

use crate::error::SpoolConvError;
use crate::pipeline::spool::SizeConvention;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Per-invocation bound applied to every converter process.
pub const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 60;

/// Configuration for the conversion pipeline.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_spool::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .invocation_timeout_secs(30)
///     .dpi(200)
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 200);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Wall-clock bound for a single converter process, in seconds. Default: 60.
    ///
    /// When exceeded the converter's whole process group is killed and the
    /// job fails with [`SpoolConvError::Timeout`]. There is no retry.
    pub invocation_timeout_secs: u64,

    /// Raster resolution passed to converters via `{dpi}`. Range: 72–600. Default: 150.
    pub dpi: u32,

    /// How spool record sizes are interpreted. Default: payload-only.
    pub size_convention: SizeConvention,

    /// External programs and their argument templates.
    pub toolchain: Toolchain,

    /// Parent directory for per-job scratch directories.
    /// If None, uses the system temp directory.
    pub work_dir: Option<PathBuf>,

    /// Upper bound on captured converter stderr, in bytes. Default: 8 KiB.
    ///
    /// Only the tail is kept: the last lines of a failing tool are almost
    /// always the ones that explain the failure.
    pub max_diagnostic_bytes: usize,

    /// Optional observer for job and stage events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            invocation_timeout_secs: DEFAULT_INVOCATION_TIMEOUT_SECS,
            dpi: 150,
            size_convention: SizeConvention::default(),
            toolchain: Toolchain::default(),
            work_dir: None,
            max_diagnostic_bytes: 8 * 1024,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("invocation_timeout_secs", &self.invocation_timeout_secs)
            .field("dpi", &self.dpi)
            .field("size_convention", &self.size_convention)
            .field("toolchain", &self.toolchain)
            .field("work_dir", &self.work_dir)
            .field("max_diagnostic_bytes", &self.max_diagnostic_bytes)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn JobProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn invocation_timeout_secs(mut self, secs: u64) -> Self {
        self.config.invocation_timeout_secs = secs;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn size_convention(mut self, convention: SizeConvention) -> Self {
        self.config.size_convention = convention;
        self
    }

    pub fn toolchain(mut self, toolchain: Toolchain) -> Self {
        self.config.toolchain = toolchain;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = Some(dir.into());
        self
    }

    pub fn max_diagnostic_bytes(mut self, n: usize) -> Self {
        self.config.max_diagnostic_bytes = n;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, SpoolConvError> {
        let c = &self.config;
        if c.invocation_timeout_secs == 0 {
            return Err(SpoolConvError::InvalidConfig(
                "Invocation timeout must be ≥ 1s".into(),
            ));
        }
        if c.max_diagnostic_bytes < 256 {
            return Err(SpoolConvError::InvalidConfig(format!(
                "max_diagnostic_bytes must be ≥ 256, got {}",
                c.max_diagnostic_bytes
            )));
        }
        c.toolchain.validate()?;
        Ok(self.config)
    }
}

// ── Result store bounds ──────────────────────────────────────────────────

/// Size bounds for the result store.
///
/// Eviction starts once the store would exceed `cap_bytes` and stops as soon
/// as it is back under `target_bytes`. The gap between the two keeps a store
/// hovering near the cap from evicting on every single commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapacity {
    cap_bytes: u64,
    target_bytes: u64,
}

impl StoreCapacity {
    /// Create bounds, rejecting `target_bytes >= cap_bytes`.
    pub fn new(cap_bytes: u64, target_bytes: u64) -> Result<Self, SpoolConvError> {
        if target_bytes >= cap_bytes {
            return Err(SpoolConvError::InvalidConfig(format!(
                "store target ({target_bytes} bytes) must be below the cap ({cap_bytes} bytes)"
            )));
        }
        Ok(Self {
            cap_bytes,
            target_bytes,
        })
    }

    pub fn cap_bytes(&self) -> u64 {
        self.cap_bytes
    }

    pub fn target_bytes(&self) -> u64 {
        self.target_bytes
    }
}

impl Default for StoreCapacity {
    /// 5 GiB cap, evicting down to 4 GiB.
    fn default() -> Self {
        Self {
            cap_bytes: 5 * GIB,
            target_bytes: 4 * GIB,
        }
    }
}

// ── External converters ──────────────────────────────────────────────────

/// An external program plus its argument template.
///
/// Arguments may contain placeholders that the pipeline fills in per
/// invocation (see [`crate::pipeline::tools`]):
///
/// | Placeholder       | Expands to |
/// |-------------------|------------|
/// | `{input}`         | the single input file |
/// | `{inputs}`        | every input file, one argument each (must be a whole argument) |
/// | `{output}`        | the output file |
/// | `{output_prefix}` | output path without extension, for tools that number their pages |
/// | `{output_dir}`    | the job's scratch directory |
/// | `{dpi}`           | [`PipelineConfig::dpi`] |
///
/// No shell is involved; every expanded argument reaches the program verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// The converters each stage calls.
///
/// Serialisable so a deployment can swap binaries with a JSON file instead of
/// a rebuild; unspecified entries keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    /// EMF → PNG, one invocation per metafile.
    pub metafile_to_png: ToolSpec,
    /// PDF → one PNG per physical page, numbered `{output_prefix}-N.png`.
    pub pdf_to_png: ToolSpec,
    /// PDF → plain text.
    pub pdf_to_text: ToolSpec,
    /// Stack page PNGs top-to-bottom into one image.
    pub merge_png: ToolSpec,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            metafile_to_png: ToolSpec::new(
                "inkscape",
                [
                    "{input}",
                    "--export-type=png",
                    "--export-dpi={dpi}",
                    "--export-filename={output}",
                ],
            ),
            pdf_to_png: ToolSpec::new(
                "pdftoppm",
                ["-png", "-r", "{dpi}", "{input}", "{output_prefix}"],
            ),
            pdf_to_text: ToolSpec::new("pdftotext", ["-layout", "{input}", "{output}"]),
            merge_png: ToolSpec::new("magick", ["{inputs}", "-append", "{output}"]),
        }
    }
}

impl Toolchain {
    /// Load a toolchain from JSON; missing entries fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, SpoolConvError> {
        let toolchain: Toolchain = serde_json::from_str(json)
            .map_err(|e| SpoolConvError::InvalidConfig(format!("toolchain: {e}")))?;
        toolchain.validate()?;
        Ok(toolchain)
    }

    fn validate(&self) -> Result<(), SpoolConvError> {
        for (name, spec) in [
            ("metafile_to_png", &self.metafile_to_png),
            ("pdf_to_png", &self.pdf_to_png),
            ("pdf_to_text", &self.pdf_to_text),
            ("merge_png", &self.merge_png),
        ] {
            if spec.program.trim().is_empty() {
                return Err(SpoolConvError::InvalidConfig(format!(
                    "toolchain entry '{name}' has no program"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::builder().build().unwrap();
        assert_eq!(config.invocation_timeout(), Duration::from_secs(60));
        assert_eq!(config.dpi, 150);
        assert_eq!(config.size_convention, SizeConvention::PayloadOnly);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = PipelineConfig::builder()
            .invocation_timeout_secs(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, SpoolConvError::InvalidConfig(_)));
    }

    #[test]
    fn dpi_is_clamped() {
        let config = PipelineConfig::builder().dpi(10).build().unwrap();
        assert_eq!(config.dpi, 72);
        let config = PipelineConfig::builder().dpi(5000).build().unwrap();
        assert_eq!(config.dpi, 600);
    }

    #[test]
    fn capacity_requires_target_below_cap() {
        assert!(StoreCapacity::new(5 * GIB, 4 * GIB).is_ok());
        assert!(StoreCapacity::new(4 * GIB, 4 * GIB).is_err());
        assert!(StoreCapacity::new(1, 2).is_err());
        assert_eq!(StoreCapacity::default().cap_bytes(), 5 * GIB);
        assert_eq!(StoreCapacity::default().target_bytes(), 4 * GIB);
    }

    #[test]
    fn partial_toolchain_json_keeps_defaults() {
        let tc = Toolchain::from_json(r#"{"merge_png": {"program": "convert", "args": ["{inputs}", "-append", "{output}"]}}"#)
            .unwrap();
        assert_eq!(tc.merge_png.program, "convert");
        assert_eq!(tc.pdf_to_png.program, "pdftoppm");
    }

    #[test]
    fn toolchain_with_blank_program_is_rejected() {
        let err = Toolchain::from_json(r#"{"pdf_to_text": {"program": " "}}"#).unwrap_err();
        assert!(err.to_string().contains("pdf_to_text"));
    }

    #[test]
    fn debug_hides_callback() {
        let config = PipelineConfig::default();
        let dbg = format!("{config:?}");
        assert!(dbg.contains("invocation_timeout_secs"));
    }
}
