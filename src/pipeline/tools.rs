//! Converter argument templates and page-output discovery.
//!
//! Argument lists are built from [`ToolSpec`] templates by plain string
//! substitution. Nothing goes through a shell, so the same job state always
//! yields the same argv.
//!
//! Multi-page converters such as `pdftoppm` decide their own file names
//! (`prefix-1.png` or `prefix-01.png` depending on page count), so their
//! outputs are discovered after the run and ordered by numeric page index,
//! never lexically: `page-10` comes after `page-9`.

use crate::config::ToolSpec;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// `<stem>-<page>.<ext>` as written by numbering converters.
static RE_NUMBERED_OUTPUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<stem>.+)-(?P<page>\d+)\.(?P<ext>[A-Za-z0-9]+)$").unwrap());

/// Values substituted into a [`ToolSpec`] template.
#[derive(Debug, Clone, Default)]
pub struct ToolVars<'a> {
    pub inputs: &'a [PathBuf],
    pub output: Option<&'a Path>,
    pub output_prefix: Option<&'a Path>,
    pub output_dir: Option<&'a Path>,
    pub dpi: u32,
}

/// Expand `spec.args` against `vars`.
///
/// An argument that is exactly `{inputs}` becomes one argument per input;
/// every other placeholder is substituted in place.
pub fn expand_args(spec: &ToolSpec, vars: &ToolVars<'_>) -> Vec<OsString> {
    let mut argv = Vec::with_capacity(spec.args.len() + vars.inputs.len());
    for arg in &spec.args {
        match arg.as_str() {
            "{inputs}" => argv.extend(vars.inputs.iter().map(|p| p.as_os_str().to_owned())),
            "{input}" => {
                if let Some(first) = vars.inputs.first() {
                    argv.push(first.as_os_str().to_owned());
                }
            }
            "{output}" => {
                if let Some(out) = vars.output {
                    argv.push(out.as_os_str().to_owned());
                }
            }
            _ => argv.push(OsString::from(substitute(arg, vars))),
        }
    }
    argv
}

fn substitute(arg: &str, vars: &ToolVars<'_>) -> String {
    if !arg.contains('{') {
        return arg.to_string();
    }
    let path = |p: Option<&Path>| p.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
    arg.replace("{output_prefix}", &path(vars.output_prefix))
        .replace("{output_dir}", &path(vars.output_dir))
        .replace("{output}", &path(vars.output))
        .replace("{input}", &path(vars.inputs.first().map(PathBuf::as_path)))
        .replace("{dpi}", &vars.dpi.to_string())
}

/// Find `<stem>-<N>.<ext>` files in `dir`, sorted by ascending page `N`.
pub fn collect_numbered_outputs(dir: &Path, stem: &str, ext: &str) -> io::Result<Vec<(u32, PathBuf)>> {
    let mut pages = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(caps) = RE_NUMBERED_OUTPUT.captures(name) else {
            continue;
        };
        if &caps["stem"] != stem || !caps["ext"].eq_ignore_ascii_case(ext) {
            continue;
        }
        if let Ok(page) = caps["page"].parse::<u32>() {
            pages.push((page, entry.path()));
        }
    }
    pages.sort_by_key(|(page, _)| *page);
    Ok(pages)
}

/// Base name for derived files: the file name up to its first dot.
///
/// Directory components are dropped; the rest is kept as-is, so
/// `job 42.spl` gives `job 42` and `.hidden` gives an empty base.
pub fn base_name(original_name: &str) -> String {
    let file = Path::new(original_name)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_default();
    file.split('.').next().unwrap_or_default().to_string()
}
