//! Bundling adapter.
//!
//! The transpile/link step is an external capability that may be absent.
//! It is reached through the [`Toolchain`] trait; [`DenoToolchain`] shells
//! out to `deno bundle`. Generated modules live in a [`ScratchDir`] owned by
//! the caller and removed on drop.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::generator::{GeneratedSource, ENTRY_FILENAME};
use crate::sourcemap::SourceMapV3;
use crate::utils::scan_imports;
use crate::{BundleError, ParseResult};

/// Environment override for the deno executable.
pub const DENO_ENV: &str = "MELKER_DENO";

pub const BUNDLE_FILENAME: &str = "bundle.js";

/// Shown when bundling is required but no toolchain can be found.
pub const TOOLCHAIN_UNAVAILABLE_HINT: &str =
    "Install Deno 2.4 or later, or point MELKER_DENO at a deno executable. Scripts that import other modules must be bundled before they can run.";

// ---------------------------------------------------------------------------
// Toolchain capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct BundleRequest<'a> {
    pub entry: &'a Path,
    pub out_dir: &'a Path,
    pub minify: bool,
}

/// Raw toolchain output before the sourcemap is parsed.
#[derive(Debug, Clone, Default)]
pub struct ToolchainOutput {
    pub code: String,
    pub source_map: Option<String>,
    pub warnings: Vec<String>,
}

/// The external transpile/link capability.
pub trait Toolchain: Sync {
    /// Version identifier, or `None` when the capability is unavailable.
    fn version(&self) -> impl Future<Output = Option<String>> + Send;

    /// Link `request.entry` and everything it imports into one payload.
    fn bundle(
        &self,
        request: BundleRequest<'_>,
    ) -> impl Future<Output = Result<ToolchainOutput, BundleError>> + Send;
}

#[derive(Debug, Clone)]
pub struct DenoToolchain {
    program: PathBuf,
}

impl DenoToolchain {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `MELKER_DENO`, else `deno` from `PATH`.
    pub fn from_env() -> Self {
        match std::env::var_os(DENO_ENV) {
            Some(program) if !program.is_empty() => Self::new(program),
            _ => Self::new("deno"),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for DenoToolchain {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Toolchain for DenoToolchain {
    fn version(&self) -> impl Future<Output = Option<String>> + Send {
        let program = self.program.clone();
        async move {
            let output = Command::new(&program).arg("--version").output().await.ok()?;
            if !output.status.success() {
                return None;
            }
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
        }
    }

    fn bundle(
        &self,
        request: BundleRequest<'_>,
    ) -> impl Future<Output = Result<ToolchainOutput, BundleError>> + Send {
        let program = self.program.clone();
        let entry = request.entry.to_path_buf();
        let out_dir = request.out_dir.to_path_buf();
        let minify = request.minify;

        async move {
            let out_file = out_dir.join(BUNDLE_FILENAME);
            let mut command = Command::new(&program);
            command
                .arg("bundle")
                .arg("--platform=deno")
                .arg("--sourcemap=external")
                .arg("--output")
                .arg(&out_file);
            if minify {
                command.arg("--minify");
            }
            command.arg(&entry).current_dir(&out_dir);

            debug!(program = %program.display(), entry = %entry.display(), "running bundler");
            let output = command.output().await.map_err(|e| BundleError::BundleFailed {
                message: format!("failed to start `{}`: {e}", program.display()),
                hint: Some(TOOLCHAIN_UNAVAILABLE_HINT),
                line: None,
            })?;

            let stderr = strip_ansi(&String::from_utf8_lossy(&output.stderr));
            if !output.status.success() {
                let message = stderr.trim().to_string();
                return Err(BundleError::BundleFailed {
                    hint: bundling_hint(&message),
                    message,
                    line: None,
                });
            }

            let code = tokio::fs::read_to_string(&out_file).await?;
            let map_file = out_dir.join(format!("{BUNDLE_FILENAME}.map"));
            let source_map = tokio::fs::read_to_string(&map_file).await.ok();
            let warnings = stderr
                .lines()
                .map(str::trim)
                .filter(|line| line.to_ascii_lowercase().starts_with("warning"))
                .map(str::to_string)
                .collect();

            Ok(ToolchainOutput {
                code,
                source_map,
                warnings,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Scratch directory
// ---------------------------------------------------------------------------

/// Owner of on-disk artifacts. Removed when dropped unless kept.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("melker-").tempdir()?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Disable removal and return the path (debug mode).
    pub fn keep(self) -> PathBuf {
        self.dir.keep()
    }

    /// Remove the directory now, reporting failures.
    pub fn cleanup(self) -> io::Result<()> {
        self.dir.close()
    }

    /// Write the entry and script modules. Returns the entry path.
    pub async fn write_generated(&self, generated: &GeneratedSource) -> io::Result<PathBuf> {
        for module in &generated.modules {
            tokio::fs::write(self.path().join(&module.filename), &module.content).await?;
        }
        let entry = self.path().join(ENTRY_FILENAME);
        tokio::fs::write(&entry, &generated.entry).await?;
        Ok(entry)
    }
}

// ---------------------------------------------------------------------------
// BundleResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BundleResult {
    pub code: String,
    pub source_map: Option<SourceMapV3>,
    pub warnings: Vec<String>,
    /// Directory holding the on-disk artifacts.
    pub out_dir: Option<PathBuf>,
}

/// Write the generated modules into `scratch` and run the toolchain on them.
pub async fn bundle_generated<T: Toolchain>(
    toolchain: &T,
    generated: &GeneratedSource,
    scratch: &ScratchDir,
    minify: bool,
) -> Result<BundleResult, BundleError> {
    let entry = scratch.write_generated(generated).await?;
    let output = toolchain
        .bundle(BundleRequest {
            entry: &entry,
            out_dir: scratch.path(),
            minify,
        })
        .await?;

    let mut warnings = output.warnings;
    let source_map = match output.source_map.as_deref().map(SourceMapV3::from_json) {
        Some(Ok(map)) => Some(map),
        Some(Err(e)) => {
            warn!("ignoring unparsable sourcemap: {e}");
            warnings.push(format!("sourcemap could not be parsed: {e}"));
            None
        }
        None => {
            warnings.push("bundler produced no sourcemap".to_string());
            None
        }
    };

    Ok(BundleResult {
        code: output.code,
        source_map,
        warnings,
        out_dir: Some(scratch.path().to_path_buf()),
    })
}

// ---------------------------------------------------------------------------
// Bundling requirement & failure hints
// ---------------------------------------------------------------------------

/// The first place a script reaches outside the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSite {
    pub script_id: String,
    pub line: u32,
    pub specifier: String,
}

/// Scan scripts in document order for external references and import syntax.
pub fn requires_bundling(parsed: &ParseResult) -> Option<ImportSite> {
    for script in &parsed.scripts {
        if let Some(reference) = &script.external_ref {
            return Some(ImportSite {
                script_id: script.id.clone(),
                line: script.range.start.line,
                specifier: reference.clone(),
            });
        }
        if let Some(import) = scan_imports(&script.code).into_iter().next() {
            return Some(ImportSite {
                script_id: script.id.clone(),
                line: script.range.start.line + import.line_offset,
                specifier: import.specifier,
            });
        }
    }
    None
}

const HINTS: &[(&[&str], &str)] = &[
    (
        &["unrecognized subcommand", "unexpected argument '--platform"],
        "This deno has no `deno bundle`; upgrade to Deno 2.4 or later.",
    ),
    (
        &["Relative import path", "not prefixed with", "Unsupported scheme"],
        "Bare specifiers need an `npm:` or `jsr:` prefix, or an entry in the import map.",
    ),
    (
        &["Module not found", "Could not resolve", "Cannot resolve"],
        "Check the import path. Relative imports resolve against the .melker file's directory.",
    ),
    (
        &["SyntaxError", "Unexpected token", "Expected", "Unterminated"],
        "A script block or handler has a syntax error. Fix the code at the reported location.",
    ),
    (
        &["Requires read access", "Requires net access", "PermissionDenied", "permission denied"],
        "The bundler lacks a permission it needs (read access to sources or network for remote imports).",
    ),
    (
        &["error sending request", "dns error", "Connection refused", "failed to fetch"],
        "A remote import could not be fetched. Check network access or vendor the dependency.",
    ),
];

/// Attach a human hint to a bundler error message.
pub fn bundling_hint(message: &str) -> Option<&'static str> {
    HINTS
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| message.contains(needle)))
        .map(|(_, hint)| *hint)
}

static ANSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi pattern is valid"));

fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
