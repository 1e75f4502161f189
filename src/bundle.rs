//! Bundle orchestration.
//!
//! `process_melker_bundle` runs the pipeline for one parsed file:
//! 1. Return a cached bundle when caching is enabled and the entry is valid
//! 2. Fail fast when scripts import modules but no toolchain is available
//! 3. Generate the entry and script modules
//! 4. Bundle them, or run them unbundled when nothing needs linking
//! 5. Rewrite handler attributes in the template
//! 6. Store the result in the cache
//!
//! Every step is awaited in order; nothing runs concurrently for one file.

use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::bundler::{bundle_generated, requires_bundling, ScratchDir, Toolchain, TOOLCHAIN_UNAVAILABLE_HINT};
use crate::cache::{BundleCache, CacheEntry, CacheLookup, StoreOutcome};
use crate::generator::{generate, GeneratedSource, LineMap, ScriptMeta, ENTRY_FILENAME};
use crate::rewrite::{rewrite_handlers, validate_handler_references};
use crate::runtime::PAYLOAD_FILENAME;
use crate::sourcemap::SourceMapV3;
use crate::translate::ErrorTranslator;
use crate::{BundleError, BundleOptions, Diagnostic, ParseResult};

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// A bundled `.melker` file, ready to execute.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledMelker {
    /// Template with handler attributes routed through the registry.
    pub template: String,
    pub bundled_code: String,
    pub line_map: LineMap,
    pub source_map: Option<SourceMapV3>,
    pub script_meta: Vec<ScriptMeta>,
    pub original_content: String,
    pub source_id: String,
    /// Generated modules an unbundled payload imports. Removed on drop.
    #[serde(skip)]
    pub artifacts: Option<ScratchDir>,
    pub metadata: Option<BundleMetadata>,
}

impl AssembledMelker {
    /// An error translator over this bundle's mappings, for a payload
    /// written as [`PAYLOAD_FILENAME`].
    pub fn translator(&self) -> ErrorTranslator {
        ErrorTranslator::new(self.source_id.clone())
            .with_payload_file(PAYLOAD_FILENAME)
            .with_line_map(self.line_map.clone())
            .with_script_meta(self.script_meta.clone())
            .with_source_map(self.source_map.clone())
            .with_original_content(self.original_content.clone())
    }

    /// True when the payload is the generated entry rather than a bundle.
    pub fn is_unbundled(&self) -> bool {
        self.artifacts.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub toolchain_version: Option<String>,
    pub from_cache: bool,
    /// Script module file names, in generation order.
    pub modules: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    /// Generated entry text (debug mode only).
    pub generated_entry: Option<String>,
    /// Kept scratch directory (debug mode only).
    pub out_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub async fn process_melker_bundle<T: Toolchain>(
    parsed: &ParseResult,
    opts: &BundleOptions,
    toolchain: &T,
) -> Result<AssembledMelker, BundleError> {
    let toolchain_version = toolchain.version().await;
    let cache = opts
        .use_cache
        .then(|| BundleCache::open(opts.cache_dir.as_deref()));

    // 1. Cache
    if let (Some(cache), Some(version)) = (&cache, &toolchain_version) {
        match cache.lookup(&parsed.source_id, &parsed.content, version).await {
            CacheLookup::Hit(entry) => {
                info!(source = %parsed.source_id, "using cached bundle");
                return Ok(from_cache_entry(parsed, *entry));
            }
            CacheLookup::Miss(reason) => debug!(?reason, "bundle cache miss"),
        }
    }

    // 2. Toolchain requirement
    let import_site = requires_bundling(parsed);
    if toolchain_version.is_none() {
        if let Some(site) = &import_site {
            return Err(BundleError::ToolchainUnavailable {
                file: parsed.source_id.clone(),
                line: site.line,
                specifier: site.specifier.clone(),
                hint: TOOLCHAIN_UNAVAILABLE_HINT,
            });
        }
    }

    // 3. Generate
    let generated = generate(parsed);
    let mut diagnostics = generated.diagnostics.clone();
    debug!(
        modules = generated.modules.len(),
        mapped_lines = generated.line_map.len(),
        "generated entry"
    );

    // 4. Bundle
    let scratch = ScratchDir::new()?;
    let mut out_dir = None;
    let (bundled_code, source_map, artifacts) = match &toolchain_version {
        Some(version) => {
            debug!(%version, "bundling");
            let result = bundle_generated(toolchain, &generated, &scratch, opts.minify)
                .await
                .map_err(|e| locate_failure(&generated, e))?;
            diagnostics.extend(result.warnings.iter().map(|w| Diagnostic::warning(w.clone(), None)));
            if opts.debug {
                out_dir = Some(scratch.keep());
            }
            (result.code, result.source_map, None)
        }
        None => {
            scratch.write_generated(&generated).await?;
            diagnostics.push(Diagnostic::info(
                "No bundling toolchain available; running the generated modules unbundled",
            ));
            (generated.entry.clone(), None, Some(scratch))
        }
    };

    // 5. Template
    let template = rewrite_handlers(&parsed.template, &parsed.handlers);
    if let Err(problems) = validate_handler_references(&template, &parsed.handlers) {
        diagnostics.extend(problems);
    }

    // 6. Cache
    if let (Some(cache), Some(version), None) = (&cache, &toolchain_version, &artifacts) {
        let entry = CacheEntry {
            source_map: source_map.clone(),
            script_meta: generated.script_meta.clone(),
            ..BundleCache::entry_for(
                &parsed.content,
                bundled_code.clone(),
                generated.line_map.clone(),
                template.clone(),
                version,
            )
        };
        if let StoreOutcome::Failed(reason) = cache.store(&parsed.source_id, &parsed.content, &entry).await {
            diagnostics.push(Diagnostic::warning(
                format!("Bundle cache not written: {reason}"),
                None,
            ));
        }
    }

    let metadata = BundleMetadata {
        toolchain_version,
        from_cache: false,
        modules: generated.modules.iter().map(|m| m.filename.clone()).collect(),
        diagnostics,
        generated_entry: opts.debug.then(|| generated.entry.clone()),
        out_dir,
    };

    Ok(AssembledMelker {
        template,
        bundled_code,
        line_map: generated.line_map,
        source_map,
        script_meta: generated.script_meta,
        original_content: parsed.content.clone(),
        source_id: parsed.source_id.clone(),
        artifacts,
        metadata: Some(metadata),
    })
}

fn from_cache_entry(parsed: &ParseResult, entry: CacheEntry) -> AssembledMelker {
    AssembledMelker {
        template: entry.template,
        bundled_code: entry.bundled_code,
        line_map: entry.line_map,
        source_map: entry.source_map,
        script_meta: entry.script_meta,
        original_content: parsed.content.clone(),
        source_id: parsed.source_id.clone(),
        artifacts: None,
        metadata: Some(BundleMetadata {
            toolchain_version: Some(entry.toolchain_version),
            from_cache: true,
            ..Default::default()
        }),
    }
}

static MODULE_LOCATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(_melker_entry|_(?:inline|init|ready)_\d+)\.ts:(\d+)")
        .expect("module location pattern is valid")
});

/// Point a bundler failure at the authored line when its message names a
/// generated module position.
fn locate_failure(generated: &GeneratedSource, err: BundleError) -> BundleError {
    match err {
        BundleError::BundleFailed { message, hint, line: None } => {
            let line = MODULE_LOCATION_RE.captures(&message).and_then(|caps| {
                let filename = format!("{}.ts", &caps[1]);
                let module_line: u32 = caps[2].parse().ok()?;
                if filename == ENTRY_FILENAME {
                    generated.line_map.get(module_line).map(|m| m.original_line)
                } else {
                    generated.meta(&filename).map(|m| m.original_line_for(module_line))
                }
            });
            BundleError::BundleFailed { message, hint, line }
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Fatal reporting
// ---------------------------------------------------------------------------

/// A located, hinted rendering of a startup failure.
pub struct FatalError<'a> {
    source_id: &'a str,
    content: &'a str,
    error: &'a BundleError,
}

impl<'a> FatalError<'a> {
    pub fn new(parsed: &'a ParseResult, error: &'a BundleError) -> Self {
        Self {
            source_id: &parsed.source_id,
            content: &parsed.content,
            error,
        }
    }

    fn line(&self) -> Option<u32> {
        match self.error {
            BundleError::ToolchainUnavailable { line, .. } => Some(*line),
            BundleError::BundleFailed { line, .. } => *line,
            _ => None,
        }
    }
}

impl fmt::Display for FatalError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.error)?;
        if let Some(line) = self.line() {
            writeln!(f, "  --> {}:{}", self.source_id, line)?;
            let text = line
                .checked_sub(1)
                .and_then(|idx| self.content.lines().nth(idx as usize));
            if let Some(text) = text {
                let gutter = " ".repeat(line.to_string().len());
                writeln!(f, "{gutter} |")?;
                writeln!(f, "{line} | {}", text.trim_end())?;
                writeln!(f, "{gutter} |")?;
            }
        }
        if let Some(hint) = self.error.hint() {
            writeln!(f, "hint: {hint}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
