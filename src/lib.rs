//! # Melker Bundler
//!
//! Runtime bundler for `.melker` terminal apps. Consumes the `ParseResult`
//! produced by the template parser and produces one executable payload plus
//! the mappings needed to report runtime errors at their authored location.
//!
//! Pipeline: generate -> bundle -> rewrite template -> cache -> execute.
//! The bundler never parses markup itself and never interprets scripts.

pub mod bundle;
pub mod bundler;
pub mod cache;
pub mod generator;
pub mod rewrite;
pub mod runtime;
pub mod sourcemap;
pub mod translate;
pub mod utils;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bundle::{AssembledMelker, BundleMetadata, FatalError};
pub use bundler::{BundleResult, DenoToolchain, Toolchain};
pub use cache::{BundleCache, CacheLookup, CacheStats};
pub use generator::{generate, GeneratedSource, LineMap, LineMapping, ScriptMeta, ScriptModule};
pub use rewrite::rewrite_handlers;
pub use runtime::{execute_bundle, DenoHost, ExecutionContext, MelkerRegistry, ScriptHost};
pub use sourcemap::SourceMapV3;
pub use translate::{ErrorTranslator, FrameKind, TranslatedError, TranslatedFrame};

/// Handler ids starting with this prefix are authentication callbacks.
/// They are registered like any handler but never placed in markup.
pub const AUTH_HANDLER_PREFIX: &str = "__auth";

// ---------------------------------------------------------------------------
// Source positions (produced once by the parser)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePosition {
    /// 1-based line.
    pub line: u32,
    /// 0-based column.
    pub column: u32,
    pub byte_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub start: SourcePosition,
    pub end: SourcePosition,
}

// ---------------------------------------------------------------------------
// Parsed file (input contract)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    /// Evaluated at load time; exports are merged into the shared bag.
    Sync,
    /// Awaited once after load, before the first render.
    Init,
    /// Awaited once after the host has rendered.
    Ready,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::Sync => "sync",
            ScriptKind::Init => "init",
            ScriptKind::Ready => "ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedScript {
    pub id: String,
    pub kind: ScriptKind,
    pub code: String,
    /// Value of the `src` attribute, if any.
    #[serde(default)]
    pub external_ref: Option<String>,
    #[serde(default)]
    pub has_await: bool,
    pub range: SourceRange,
}

/// The element owning a handler attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedHandler {
    /// Generated id, unique within the file.
    pub id: String,
    pub attr_name: String,
    pub code: String,
    #[serde(default)]
    pub has_await: bool,
    #[serde(default)]
    pub params: Vec<String>,
    /// Range of the whole attribute (`onClick="..."`) in the template.
    pub attr_range: SourceRange,
    /// Range of the handler code only.
    pub code_range: SourceRange,
    pub element: ElementInfo,
}

impl ParsedHandler {
    pub fn is_auth_callback(&self) -> bool {
        self.id.starts_with(AUTH_HANDLER_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseResult {
    /// Path or URL of the `.melker` file.
    pub source_id: String,
    /// Raw file text. Used for the cache key and for error display.
    pub content: String,
    /// Markup text that handler byte offsets refer to.
    pub template: String,
    #[serde(default)]
    pub scripts: Vec<ParsedScript>,
    #[serde(default)]
    pub handlers: Vec<ParsedHandler>,
}

// ---------------------------------------------------------------------------
// BundleOptions
// ---------------------------------------------------------------------------

/// Options forwarded from the host CLI.
#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
    pub minify: bool,
    /// Opt in to the content-addressed cache.
    pub use_cache: bool,
    /// Keep scratch directories and attach the generated entry to the metadata.
    pub debug: bool,
    /// Cache directory override. Falls back to `MELKER_CACHE_DIR`, then the
    /// platform cache root.
    pub cache_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic emitted during bundling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Info,
            message: message.into(),
            context: None,
        }
    }

    pub fn warning(message: impl Into<String>, context: Option<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
            context,
        }
    }
}

// ---------------------------------------------------------------------------
// BundleError
// ---------------------------------------------------------------------------

/// Errors that abort the bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("{file}:{line}: `{specifier}` needs the bundler, but no bundling toolchain is available")]
    ToolchainUnavailable {
        file: String,
        line: u32,
        specifier: String,
        hint: &'static str,
    },

    #[error("Bundling failed: {message}")]
    BundleFailed {
        message: String,
        hint: Option<&'static str>,
        /// Authored line the failure points at, when it could be located.
        line: Option<u32>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BundleError {
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            BundleError::ToolchainUnavailable { hint, .. } => Some(*hint),
            BundleError::BundleFailed { hint, .. } => *hint,
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Generate, bundle and assemble a parsed `.melker` file.
///
/// Checks the cache first when `opts.use_cache` is set. See
/// [`bundle::process_melker_bundle`] for the full sequence.
pub async fn process_melker_bundle<T: Toolchain>(
    parsed: &ParseResult,
    opts: &BundleOptions,
    toolchain: &T,
) -> Result<AssembledMelker, BundleError> {
    bundle::process_melker_bundle(parsed, opts, toolchain).await
}
