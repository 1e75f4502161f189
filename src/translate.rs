//! Runtime error translation.
//!
//! Maps frames of a stack trace taken against the bundled payload back to
//! authored lines of the `.melker` file. Each frame is tried against:
//!
//! 1. the module the frame points at directly, when running unbundled;
//! 2. the bundler's sourcemap, composed with the per-module [`ScriptMeta`]
//!    or, for the entry module, with the [`LineMap`];
//! 3. the [`LineMap`] alone, probing a few lines either side.
//!
//! Only frames in the payload file, the entry module or a script module are
//! resolved. Frames from the host driver, runtime internals or dependencies
//! are kept as [`FrameKind::Unknown`], as are frames none of the steps
//! resolve. Unknown frames are left out of [`TranslatedError::format`].

use std::fmt::Write as _;

use once_cell::sync::Lazy;
use once_cell::unsync::OnceCell;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::generator::{LineMap, ScriptMeta, ENTRY_FILENAME, INIT_FUNCTION, READY_FUNCTION};
use crate::sourcemap::{DecodedMappings, SourceMapV3};

/// How far the line-map fallback searches around a missing line.
pub const FALLBACK_RADIUS: u32 = 5;

static FRAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*at\s+(?:async\s+)?(?:(.+?)\s+\()?(.+?):(\d+):(\d+)\)?\s*$")
        .expect("frame pattern is valid")
});
static HANDLER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^__h(?:andler_?)?\d+$").expect("handler pattern is valid"));
static INIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^__init_\d+$").expect("init pattern is valid"));
static READY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^__ready_\d+$").expect("ready pattern is valid"));

// ---------------------------------------------------------------------------
// Stack parsing
// ---------------------------------------------------------------------------

/// One `at ...` line of a V8 stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawFrame {
    pub function_name: Option<String>,
    pub file: String,
    /// 1-based.
    pub line: u32,
    /// 1-based.
    pub column: u32,
}

/// Split a stack trace into its message and frames. Lines that are not
/// frames and follow the first frame are ignored.
pub fn parse_stack(raw: &str) -> (String, Vec<RawFrame>) {
    let mut message = Vec::new();
    let mut frames = Vec::new();

    for line in raw.lines() {
        match FRAME_RE.captures(line) {
            Some(caps) => {
                let (Ok(line), Ok(column)) = (caps[3].parse(), caps[4].parse()) else {
                    continue;
                };
                frames.push(RawFrame {
                    function_name: caps.get(1).map(|m| m.as_str().to_string()),
                    file: caps[2].to_string(),
                    line,
                    column,
                });
            }
            None if frames.is_empty() => message.push(line),
            None => {}
        }
    }

    (message.join("\n").trim().to_string(), frames)
}

// ---------------------------------------------------------------------------
// Translated output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Script,
    Handler,
    Init,
    Ready,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatedFrame {
    pub function_name: String,
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    pub source_line: Option<String>,
    pub kind: FrameKind,
    pub raw: RawFrame,
}

impl TranslatedFrame {
    pub fn is_known(&self) -> bool {
        self.kind != FrameKind::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslatedError {
    pub message: String,
    pub frames: Vec<TranslatedFrame>,
}

impl TranslatedError {
    pub fn known_frames(&self) -> impl Iterator<Item = &TranslatedFrame> {
        self.frames.iter().filter(|f| f.is_known())
    }

    /// User-facing rendering. Unknown frames are omitted.
    pub fn format(&self) -> String {
        let mut out = String::new();
        out.push_str(if self.message.is_empty() { "Error" } else { &self.message });
        out.push('\n');

        let mut any = false;
        for frame in self.known_frames() {
            any = true;
            let _ = writeln!(out, "  at {} ({}:{})", frame.function_name, frame.file, frame.line);
            if let Some(source) = &frame.source_line {
                let _ = writeln!(out, "    {:>4} | {}", frame.line, source.trim_end());
            }
        }
        if !any {
            out.push_str("  (no frames could be mapped to the source file)\n");
        }
        out
    }
}

// ---------------------------------------------------------------------------
// ErrorTranslator
// ---------------------------------------------------------------------------

/// Where a frame resolved to, before display names are applied.
struct Resolution {
    line: u32,
    column: Option<u32>,
    kind: Option<FrameKind>,
}

pub struct ErrorTranslator {
    source_id: String,
    /// File name of the bundled payload frames are reported against.
    payload_file: Option<String>,
    original_content: Option<String>,
    line_map: LineMap,
    script_meta: Vec<ScriptMeta>,
    source_map: Option<SourceMapV3>,
    /// Decoded `source_map.mappings`, filled on first use.
    decoded: OnceCell<Option<DecodedMappings>>,
}

impl ErrorTranslator {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            payload_file: None,
            original_content: None,
            line_map: LineMap::new(),
            script_meta: Vec::new(),
            source_map: None,
            decoded: OnceCell::new(),
        }
    }

    pub fn with_payload_file(mut self, name: impl Into<String>) -> Self {
        self.payload_file = Some(name.into());
        self
    }

    pub fn with_line_map(mut self, line_map: LineMap) -> Self {
        self.line_map = line_map;
        self
    }

    pub fn with_script_meta(mut self, script_meta: Vec<ScriptMeta>) -> Self {
        self.script_meta = script_meta;
        self
    }

    pub fn with_source_map(mut self, source_map: Option<SourceMapV3>) -> Self {
        self.set_source_map(source_map);
        self
    }

    pub fn with_original_content(mut self, content: impl Into<String>) -> Self {
        self.original_content = Some(content.into());
        self
    }

    /// Replace the sourcemap and drop the memoized decode.
    pub fn set_source_map(&mut self, source_map: Option<SourceMapV3>) {
        self.source_map = source_map;
        self.decoded = OnceCell::new();
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn decoded(&self) -> Option<&DecodedMappings> {
        self.decoded
            .get_or_init(|| {
                let map = self.source_map.as_ref()?;
                match map.decode() {
                    Ok(decoded) => {
                        debug!(lines = decoded.line_count(), "decoded sourcemap");
                        Some(decoded)
                    }
                    Err(e) => {
                        warn!("sourcemap could not be decoded: {e}");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Translate a raw stack trace.
    pub fn translate(&self, raw: &str) -> TranslatedError {
        let (message, frames) = parse_stack(raw);
        TranslatedError {
            message,
            frames: frames.into_iter().map(|f| self.translate_frame(f)).collect(),
        }
    }

    pub fn translate_frame(&self, raw: RawFrame) -> TranslatedFrame {
        let name_kind = raw.function_name.as_deref().and_then(kind_for_name);

        let Some(resolved) = self.resolve(&raw) else {
            return TranslatedFrame {
                function_name: raw.function_name.clone().unwrap_or_else(|| "<anonymous>".into()),
                file: raw.file.clone(),
                line: raw.line,
                column: Some(raw.column),
                source_line: None,
                kind: FrameKind::Unknown,
                raw,
            };
        };

        let kind = name_kind.or(resolved.kind).unwrap_or(FrameKind::Script);
        TranslatedFrame {
            function_name: display_name(raw.function_name.as_deref(), kind),
            file: self.source_id.clone(),
            line: resolved.line,
            column: resolved.column,
            source_line: self.source_line(resolved.line),
            kind,
            raw,
        }
    }

    fn resolve(&self, raw: &RawFrame) -> Option<Resolution> {
        if let Some(meta) = self.meta_for(&raw.file) {
            return Some(Resolution {
                line: meta.original_line_for(raw.line),
                column: None,
                kind: kind_for_module(&meta.filename),
            });
        }
        if is_file(&raw.file, ENTRY_FILENAME) {
            return self.from_line_map(raw.line);
        }
        if !self.is_payload(&raw.file) {
            return None;
        }
        self.from_source_map(raw).or_else(|| self.from_line_map(raw.line))
    }

    fn is_payload(&self, file: &str) -> bool {
        self.payload_file
            .as_deref()
            .is_some_and(|payload| is_file(file, payload))
    }

    fn from_source_map(&self, raw: &RawFrame) -> Option<Resolution> {
        let decoded = self.decoded()?;
        let map = self.source_map.as_ref()?;
        let position = decoded.lookup(raw.line, Some(raw.column.saturating_sub(1)))?;
        let source = map.source(position.source_index)?;

        if let Some(meta) = self.meta_for(&source) {
            return Some(Resolution {
                line: meta.original_line_for(position.line),
                column: Some(position.column),
                kind: kind_for_module(&meta.filename),
            });
        }
        if is_file(&source, ENTRY_FILENAME) {
            let mapping = self.line_map.get(position.line)?;
            return Some(Resolution {
                line: mapping.original_line,
                column: None,
                kind: kind_for_name(&mapping.source_id),
            });
        }
        None
    }

    fn from_line_map(&self, line: u32) -> Option<Resolution> {
        let (_, mapping) = self.line_map.lookup_near(line, FALLBACK_RADIUS)?;
        Some(Resolution {
            line: mapping.original_line,
            column: None,
            kind: kind_for_name(&mapping.source_id),
        })
    }

    fn meta_for(&self, file: &str) -> Option<&ScriptMeta> {
        self.script_meta
            .iter()
            .find(|meta| is_file(file, &meta.filename))
    }

    fn source_line(&self, line: u32) -> Option<String> {
        let content = self.original_content.as_ref()?;
        let index = line.checked_sub(1)? as usize;
        content.lines().nth(index).map(|l| l.trim_end().to_string())
    }

    /// `"defined at <file>:<line>"` for a handler or script id.
    pub fn handler_location(&self, id: &str) -> Option<String> {
        self.line_map
            .find_by_source_id(id)
            .map(|(_, mapping)| format!("defined at {}:{}", self.source_id, mapping.original_line))
    }
}

/// `file` is `name` or a path or URL whose last segment is `name`.
fn is_file(file: &str, name: &str) -> bool {
    file == name
        || file
            .strip_suffix(name)
            .is_some_and(|rest| rest.ends_with('/') || rest.ends_with('\\'))
}

fn last_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn kind_for_name(name: &str) -> Option<FrameKind> {
    let name = last_segment(name);
    if HANDLER_ID_RE.is_match(name) {
        Some(FrameKind::Handler)
    } else if name == INIT_FUNCTION || INIT_RE.is_match(name) {
        Some(FrameKind::Init)
    } else if name == READY_FUNCTION || READY_RE.is_match(name) {
        Some(FrameKind::Ready)
    } else {
        None
    }
}

fn kind_for_module(filename: &str) -> Option<FrameKind> {
    if filename.starts_with("_init_") {
        Some(FrameKind::Init)
    } else if filename.starts_with("_ready_") {
        Some(FrameKind::Ready)
    } else if filename.starts_with("_inline_") {
        Some(FrameKind::Script)
    } else {
        None
    }
}

fn display_name(name: Option<&str>, kind: FrameKind) -> String {
    let named = name.and_then(kind_for_name).or(name.is_none().then_some(kind));
    match named {
        Some(FrameKind::Handler) => "event handler".into(),
        Some(FrameKind::Init) => "async init".into(),
        Some(FrameKind::Ready) => "async ready".into(),
        _ => name.unwrap_or("<anonymous>").to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
