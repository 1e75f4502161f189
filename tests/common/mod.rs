#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use melker_bundler::bundler::{BundleRequest, ToolchainOutput};
use melker_bundler::{
    BundleError, ElementInfo, ParseResult, ParsedHandler, ParsedScript, ScriptKind,
    SourcePosition, SourceRange, Toolchain,
};

// ---------------------------------------------------------------------------
// Minimal .melker reader
// ---------------------------------------------------------------------------

static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<script(?P<attrs>[^>]*)>(?P<code>.*?)</script>").unwrap());
static HANDLER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?P<attr>on[A-Z]\w*)="(?P<code>[^"]*)""#).unwrap());
static TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"type="(\w+)""#).unwrap());
static SRC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"src="([^"]+)""#).unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([A-Za-z][\w-]*)").unwrap());
static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\sid="([^"]+)""#).unwrap());

pub fn pos(content: &str, byte_offset: usize) -> SourcePosition {
    let before = &content[..byte_offset];
    let line = before.matches('\n').count() as u32 + 1;
    let column = (byte_offset - before.rfind('\n').map_or(0, |i| i + 1)) as u32;
    SourcePosition { line, column, byte_offset }
}

fn range(content: &str, start: usize, end: usize) -> SourceRange {
    SourceRange {
        start: pos(content, start),
        end: pos(content, end),
    }
}

/// Stand-in for the template parser: script blocks and `onX="..."`
/// attributes, with exact offsets. The template is the full content.
pub fn parse(source_id: &str, content: &str) -> ParseResult {
    let scripts = SCRIPT_RE
        .captures_iter(content)
        .enumerate()
        .map(|(i, caps)| {
            let whole = caps.get(0).unwrap();
            let attrs = &caps["attrs"];
            let code = caps["code"].to_string();
            let kind = match TYPE_RE.captures(attrs).map(|c| c[1].to_string()).as_deref() {
                Some("init") => ScriptKind::Init,
                Some("ready") => ScriptKind::Ready,
                _ => ScriptKind::Sync,
            };
            ParsedScript {
                id: format!("script_{i}"),
                kind,
                has_await: code.contains("await"),
                external_ref: SRC_RE.captures(attrs).map(|c| c[1].to_string()),
                code,
                range: range(content, whole.start(), whole.end()),
            }
        })
        .collect();

    let handlers = HANDLER_RE
        .captures_iter(content)
        .enumerate()
        .map(|(i, caps)| {
            let attr = caps.get(0).unwrap();
            let code = caps.get(2).unwrap();
            let tag_start = content[..attr.start()].rfind('<').unwrap();
            let tag_text = &content[tag_start..attr.start()];
            ParsedHandler {
                id: format!("__h{i}"),
                attr_name: caps["attr"].to_string(),
                code: code.as_str().to_string(),
                has_await: code.as_str().contains("await"),
                params: vec!["event".to_string()],
                attr_range: range(content, attr.start(), attr.end()),
                code_range: range(content, code.start(), code.end()),
                element: ElementInfo {
                    tag: TAG_RE.captures(tag_text).unwrap()[1].to_string(),
                    id: ID_RE.captures(tag_text).map(|c| c[1].to_string()),
                    line: pos(content, tag_start).line,
                },
            }
        })
        .collect();

    ParseResult {
        source_id: source_id.to_string(),
        content: content.to_string(),
        template: content.to_string(),
        scripts,
        handlers,
    }
}

pub const COUNTER_APP: &str = r#"<melker>
  <script>
    export let count = 0;
    export function bump(n) { count += n; }
  </script>
  <script type="ready">
    $melker.render();
  </script>
  <container id="root">
    <text id="label">Count</text>
    <button id="inc" label="+" onClick="$app.bump(1)"/>
    <button id="dec" label="-" onClick="$app.bump(-1)"/>
    <input id="name" onChange="await $melker.logger.info(event.value)"/>
  </container>
</melker>
"#;

pub fn sha256(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Fake toolchain
// ---------------------------------------------------------------------------

/// Returns the entry text as the bundle with a line-for-line sourcemap
/// onto `_melker_entry.ts`.
pub struct FakeToolchain {
    pub version: Option<String>,
    pub failure: Option<String>,
    pub calls: AtomicUsize,
    pub entries: Mutex<Vec<String>>,
}

impl FakeToolchain {
    pub fn new(version: &str) -> Self {
        Self {
            version: Some(version.to_string()),
            failure: None,
            calls: AtomicUsize::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn absent() -> Self {
        Self {
            version: None,
            ..Self::new("")
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new("fake 1.0.0")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn identity_mappings(lines: usize) -> String {
    (0..lines)
        .map(|i| if i == 0 { "AAAA" } else { "AACA" })
        .collect::<Vec<_>>()
        .join(";")
}

impl Toolchain for FakeToolchain {
    fn version(&self) -> impl Future<Output = Option<String>> + Send {
        let version = self.version.clone();
        async move { version }
    }

    fn bundle(
        &self,
        request: BundleRequest<'_>,
    ) -> impl Future<Output = Result<ToolchainOutput, BundleError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let entry = std::fs::read_to_string(request.entry).unwrap();
        self.entries.lock().unwrap().push(entry.clone());
        let failure = self.failure.clone();
        async move {
            if let Some(message) = failure {
                return Err(BundleError::BundleFailed {
                    hint: melker_bundler::bundler::bundling_hint(&message),
                    message,
                    line: None,
                });
            }
            let map = serde_json::json!({
                "version": 3,
                "sources": ["_melker_entry.ts"],
                "names": [],
                "mappings": identity_mappings(entry.lines().count()),
            });
            Ok(ToolchainOutput {
                code: entry,
                source_map: Some(map.to_string()),
                warnings: vec![],
            })
        }
    }
}
