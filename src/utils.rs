//! Utility functions for the bundler.
//!
//! - JS string escaping (injection-safe)
//! - Module reference resolution against the `.melker` file location
//! - Import syntax scanning

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

// ---------------------------------------------------------------------------
// JS String Escaping
// ---------------------------------------------------------------------------

/// Escape a string for safe embedding inside a JS double-quoted string literal.
pub fn escape_js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Number of lines in `text`, counting a trailing partial line.
pub fn line_count(text: &str) -> u32 {
    text.split('\n').count() as u32
}

// ---------------------------------------------------------------------------
// Reference resolution
// ---------------------------------------------------------------------------

/// True when `reference` already carries a URL scheme (`npm:`, `jsr:`,
/// `https:`, `file:` ...). Single-letter schemes are Windows drive letters.
pub fn has_scheme(reference: &str) -> bool {
    match Url::parse(reference) {
        Ok(url) => url.scheme().len() > 1,
        Err(_) => false,
    }
}

/// URL of the `.melker` file itself. Plain paths become `file://` URLs.
pub fn base_url(source_id: &str) -> Option<Url> {
    if has_scheme(source_id) {
        return Url::parse(source_id).ok();
    }
    let path = Path::new(source_id);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    Url::from_file_path(absolute).ok()
}

/// Resolve a script reference against the owning file's location.
///
/// Absolute references are returned unchanged. When no URL can be built
/// the reference is joined to the file's directory as a plain path.
pub fn resolve_reference(source_id: &str, reference: &str) -> String {
    if has_scheme(reference) {
        return reference.to_string();
    }
    match base_url(source_id).and_then(|base| base.join(reference).ok()) {
        Some(url) => url.to_string(),
        None => naive_join(source_id, reference),
    }
}

fn naive_join(source_id: &str, reference: &str) -> String {
    if reference.starts_with('/') {
        return reference.to_string();
    }
    let dir = source_dirname(source_id);
    format!("{}/{}", dir, reference.trim_start_matches("./"))
}

/// Directory part of a path or URL, without trailing separator.
pub fn source_dirname(source_id: &str) -> String {
    match source_id.rfind(['/', '\\']) {
        Some(0) => "/".to_string(),
        Some(idx) => source_id[..idx].to_string(),
        None => ".".to_string(),
    }
}

/// Local filesystem path for a source id, when it names one.
pub fn source_path(source_id: &str) -> Option<PathBuf> {
    if has_scheme(source_id) {
        return Url::parse(source_id).ok()?.to_file_path().ok();
    }
    Some(PathBuf::from(source_id))
}

// ---------------------------------------------------------------------------
// Import scanning
// ---------------------------------------------------------------------------

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)(?:^|[;\s])(?:import|export)\s*(?:[\w*${}\s,]+?\s*from\s*)?["']([^"'\n]+)["']|\bimport\s*\(\s*["']([^"'\n]+)["']\s*\)"#,
    )
    .expect("import pattern is valid")
});

/// A module specifier found in script code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub specifier: String,
    /// Byte range of the specifier text (without quotes) in the code.
    pub start: usize,
    pub end: usize,
    /// 0-based line of the specifier within the code.
    pub line_offset: u32,
}

/// Find static, re-export and dynamic import specifiers in `code`.
pub fn scan_imports(code: &str) -> Vec<ImportRef> {
    IMPORT_RE
        .captures_iter(code)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| ImportRef {
            specifier: m.as_str().to_string(),
            start: m.start(),
            end: m.end(),
            line_offset: code[..m.start()].matches('\n').count() as u32,
        })
        .collect()
}

/// Specifiers relative to the authoring file (`./x`, `../x`, `/x`).
pub fn is_relative_specifier(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
}

/// Rewrite relative import specifiers so they resolve against the `.melker`
/// file instead of the scratch directory. Line structure is preserved.
pub fn resolve_relative_imports(code: &str, source_id: &str) -> String {
    let mut out = code.to_string();
    let mut imports = scan_imports(code);
    imports.sort_by(|a, b| b.start.cmp(&a.start));
    for import in imports {
        if is_relative_specifier(&import.specifier) {
            let resolved = resolve_reference(source_id, &import.specifier);
            out.replace_range(import.start..import.end, &resolved);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
