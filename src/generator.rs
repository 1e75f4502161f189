//! Code generation.
//!
//! Turns a `ParseResult` into one entry module plus one module per inline,
//! init and ready script, recording where every authored line ended up.
//!
//! Entry sections, always in this order:
//! 1. execution context declarations (`$melker`, `argv`, `$app`)
//! 2. sync script imports
//! 3. export merge routine and merge calls
//! 4. init/ready imports and their combining functions
//! 5. handler functions
//! 6. the `globalThis.__melker` registry
//!
//! **Invariant:** generation is a pure function of its input. Same input,
//! same bytes, same line map. The cache key and diagnostics depend on it.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::utils::{escape_js_string, line_count, resolve_reference, resolve_relative_imports};
use crate::{Diagnostic, ParseResult, ParsedHandler, ParsedScript, ScriptKind};

/// File name the entry module is written under in the scratch directory.
pub const ENTRY_FILENAME: &str = "_melker_entry.ts";

/// Name of the registry the bundle publishes on `globalThis`.
pub const REGISTRY_GLOBAL: &str = "__melker";

/// Combining functions for lifecycle scripts.
pub const INIT_FUNCTION: &str = "__melkerInit";
pub const READY_FUNCTION: &str = "__melkerReady";

/// Members the host's execution context object is expected to expose.
/// The default script host builds its fallback context from this list.
pub const CONTEXT_MEMBERS: &[&str] = &[
    "getElementById",
    "render",
    "forceRender",
    "exit",
    "quit",
    "setTitle",
    "alert",
    "confirm",
    "prompt",
    "copyToClipboard",
    "openBrowser",
    "logger",
    "exports",
    "url",
    "dirname",
];

const MODULE_PREAMBLE: [&str; 2] = [
    "const $melker = globalThis.$melker;",
    "const argv = globalThis.argv ?? [];",
];

const MERGE_ROUTINE: &str = r#"function __melkerMergeExports(target, source, origin) {
  for (const key of Object.keys(source)) {
    if (Object.prototype.hasOwnProperty.call(target, key)) {
      $melker.logger?.warn?.(`Export "${key}" from ${origin} overrides an earlier script export`);
    }
    target[key] = source[key];
  }
}"#;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Where a generated line came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineMapping {
    pub original_line: u32,
    /// Script or handler id the line belongs to.
    pub source_id: String,
    pub description: String,
}

/// Generated line -> authored line. Serialized as an ordered list of
/// `[line, mapping]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(u32, LineMapping)>", into = "Vec<(u32, LineMapping)>")]
pub struct LineMap {
    entries: BTreeMap<u32, LineMapping>,
}

impl LineMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, generated_line: u32, mapping: LineMapping) {
        self.entries.insert(generated_line, mapping);
    }

    pub fn get(&self, generated_line: u32) -> Option<&LineMapping> {
        self.entries.get(&generated_line)
    }

    /// Exact lookup, then the nearest line within `radius` (below first on ties).
    pub fn lookup_near(&self, generated_line: u32, radius: u32) -> Option<(u32, &LineMapping)> {
        if let Some(mapping) = self.get(generated_line) {
            return Some((generated_line, mapping));
        }
        for distance in 1..=radius {
            if let Some(below) = generated_line.checked_sub(distance) {
                if let Some(mapping) = self.get(below) {
                    return Some((below, mapping));
                }
            }
            if let Some(above) = generated_line.checked_add(distance) {
                if let Some(mapping) = self.get(above) {
                    return Some((above, mapping));
                }
            }
        }
        None
    }

    /// First generated line belonging to `source_id`.
    pub fn find_by_source_id(&self, source_id: &str) -> Option<(u32, &LineMapping)> {
        self.entries
            .iter()
            .find(|(_, mapping)| mapping.source_id == source_id)
            .map(|(line, mapping)| (*line, mapping))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &LineMapping)> {
        self.entries.iter().map(|(line, mapping)| (*line, mapping))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<(u32, LineMapping)>> for LineMap {
    fn from(pairs: Vec<(u32, LineMapping)>) -> Self {
        Self {
            entries: pairs.into_iter().collect(),
        }
    }
}

impl From<LineMap> for Vec<(u32, LineMapping)> {
    fn from(map: LineMap) -> Self {
        map.entries.into_iter().collect()
    }
}

/// A script compiled as its own module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptModule {
    pub filename: String,
    /// Header plus script code.
    pub content: String,
    pub original_line: u32,
    pub source_id: String,
}

/// Header bookkeeping for the sourcemap path of the error translator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptMeta {
    pub filename: String,
    /// Line the owning script tag begins on.
    pub original_line: u32,
    /// Synthetic lines before user code. The first fragment of the code
    /// continues the last header line.
    pub header_lines: u32,
}

impl ScriptMeta {
    /// Authored line for a 1-based line of this module.
    pub fn original_line_for(&self, module_line: u32) -> u32 {
        self.original_line
            .saturating_add(module_line)
            .saturating_sub(self.header_lines)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSource {
    pub entry: String,
    pub modules: Vec<ScriptModule>,
    pub line_map: LineMap,
    pub script_meta: Vec<ScriptMeta>,
    pub original_content: String,
    pub source_id: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl GeneratedSource {
    pub fn module(&self, filename: &str) -> Option<&ScriptModule> {
        self.modules.iter().find(|m| m.filename == filename)
    }

    pub fn meta(&self, filename: &str) -> Option<&ScriptMeta> {
        self.script_meta.iter().find(|m| m.filename == filename)
    }
}

// ---------------------------------------------------------------------------
// Line emitter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Emitter {
    lines: Vec<String>,
    line_map: LineMap,
}

impl Emitter {
    fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn push_mapped(&mut self, line: impl Into<String>, original_line: u32, source_id: &str, description: &str) {
        self.lines.push(line.into());
        let generated_line = self.lines.len() as u32;
        self.line_map.insert(
            generated_line,
            LineMapping {
                original_line,
                source_id: source_id.to_string(),
                description: description.to_string(),
            },
        );
    }

    fn push_code(&mut self, code: &str, first_line: u32, source_id: &str, description: &str) {
        for (offset, line) in code.split('\n').enumerate() {
            self.push_mapped(line, first_line + offset as u32, source_id, description);
        }
    }

    fn finish(self) -> (String, LineMap) {
        let mut text = self.lines.join("\n");
        text.push('\n');
        (text, self.line_map)
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

struct LifecycleImport {
    function: String,
    original_line: u32,
    source_id: String,
}

/// Generate the entry module, script modules and mappings for a parsed file.
pub fn generate(parsed: &ParseResult) -> GeneratedSource {
    let mut out = Emitter::default();
    let mut modules = Vec::new();
    let mut script_meta = Vec::new();
    let mut diagnostics = Vec::new();

    // 1. Execution context
    out.push(format!(
        "// Generated by melker-bundler from {}. Do not edit.",
        single_line(&parsed.source_id)
    ));
    out.push(MODULE_PREAMBLE[0]);
    out.push("if (!$melker) throw new Error(\"melker: execution context missing (globalThis.$melker)\");");
    out.push(MODULE_PREAMBLE[1]);
    out.push("const $app = ($melker.exports ??= {});");

    // 2. Sync scripts
    let mut merged: Vec<(String, String, u32, String)> = Vec::new();
    let mut inline_count = 0;
    for script in parsed.scripts.iter().filter(|s| s.kind == ScriptKind::Sync) {
        let binding = format!("__script_{}", merged.len());
        let line = script.range.start.line;
        let origin = match &script.external_ref {
            Some(reference) => {
                let url = resolve_reference(&parsed.source_id, reference);
                out.push_mapped(
                    format!("import * as {binding} from \"{}\";", escape_js_string(&url)),
                    line,
                    &script.id,
                    "script src",
                );
                reference.clone()
            }
            None => {
                let filename = format!("_inline_{inline_count}.ts");
                inline_count += 1;
                let header = module_header(&filename, parsed, script);
                let (module, meta) = build_module(&filename, header, &script_code(parsed, script), None, script);
                modules.push(module);
                script_meta.push(meta);
                out.push_mapped(
                    format!("import * as {binding} from \"./{filename}\";"),
                    line,
                    &script.id,
                    "script",
                );
                filename
            }
        };
        merged.push((binding, origin, line, script.id.clone()));
    }

    // 3. Export merge
    if !merged.is_empty() {
        for line in MERGE_ROUTINE.lines() {
            out.push(line);
        }
        for (binding, origin, line, id) in &merged {
            out.push_mapped(
                format!(
                    "__melkerMergeExports($app, {binding}, \"{}\");",
                    escape_js_string(origin)
                ),
                *line,
                id,
                "script exports",
            );
        }
    }

    // 4. Lifecycle scripts
    let mut init = Vec::new();
    let mut ready = Vec::new();
    for script in &parsed.scripts {
        let (list, prefix) = match script.kind {
            ScriptKind::Sync => continue,
            ScriptKind::Init => (&mut init, "init"),
            ScriptKind::Ready => (&mut ready, "ready"),
        };
        let index = list.len();
        let filename = format!("_{prefix}_{index}.ts");
        let function = format!("__{prefix}_{index}");

        let mut header = module_header(&filename, parsed, script);
        let body = match &script.external_ref {
            Some(reference) => {
                let url = resolve_reference(&parsed.source_id, reference);
                header.push(format!(
                    "import * as __external from \"{}\";",
                    escape_js_string(&url)
                ));
                String::from("\nif (typeof __external.default === \"function\") await __external.default($melker);")
            }
            None => script_code(parsed, script),
        };
        header.push(format!("export async function {function}() {{"));
        header.push("const $app = $melker.exports;".to_string());
        let (module, meta) = build_module(&filename, header, &body, Some("}"), script);
        modules.push(module);
        script_meta.push(meta);

        out.push_mapped(
            format!("import {{ {function} }} from \"./{filename}\";"),
            script.range.start.line,
            &script.id,
            &format!("{prefix} script"),
        );
        list.push(LifecycleImport {
            function,
            original_line: script.range.start.line,
            source_id: script.id.clone(),
        });
    }
    for (name, list, description) in [
        (INIT_FUNCTION, &init, "init script"),
        (READY_FUNCTION, &ready, "ready script"),
    ] {
        if list.is_empty() {
            continue;
        }
        out.push(format!("async function {name}() {{"));
        for hook in list {
            out.push_mapped(
                format!("  await {}();", hook.function),
                hook.original_line,
                &hook.source_id,
                description,
            );
        }
        out.push("}");
    }

    // 5. Handlers
    let mut handler_ids = Vec::new();
    let mut seen = HashSet::new();
    for handler in &parsed.handlers {
        if !seen.insert(handler.id.as_str()) {
            diagnostics.push(Diagnostic::warning(
                format!("Duplicate handler id `{}` skipped", handler.id),
                Some(format!("{} on line {}", handler.attr_name, handler.element.line)),
            ));
            continue;
        }
        emit_handler(&mut out, handler);
        handler_ids.push(handler.id.clone());
    }

    // 6. Registry
    let mut members = Vec::new();
    if !init.is_empty() {
        members.push(format!("init: {INIT_FUNCTION}"));
    }
    if !ready.is_empty() {
        members.push(format!("ready: {READY_FUNCTION}"));
    }
    members.extend(handler_ids);
    if members.is_empty() {
        out.push(format!("globalThis.{REGISTRY_GLOBAL} = {{}};"));
    } else {
        out.push(format!("globalThis.{REGISTRY_GLOBAL} = {{"));
        for member in members {
            out.push(format!("  {member},"));
        }
        out.push("};");
    }

    let (entry, line_map) = out.finish();
    GeneratedSource {
        entry,
        modules,
        line_map,
        script_meta,
        original_content: parsed.content.clone(),
        source_id: parsed.source_id.clone(),
        diagnostics,
    }
}

fn emit_handler(out: &mut Emitter, handler: &ParsedHandler) {
    let element = match &handler.element.id {
        Some(id) => format!("<{}#{}>", handler.element.tag, id),
        None => format!("<{}>", handler.element.tag),
    };
    let description = format!("{} on {}", handler.attr_name, element);
    let keyword = if handler.has_await { "async function" } else { "function" };

    out.push(format!("// {} (line {})", description, handler.element.line));
    out.push(format!(
        "{} {}({}) {{",
        keyword,
        handler.id,
        handler.params.join(", ")
    ));
    let code = normalize_newlines(&handler.code);
    out.push_code(
        code.trim_end_matches('\n'),
        handler.code_range.start.line,
        &handler.id,
        &description,
    );
    out.push("}");
}

fn module_header(filename: &str, parsed: &ParseResult, script: &ParsedScript) -> Vec<String> {
    let mut header = vec![format!(
        "// {}: {} script from {}:{}",
        filename,
        script.kind.as_str(),
        single_line(&parsed.source_id),
        script.range.start.line
    )];
    header.extend(MODULE_PREAMBLE.iter().map(|line| line.to_string()));
    header
}

/// Assemble a module. The code continues the last header line so that
/// module line `header_lines + k - 1` holds code line `k`.
fn build_module(
    filename: &str,
    header: Vec<String>,
    code: &str,
    footer: Option<&str>,
    script: &ParsedScript,
) -> (ScriptModule, ScriptMeta) {
    let header_lines = header.len() as u32;
    let mut content = header.join("\n");
    content.push_str(code);
    if !content.ends_with('\n') {
        content.push('\n');
    }
    if let Some(footer) = footer {
        content.push_str(footer);
        content.push('\n');
    }
    debug_assert!(line_count(&content) > header_lines);

    let module = ScriptModule {
        filename: filename.to_string(),
        content,
        original_line: script.range.start.line,
        source_id: script.id.clone(),
    };
    let meta = ScriptMeta {
        filename: filename.to_string(),
        original_line: script.range.start.line,
        header_lines,
    };
    (module, meta)
}

fn script_code(parsed: &ParseResult, script: &ParsedScript) -> String {
    resolve_relative_imports(&normalize_newlines(&script.code), &parsed.source_id)
}

fn normalize_newlines(code: &str) -> String {
    code.replace("\r\n", "\n")
}

fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
