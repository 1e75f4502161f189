//! Handler template rewriting.
//!
//! Replaces each inline handler attribute in the markup with a call through
//! the runtime registry, splicing at the exact byte range recorded by the
//! parser. Bytes outside handler attributes are never touched.

use tracing::warn;

use crate::generator::REGISTRY_GLOBAL;
use crate::{Diagnostic, DiagnosticLevel, ParsedHandler};

/// Attribute text that routes an event through the registry.
pub fn registry_call(handler: &ParsedHandler) -> String {
    format!(
        "{}=\"{}.{}({})\"",
        handler.attr_name,
        REGISTRY_GLOBAL,
        handler.id,
        handler.params.join(", ")
    )
}

/// Rewrite handler attributes in `template`.
///
/// Auth callbacks are skipped; they are wired through another channel.
/// Handlers are spliced by descending start offset so earlier offsets stay
/// valid. A handler whose recorded range no longer starts with its attribute
/// name is skipped with a warning instead of corrupting the template.
pub fn rewrite_handlers(template: &str, handlers: &[ParsedHandler]) -> String {
    let mut ordered: Vec<&ParsedHandler> = handlers
        .iter()
        .filter(|h| !h.is_auth_callback())
        .collect();
    ordered.sort_by(|a, b| {
        b.attr_range
            .start
            .byte_offset
            .cmp(&a.attr_range.start.byte_offset)
    });

    let mut out = template.to_string();
    // Lowest start offset spliced so far; ranges must end at or before it.
    let mut floor = template.len();
    for handler in ordered {
        let start = handler.attr_range.start.byte_offset;
        let end = handler.attr_range.end.byte_offset;

        if let Err(reason) = check_range(template, handler, start, end, floor) {
            warn!(
                handler = %handler.id,
                attr = %handler.attr_name,
                line = handler.element.line,
                "skipping handler rewrite: {reason}"
            );
            continue;
        }

        out.replace_range(start..end, &registry_call(handler));
        floor = start;
    }
    out
}

fn check_range(
    template: &str,
    handler: &ParsedHandler,
    start: usize,
    end: usize,
    floor: usize,
) -> Result<(), String> {
    if start > end || end > template.len() {
        return Err(format!("range {start}..{end} is outside the template"));
    }
    if end > floor {
        return Err(format!("range {start}..{end} overlaps another handler"));
    }
    if !template.is_char_boundary(start) || !template.is_char_boundary(end) {
        return Err(format!("range {start}..{end} splits a character"));
    }
    if !template[start..end].starts_with(handler.attr_name.as_str()) {
        let found: String = template[start..end].chars().take(24).collect();
        return Err(format!(
            "expected `{}` at byte {start}, found `{found}`",
            handler.attr_name
        ));
    }
    Ok(())
}

/// Check every non-auth handler is referenced exactly once in the
/// rewritten template.
pub fn validate_handler_references(
    template: &str,
    handlers: &[ParsedHandler],
) -> Result<(), Vec<Diagnostic>> {
    let mut problems = Vec::new();
    for handler in handlers.iter().filter(|h| !h.is_auth_callback()) {
        let needle = format!("{}.{}(", REGISTRY_GLOBAL, handler.id);
        let count = template.matches(&needle).count();
        if count != 1 {
            problems.push(Diagnostic {
                level: DiagnosticLevel::Warning,
                message: format!(
                    "Handler `{}` is referenced {} times in the template (expected 1)",
                    handler.id, count
                ),
                context: Some(format!(
                    "{} on <{}> at line {}",
                    handler.attr_name, handler.element.tag, handler.element.line
                )),
            });
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
