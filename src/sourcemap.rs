//! Version 3 sourcemap decoding.
//!
//! Only decoding is implemented. The bundling toolchain produces the map;
//! the error translator reads it back to find which generated module (and
//! which line in it) a bundled position came from.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMapV3 {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_root: Option<String>,
    pub sources: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    pub mappings: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources_content: Option<Vec<Option<String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceMapError {
    #[error("unsupported sourcemap version {0} (expected 3)")]
    UnsupportedVersion(u32),

    #[error("invalid base64 character `{ch}` in mappings at byte {offset}")]
    InvalidCharacter { ch: char, offset: usize },

    #[error("truncated VLQ value in mappings at byte {0}")]
    Truncated(usize),

    #[error("VLQ value overflows at byte {0}")]
    Overflow(usize),

    #[error("segment with {0} fields (expected 1, 4 or 5)")]
    BadSegment(usize),

    #[error("negative {field} after applying delta at generated line {line}")]
    Negative { field: &'static str, line: u32 },
}

impl SourceMapV3 {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Source path at `index`, with `sourceRoot` applied.
    pub fn source(&self, index: u32) -> Option<String> {
        let source = self.sources.get(index as usize)?;
        Some(match self.source_root.as_deref() {
            Some(root) if !root.is_empty() => {
                format!("{}/{}", root.trim_end_matches('/'), source)
            }
            _ => source.clone(),
        })
    }

    /// Decode the VLQ mapping string into per-line segments.
    pub fn decode(&self) -> Result<DecodedMappings, SourceMapError> {
        if self.version != 3 {
            return Err(SourceMapError::UnsupportedVersion(self.version));
        }
        decode_mappings(&self.mappings)
    }
}

// ---------------------------------------------------------------------------
// Decoded form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// 0-based column in the generated line.
    pub generated_column: u32,
    pub source: Option<SegmentSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSource {
    pub source_index: u32,
    /// 0-based, as stored in the map.
    pub original_line: u32,
    pub original_column: u32,
    pub name_index: Option<u32>,
}

/// A bundled position resolved to a source file position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source_index: u32,
    /// 1-based.
    pub line: u32,
    /// 0-based.
    pub column: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMappings {
    lines: Vec<Vec<Segment>>,
}

impl DecodedMappings {
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn segments(&self, generated_line: u32) -> &[Segment] {
        generated_line
            .checked_sub(1)
            .and_then(|idx| self.lines.get(idx as usize))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolve a 1-based generated line and optional 0-based column.
    ///
    /// With a column, the closest segment starting at or before it wins.
    /// Without one, or when the column precedes every segment, the first
    /// segment carrying a source is used.
    pub fn lookup(&self, generated_line: u32, column: Option<u32>) -> Option<OriginalPosition> {
        let segments = self.segments(generated_line);
        let with_source = || segments.iter().filter_map(|s| s.source.map(|src| (s, src)));

        let chosen = column
            .and_then(|col| {
                with_source()
                    .filter(|(s, _)| s.generated_column <= col)
                    .last()
            })
            .or_else(|| with_source().next())?;

        let (_, src) = chosen;
        Some(OriginalPosition {
            source_index: src.source_index,
            line: src.original_line.checked_add(1)?,
            column: src.original_column,
        })
    }
}

// ---------------------------------------------------------------------------
// VLQ
// ---------------------------------------------------------------------------

const VLQ_CONTINUATION: i64 = 0b10_0000;
const VLQ_MASK: i64 = 0b01_1111;

fn base64_value(byte: u8) -> Option<i64> {
    let value = match byte {
        b'A'..=b'Z' => byte - b'A',
        b'a'..=b'z' => byte - b'a' + 26,
        b'0'..=b'9' => byte - b'0' + 52,
        b'+' => 62,
        b'/' => 63,
        _ => return None,
    };
    Some(value as i64)
}

/// Decode one comma-free segment into its signed fields.
fn decode_segment(segment: &str, base_offset: usize) -> Result<Vec<i64>, SourceMapError> {
    let mut fields = Vec::with_capacity(5);
    let mut value: i64 = 0;
    let mut shift = 0u32;

    for (i, byte) in segment.bytes().enumerate() {
        let offset = base_offset + i;
        let digit = base64_value(byte).ok_or(SourceMapError::InvalidCharacter {
            ch: byte as char,
            offset,
        })?;
        if shift >= 60 {
            return Err(SourceMapError::Overflow(offset));
        }
        value += (digit & VLQ_MASK) << shift;
        if digit & VLQ_CONTINUATION != 0 {
            shift += 5;
        } else {
            let negative = value & 1 == 1;
            let magnitude = value >> 1;
            fields.push(if negative { -magnitude } else { magnitude });
            value = 0;
            shift = 0;
        }
    }

    if shift != 0 {
        return Err(SourceMapError::Truncated(base_offset + segment.len()));
    }
    Ok(fields)
}

fn apply_delta(
    current: i64,
    delta: i64,
    field: &'static str,
    line: u32,
    offset: usize,
) -> Result<i64, SourceMapError> {
    let next = current.checked_add(delta).ok_or(SourceMapError::Overflow(offset))?;
    if next < 0 {
        return Err(SourceMapError::Negative { field, line });
    }
    Ok(next)
}

fn to_u32(value: i64, offset: usize) -> Result<u32, SourceMapError> {
    u32::try_from(value).map_err(|_| SourceMapError::Overflow(offset))
}

/// Decode a full `mappings` string.
///
/// Generated columns reset on every line; source index, original line,
/// original column and name index are deltas across the whole string.
pub fn decode_mappings(mappings: &str) -> Result<DecodedMappings, SourceMapError> {
    let mut lines = Vec::new();
    let mut source_index = 0i64;
    let mut original_line = 0i64;
    let mut original_column = 0i64;
    let mut name_index = 0i64;
    let mut offset = 0usize;

    for (line_idx, line) in mappings.split(';').enumerate() {
        let line_no = u32::try_from(line_idx + 1).unwrap_or(u32::MAX);
        let mut segments = Vec::new();
        let mut generated_column = 0i64;
        let mut segment_offset = offset;

        for raw in line.split(',') {
            if raw.is_empty() {
                segment_offset += 1;
                continue;
            }
            let fields = decode_segment(raw, segment_offset)?;
            let at = segment_offset;
            segment_offset += raw.len() + 1;

            generated_column = apply_delta(generated_column, fields[0], "generated column", line_no, at)?;
            let source = match fields.len() {
                1 => None,
                4 | 5 => {
                    source_index = apply_delta(source_index, fields[1], "source index", line_no, at)?;
                    original_line = apply_delta(original_line, fields[2], "original line", line_no, at)?;
                    original_column =
                        apply_delta(original_column, fields[3], "original column", line_no, at)?;
                    let name = if fields.len() == 5 {
                        name_index = apply_delta(name_index, fields[4], "name index", line_no, at)?;
                        Some(to_u32(name_index, at)?)
                    } else {
                        None
                    };
                    Some(SegmentSource {
                        source_index: to_u32(source_index, at)?,
                        original_line: to_u32(original_line, at)?,
                        original_column: to_u32(original_column, at)?,
                        name_index: name,
                    })
                }
                n => return Err(SourceMapError::BadSegment(n)),
            };
            segments.push(Segment {
                generated_column: to_u32(generated_column, at)?,
                source,
            });
        }

        offset += line.len() + 1;
        lines.push(segments);
    }

    Ok(DecodedMappings { lines })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
