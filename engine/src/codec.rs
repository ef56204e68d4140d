//! Conversion between structural patches and RFC 6902 JSON Patch.
//!
//! Paths become RFC 6901 pointers: `~` is written as `~0` and `/` as `~1`.
//! Escaping goes `~` first, unescaping goes `~1` first, so `~01` decodes to
//! `~1` and never to `/`.

use crate::{
    error::Result,
    patch::{PathSegment, Patch, PatchOp},
    Error,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An RFC 6902 operation as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum JsonPatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
    Move { from: String, path: String },
    Copy { from: String, path: String },
}

/// Escape one reference token.
pub fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Unescape one reference token.
pub fn unescape_segment(token: &str) -> Result<String> {
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c == '~' && !matches!(chars.next(), Some('0') | Some('1')) {
            return Err(Error::InvalidPointer {
                pointer: token.to_string(),
                reason: "'~' must be followed by '0' or '1'".into(),
            });
        }
    }
    Ok(token.replace("~1", "/").replace("~0", "~"))
}

/// Build a pointer from path segments. The empty path is `""`.
pub fn to_pointer_path(segments: &[PathSegment]) -> String {
    segments
        .iter()
        .map(|segment| format!("/{}", escape_segment(&segment.to_string())))
        .collect()
}

/// Parse a pointer into path segments.
///
/// Tokens that are canonical array indices (`0`, `17`, never `07`) become
/// [`PathSegment::Index`]; patch application treats them as keys when the
/// container is an object.
pub fn parse_pointer(pointer: &str) -> Result<Vec<PathSegment>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(Error::InvalidPointer {
            pointer: pointer.to_string(),
            reason: "must be empty or start with '/'".into(),
        });
    };
    rest.split('/')
        .map(|token| {
            let token = unescape_segment(token).map_err(|_| Error::InvalidPointer {
                pointer: pointer.to_string(),
                reason: format!("bad escape in token '{}'", token),
            })?;
            Ok(match parse_array_index(&token) {
                Some(index) => PathSegment::Index(index),
                None => PathSegment::Key(token),
            })
        })
        .collect()
}

/// Parse a canonical array index token.
pub fn parse_array_index(token: &str) -> Option<usize> {
    let canonical = token == "0"
        || (!token.is_empty()
            && !token.starts_with('0')
            && token.bytes().all(|b| b.is_ascii_digit()));
    if canonical {
        token.parse().ok()
    } else {
        None
    }
}

/// Translate a structural patch into RFC 6902 operations.
///
/// move/copy operations without a source are dropped with a warning.
pub fn to_json_patch(patch: &Patch) -> Vec<JsonPatchOp> {
    patch.iter().filter_map(to_json_op).collect()
}

fn to_json_op(op: &PatchOp) -> Option<JsonPatchOp> {
    use crate::patch::OpKind;

    let path = to_pointer_path(&op.path);
    let value = || op.value.clone().unwrap_or(Value::Null);
    let from = || match &op.from {
        Some(from) => Some(to_pointer_path(from)),
        None => {
            tracing::warn!(op = %op.op, path = %path, "dropping patch op without 'from'");
            None
        }
    };
    Some(match op.op {
        OpKind::Add => JsonPatchOp::Add {
            path,
            value: value(),
        },
        OpKind::Replace => JsonPatchOp::Replace {
            path,
            value: value(),
        },
        OpKind::Remove => JsonPatchOp::Remove { path },
        OpKind::Move => JsonPatchOp::Move {
            from: from()?,
            path,
        },
        OpKind::Copy => JsonPatchOp::Copy {
            from: from()?,
            path,
        },
    })
}

/// Translate RFC 6902 operations into a structural patch.
///
/// Operations whose pointers do not parse are dropped with a warning.
pub fn from_json_patch(ops: &[JsonPatchOp]) -> Patch {
    ops.iter()
        .filter_map(|op| match from_json_op(op) {
            Ok(op) => Some(op),
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable patch op");
                None
            }
        })
        .collect()
}

fn from_json_op(op: &JsonPatchOp) -> Result<PatchOp> {
    Ok(match op {
        JsonPatchOp::Add { path, value } => PatchOp::add(parse_pointer(path)?, value.clone()),
        JsonPatchOp::Replace { path, value } => {
            PatchOp::replace(parse_pointer(path)?, value.clone())
        }
        JsonPatchOp::Remove { path } => PatchOp::remove(parse_pointer(path)?),
        JsonPatchOp::Move { from, path } => {
            PatchOp::move_from(parse_pointer(from)?, parse_pointer(path)?)
        }
        JsonPatchOp::Copy { from, path } => {
            PatchOp::copy_from(parse_pointer(from)?, parse_pointer(path)?)
        }
    })
}

/// Read raw RFC 6902 JSON into a structural patch.
///
/// Anything outside the supported set (`test`, unknown names, entries
/// missing required members) is dropped with a warning. A document that is
/// not an array yields an empty patch.
pub fn parse_json_patch(raw: &Value) -> Patch {
    let Some(entries) = raw.as_array() else {
        tracing::warn!("JSON patch is not an array; ignoring it");
        return Patch::new();
    };
    let ops: Vec<JsonPatchOp> = entries
        .iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(op) => Some(op),
            Err(e) => {
                let name = entry.get("op").and_then(Value::as_str).unwrap_or("<none>");
                tracing::warn!(op = name, error = %e, "dropping unsupported patch op");
                None
            }
        })
        .collect();
    from_json_patch(&ops)
}

/// Render a structural patch as an RFC 6902 JSON array.
pub fn to_json_value(patch: &Patch) -> Value {
    serde_json::to_value(to_json_patch(patch)).unwrap_or_else(|_| Value::Array(Vec::new()))
}
