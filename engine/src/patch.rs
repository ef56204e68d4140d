//! Structural patches over JSON trees.
//!
//! A [`Patch`] is an ordered list of [`PatchOp`]s addressed by segment
//! paths. This is the form the engine stores and replays; [`crate::codec`]
//! converts it to and from RFC 6902 JSON Patch.

use crate::{codec, error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One step of a path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    /// Create a key segment.
    pub fn key(key: impl Into<String>) -> Self {
        PathSegment::Key(key.into())
    }

    /// Create an index segment.
    pub fn index(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{}", i),
            PathSegment::Key(k) => write!(f, "{}", k),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// Supported patch operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Replace,
    Remove,
    Move,
    Copy,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Add => write!(f, "add"),
            OpKind::Replace => write!(f, "replace"),
            OpKind::Remove => write!(f, "remove"),
            OpKind::Move => write!(f, "move"),
            OpKind::Copy => write!(f, "copy"),
        }
    }
}

/// A single structural operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOp {
    /// Operation kind
    pub op: OpKind,
    /// Target path (empty = document root)
    pub path: Vec<PathSegment>,
    /// Value for add/replace; a missing value reads as `null`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Source path for move/copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Vec<PathSegment>>,
}

impl PatchOp {
    /// Create an add operation.
    pub fn add(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: OpKind::Add,
            path,
            value: Some(value),
            from: None,
        }
    }

    /// Create a replace operation.
    pub fn replace(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: OpKind::Replace,
            path,
            value: Some(value),
            from: None,
        }
    }

    /// Create a remove operation.
    pub fn remove(path: Vec<PathSegment>) -> Self {
        Self {
            op: OpKind::Remove,
            path,
            value: None,
            from: None,
        }
    }

    /// Create a move operation.
    pub fn move_from(from: Vec<PathSegment>, path: Vec<PathSegment>) -> Self {
        Self {
            op: OpKind::Move,
            path,
            value: None,
            from: Some(from),
        }
    }

    /// Create a copy operation.
    pub fn copy_from(from: Vec<PathSegment>, path: Vec<PathSegment>) -> Self {
        Self {
            op: OpKind::Copy,
            path,
            value: None,
            from: Some(from),
        }
    }

    fn value_or_null(&self) -> Value {
        self.value.clone().unwrap_or(Value::Null)
    }

    fn source(&self) -> Result<&[PathSegment]> {
        self.from.as_deref().ok_or_else(|| Error::MissingField {
            op: self.op.to_string(),
            field: "from".into(),
        })
    }
}

/// An ordered sequence of operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    ops: Vec<PatchOp>,
}

impl Patch {
    /// Create an empty patch.
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Create a patch from operations.
    pub fn from_ops(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    /// A patch that replaces the whole document.
    pub fn replace_root(value: Value) -> Self {
        Self::from_ops(vec![PatchOp::replace(Vec::new(), value)])
    }

    /// Concatenate patches in order.
    pub fn concat<'a>(patches: impl IntoIterator<Item = &'a Patch>) -> Self {
        let mut combined = Patch::new();
        for patch in patches {
            combined.extend(patch);
        }
        combined
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<PatchOp> {
        self.ops
    }

    pub fn push(&mut self, op: PatchOp) {
        self.ops.push(op);
    }

    /// Append every operation of `other`.
    pub fn extend(&mut self, other: &Patch) {
        self.ops.extend(other.ops.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchOp> {
        self.ops.iter()
    }
}

impl FromIterator<PatchOp> for Patch {
    fn from_iter<I: IntoIterator<Item = PatchOp>>(iter: I) -> Self {
        Self::from_ops(iter.into_iter().collect())
    }
}

/// Apply a patch to a document.
///
/// Operations run in order against a working copy; `doc` is only replaced
/// once every operation succeeded.
pub fn apply(doc: &mut Value, patch: &Patch) -> Result<()> {
    let mut working = doc.clone();
    for op in patch.iter() {
        apply_op(&mut working, op)?;
    }
    *doc = working;
    Ok(())
}

/// Apply a patch to a copy of `doc` and return the result.
pub fn applied(doc: &Value, patch: &Patch) -> Result<Value> {
    let mut next = doc.clone();
    apply(&mut next, patch)?;
    Ok(next)
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<()> {
    match op.op {
        OpKind::Add => add(doc, &op.path, op.value_or_null()),
        OpKind::Replace => {
            let target = get_mut(doc, &op.path)?;
            *target = op.value_or_null();
            Ok(())
        }
        OpKind::Remove => remove(doc, &op.path).map(|_| ()),
        OpKind::Move => {
            let from = op.source()?;
            if from == op.path.as_slice() {
                return Ok(());
            }
            if op.path.starts_with(from) {
                return Err(Error::InvalidTarget(codec::to_pointer_path(&op.path)));
            }
            let value = remove(doc, from)?;
            add(doc, &op.path, value)
        }
        OpKind::Copy => {
            let value = get_mut(doc, op.source()?)?.clone();
            add(doc, &op.path, value)
        }
    }
}

fn add(doc: &mut Value, path: &[PathSegment], value: Value) -> Result<()> {
    let Some((last, parent_path)) = path.split_last() else {
        *doc = value;
        return Ok(());
    };
    match get_mut(doc, parent_path)? {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(path, last, items.len(), true)?;
            items.insert(index, value);
            Ok(())
        }
        _ => Err(Error::InvalidTarget(codec::to_pointer_path(parent_path))),
    }
}

fn remove(doc: &mut Value, path: &[PathSegment]) -> Result<Value> {
    let Some((last, parent_path)) = path.split_last() else {
        return Ok(std::mem::take(doc));
    };
    match get_mut(doc, parent_path)? {
        Value::Object(map) => map
            .remove(&last.to_string())
            .ok_or_else(|| Error::PathNotFound(codec::to_pointer_path(path))),
        Value::Array(items) => {
            let index = array_index(path, last, items.len(), false)?;
            Ok(items.remove(index))
        }
        _ => Err(Error::InvalidTarget(codec::to_pointer_path(parent_path))),
    }
}

fn get_mut<'a>(doc: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value> {
    let mut current = doc;
    for (depth, segment) in path.iter().enumerate() {
        let here = &path[..=depth];
        current = match current {
            Value::Object(map) => map
                .get_mut(&segment.to_string())
                .ok_or_else(|| Error::PathNotFound(codec::to_pointer_path(here)))?,
            Value::Array(items) => {
                let index = array_index(here, segment, items.len(), false)?;
                &mut items[index]
            }
            _ => return Err(Error::InvalidTarget(codec::to_pointer_path(&path[..depth]))),
        };
    }
    Ok(current)
}

/// Resolve a segment against an array of `len` items. `-` (and `len`
/// itself) address the end only when `allow_end` is set.
fn array_index(
    path: &[PathSegment],
    segment: &PathSegment,
    len: usize,
    allow_end: bool,
) -> Result<usize> {
    let invalid = || Error::InvalidIndex {
        path: codec::to_pointer_path(path),
        index: segment.to_string(),
    };
    let index = match segment {
        PathSegment::Index(i) => *i,
        PathSegment::Key(k) if k == "-" && allow_end => len,
        PathSegment::Key(k) => codec::parse_array_index(k).ok_or_else(invalid)?,
    };
    let bound = if allow_end { len } else { len.saturating_sub(1) };
    if index > bound || (!allow_end && len == 0) {
        return Err(invalid());
    }
    Ok(index)
}

/// Structural diff: the patch that turns `before` into `after`.
///
/// Objects are compared key by key, arrays by position (common prefix is
/// diffed, the tail is added or removed from the end), anything else is
/// replaced whole. `diff(after, before)` is the inverse.
pub fn diff(before: &Value, after: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_into(&mut Vec::new(), before, after, &mut ops);
    Patch::from_ops(ops)
}

fn diff_into(path: &mut Vec<PathSegment>, before: &Value, after: &Value, ops: &mut Vec<PatchOp>) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                path.push(PathSegment::Key(key.clone()));
                match new.get(key) {
                    Some(new_value) => diff_into(path, old_value, new_value, ops),
                    None => ops.push(PatchOp::remove(path.clone())),
                }
                path.pop();
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    path.push(PathSegment::Key(key.clone()));
                    ops.push(PatchOp::add(path.clone(), new_value.clone()));
                    path.pop();
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let common = old.len().min(new.len());
            for i in 0..common {
                path.push(PathSegment::Index(i));
                diff_into(path, &old[i], &new[i], ops);
                path.pop();
            }
            for (i, item) in new.iter().enumerate().skip(common) {
                path.push(PathSegment::Index(i));
                ops.push(PatchOp::add(path.clone(), item.clone()));
                path.pop();
            }
            for i in (common..old.len()).rev() {
                path.push(PathSegment::Index(i));
                ops.push(PatchOp::remove(path.clone()));
                path.pop();
            }
        }
        _ => ops.push(PatchOp::replace(path.clone(), after.clone())),
    }
}
