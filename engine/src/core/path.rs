//! Dotted path parsing and document traversal.
//!
//! Paths are parsed once into a [`CommandPath`] and then used for lookups and
//! writes. Writes are two-phase: [`ensure_writable`] walks the chain read-only
//! before [`write`] creates any container, so a failing write leaves the
//! document untouched.

use std::fmt;

use serde_json::{Map, Value};

use crate::core::types::CommandError;

/// A parsed, non-empty dotted path (`"inventory.items.sword"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandPath {
    segments: Vec<String>,
}

impl CommandPath {
    /// Parse a dotted path. Empty paths and empty segments are shape errors.
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        if raw.trim().is_empty() {
            return Err(CommandError::Shape(
                "path must be a non-empty string".to_string(),
            ));
        }
        let mut segments = Vec::new();
        for (index, segment) in raw.split('.').enumerate() {
            if segment.trim().is_empty() {
                return Err(CommandError::Shape(format!(
                    "path '{raw}' has an empty segment at position {index}"
                )));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments (always at least one).
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn leaf(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn parent_segments(&self) -> &[String] {
        match self.segments.split_last() {
            Some((_, parent)) => parent,
            None => &[],
        }
    }

    /// Segment-wise prefix test (`attributes` does not prefix `attributesX`).
    pub fn starts_with(&self, prefix: &CommandPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    pub fn starts_with_segments(&self, prefix: &[&str]) -> bool {
        prefix.len() <= self.segments.len()
            && prefix
                .iter()
                .zip(&self.segments)
                .all(|(expected, actual)| *expected == actual.as_str())
    }
}

impl fmt::Display for CommandPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// Read the value at `path`, or `None` if any segment is absent.
///
/// Paths that run through a scalar are treated as absent.
pub fn lookup<'a>(root: &'a Value, path: &CommandPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment.as_str()),
            Value::Array(items) => parse_index(segment).and_then(|position| items.get(position)),
            _ => None,
        })
}

/// Mutable counterpart of [`lookup`]. Never creates containers.
pub fn lookup_mut<'a>(root: &'a mut Value, path: &CommandPath) -> Option<&'a mut Value> {
    descend_mut(root, path.segments())
}

/// Check that a write to `path` can succeed without mutating anything.
///
/// Missing and `null` intermediates are fine (they get created); passing
/// through a scalar or indexing past the end of an array is a traversal error
/// naming the segment at fault.
pub fn ensure_writable(root: &Value, path: &CommandPath) -> Result<(), CommandError> {
    let last = path.depth() - 1;
    let mut current = root;
    let mut holder: Option<(usize, &str)> = None;

    for (index, segment) in path.segments().iter().enumerate() {
        let next = match current {
            Value::Object(map) => map.get(segment.as_str()),
            Value::Array(items) => {
                let position = parse_index(segment)
                    .ok_or_else(|| traversal(index, segment, "expected an array index"))?;
                if position >= items.len() {
                    return Err(traversal(
                        index,
                        segment,
                        format!(
                            "index {position} out of range for array of length {}",
                            items.len()
                        ),
                    ));
                }
                items.get(position)
            }
            Value::Null => return Ok(()),
            scalar => return Err(through_scalar(holder, index, segment, scalar)),
        };

        match next {
            None | Some(Value::Null) => return Ok(()),
            Some(_) if index == last => return Ok(()),
            Some(value) => current = value,
        }
        holder = Some((index, segment.as_str()));
    }

    Ok(())
}

/// Write `value` at `path`, creating missing intermediate objects.
pub fn write(root: &mut Value, path: &CommandPath, value: Value) -> Result<(), CommandError> {
    ensure_writable(root, path)?;
    let leaf_index = path.depth() - 1;
    let container = parent_mut_creating(root, path)?;
    match container {
        Value::Object(map) => {
            map.insert(path.leaf().to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let len = items.len();
            let slot = parse_index(path.leaf()).and_then(|position| items.get_mut(position));
            match slot {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(traversal(
                    leaf_index,
                    path.leaf(),
                    format!("index out of range for array of length {len}"),
                )),
            }
        }
        other => Err(traversal(
            leaf_index,
            path.leaf(),
            format!("parent is {}", kind_label(other)),
        )),
    }
}

/// Remove and return the value at `path`. Missing paths yield `None`.
pub fn remove(root: &mut Value, path: &CommandPath) -> Option<Value> {
    let parent = descend_mut(root, path.parent_segments())?;
    match parent {
        Value::Object(map) => map.remove(path.leaf()),
        Value::Array(items) => {
            let position = parse_index(path.leaf())?;
            (position < items.len()).then(|| items.remove(position))
        }
        _ => None,
    }
}

/// Human-readable JSON kind, used in error messages.
pub fn kind_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn descend_mut<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(segment.as_str())?,
            Value::Array(items) => items.get_mut(parse_index(segment)?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn parent_mut_creating<'a>(
    root: &'a mut Value,
    path: &CommandPath,
) -> Result<&'a mut Value, CommandError> {
    let mut current = root;
    for (index, segment) in path.parent_segments().iter().enumerate() {
        current = match current {
            Value::Object(map) => map.entry(segment.clone()).or_insert(Value::Null),
            Value::Array(items) => {
                let len = items.len();
                let Some(position) = parse_index(segment) else {
                    return Err(traversal(index, segment, "expected an array index"));
                };
                match items.get_mut(position) {
                    Some(item) => item,
                    None => {
                        return Err(traversal(
                            index,
                            segment,
                            format!("index {position} out of range for array of length {len}"),
                        ));
                    }
                }
            }
            other => {
                return Err(traversal(
                    index,
                    segment,
                    format!("cannot traverse into {}", kind_label(other)),
                ));
            }
        };
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
    }
    Ok(current)
}

fn parse_index(segment: &str) -> Option<usize> {
    if segment.bytes().all(|byte| byte.is_ascii_digit()) {
        segment.parse().ok()
    } else {
        None
    }
}

fn through_scalar(
    holder: Option<(usize, &str)>,
    index: usize,
    segment: &str,
    scalar: &Value,
) -> CommandError {
    match holder {
        Some((holder_index, holder_segment)) => traversal(
            holder_index,
            holder_segment,
            format!(
                "cannot traverse into {} while resolving '{segment}'",
                kind_label(scalar)
            ),
        ),
        None => traversal(
            index,
            segment,
            format!("document root is {}", kind_label(scalar)),
        ),
    }
}

fn traversal(index: usize, segment: &str, reason: impl Into<String>) -> CommandError {
    CommandError::Traversal {
        index,
        segment: segment.to_string(),
        reason: reason.into(),
    }
}
