//! Shared deterministic types for command validation and execution.
//!
//! These types define stable contracts between the validator, the executor and
//! the controller. They carry no I/O state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::path::CommandPath;

/// Closed set of mutations a producer may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Set,
    Add,
    Push,
    Pull,
    Delete,
}

impl Action {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "set" => Some(Action::Set),
            "add" => Some(Action::Add),
            "push" => Some(Action::Push),
            "pull" => Some(Action::Pull),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Action::Set => "set",
            Action::Add => "add",
            Action::Push => "push",
            Action::Pull => "pull",
            Action::Delete => "delete",
        }
    }

    /// Every action except `delete` carries a value.
    pub fn requires_value(self) -> bool {
        !matches!(self, Action::Delete)
    }
}

/// A command that passed validation.
///
/// The path is parsed once here and the value is already coerced, so the
/// executor never re-splits strings or re-checks shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub action: Action,
    pub path: CommandPath,
    /// `None` only for `delete`.
    pub value: Option<Value>,
}

impl Command {
    pub fn new(action: Action, path: CommandPath, value: Option<Value>) -> Self {
        Self {
            action,
            path,
            value,
        }
    }
}

/// Coarse error class, stable across message wording changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Shape,
    Policy,
    Type,
    Traversal,
    Persistence,
}

/// Per-command failure. None of these abort the surrounding batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Malformed command (unknown action, missing value, bad path syntax).
    #[error("shape error: {0}")]
    Shape(String),
    /// Path outside the allow-list, forbidden, or a protected root.
    #[error("policy error: {0}")]
    Policy(String),
    /// Value or current document value has the wrong type.
    #[error("type error: {0}")]
    Type(String),
    /// Path passes through a scalar or an out-of-range index.
    #[error("traversal error at segment {index} ('{segment}'): {reason}")]
    Traversal {
        index: usize,
        segment: String,
        reason: String,
    },
    /// Target shard could not be read from storage, so it cannot be changed yet.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Shape(_) => ErrorKind::Shape,
            CommandError::Policy(_) => ErrorKind::Policy,
            CommandError::Type(_) => ErrorKind::Type,
            CommandError::Traversal { .. } => ErrorKind::Traversal,
            CommandError::Persistence(_) => ErrorKind::Persistence,
        }
    }
}

/// Outcome of validating a single raw command.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// Normalized command, present only when validation succeeded.
    pub command: Option<Command>,
    pub errors: Vec<CommandError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.command.is_some()
    }
}

/// A command that was excluded from a batch, with its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandFailure {
    /// Index of the command in the submitted batch.
    pub index: usize,
    /// Raw action text, if the command carried one.
    pub action: Option<String>,
    /// Raw path text, if the command carried one.
    pub path: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl CommandFailure {
    /// Build a failure record from the raw command as submitted.
    pub fn from_raw(index: usize, raw: &Value, error: &CommandError) -> Self {
        Self {
            index,
            action: raw.get("action").and_then(Value::as_str).map(str::to_string),
            path: raw.get("path").and_then(Value::as_str).map(str::to_string),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}
