//! Command validation pipeline.
//!
//! Each raw command goes through, in order: shape check, allow-list root
//! check, forbidden-path check, protected-root check, numeric coercion,
//! structural type check and extra-field pruning. Validation never fails the
//! batch; invalid commands come back with errors and are simply not executed.

use anyhow::Result;
use serde_json::Value;
use tracing::debug;

use crate::core::path::CommandPath;
use crate::core::policy::PathPolicy;
use crate::core::schema::SchemaRegistry;
use crate::core::types::{Action, Command, CommandError, ValidationResult};

const KNOWN_FIELDS: [&str; 3] = ["action", "path", "value"];

#[derive(Debug)]
pub struct CommandValidator {
    policy: PathPolicy,
    schemas: SchemaRegistry,
}

impl CommandValidator {
    pub fn new(policy: PathPolicy, schemas: SchemaRegistry) -> Self {
        Self { policy, schemas }
    }

    /// Validator with the default policy and the builtin shape registry.
    pub fn builtin() -> Result<Self> {
        Ok(Self::new(PathPolicy::default(), SchemaRegistry::builtin()?))
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Validate one raw command as received from the producer.
    pub fn validate(&self, raw: &Value) -> ValidationResult {
        let mut warnings = pruned_field_warnings(raw);
        match self.validate_inner(raw, &mut warnings) {
            Ok(command) => ValidationResult {
                command: Some(command),
                errors: Vec::new(),
                warnings,
            },
            Err(error) => {
                debug!(error = %error, "command failed validation");
                if let CommandError::Policy(reason) = &error {
                    warnings.push(format!("mutation rejected: {reason}"));
                }
                ValidationResult {
                    command: None,
                    errors: vec![error],
                    warnings,
                }
            }
        }
    }

    /// Validate every command independently; results line up with `raws`.
    pub fn validate_batch(&self, raws: &[Value]) -> Vec<ValidationResult> {
        raws.iter().map(|raw| self.validate(raw)).collect()
    }

    fn validate_inner(&self, raw: &Value, warnings: &mut Vec<String>) -> Result<Command, CommandError> {
        let (action, path, value) = check_shape(raw)?;
        self.policy.check(action, &path)?;

        let value = match (action, value) {
            (Action::Delete, Some(_)) => {
                warnings.push("delete ignores its value".to_string());
                None
            }
            (Action::Delete, None) => None,
            (action, Some(value)) => {
                let coerced = self.schemas.coerce(action, &path, value.clone());
                if action == Action::Add && !coerced.is_number() {
                    return Err(CommandError::Type(format!(
                        "add on '{path}' needs a numeric value, got {coerced}"
                    )));
                }
                self.schemas.check(action, &path, &coerced)?;
                Some(coerced)
            }
            (action, None) => {
                return Err(CommandError::Shape(format!(
                    "{} requires a value",
                    action.label()
                )));
            }
        };

        Ok(Command::new(action, path, value))
    }
}

/// Shape check: object with a known action, a non-empty path and a value
/// unless the action is `delete`.
fn check_shape(raw: &Value) -> Result<(Action, CommandPath, Option<&Value>), CommandError> {
    let Value::Object(fields) = raw else {
        return Err(CommandError::Shape(format!(
            "command must be an object, got {raw}"
        )));
    };

    let action = match fields.get("action") {
        Some(Value::String(name)) => Action::parse(name)
            .ok_or_else(|| CommandError::Shape(format!("unknown action '{name}'")))?,
        Some(other) => {
            return Err(CommandError::Shape(format!(
                "action must be a string, got {other}"
            )));
        }
        None => return Err(CommandError::Shape("missing action".to_string())),
    };

    let path = match fields.get("path") {
        Some(Value::String(raw_path)) => CommandPath::parse(raw_path)?,
        Some(other) => {
            return Err(CommandError::Shape(format!(
                "path must be a string, got {other}"
            )));
        }
        None => return Err(CommandError::Shape("missing path".to_string())),
    };

    let value = fields.get("value");
    if action.requires_value() && value.is_none() {
        return Err(CommandError::Shape(format!(
            "{} requires a value",
            action.label()
        )));
    }

    Ok((action, path, value))
}

fn pruned_field_warnings(raw: &Value) -> Vec<String> {
    let Value::Object(fields) = raw else {
        return Vec::new();
    };
    fields
        .keys()
        .filter(|key| !KNOWN_FIELDS.contains(&key.as_str()))
        .map(|key| format!("dropped unknown field '{key}'"))
        .collect()
}
