//! Copy-on-write command application.

use serde_json::{Number, Value};

use crate::core::path::{self, CommandPath, kind_label};
use crate::core::types::{Action, Command, CommandError};

/// Result of applying a batch of validated commands.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// The mutated copy; the caller's document is never touched.
    pub document: Value,
    pub applied_count: usize,
    /// Paths of the commands that applied, in application order.
    pub applied_paths: Vec<CommandPath>,
    pub failures: Vec<ExecFailure>,
}

/// A command that failed during application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFailure {
    /// Index into the slice passed to [`apply_commands`].
    pub index: usize,
    pub error: CommandError,
}

/// Apply `commands` in order to a copy of `document`.
///
/// Each command sees the effects of the ones before it. A failing command is
/// recorded and skipped without partially mutating the copy; the remaining
/// commands still run.
pub fn apply_commands(document: &Value, commands: &[Command]) -> ApplyOutcome {
    let mut working = document.clone();
    let mut applied_paths = Vec::new();
    let mut failures = Vec::new();

    for (index, command) in commands.iter().enumerate() {
        match apply_one(&mut working, command) {
            Ok(()) => applied_paths.push(command.path.clone()),
            Err(error) => failures.push(ExecFailure { index, error }),
        }
    }

    ApplyOutcome {
        document: working,
        applied_count: applied_paths.len(),
        applied_paths,
        failures,
    }
}

fn apply_one(document: &mut Value, command: &Command) -> Result<(), CommandError> {
    let path = &command.path;
    match (command.action, command.value.as_ref()) {
        (Action::Set, Some(value)) => path::write(document, path, value.clone()),
        (Action::Add, Some(delta)) => {
            path::ensure_writable(document, path)?;
            let sum = add_to(path::lookup(document, path), delta, path)?;
            path::write(document, path, sum)
        }
        (Action::Push, Some(value)) => {
            path::ensure_writable(document, path)?;
            match path::lookup_mut(document, path) {
                Some(Value::Array(items)) => {
                    items.push(value.clone());
                    Ok(())
                }
                None | Some(Value::Null) => path::write(document, path, Value::Array(vec![value.clone()])),
                Some(other) => Err(CommandError::Type(format!(
                    "push on '{path}' needs an array, found {}",
                    kind_label(other)
                ))),
            }
        }
        (Action::Pull, Some(value)) => match path::lookup_mut(document, path) {
            Some(Value::Array(items)) => {
                items.retain(|item| item != value);
                Ok(())
            }
            None | Some(Value::Null) => Ok(()),
            Some(other) => Err(CommandError::Type(format!(
                "pull on '{path}' needs an array, found {}",
                kind_label(other)
            ))),
        },
        (Action::Delete, _) => {
            path::remove(document, path);
            Ok(())
        }
        (action, None) => Err(CommandError::Shape(format!(
            "{} requires a value",
            action.label()
        ))),
    }
}

/// Sum the current value (absent counts as `0`) and `delta`.
fn add_to(current: Option<&Value>, delta: &Value, path: &CommandPath) -> Result<Value, CommandError> {
    let Value::Number(delta) = delta else {
        return Err(CommandError::Type(format!(
            "add on '{path}' needs a numeric value, got {}",
            kind_label(delta)
        )));
    };
    let current = match current {
        None | Some(Value::Null) => Number::from(0),
        Some(Value::Number(number)) => number.clone(),
        Some(other) => {
            return Err(CommandError::Type(format!(
                "add on '{path}' needs a numeric current value, found {}",
                kind_label(other)
            )));
        }
    };
    add_numbers(&current, delta)
        .map(Value::Number)
        .ok_or_else(|| CommandError::Type(format!("add on '{path}' overflows")))
}

/// Integer + integer stays an integer; any float operand yields a float.
fn add_numbers(current: &Number, delta: &Number) -> Option<Number> {
    if let (Some(left), Some(right)) = (current.as_i64(), delta.as_i64()) {
        return left.checked_add(right).map(Number::from);
    }
    let sum = current.as_f64()? + delta.as_f64()?;
    Number::from_f64(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;
    use serde_json::json;

    fn command(action: Action, raw_path: &str, value: Option<Value>) -> Command {
        Command::new(action, CommandPath::parse(raw_path).expect("path"), value)
    }

    #[test]
    fn apply_leaves_input_untouched() {
        let document = json!({"attributes": {"current_hp": 100}});
        let outcome = apply_commands(
            &document,
            &[command(Action::Set, "attributes.current_hp", Some(json!(1)))],
        );
        assert_eq!(document, json!({"attributes": {"current_hp": 100}}));
        assert_eq!(outcome.document["attributes"]["current_hp"], json!(1));
        assert_eq!(outcome.applied_count, 1);
    }

    #[test]
    fn add_sums_and_defaults_absent_to_zero() {
        let document = json!({"attributes": {"current_hp": 100}});
        let outcome = apply_commands(
            &document,
            &[
                command(Action::Add, "attributes.current_hp", Some(json!(-30))),
                command(Action::Add, "currency.spirit_stones", Some(json!(12))),
                command(Action::Add, "attributes.current_hp", Some(json!(0.5))),
            ],
        );
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.document["attributes"]["current_hp"], json!(70.5));
        assert_eq!(outcome.document["currency"]["spirit_stones"], json!(12));
    }

    #[test]
    fn add_on_non_numeric_current_is_skipped() {
        let document = json!({"position": {"location": "Jade Valley"}});
        let outcome = apply_commands(
            &document,
            &[command(Action::Add, "position.location", Some(json!(1)))],
        );
        assert_eq!(outcome.applied_count, 0);
        assert_eq!(outcome.failures[0].error.kind(), ErrorKind::Type);
        assert_eq!(outcome.document, document);
    }

    #[test]
    fn add_overflow_is_a_type_error() {
        let document = json!({"currency": {"gold": i64::MAX}});
        let outcome = apply_commands(
            &document,
            &[command(Action::Add, "currency.gold", Some(json!(1)))],
        );
        assert_eq!(outcome.failures[0].error.kind(), ErrorKind::Type);
        assert_eq!(outcome.document, document);
    }

    #[test]
    fn push_creates_and_appends() {
        let outcome = apply_commands(
            &json!({}),
            &[
                command(Action::Push, "memory.short_term", Some(json!("met Elder Mo"))),
                command(Action::Push, "memory.short_term", Some(json!("left the sect"))),
            ],
        );
        assert_eq!(
            outcome.document["memory"]["short_term"],
            json!(["met Elder Mo", "left the sect"])
        );
    }

    #[test]
    fn push_onto_scalar_is_a_type_error() {
        let document = json!({"quests": {"active": "none"}});
        let outcome = apply_commands(
            &document,
            &[command(Action::Push, "quests.active", Some(json!({"title": "x"})))],
        );
        assert_eq!(outcome.failures[0].error.kind(), ErrorKind::Type);
    }

    #[test]
    fn pull_removes_every_deep_equal_element() {
        let document = json!({"status_effects": [
            {"name": "Poisoned", "duration": 3},
            {"name": "Blessed", "duration": 1},
            {"name": "Poisoned", "duration": 3}
        ]});
        let outcome = apply_commands(
            &document,
            &[command(
                Action::Pull,
                "status_effects",
                Some(json!({"name": "Poisoned", "duration": 3})),
            )],
        );
        assert_eq!(
            outcome.document["status_effects"],
            json!([{"name": "Blessed", "duration": 1}])
        );
    }

    #[test]
    fn pull_and_delete_on_absent_paths_are_no_ops() {
        let document = json!({"memory": {"short_term": ["a"]}});
        let outcome = apply_commands(
            &document,
            &[
                command(Action::Pull, "memory.short_term", Some(json!("zzz"))),
                command(Action::Pull, "memory.implicit", Some(json!("a"))),
                command(Action::Delete, "inventory.items.ghost", None),
                command(Action::Delete, "memory.short_term.0.deep", None),
            ],
        );
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.applied_count, 4);
        assert_eq!(outcome.document, document);
    }

    #[test]
    fn delete_removes_leaf() {
        let document = json!({"inventory": {"items": {"sword": {"name": "Sword", "quantity": 1}}}});
        let outcome = apply_commands(
            &document,
            &[command(Action::Delete, "inventory.items.sword", None)],
        );
        assert_eq!(outcome.document, json!({"inventory": {"items": {}}}));
    }

    #[test]
    fn traversal_failure_does_not_stop_the_batch() {
        let document = json!({"attributes": {"current_hp": 100}});
        let outcome = apply_commands(
            &document,
            &[
                command(Action::Set, "attributes.current_hp.bonus", Some(json!(1))),
                command(Action::Add, "attributes.current_hp", Some(json!(5))),
            ],
        );
        assert_eq!(outcome.applied_count, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 0);
        assert_eq!(outcome.failures[0].error.kind(), ErrorKind::Traversal);
        assert_eq!(outcome.document["attributes"]["current_hp"], json!(105));
    }

    #[test]
    fn later_commands_observe_earlier_ones() {
        let outcome = apply_commands(
            &json!({}),
            &[
                command(
                    Action::Set,
                    "inventory.items.pill",
                    Some(json!({"name": "Qi Pill", "quantity": 1})),
                ),
                command(Action::Add, "inventory.items.pill.quantity", Some(json!(2))),
            ],
        );
        assert_eq!(outcome.document["inventory"]["items"]["pill"]["quantity"], json!(3));
    }
}
