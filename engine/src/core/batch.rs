//! Extraction of command batches from producer output.
//!
//! The producer answers with narrative text plus a structured block of state
//! commands. Only the command batch is consumed here; narrative fields are
//! ignored.

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

/// Field names a producer response may carry its batch under, in priority order.
const BATCH_FIELDS: [&str; 3] = ["commands", "state_updates", "tavern_commands"];

/// Pull the raw command list out of a producer response.
///
/// Accepts a bare array, or an object holding the array under one of the
/// known batch fields. An object with none of them yields an empty batch.
pub fn extract_command_batch(response: &Value) -> Result<Vec<Value>> {
    match response {
        Value::Array(commands) => Ok(commands.clone()),
        Value::Object(fields) => {
            for field in BATCH_FIELDS {
                match fields.get(field) {
                    Some(Value::Array(commands)) => return Ok(commands.clone()),
                    Some(Value::Null) | None => continue,
                    Some(other) => {
                        return Err(anyhow!("'{field}' must be an array, got {other}"));
                    }
                }
            }
            Ok(Vec::new())
        }
        other => Err(anyhow!(
            "expected a command array or response object, got {other}"
        )),
    }
}

/// Parse JSON text and extract its command batch.
pub fn parse_command_batch(raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).context("parse command batch json")?;
    extract_command_batch(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_array_is_the_batch() {
        let batch = extract_command_batch(&json!([
            {"action": "add", "path": "attributes.current_hp", "value": -5}
        ]))
        .expect("batch");
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn response_object_ignores_narrative() {
        let batch = extract_command_batch(&json!({
            "narrative": "The elder nods slowly.",
            "state_updates": [
                {"action": "push", "path": "memory.short_term", "value": "elder nodded"}
            ]
        }))
        .expect("batch");
        assert_eq!(batch[0]["path"], json!("memory.short_term"));
    }

    #[test]
    fn object_without_batch_is_empty() {
        let batch = extract_command_batch(&json!({"narrative": "Nothing happens."})).expect("batch");
        assert!(batch.is_empty());
    }

    #[test]
    fn non_array_batch_field_is_an_error() {
        let err = extract_command_batch(&json!({"commands": "set hp 5"})).expect_err("error");
        assert!(err.to_string().contains("'commands' must be an array"));
    }

    #[test]
    fn parse_rejects_invalid_json() {
        let err = parse_command_batch("[{").expect_err("error");
        assert!(err.to_string().contains("parse command batch json"));
    }
}
