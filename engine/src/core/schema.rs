//! Registry of known path shapes.
//!
//! Maps glob-like path patterns (`inventory.items.*`, `*` matches exactly one
//! segment) to JSON Schema descriptors, plus a list of numeric-field patterns
//! whose string values are coerced to numbers. Paths without a registered
//! shape pass unchecked; the allow-list policy is the security boundary.

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use jsonschema::{Validator, validator_for};
use regex::Regex;
use serde_json::{Number, Value, json};

use crate::core::path::CommandPath;
use crate::core::types::{Action, CommandError};

static NUMERIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Wildcard,
}

/// A dotted pattern where `*` matches any single segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<PatternSegment>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        let parsed = CommandPath::parse(raw)?;
        let segments = parsed
            .segments()
            .iter()
            .map(|segment| match segment.as_str() {
                "*" => PatternSegment::Wildcard,
                literal => PatternSegment::Literal(literal.to_string()),
            })
            .collect();
        Ok(Self { segments })
    }

    pub fn matches(&self, path: &CommandPath) -> bool {
        self.segments.len() == path.depth()
            && self
                .segments
                .iter()
                .zip(path.segments())
                .all(|(pattern, segment)| match pattern {
                    PatternSegment::Wildcard => true,
                    PatternSegment::Literal(literal) => literal == segment,
                })
    }

    /// Number of literal segments; more literals means a more specific rule.
    fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, PatternSegment::Literal(_)))
            .count()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<&str> = self
            .segments
            .iter()
            .map(|segment| match segment {
                PatternSegment::Wildcard => "*",
                PatternSegment::Literal(literal) => literal.as_str(),
            })
            .collect();
        f.write_str(&rendered.join("."))
    }
}

/// What a schema rule describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    /// The value stored at the path (`set`).
    Value,
    /// One element of the sequence stored at the path (`push`, `pull`).
    Element,
}

impl RuleTarget {
    fn for_action(action: Action) -> Option<Self> {
        match action {
            Action::Set | Action::Add => Some(RuleTarget::Value),
            Action::Push | Action::Pull => Some(RuleTarget::Element),
            Action::Delete => None,
        }
    }
}

pub struct SchemaRule {
    pattern: PathPattern,
    target: RuleTarget,
    schema: Value,
    validator: Validator,
}

impl fmt::Debug for SchemaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRule")
            .field("pattern", &self.pattern.to_string())
            .field("target", &self.target)
            .field("schema", &self.schema)
            .finish()
    }
}

/// Pattern-keyed shape registry consulted by the validator.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    rules: Vec<SchemaRule>,
    numeric: Vec<PathPattern>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the game-state shapes the engine ships with.
    pub fn builtin() -> Result<Self> {
        let named_object = |extra: Value| {
            let mut schema = json!({
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": {"type": "string", "minLength": 1},
                    "description": {"type": "string"}
                }
            });
            if let (Some(properties), Value::Object(extra)) =
                (schema["properties"].as_object_mut(), extra)
            {
                for (key, property) in extra {
                    properties.insert(key, property);
                }
            }
            schema
        };

        let mut registry = Self::empty();
        for pattern in [
            "attributes.*",
            "realm.level",
            "realm.progress",
            "currency.*",
            "inventory.capacity",
            "inventory.items.*.quantity",
            "relationships.*.affinity",
            "skills.*.level",
            "skills.*.proficiency",
            "cultivation.progress",
            "sect.contribution",
            "time.year",
            "time.month",
            "time.day",
            "time.hour",
            "status_effects.*.duration",
        ] {
            registry = registry.with_numeric(pattern)?;
        }

        let mut item = named_object(json!({"quantity": {"type": "integer", "minimum": 0}}));
        item["required"] = json!(["name", "quantity"]);
        let mut relationship = named_object(json!({
            "affinity": {"type": "number"},
            "status": {"type": "string"}
        }));
        relationship["required"] = json!(["name", "affinity"]);
        let mut skill = named_object(json!({
            "level": {"type": "integer", "minimum": 0},
            "proficiency": {"type": "number"}
        }));
        skill["required"] = json!(["name", "level"]);
        let mut effect = named_object(json!({"duration": {"type": "number"}}));
        effect["required"] = json!(["name", "duration"]);
        let mut equipped = named_object(json!({}));
        equipped["type"] = json!(["object", "null"]);

        registry = registry
            .with_rule("inventory.items.*", RuleTarget::Value, item)?
            .with_rule("relationships.*", RuleTarget::Value, relationship)?
            .with_rule("skills.*", RuleTarget::Value, skill)?
            .with_rule("equipment.*", RuleTarget::Value, equipped)?
            .with_rule("status_effects", RuleTarget::Element, effect)?
            .with_rule(
                "quests.active",
                RuleTarget::Element,
                json!({
                    "type": "object",
                    "required": ["title", "description"],
                    "properties": {
                        "title": {"type": "string", "minLength": 1},
                        "description": {"type": "string"}
                    }
                }),
            )?
            .with_rule(
                "world.events",
                RuleTarget::Element,
                json!({
                    "type": "object",
                    "required": ["title", "description"],
                    "properties": {
                        "title": {"type": "string"},
                        "description": {"type": "string"}
                    }
                }),
            )?
            .with_rule(
                "memory.short_term",
                RuleTarget::Element,
                json!({"type": "string", "minLength": 1}),
            )?
            .with_rule(
                "memory.implicit",
                RuleTarget::Element,
                json!({"type": "string", "minLength": 1}),
            )?
            .with_rule(
                "position.location",
                RuleTarget::Value,
                json!({"type": "string"}),
            )?
            .with_rule(
                "position.region",
                RuleTarget::Value,
                json!({"type": "string"}),
            )?;
        Ok(registry)
    }

    pub fn with_numeric(mut self, pattern: &str) -> Result<Self> {
        let parsed =
            PathPattern::parse(pattern).map_err(|err| anyhow!("numeric pattern: {err}"))?;
        self.numeric.push(parsed);
        Ok(self)
    }

    pub fn with_rule(mut self, pattern: &str, target: RuleTarget, schema: Value) -> Result<Self> {
        let parsed =
            PathPattern::parse(pattern).map_err(|err| anyhow!("schema pattern: {err}"))?;
        let validator = validator_for(&schema)
            .map_err(|err| anyhow!("invalid schema for '{pattern}': {err}"))?;
        self.rules.push(SchemaRule {
            pattern: parsed,
            target,
            schema,
            validator,
        });
        Ok(self)
    }

    pub fn is_numeric_path(&self, path: &CommandPath) -> bool {
        self.numeric.iter().any(|pattern| pattern.matches(path))
    }

    /// Most specific rule for `action` at `path`; ties go to the earliest rule.
    pub fn rule_for(&self, action: Action, path: &CommandPath) -> Option<&SchemaRule> {
        let target = RuleTarget::for_action(action)?;
        let mut best: Option<&SchemaRule> = None;
        for rule in &self.rules {
            if rule.target != target || !rule.pattern.matches(path) {
                continue;
            }
            let better = best.is_none_or(|current| {
                rule.pattern.specificity() > current.pattern.specificity()
            });
            if better {
                best = Some(rule);
            }
        }
        best
    }

    /// Coerce numeric-looking strings for numeric paths and numeric schema fields.
    ///
    /// Values at paths with no numeric pattern and no schema are returned as-is.
    pub fn coerce(&self, action: Action, path: &CommandPath, value: Value) -> Value {
        let value = if matches!(action, Action::Set | Action::Add) && self.is_numeric_path(path) {
            coerce_numeric(value)
        } else {
            value
        };
        match self.rule_for(action, path) {
            Some(rule) => coerce_by_schema(&rule.schema, value),
            None => value,
        }
    }

    /// Check `value` against the registered shape for `path`.
    pub fn check(&self, action: Action, path: &CommandPath, value: &Value) -> Result<(), CommandError> {
        if action == Action::Set && self.is_numeric_path(path) && !value.is_number() {
            return Err(CommandError::Type(format!(
                "'{path}' holds a number, got {value}"
            )));
        }
        if !matches!(action, Action::Set | Action::Push) {
            return Ok(());
        }
        let Some(rule) = self.rule_for(action, path) else {
            return Ok(());
        };
        let messages: Vec<String> = rule
            .validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect();
        if messages.is_empty() {
            return Ok(());
        }
        Err(CommandError::Type(format!(
            "{} value for '{path}' does not match shape '{}': {}",
            action.label(),
            rule.pattern,
            messages.join("; ")
        )))
    }
}

/// Turn a numeric-looking string into a JSON number; anything else is unchanged.
pub fn coerce_numeric(value: Value) -> Value {
    let Value::String(raw) = &value else {
        return value;
    };
    let trimmed = raw.trim();
    if !NUMERIC_RE.is_match(trimmed) {
        return value;
    }
    if let Ok(integer) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(integer));
    }
    match trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(number) => Value::Number(number),
        None => value,
    }
}

fn coerce_by_schema(schema: &Value, value: Value) -> Value {
    if expects_number(schema) {
        return coerce_numeric(value);
    }
    let properties = schema.get("properties").and_then(Value::as_object);
    match (value, properties) {
        (Value::Object(mut map), Some(properties)) => {
            for (key, property) in properties {
                if let Some(field) = map.remove(key) {
                    map.insert(key.clone(), coerce_by_schema(property, field));
                }
            }
            Value::Object(map)
        }
        (value, _) => value,
    }
}

fn expects_number(schema: &Value) -> bool {
    let is_numeric = |name: &str| name == "number" || name == "integer";
    match schema.get("type") {
        Some(Value::String(name)) => is_numeric(name),
        Some(Value::Array(names)) => {
            let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            names.iter().any(|name| is_numeric(name)) && !names.contains(&"string")
        }
        _ => false,
    }
}
