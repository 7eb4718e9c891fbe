//! Allow-list path policy.
//!
//! Writes are rejected by default. A path is admitted only when it lies at or
//! under an allowed prefix, is not under a forbidden (system-managed or
//! derived) path, and does not replace or delete a protected root wholesale.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::path::CommandPath;
use crate::core::types::{Action, CommandError};

/// Serializable policy lists (the `[policy]` table of the engine config).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Prefixes a command path must start with.
    pub allow: Vec<String>,
    /// Paths (and everything beneath them) that are never writable.
    pub forbid: Vec<String>,
    /// Containers that may only be mutated through their descendants.
    pub protected: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow: to_strings(&[
                "attributes",
                "realm",
                "position",
                "equipment",
                "inventory",
                "currency",
                "skills",
                "cultivation",
                "relationships",
                "sect",
                "quests",
                "world",
                "memory.short_term",
                "memory.implicit",
                "time",
                "status_effects",
            ]),
            forbid: to_strings(&["attributes.combat_power", "time.epoch", "world.info.seed"]),
            protected: to_strings(&[
                "attributes",
                "realm",
                "position",
                "equipment",
                "inventory",
                "inventory.items",
                "currency",
                "skills",
                "cultivation",
                "relationships",
                "sect",
                "quests",
                "quests.active",
                "quests.completed",
                "world",
                "world.info",
                "world.events",
                "memory.short_term",
                "memory.implicit",
                "time",
                "status_effects",
            ]),
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.allow.is_empty() {
            return Err(anyhow!("policy.allow must list at least one prefix"));
        }
        for (list, entries) in [
            ("allow", &self.allow),
            ("forbid", &self.forbid),
            ("protected", &self.protected),
        ] {
            for entry in entries {
                CommandPath::parse(entry)
                    .map_err(|err| anyhow!("policy.{list} entry '{entry}': {err}"))?;
            }
        }
        Ok(())
    }
}

/// Compiled policy used by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPolicy {
    allow: Vec<CommandPath>,
    forbid: Vec<CommandPath>,
    protected: Vec<CommandPath>,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::compile(&PolicyConfig::default())
    }
}

impl PathPolicy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::compile(config))
    }

    fn compile(config: &PolicyConfig) -> Self {
        Self {
            allow: parse_known(&config.allow),
            forbid: parse_known(&config.forbid),
            protected: parse_known(&config.protected),
        }
    }

    /// True when some allow prefix is a segment-wise prefix of `path`.
    pub fn is_allowed(&self, path: &CommandPath) -> bool {
        self.allow.iter().any(|prefix| path.starts_with(prefix))
    }

    pub fn is_forbidden(&self, path: &CommandPath) -> bool {
        self.forbid.iter().any(|entry| path.starts_with(entry))
    }

    pub fn is_protected_root(&self, path: &CommandPath) -> bool {
        self.protected.iter().any(|root| root == path)
    }

    /// Run the allow-list, forbidden-path and protected-root checks in order.
    pub fn check(&self, action: Action, path: &CommandPath) -> Result<(), CommandError> {
        if !self.is_allowed(path) {
            return Err(CommandError::Policy(format!(
                "path '{path}' is outside the writable namespaces"
            )));
        }
        if self.is_forbidden(path) {
            return Err(CommandError::Policy(format!(
                "path '{path}' is system-managed"
            )));
        }
        if matches!(action, Action::Set | Action::Delete) && self.is_protected_root(path) {
            return Err(CommandError::Policy(format!(
                "{} on protected root '{path}' is not allowed; mutate its children instead",
                action.label()
            )));
        }
        Ok(())
    }
}

fn to_strings(entries: &[&str]) -> Vec<String> {
    entries.iter().map(|entry| entry.to_string()).collect()
}

/// Parse entries that were already validated; unparseable ones are skipped.
fn parse_known(entries: &[String]) -> Vec<CommandPath> {
    entries
        .iter()
        .filter_map(|entry| CommandPath::parse(entry).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;

    fn path(raw: &str) -> CommandPath {
        CommandPath::parse(raw).expect("path")
    }

    #[test]
    fn default_config_validates() {
        PolicyConfig::default().validate().expect("valid defaults");
    }

    /// Every accepted path has an allow prefix; everything else is rejected.
    #[test]
    fn allow_list_is_complete() {
        let policy = PathPolicy::default();
        let config = PolicyConfig::default();
        for raw in [
            "attributes.current_hp",
            "memory.short_term.0",
            "world.events.2.title",
            "system.flags.debug",
            "identity.name",
            "memory.long_term",
            "attributesX.hp",
            "forbidden.subtree",
        ] {
            let candidate = path(raw);
            let accepted = policy.check(Action::Add, &candidate).is_ok();
            let has_prefix = config
                .allow
                .iter()
                .any(|prefix| candidate.starts_with(&path(prefix)));
            if accepted {
                assert!(has_prefix, "{raw} accepted without prefix");
            }
            if !has_prefix {
                assert!(!accepted, "{raw} accepted outside allow-list");
            }
        }
    }

    #[test]
    fn forbidden_paths_reject_descendants_too() {
        let policy = PathPolicy::default();
        let err = policy
            .check(Action::Set, &path("attributes.combat_power"))
            .expect_err("forbidden");
        assert_eq!(err.kind(), ErrorKind::Policy);
        assert!(policy.check(Action::Set, &path("time.epoch.start")).is_err());
    }

    #[test]
    fn protected_roots_reject_set_and_delete_only() {
        let policy = PathPolicy::default();
        for action in [Action::Set, Action::Delete] {
            let err = policy
                .check(action, &path("inventory.items"))
                .expect_err("protected");
            assert!(err.to_string().contains("protected root"));
        }
        assert!(policy.check(Action::Push, &path("status_effects")).is_ok());
        assert!(policy.check(Action::Set, &path("inventory.items.sword")).is_ok());
        assert!(policy.check(Action::Delete, &path("inventory.items.sword")).is_ok());
    }

    #[test]
    fn from_config_rejects_malformed_entries() {
        let config = PolicyConfig {
            allow: vec!["attributes".to_string()],
            forbid: vec!["a..b".to_string()],
            protected: Vec::new(),
        };
        let err = PathPolicy::from_config(&config).expect_err("invalid");
        assert!(err.to_string().contains("policy.forbid"));
    }
}
