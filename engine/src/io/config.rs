//! Engine configuration stored under `.engine/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::policy::PolicyConfig;

pub const CONFIG_DIR: &str = ".engine";
pub const CONFIG_FILE: &str = "config.toml";

/// Engine configuration (TOML).
///
/// Missing fields default, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// First segment of every storage key.
    pub namespace: String,

    /// Layout version segment of every shard key.
    pub key_version: String,

    /// Root directory of the file backend, relative to the config directory's parent.
    pub data_dir: PathBuf,

    /// Upper bound for one persistence call, in milliseconds.
    pub persist_timeout_ms: u64,

    pub policy: PolicyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "engine".to_string(),
            key_version: "v1".to_string(),
            data_dir: PathBuf::from(".engine/data"),
            persist_timeout_ms: 5_000,
            policy: PolicyConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("namespace", &self.namespace), ("key_version", &self.key_version)] {
            if value.trim().is_empty() {
                return Err(anyhow!("{field} must be non-empty"));
            }
            if value.contains('/') {
                return Err(anyhow!("{field} must not contain '/'"));
            }
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("data_dir must be non-empty"));
        }
        if self.persist_timeout_ms == 0 {
            return Err(anyhow!("persist_timeout_ms must be > 0"));
        }
        self.policy.validate()
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

/// Default config location under `root`.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = config_path(temp.path());
        let mut cfg = EngineConfig::default();
        cfg.namespace = "tavern".to_string();
        cfg.policy.allow.push("npc_cache".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "persist_timeout_ms = 250\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.persist_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.namespace, "engine");
        assert_eq!(cfg.policy, PolicyConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "namespace = \"a/b\"\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("namespace must not contain '/'"));

        let cfg = EngineConfig {
            persist_timeout_ms: 0,
            ..EngineConfig::default()
        };
        assert!(write_config(&path, &cfg).is_err());
    }
}
