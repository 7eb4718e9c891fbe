//! Key-value backend abstraction.
//!
//! The [`KvBackend`] trait decouples the shard store from where bytes live.
//! [`MemoryBackend`] keeps values in a map (tests, embedding); [`FileBackend`]
//! keeps one JSON file per key under a root directory. Tests wrap these with
//! recording or failing backends.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error on key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// The stored bytes exist but do not parse.
    #[error("corrupt value under key '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid key '{0}'")]
    InvalidKey(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, BackendError::Corrupt { .. })
    }
}

/// Per-key outcome of a batched call.
pub type KeyResult<T> = (String, Result<T, BackendError>);

/// Abstraction over key-value persistence backends.
///
/// Deleting a missing key is not an error. Batched variants report one
/// result per key so a single failure never hides the others.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError>;

    async fn set(&self, key: &str, value: &Value) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn get_many(&self, keys: &[String]) -> Vec<KeyResult<Option<Value>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push((key.clone(), self.get(key).await));
        }
        results
    }

    async fn set_many(&self, entries: &[(String, Value)]) -> Vec<KeyResult<()>> {
        let mut results = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            results.push((key.clone(), self.set(key, value).await));
        }
        results
    }

    async fn delete_many(&self, keys: &[String]) -> Vec<KeyResult<()>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push((key.clone(), self.delete(key).await));
        }
        results
    }
}

/// In-process backend backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored key and value.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> T,
    ) -> Result<T, BackendError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BackendError::Unavailable("memory backend lock poisoned".to_string()))?;
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), BackendError> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.clone());
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }
}

/// Backend storing each key as `<root>/<segment>/.../<last>.json`.
///
/// Keys are `/`-separated; segments must be non-empty and may not be `.` or
/// `..`. Writes go to a temp file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, BackendError> {
        let mut path = self.root.clone();
        let segments: Vec<&str> = key.split('/').collect();
        for segment in &segments {
            let valid = !segment.is_empty()
                && *segment != "."
                && *segment != ".."
                && !segment.contains('\\');
            if !valid {
                return Err(BackendError::InvalidKey(key.to_string()));
            }
        }
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(BackendError::InvalidKey(key.to_string()));
        };
        for segment in parents {
            path.push(segment);
        }
        path.push(format!("{leaf}.json"));
        Ok(path)
    }
}

#[async_trait]
impl KvBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        let path = self.key_path(key)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(BackendError::Io {
                    key: key.to_string(),
                    source,
                });
            }
        };
        let value = serde_json::from_str(&contents).map_err(|source| BackendError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), BackendError> {
        let path = self.key_path(key)?;
        let io_err = |source| BackendError::Io {
            key: key.to_string(),
            source,
        };
        let mut buf = serde_json::to_string_pretty(value).map_err(|source| {
            BackendError::Corrupt {
                key: key.to_string(),
                source,
            }
        })?;
        buf.push('\n');
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, buf).await.map_err(io_err)?;
        fs::rename(&tmp_path, &path).await.map_err(io_err)?;
        debug!(key, path = %path.display(), "wrote key");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BackendError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}
