//! Shard persistence over a [`KvBackend`].
//!
//! Every session owns the keys `{namespace}/{session}/{version}/{shard}`.
//! Batched operations never abort on a single key: each failure is logged
//! and reported, and the remaining keys are still processed.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::shards::{ShardKey, ShardMap};
use crate::io::backend::{BackendError, KvBackend};

/// Key suffix of the pre-shard, single-document layout.
const LEGACY_SUFFIX: &str = "aggregate";

/// Outcome of a batched shard write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub written: Vec<ShardKey>,
    pub failed: Vec<ShardFailure>,
}

impl SaveReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of loading every shard of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Shards that were present and parsed.
    pub shards: ShardMap,
    /// Keys with no stored value.
    pub missing: Vec<ShardKey>,
    /// Keys whose read failed (I/O, unavailable backend).
    pub failed: Vec<ShardFailure>,
    /// Keys whose stored bytes do not parse.
    pub corrupt: Vec<ShardFailure>,
}

impl LoadReport {
    /// True when nothing at all is stored for the session.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty() && self.failed.is_empty() && self.corrupt.is_empty()
    }
}

/// Outcome of deleting every key of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub deleted: usize,
    pub failed: Vec<ShardFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardFailure {
    pub shard: ShardKey,
    pub reason: String,
}

/// Session ids become key segments, so they may not be empty or contain `/`.
pub fn is_valid_session_id(session: &str) -> bool {
    !session.trim().is_empty() && !session.contains(['/', '\\']) && session != "." && session != ".."
}

#[derive(Debug)]
pub struct ShardStore<B> {
    backend: B,
    namespace: String,
    version: String,
}

impl<B: KvBackend> ShardStore<B> {
    pub fn new(backend: B, namespace: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            version: version.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn shard_key(&self, session: &str, shard: ShardKey) -> String {
        format!(
            "{}/{session}/{}/{}",
            self.namespace,
            self.version,
            shard.name()
        )
    }

    pub fn legacy_key(&self, session: &str) -> String {
        format!("{}/{session}/{LEGACY_SUFFIX}", self.namespace)
    }

    /// Full save: every shard in `shards` in one batched call.
    pub async fn save_all(&self, session: &str, shards: &ShardMap) -> SaveReport {
        debug!(session, shards = shards.len(), "saving all shards");
        self.write(session, shards).await
    }

    /// Incremental save of a subset of shards.
    pub async fn save_many(&self, session: &str, shards: &ShardMap) -> SaveReport {
        debug!(
            session,
            shards = ?shards.keys().map(|key| key.name()).collect::<Vec<_>>(),
            "saving shards"
        );
        self.write(session, shards).await
    }

    /// Read every known shard key, tolerating missing ones.
    pub async fn load_all(&self, session: &str) -> LoadReport {
        let keys: Vec<String> = ShardKey::ALL
            .iter()
            .map(|shard| self.shard_key(session, *shard))
            .collect();
        let results = self.backend.get_many(&keys).await;

        let mut report = LoadReport::default();
        for (shard, (key, result)) in ShardKey::ALL.into_iter().zip(results) {
            match result {
                Ok(Some(value)) => {
                    report.shards.insert(shard, value);
                }
                Ok(None) => report.missing.push(shard),
                Err(err) => {
                    warn!(key = %key, error = %err, "shard read failed");
                    let failure = ShardFailure {
                        shard,
                        reason: err.to_string(),
                    };
                    if err.is_corrupt() {
                        report.corrupt.push(failure);
                    } else {
                        report.failed.push(failure);
                    }
                }
            }
        }
        debug!(
            session,
            loaded = report.shards.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            corrupt = report.corrupt.len(),
            "loaded shards"
        );
        report
    }

    /// Read a single shard without touching the rest of the session.
    pub async fn load_one(&self, session: &str, shard: ShardKey) -> Result<Option<Value>, BackendError> {
        self.backend.get(&self.shard_key(session, shard)).await
    }

    pub async fn load_legacy(&self, session: &str) -> Result<Option<Value>, BackendError> {
        self.backend.get(&self.legacy_key(session)).await
    }

    pub async fn delete_legacy(&self, session: &str) -> Result<(), BackendError> {
        self.backend.delete(&self.legacy_key(session)).await
    }

    /// Delete every known shard key plus the legacy key, tolerating missing ones.
    pub async fn clear_all(&self, session: &str) -> ClearReport {
        let keys: Vec<String> = ShardKey::ALL
            .iter()
            .map(|shard| self.shard_key(session, *shard))
            .collect();
        let results = self.backend.delete_many(&keys).await;

        let mut report = ClearReport::default();
        for (shard, (key, result)) in ShardKey::ALL.into_iter().zip(results) {
            match result {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    warn!(key = %key, error = %err, "shard delete failed");
                    report.failed.push(ShardFailure {
                        shard,
                        reason: err.to_string(),
                    });
                }
            }
        }
        if let Err(err) = self.delete_legacy(session).await {
            warn!(key = %self.legacy_key(session), error = %err, "legacy delete failed");
        }
        debug!(session, deleted = report.deleted, "cleared session");
        report
    }

    async fn write(&self, session: &str, shards: &ShardMap) -> SaveReport {
        let order: Vec<ShardKey> = shards.keys().copied().collect();
        let entries: Vec<(String, Value)> = shards
            .iter()
            .map(|(shard, value)| (self.shard_key(session, *shard), value.clone()))
            .collect();
        let results = self.backend.set_many(&entries).await;

        let mut report = SaveReport::default();
        for (shard, (key, result)) in order.into_iter().zip(results) {
            match result {
                Ok(()) => report.written.push(shard),
                Err(err) => {
                    warn!(key = %key, error = %err, "shard write failed");
                    report.failed.push(ShardFailure {
                        shard,
                        reason: err.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shards::{decompose, default_aggregate};
    use crate::io::backend::{FileBackend, MemoryBackend};
    use serde_json::json;

    fn store() -> ShardStore<MemoryBackend> {
        ShardStore::new(MemoryBackend::new(), "game", "v1")
    }

    #[test]
    fn keys_are_namespaced_and_versioned() {
        let store = store();
        assert_eq!(
            store.shard_key("s1", ShardKey::MemoryShortTerm),
            "game/s1/v1/memory_short_term"
        );
        assert_eq!(store.legacy_key("s1"), "game/s1/aggregate");
    }

    #[test]
    fn session_ids_must_be_single_segments() {
        assert!(is_valid_session_id("slot-1"));
        for bad in ["", "  ", "a/b", "..", "a\\b"] {
            assert!(!is_valid_session_id(bad), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn save_all_then_load_all_returns_every_shard() {
        let store = store();
        let shards = decompose(&default_aggregate());
        let saved = store.save_all("s1", &shards).await;
        assert!(saved.is_complete());
        assert_eq!(saved.written.len(), ShardKey::ALL.len());

        let loaded = store.load_all("s1").await;
        assert!(loaded.missing.is_empty());
        assert_eq!(loaded.shards, shards);
    }

    #[tokio::test]
    async fn load_all_tolerates_missing_keys() {
        let store = store();
        let mut partial = ShardMap::new();
        partial.insert(ShardKey::Realm, json!({"name": "Foundation", "level": 1}));
        store.save_many("s1", &partial).await;

        let loaded = store.load_all("s1").await;
        assert_eq!(loaded.shards, partial);
        assert_eq!(loaded.missing.len(), ShardKey::ALL.len() - 1);
        assert!(!loaded.is_empty());
        assert!(store.load_all("other").await.is_empty());
    }

    #[tokio::test]
    async fn sessions_do_not_share_keys() {
        let store = store();
        let mut partial = ShardMap::new();
        partial.insert(ShardKey::Time, json!({"day": 9}));
        store.save_many("a", &partial).await;
        assert_eq!(store.load_one("b", ShardKey::Time).await.expect("load"), None);
        assert_eq!(
            store.load_one("a", ShardKey::Time).await.expect("load"),
            Some(json!({"day": 9}))
        );
    }

    #[tokio::test]
    async fn corrupt_key_does_not_block_the_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ShardStore::new(FileBackend::new(temp.path()), "game", "v1");
        store.save_all("s1", &decompose(&default_aggregate())).await;
        std::fs::write(temp.path().join("game/s1/v1/realm.json"), "{broken").expect("write");

        let loaded = store.load_all("s1").await;
        assert_eq!(loaded.corrupt.len(), 1);
        assert_eq!(loaded.corrupt[0].shard, ShardKey::Realm);
        assert_eq!(loaded.shards.len(), ShardKey::ALL.len() - 1);
    }

    #[tokio::test]
    async fn clear_all_removes_shards_and_legacy_key() {
        let store = store();
        store.save_all("s1", &decompose(&default_aggregate())).await;
        store
            .backend()
            .set(&store.legacy_key("s1"), &json!({}))
            .await
            .expect("set legacy");

        let cleared = store.clear_all("s1").await;
        assert_eq!(cleared.deleted, ShardKey::ALL.len());
        assert!(store.backend().snapshot().is_empty());
        // Clearing again is a no-op.
        assert!(store.clear_all("s1").await.failed.is_empty());
    }
}
