//! Session lifecycle: load, mutate, persist, exit.
//!
//! A [`StateController`] owns one session's aggregate. Mutations run through
//! validate, apply and persist to completion; taking `&mut self` rules out a
//! second mutation while one is in flight. The in-memory aggregate is swapped
//! before any persistence I/O starts and stays authoritative when a write
//! fails or times out: the affected shards are queued and retried on the next
//! persistence cycle.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::executor::apply_commands;
use crate::core::path::CommandPath;
use crate::core::policy::PathPolicy;
use crate::core::schema::SchemaRegistry;
use crate::core::shards::{
    ShardKey, ShardMap, decompose, default_aggregate, recompose, shards_for_path, shards_for_paths,
};
use crate::core::types::{CommandError, CommandFailure};
use crate::core::validator::CommandValidator;
use crate::io::backend::KvBackend;
use crate::io::config::EngineConfig;
use crate::io::shard_store::{
    ClearReport, LoadReport, ShardFailure, ShardStore, is_valid_session_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Unloaded,
    Loading,
    Ready,
    Mutating,
    Flushing,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Unloaded => "unloaded",
            SessionPhase::Loading => "loading",
            SessionPhase::Ready => "ready",
            SessionPhase::Mutating => "mutating",
            SessionPhase::Flushing => "flushing",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid session id '{0}'")]
    InvalidSession(String),
    #[error("no session is loaded")]
    NotLoaded,
    #[error("cannot {operation} while the session is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: SessionPhase,
    },
    /// The stored document cannot be parsed; fall back to a default session.
    #[error("session '{session}' is corrupt: {detail}")]
    Corrupt { session: String, detail: String },
    #[error("storage unavailable for session '{session}': {detail}")]
    Unavailable { session: String, detail: String },
    #[error(transparent)]
    Path(#[from] CommandError),
}

/// Result of one persistence cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    /// True when every writable shard was targeted.
    pub full: bool,
    pub written: Vec<ShardKey>,
    pub failed: Vec<ShardKey>,
    pub timed_out: bool,
}

impl PersistOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.timed_out
    }
}

/// Result of submitting one command batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub applied_count: usize,
    /// Rejected or failed commands, ordered by batch index.
    pub failures: Vec<CommandFailure>,
    pub warnings: Vec<String>,
    pub persist: PersistOutcome,
}

#[derive(Debug)]
struct Session {
    id: String,
    document: Value,
    /// A full save has completed at least once (or shards already existed).
    persisted_once: bool,
    /// Shards whose last write failed, never happened, or was cut short.
    pending: BTreeSet<ShardKey>,
    /// Shards whose read failed at load. Never written while unread; commands
    /// touching them are rejected until a retried read succeeds.
    unreadable: BTreeSet<ShardKey>,
}

#[derive(Debug)]
pub struct StateController<B> {
    store: ShardStore<B>,
    validator: CommandValidator,
    persist_timeout: Duration,
    phase: SessionPhase,
    session: Option<Session>,
}

impl<B: KvBackend> StateController<B> {
    pub fn new(store: ShardStore<B>, validator: CommandValidator, persist_timeout: Duration) -> Self {
        Self {
            store,
            validator,
            persist_timeout,
            phase: SessionPhase::Unloaded,
            session: None,
        }
    }

    /// Controller wired from config: policy, namespace, key version, timeout.
    pub fn from_config(backend: B, config: &EngineConfig) -> Result<Self> {
        let policy = PathPolicy::from_config(&config.policy)?;
        let validator = CommandValidator::new(policy, SchemaRegistry::builtin()?);
        let store = ShardStore::new(backend, &config.namespace, &config.key_version);
        Ok(Self::new(store, validator, config.persist_timeout()))
    }

    /// Phase between calls.
    ///
    /// `Loading`, `Mutating` and `Flushing` only last while a call is in
    /// flight. If that call's future is dropped, the controller reads as
    /// `Ready` (or `Unloaded` when nothing was loaded yet).
    pub fn phase(&self) -> SessionPhase {
        match self.phase {
            SessionPhase::Loading | SessionPhase::Mutating | SessionPhase::Flushing => {
                if self.session.is_some() {
                    SessionPhase::Ready
                } else {
                    SessionPhase::Unloaded
                }
            }
            phase => phase,
        }
    }

    pub fn store(&self) -> &ShardStore<B> {
        &self.store
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.id.as_str())
    }

    pub fn document(&self) -> Option<&Value> {
        self.session.as_ref().map(|session| &session.document)
    }

    /// Current in-memory value of one shard.
    pub fn shard(&self, key: ShardKey) -> Option<Value> {
        let document = self.document()?;
        if key == ShardKey::Extras {
            return decompose(document).remove(&key);
        }
        key.owned_path()
            .iter()
            .try_fold(document, |current, segment| current.get(*segment))
            .cloned()
            .or_else(|| Some(key.default_value()))
    }

    /// Shards queued for the next persistence cycle.
    pub fn pending_shards(&self) -> Vec<ShardKey> {
        self.session
            .as_ref()
            .map(|session| session.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Shards whose stored copy has not been read since load.
    pub fn unreadable_shards(&self) -> Vec<ShardKey> {
        self.session
            .as_ref()
            .map(|session| session.unreadable.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Read one stored shard of any session without loading it.
    pub async fn read_stored_shard(
        &self,
        session: &str,
        key: ShardKey,
    ) -> Result<Option<Value>, ControllerError> {
        if !is_valid_session_id(session) {
            return Err(ControllerError::InvalidSession(session.to_string()));
        }
        let unavailable = |detail: String| ControllerError::Unavailable {
            session: session.to_string(),
            detail,
        };
        self.bounded(self.store.load_one(session, key))
            .await
            .ok_or_else(|| unavailable("read timed out".to_string()))?
            .map_err(|err| unavailable(err.to_string()))
    }

    /// Read a session's aggregate without loading it or writing anything.
    ///
    /// Missing shards read as defaults and a legacy document is returned as
    /// is, unmigrated. Any unreadable shard is an error.
    pub async fn peek_session(&self, id: &str) -> Result<Value, ControllerError> {
        if !is_valid_session_id(id) {
            return Err(ControllerError::InvalidSession(id.to_string()));
        }
        let report = self.load_report(id).await?;
        if report.is_empty() {
            return Ok(match self.read_legacy(id).await? {
                Some((_, document)) => document,
                None => default_aggregate(),
            });
        }
        if !report.failed.is_empty() {
            return Err(ControllerError::Unavailable {
                session: id.to_string(),
                detail: join_reasons(&report.failed),
            });
        }
        recompose(report.shards).map_err(|err| ControllerError::Corrupt {
            session: id.to_string(),
            detail: err.to_string(),
        })
    }

    /// Load a session from storage.
    ///
    /// With no stored shards, a legacy single-document key is migrated if
    /// present; otherwise the session starts from the default aggregate.
    /// A corrupt stored document is an error and leaves nothing loaded.
    pub async fn load_session(&mut self, id: &str) -> Result<&Value, ControllerError> {
        self.settle_phase();
        self.expect_phase(SessionPhase::Unloaded, "load a session")?;
        if !is_valid_session_id(id) {
            return Err(ControllerError::InvalidSession(id.to_string()));
        }
        self.phase = SessionPhase::Loading;
        match self.read_session(id).await {
            Ok(session) => {
                info!(
                    session = id,
                    pending = session.pending.len(),
                    unreadable = session.unreadable.len(),
                    "session loaded"
                );
                self.phase = SessionPhase::Ready;
                Ok(&self.session.insert(session).document)
            }
            Err(err) => {
                warn!(session = id, error = %err, "session load failed");
                self.phase = SessionPhase::Unloaded;
                Err(err)
            }
        }
    }

    /// Install a default aggregate without reading storage.
    ///
    /// The first persistence cycle is a full save, replacing whatever the
    /// session's keys held before.
    pub fn start_default_session(&mut self, id: &str) -> Result<&Value, ControllerError> {
        self.settle_phase();
        self.expect_phase(SessionPhase::Unloaded, "start a session")?;
        if !is_valid_session_id(id) {
            return Err(ControllerError::InvalidSession(id.to_string()));
        }
        info!(session = id, "starting default session");
        self.phase = SessionPhase::Ready;
        let session = self.session.insert(Session {
            id: id.to_string(),
            document: default_aggregate(),
            persisted_once: false,
            pending: BTreeSet::new(),
            unreadable: BTreeSet::new(),
        });
        Ok(&session.document)
    }

    /// Validate, apply and persist one command batch.
    ///
    /// Invalid or failing commands are reported and skipped; the rest apply in
    /// order. Only shards touched by applied commands (plus queued ones) are
    /// written. Commands touching a shard that still cannot be read are
    /// rejected with a persistence error.
    pub async fn submit_commands(&mut self, raw: &[Value]) -> Result<BatchOutcome, ControllerError> {
        self.settle_phase();
        self.expect_phase(SessionPhase::Ready, "submit commands")?;
        self.recover_unreadable().await;
        self.phase = SessionPhase::Mutating;

        let mut failures = Vec::new();
        let mut warnings = Vec::new();
        let mut commands = Vec::new();
        let mut origins = Vec::new();
        let unreadable = self.session.as_ref().map(|session| &session.unreadable);
        for (index, result) in self.validator.validate_batch(raw).into_iter().enumerate() {
            warnings.extend(
                result
                    .warnings
                    .iter()
                    .map(|warning| format!("command {index}: {warning}")),
            );
            match result.command {
                Some(command) if result.errors.is_empty() => {
                    let blocked = unreadable.and_then(|unreadable| {
                        shards_for_path(&command.path)
                            .into_iter()
                            .find(|key| unreadable.contains(key))
                    });
                    match blocked {
                        Some(key) => {
                            let error = CommandError::Persistence(format!(
                                "shard '{}' could not be read from storage",
                                key.name()
                            ));
                            failures.push(CommandFailure::from_raw(index, &raw[index], &error));
                        }
                        None => {
                            commands.push(command);
                            origins.push(index);
                        }
                    }
                }
                _ => failures.extend(
                    result
                        .errors
                        .iter()
                        .map(|error| CommandFailure::from_raw(index, &raw[index], error)),
                ),
            }
        }

        let Some(session) = self.session.as_mut() else {
            self.phase = SessionPhase::Unloaded;
            return Err(ControllerError::NotLoaded);
        };
        let outcome = apply_commands(&session.document, &commands);
        for failure in &outcome.failures {
            let index = origins[failure.index];
            failures.push(CommandFailure::from_raw(index, &raw[index], &failure.error));
        }
        failures.sort_by_key(|failure| failure.index);
        for failure in &failures {
            warn!(
                session = %session.id,
                index = failure.index,
                action = failure.action.as_deref().unwrap_or("?"),
                path = failure.path.as_deref().unwrap_or("?"),
                reason = %failure.message,
                "command rejected"
            );
        }
        session.document = outcome.document;
        debug!(
            session = %session.id,
            applied = outcome.applied_count,
            rejected = failures.len(),
            "batch applied"
        );

        let persist = if outcome.applied_count == 0 && session.pending.is_empty() {
            PersistOutcome::default()
        } else {
            self.persist_cycle(Some(outcome.applied_paths.as_slice())).await
        };
        self.phase = SessionPhase::Ready;
        Ok(BatchOutcome {
            applied_count: outcome.applied_count,
            failures,
            warnings,
            persist,
        })
    }

    /// Persist the current aggregate.
    ///
    /// Without a hint (or before the first full save) every writable shard is
    /// written; otherwise only shards mapped from the hinted paths. Queued
    /// shards are always included. Shards that still cannot be read are
    /// skipped.
    pub async fn persist(&mut self, hint: Option<&[CommandPath]>) -> Result<PersistOutcome, ControllerError> {
        self.settle_phase();
        self.expect_phase(SessionPhase::Ready, "persist")?;
        self.recover_unreadable().await;
        self.phase = SessionPhase::Flushing;
        let outcome = self.persist_cycle(hint).await;
        self.phase = SessionPhase::Ready;
        Ok(outcome)
    }

    /// [`persist`](Self::persist) with dotted path strings as the hint.
    pub async fn persist_paths(&mut self, paths: &[&str]) -> Result<PersistOutcome, ControllerError> {
        let parsed = paths
            .iter()
            .map(|raw| CommandPath::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        self.persist(Some(parsed.as_slice())).await
    }

    /// Flush queued shards, then unload. Stored data is kept.
    pub async fn exit_session(&mut self) -> Result<PersistOutcome, ControllerError> {
        self.settle_phase();
        self.expect_loaded("exit the session")?;
        self.phase = SessionPhase::Flushing;
        let has_pending = self
            .session
            .as_ref()
            .is_some_and(|session| !session.pending.is_empty());
        let outcome = if has_pending {
            self.persist_cycle(Some(&[])).await
        } else {
            PersistOutcome::default()
        };
        if !outcome.is_clean() {
            warn!(
                session = self.session_id().unwrap_or_default(),
                failed = ?outcome.failed,
                timed_out = outcome.timed_out,
                "exiting with unflushed shards"
            );
        }
        self.unload();
        Ok(outcome)
    }

    /// Unload without writing anything, dropping queued shards.
    pub fn discard_session(&mut self) -> Result<(), ControllerError> {
        self.settle_phase();
        self.expect_loaded("discard the session")?;
        if let Some(session) = self.session.as_ref().filter(|session| !session.pending.is_empty()) {
            debug!(session = %session.id, pending = ?session.pending, "discarding unflushed shards");
        }
        self.unload();
        Ok(())
    }

    /// Delete every stored key of the loaded session, then unload.
    pub async fn delete_session(&mut self) -> Result<ClearReport, ControllerError> {
        self.settle_phase();
        let id = self.expect_loaded("delete the session")?.to_string();
        let report = self
            .bounded(self.store.clear_all(&id))
            .await
            .ok_or_else(|| ControllerError::Unavailable {
                session: id.clone(),
                detail: "delete timed out".to_string(),
            })?;
        info!(session = %id, deleted = report.deleted, "session deleted");
        self.session = None;
        self.phase = SessionPhase::Unloaded;
        Ok(report)
    }

    async fn read_session(&self, id: &str) -> Result<Session, ControllerError> {
        let report = self.load_report(id).await?;
        if report.is_empty() {
            return self.migrate_or_default(id).await;
        }

        let unreadable: BTreeSet<ShardKey> =
            report.failed.iter().map(|failure| failure.shard).collect();
        let pending: BTreeSet<ShardKey> = report.missing.iter().copied().collect();
        let document = recompose(report.shards).map_err(|err| ControllerError::Corrupt {
            session: id.to_string(),
            detail: err.to_string(),
        })?;
        Ok(Session {
            id: id.to_string(),
            document,
            persisted_once: true,
            pending,
            unreadable,
        })
    }

    /// Every shard of `id`; any unparseable shard makes the whole read corrupt.
    async fn load_report(&self, id: &str) -> Result<LoadReport, ControllerError> {
        let report = self
            .bounded(self.store.load_all(id))
            .await
            .ok_or_else(|| ControllerError::Unavailable {
                session: id.to_string(),
                detail: "load timed out".to_string(),
            })?;
        if !report.corrupt.is_empty() {
            return Err(ControllerError::Corrupt {
                session: id.to_string(),
                detail: join_reasons(&report.corrupt),
            });
        }
        Ok(report)
    }

    /// The legacy single-document key, split into shards and rebuilt.
    async fn read_legacy(&self, id: &str) -> Result<Option<(ShardMap, Value)>, ControllerError> {
        let corrupt = |detail: String| ControllerError::Corrupt {
            session: id.to_string(),
            detail,
        };
        let legacy = self
            .bounded(self.store.load_legacy(id))
            .await
            .ok_or_else(|| ControllerError::Unavailable {
                session: id.to_string(),
                detail: "legacy read timed out".to_string(),
            })?;
        let legacy = match legacy {
            Ok(Some(legacy)) => legacy,
            Ok(None) => return Ok(None),
            Err(err) if err.is_corrupt() => return Err(corrupt(err.to_string())),
            Err(err) => {
                return Err(ControllerError::Unavailable {
                    session: id.to_string(),
                    detail: err.to_string(),
                });
            }
        };

        if !legacy.is_object() {
            return Err(corrupt("legacy document is not an object".to_string()));
        }
        let shards = decompose(&legacy);
        let document = recompose(shards.clone()).map_err(|err| corrupt(err.to_string()))?;
        Ok(Some((shards, document)))
    }

    /// Convert a legacy single-document session into shards, or start fresh.
    async fn migrate_or_default(&self, id: &str) -> Result<Session, ControllerError> {
        let Some((shards, document)) = self.read_legacy(id).await? else {
            debug!(session = id, "no stored state, starting from defaults");
            return Ok(Session {
                id: id.to_string(),
                document: default_aggregate(),
                persisted_once: false,
                pending: BTreeSet::new(),
                unreadable: BTreeSet::new(),
            });
        };

        info!(session = id, "migrating legacy document to shards");
        let saved = self.bounded(self.store.save_all(id, &shards)).await;
        let pending: BTreeSet<ShardKey> = match &saved {
            Some(report) => report.failed.iter().map(|failure| failure.shard).collect(),
            None => shards.keys().copied().collect(),
        };
        if pending.is_empty() {
            if let Some(Err(err)) = self.bounded(self.store.delete_legacy(id)).await {
                warn!(session = id, error = %err, "legacy key not removed after migration");
            }
        } else {
            warn!(session = id, pending = pending.len(), "legacy migration incomplete; keeping legacy key");
        }
        Ok(Session {
            id: id.to_string(),
            document,
            persisted_once: pending.is_empty(),
            pending,
            unreadable: BTreeSet::new(),
        })
    }

    /// Retry reads of shards that failed at load and merge what comes back.
    ///
    /// Each recovered shard is merged before the next read starts, so a
    /// dropped call leaves the session consistent.
    async fn recover_unreadable(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let keys: Vec<ShardKey> = session.unreadable.iter().copied().collect();
        for key in keys {
            let read = timeout(self.persist_timeout, self.store.load_one(&session.id, key)).await;
            let stored = match read {
                Ok(Ok(stored)) => stored,
                Ok(Err(err)) => {
                    warn!(session = %session.id, shard = key.name(), error = %err, "shard still unreadable");
                    continue;
                }
                Err(_) => {
                    warn!(session = %session.id, shard = key.name(), "shard read timed out");
                    continue;
                }
            };

            let missing = stored.is_none();
            let mut shards = decompose(&session.document);
            shards.insert(key, stored.unwrap_or_else(|| key.default_value()));
            match recompose(shards) {
                Ok(document) => session.document = document,
                Err(err) => {
                    warn!(session = %session.id, error = %err, "stored shard is corrupt; leaving it unwritten");
                    continue;
                }
            }
            session.unreadable.remove(&key);
            if missing {
                session.pending.insert(key);
            }
            info!(session = %session.id, shard = key.name(), "unreadable shard recovered");
        }
    }

    async fn persist_cycle(&mut self, hint: Option<&[CommandPath]>) -> PersistOutcome {
        let Some(session) = self.session.as_mut() else {
            return PersistOutcome::default();
        };
        let full = hint.is_none() || !session.persisted_once;

        let mut targets: BTreeSet<ShardKey> = if full {
            ShardKey::ALL.into_iter().collect()
        } else {
            hint.map(shards_for_paths).unwrap_or_default()
        };
        targets.extend(session.pending.iter().copied());
        targets.retain(|key| !session.unreadable.contains(key));
        if targets.is_empty() {
            return PersistOutcome::default();
        }
        // Queued until the save reports back.
        session.pending.extend(targets.iter().copied());

        let subset: ShardMap = decompose(&session.document)
            .into_iter()
            .filter(|(key, _)| targets.contains(key))
            .collect();
        let store = &self.store;
        let id = session.id.as_str();
        let save = async {
            if full {
                store.save_all(id, &subset).await
            } else {
                store.save_many(id, &subset).await
            }
        };

        let result = timeout(self.persist_timeout, save).await;
        match result {
            Ok(report) => {
                session.pending = report.failed.iter().map(|failure| failure.shard).collect();
                if full {
                    session.persisted_once = true;
                }
                if !session.pending.is_empty() {
                    warn!(session = %session.id, pending = ?session.pending, "shards queued for retry");
                }
                PersistOutcome {
                    full,
                    written: report.written,
                    failed: session.pending.iter().copied().collect(),
                    timed_out: false,
                }
            }
            Err(_) => {
                warn!(
                    session = %session.id,
                    timeout_ms = self.persist_timeout.as_millis() as u64,
                    shards = targets.len(),
                    "persist timed out; shards queued for retry"
                );
                PersistOutcome {
                    full,
                    written: Vec::new(),
                    failed: session.pending.iter().copied().collect(),
                    timed_out: true,
                }
            }
        }
    }

    async fn bounded<T>(&self, operation: impl Future<Output = T>) -> Option<T> {
        timeout(self.persist_timeout, operation).await.ok()
    }

    fn unload(&mut self) {
        if let Some(session) = self.session.take() {
            info!(session = %session.id, "session unloaded");
        }
        self.phase = SessionPhase::Unloaded;
    }

    /// Drop a transient phase left behind by a call whose future was dropped.
    fn settle_phase(&mut self) {
        let settled = self.phase();
        if settled != self.phase {
            warn!(from = %self.phase, to = %settled, "previous call did not finish; phase restored");
            self.phase = settled;
        }
    }

    fn expect_phase(&self, expected: SessionPhase, operation: &'static str) -> Result<(), ControllerError> {
        if self.phase == expected {
            return Ok(());
        }
        if self.session.is_none() && expected != SessionPhase::Unloaded {
            return Err(ControllerError::NotLoaded);
        }
        Err(ControllerError::InvalidPhase {
            operation,
            phase: self.phase,
        })
    }

    fn expect_loaded(&self, operation: &'static str) -> Result<&str, ControllerError> {
        match (&self.session, self.phase) {
            (Some(session), SessionPhase::Ready) => Ok(session.id.as_str()),
            (None, _) => Err(ControllerError::NotLoaded),
            (Some(_), phase) => Err(ControllerError::InvalidPhase { operation, phase }),
        }
    }
}

fn join_reasons(failures: &[ShardFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.reason.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::backend::{KvBackend, MemoryBackend};
    use crate::test_support::{command, delete, sample_aggregate};
    use serde_json::json;

    fn controller() -> StateController<MemoryBackend> {
        StateController::from_config(MemoryBackend::new(), &EngineConfig::default())
            .expect("controller")
    }

    async fn seeded(session: &str) -> StateController<MemoryBackend> {
        let mut controller = controller();
        controller
            .store()
            .save_all(session, &decompose(&sample_aggregate()))
            .await;
        controller.load_session(session).await.expect("load");
        controller
    }

    #[tokio::test]
    async fn fresh_session_starts_from_defaults() {
        let mut controller = controller();
        let document = controller.load_session("s1").await.expect("load").clone();
        assert_eq!(document, default_aggregate());
        assert_eq!(controller.phase(), SessionPhase::Ready);
        assert_eq!(controller.session_id(), Some("s1"));
    }

    #[tokio::test]
    async fn mutations_before_load_are_rejected() {
        let mut controller = controller();
        let err = controller
            .submit_commands(&[command("add", "attributes.current_hp", json!(1))])
            .await
            .expect_err("not loaded");
        assert!(matches!(err, ControllerError::NotLoaded));
        assert!(matches!(
            controller.persist(None).await,
            Err(ControllerError::NotLoaded)
        ));
        assert!(matches!(
            controller.exit_session().await,
            Err(ControllerError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn second_load_is_rejected_until_exit() {
        let mut controller = seeded("s1").await;
        let err = controller.load_session("s2").await.expect_err("already loaded");
        assert!(matches!(
            err,
            ControllerError::InvalidPhase {
                phase: SessionPhase::Ready,
                ..
            }
        ));
        controller.exit_session().await.expect("exit");
        controller.load_session("s2").await.expect("load");
    }

    #[tokio::test]
    async fn invalid_session_ids_are_rejected() {
        let mut controller = controller();
        assert!(matches!(
            controller.load_session("a/b").await,
            Err(ControllerError::InvalidSession(_))
        ));
        assert_eq!(controller.phase(), SessionPhase::Unloaded);
    }

    #[tokio::test]
    async fn batch_failures_keep_batch_indices() {
        let mut controller = seeded("s1").await;
        let outcome = controller
            .submit_commands(&[
                command("set", "system.flags.cheat", json!(true)),
                command("add", "attributes.current_hp", json!(-30)),
                command("set", "attributes.current_hp.bonus", json!(1)),
                delete("inventory.items.qi_pill"),
            ])
            .await
            .expect("submit");
        assert_eq!(outcome.applied_count, 2);
        let indices: Vec<usize> = outcome.failures.iter().map(|failure| failure.index).collect();
        assert_eq!(indices, [0, 2]);
        let document = controller.document().expect("document");
        assert_eq!(document["attributes"]["current_hp"], json!(70));
        assert_eq!(document["inventory"]["items"], json!({}));
    }

    #[tokio::test]
    async fn shard_accessor_reads_in_memory_state() {
        let controller = seeded("s1").await;
        assert_eq!(
            controller.shard(ShardKey::MemoryShortTerm),
            Some(json!(["arrived at the sect gate"]))
        );
        assert_eq!(controller.shard(ShardKey::Extras), Some(json!({})));
    }

    #[tokio::test]
    async fn read_stored_shard_does_not_load() {
        let controller = seeded("s1").await;
        let realm = controller
            .read_stored_shard("s1", ShardKey::Identity)
            .await
            .expect("read");
        assert_eq!(realm.expect("stored")["name"], json!("Lin Feng"));
        assert_eq!(
            controller
                .read_stored_shard("nobody", ShardKey::Identity)
                .await
                .expect("read"),
            None
        );
    }

    #[tokio::test]
    async fn first_persist_of_fresh_session_is_full() {
        let mut controller = controller();
        controller.load_session("s1").await.expect("load");
        let outcome = controller
            .submit_commands(&[command("set", "position.location", json!("Jade Valley"))])
            .await
            .expect("submit");
        assert!(outcome.persist.full);
        assert_eq!(outcome.persist.written.len(), ShardKey::ALL.len());

        let outcome = controller
            .submit_commands(&[command("set", "position.region", json!("East"))])
            .await
            .expect("submit");
        assert!(!outcome.persist.full);
        assert_eq!(outcome.persist.written, [ShardKey::Position]);
    }

    #[tokio::test]
    async fn start_default_session_skips_storage() {
        let mut controller = seeded("s1").await;
        controller.exit_session().await.expect("exit");
        let document = controller.start_default_session("s1").expect("start").clone();
        assert_eq!(document, default_aggregate());
        assert_eq!(controller.phase(), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn delete_session_removes_keys_and_unloads() {
        let mut controller = seeded("s1").await;
        let report = controller.delete_session().await.expect("delete");
        assert_eq!(report.deleted, ShardKey::ALL.len());
        assert!(controller.store().backend().snapshot().is_empty());
        assert_eq!(controller.phase(), SessionPhase::Unloaded);
        assert!(controller.document().is_none());
    }

    #[tokio::test]
    async fn peek_session_reads_partial_state_without_writing() {
        let controller = controller();
        let mut partial = ShardMap::new();
        partial.insert(ShardKey::Realm, json!({"name": "Foundation", "level": 1}));
        controller.store().save_many("s1", &partial).await;

        let document = controller.peek_session("s1").await.expect("peek");

        assert_eq!(document["realm"]["name"], json!("Foundation"));
        assert_eq!(document["attributes"], ShardKey::Attributes.default_value());
        assert_eq!(controller.store().backend().snapshot().len(), 1);
        assert_eq!(controller.phase(), SessionPhase::Unloaded);
    }

    #[tokio::test]
    async fn peek_session_leaves_legacy_key_unmigrated() {
        let controller = controller();
        let legacy_key = controller.store().legacy_key("s1");
        let legacy = sample_aggregate();
        controller
            .store()
            .backend()
            .set(&legacy_key, &legacy)
            .await
            .expect("seed legacy");

        let document = controller.peek_session("s1").await.expect("peek");

        assert_eq!(document, legacy);
        let stored = controller.store().backend().snapshot();
        assert_eq!(stored.keys().collect::<Vec<_>>(), [&legacy_key]);
    }

    #[tokio::test]
    async fn discard_session_unloads_without_flushing() {
        let mut controller = controller();
        let mut partial = ShardMap::new();
        partial.insert(ShardKey::Realm, json!({"name": "Foundation", "level": 1}));
        controller.store().save_many("s1", &partial).await;
        controller.load_session("s1").await.expect("load");
        assert_eq!(controller.pending_shards().len(), ShardKey::ALL.len() - 1);

        controller.discard_session().expect("discard");

        assert_eq!(controller.phase(), SessionPhase::Unloaded);
        assert!(controller.document().is_none());
        assert_eq!(controller.store().backend().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn persist_paths_rejects_malformed_paths() {
        let mut controller = seeded("s1").await;
        let err = controller.persist_paths(&["realm..level"]).await.expect_err("bad path");
        assert!(matches!(err, ControllerError::Path(_)));
        assert_eq!(controller.phase(), SessionPhase::Ready);
    }
}
