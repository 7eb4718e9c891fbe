//! Test-only backends and fixtures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::shards::default_aggregate;
use crate::io::backend::{BackendError, KvBackend, MemoryBackend};

/// Memory backend that counts writes per key and can be told to fail or stall.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    inner: MemoryBackend,
    writes: Mutex<BTreeMap<String, usize>>,
    failing_reads: Mutex<BTreeSet<String>>,
    failing_writes: Mutex<BTreeSet<String>>,
    write_delay: Mutex<Option<Duration>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful or attempted `set` calls for `key`.
    pub fn write_count(&self, key: &str) -> usize {
        self.writes
            .lock()
            .expect("writes lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Keys written at least once since the last reset, in order.
    pub fn written_keys(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").keys().cloned().collect()
    }

    pub fn reset_counts(&self) {
        self.writes.lock().expect("writes lock").clear();
    }

    pub fn fail_reads_for(&self, key: &str) {
        self.failing_reads
            .lock()
            .expect("reads lock")
            .insert(key.to_string());
    }

    pub fn fail_writes_for(&self, key: &str) {
        self.failing_writes
            .lock()
            .expect("writes lock")
            .insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_reads.lock().expect("reads lock").clear();
        self.failing_writes.lock().expect("writes lock").clear();
    }

    /// Make every `set` sleep first; `None` removes the delay.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock().expect("delay lock") = delay;
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner.snapshot()
    }

    fn read_fails(&self, key: &str) -> bool {
        self.failing_reads.lock().expect("reads lock").contains(key)
    }

    fn write_fails(&self, key: &str) -> bool {
        self.failing_writes.lock().expect("writes lock").contains(key)
    }
}

#[async_trait]
impl KvBackend for RecordingBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        if self.read_fails(key) {
            return Err(BackendError::Unavailable(format!("injected read failure on {key}")));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), BackendError> {
        let delay = *self.write_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self
            .writes
            .lock()
            .expect("writes lock")
            .entry(key.to_string())
            .or_default() += 1;
        if self.write_fails(key) {
            return Err(BackendError::Unavailable(format!("injected write failure on {key}")));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.inner.delete(key).await
    }
}

/// Default aggregate with a recognizable character filled in.
pub fn sample_aggregate() -> Value {
    let mut aggregate = default_aggregate();
    aggregate["identity"]["name"] = json!("Lin Feng");
    aggregate["attributes"]["current_hp"] = json!(100);
    aggregate["inventory"]["items"]["qi_pill"] = json!({"name": "Qi Pill", "quantity": 10});
    aggregate["relationships"]["elder_mo"] = json!({"name": "Elder Mo", "affinity": 5});
    aggregate["memory"]["short_term"] = json!(["arrived at the sect gate"]);
    aggregate
}

/// Raw command JSON as a producer would send it.
pub fn command(action: &str, path: &str, value: Value) -> Value {
    json!({"action": action, "path": path, "value": value})
}

/// Raw `delete` command JSON.
pub fn delete(path: &str) -> Value {
    json!({"action": "delete", "path": path})
}
