use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::trace;

/// One key's write, broadcast to subscribers of a matching prefix.
#[derive(Debug, Clone)]
pub struct ContextChange {
    pub key: String,
    pub revision: u64,
    pub value: Value,
}

struct ContextState {
    revision: u64,
    values: HashMap<String, (u64, Value)>,
}

/// Per-session structured scratchpad through which agents publish hints
/// consumed by downstream agents (spec.md §4.5). Keys are role-qualified
/// (e.g. `concept.mood`); values are opaque JSON. Protected by a single
/// mutex per session: writes are short metadata, never large artifact
/// blobs, so contention is not a concern.
pub struct SharedContext {
    state: Mutex<ContextState>,
    changes: broadcast::Sender<ContextChange>,
}

impl SharedContext {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(ContextState {
                revision: 0,
                values: HashMap::new(),
            }),
            changes,
        }
    }

    /// Appends a new revision for `key`. Returns the context's new global
    /// revision counter (monotonically increasing across all keys, per
    /// spec.md §3's "monotonically-increasing revision counter").
    pub async fn put(&self, key: impl Into<String>, value: Value) -> u64 {
        let key = key.into();
        let mut state = self.state.lock().await;
        state.revision += 1;
        let revision = state.revision;
        state.values.insert(key.clone(), (revision, value.clone()));
        drop(state);
        trace!(key, revision, "shared context write");
        let _ = self.changes.send(ContextChange { key, revision, value });
        revision
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().await.values.get(key).map(|(_, v)| v.clone())
    }

    /// A consistent copy of every key's latest value, taken under the lock
    /// so a downstream stage never observes a torn write.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.state
            .lock()
            .await
            .values
            .iter()
            .map(|(k, (_, v))| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn revision(&self) -> u64 {
        self.state.lock().await.revision
    }

    /// Broadcast stream of writes; informational only (progress reporting),
    /// not required for correctness per spec.md §4.5.
    pub fn subscribe(&self) -> broadcast::Receiver<ContextChange> {
        self.changes.subscribe()
    }
}

impl Default for SharedContext {
    fn default() -> Self {
        Self::new()
    }
}
