use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::context::SharedContext;

/// Owns one `SharedContext` per active session. Iteration within a session
/// preserves the same context (spec.md §4.6's "preserves Shared Context,
/// accumulating hints across iterations"); the context is dropped only when
/// the session terminates.
#[derive(Clone, Default)]
pub struct ContextRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, Arc<SharedContext>>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, session_id: Uuid) -> Arc<SharedContext> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id)
            .or_insert_with(|| Arc::new(SharedContext::new()))
            .clone()
    }

    /// Clears the session's scratchpad. Per spec.md §3: "Cleared when the
    /// session terminates."
    pub async fn clear(&self, session_id: Uuid) {
        self.sessions.lock().await.remove(&session_id);
    }
}
