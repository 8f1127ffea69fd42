use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One cancellation token per session, shared by the Message Bus, the
/// Executor, and the Agent Runtime so a single `cancel` call propagates to
/// every suspension point a session's stage dispatch might be blocked on
/// (spec.md §5).
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token_for(&self, session_id: Uuid) -> CancellationToken {
        let mut tokens = self.tokens.lock().expect("cancellation registry poisoned");
        tokens.entry(session_id).or_insert_with(CancellationToken::new).clone()
    }

    /// Idempotent: cancelling twice, or a session with no registered token,
    /// both succeed with no error (spec.md §5).
    pub fn cancel(&self, session_id: Uuid) {
        if let Some(token) = self.tokens.lock().expect("cancellation registry poisoned").get(&session_id) {
            token.cancel();
        }
    }

    pub fn is_cancelled(&self, session_id: Uuid) -> bool {
        self.tokens
            .lock()
            .expect("cancellation registry poisoned")
            .get(&session_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    pub fn remove(&self, session_id: Uuid) {
        self.tokens.lock().expect("cancellation registry poisoned").remove(&session_id);
    }
}
