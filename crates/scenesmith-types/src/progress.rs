use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::role::Role;

/// A broadcast-only progress notification. Consumers that miss one lose
/// nothing essential: the Session Controller's persisted state is always
/// the source of truth, this is purely informational (per the spec's
/// Subscribe contract, which is explicitly not required for correctness).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: Uuid,
    pub stage: String,
    pub role: Option<Role>,
    pub message: String,
    pub ts: chrono::DateTime<chrono::Utc>,
}

impl ProgressEvent {
    pub fn new(session_id: Uuid, stage: impl Into<String>, role: Option<Role>, message: impl Into<String>) -> Self {
        Self {
            session_id,
            stage: stage.into(),
            role,
            message: message.into(),
            ts: chrono::Utc::now(),
        }
    }
}
