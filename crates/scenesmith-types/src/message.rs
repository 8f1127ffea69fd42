use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::role::Role;

/// Delivery priority. Higher variants are drained before lower ones; within
/// a priority, delivery is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Tagged sum of the message kinds the bus transports between the Workflow
/// Engine, Agent Runtime workers, and the Executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Dispatch a stage to an agent worker.
    StageRequest {
        session_id: Uuid,
        iteration: u32,
        prompt: String,
        context_snapshot: serde_json::Value,
    },
    /// An agent worker's reply to a `StageRequest`.
    StageResponse {
        session_id: Uuid,
        script: Option<String>,
        notes: String,
        /// Free-form key-value hints merged into Shared Context (spec.md
        /// §3's AgentResult.hints), e.g. a Reviewer's `rating`/`should_refine`.
        hints: serde_json::Value,
    },
    /// Request the Executor run a generated script.
    ExecuteRequest {
        session_id: Uuid,
        script_path: String,
    },
    /// The Executor's reply to an `ExecuteRequest`.
    ExecuteResponse {
        session_id: Uuid,
        exit_code: Option<i32>,
        timed_out: bool,
        stdout_tail: String,
        stderr_tail: String,
    },
    /// Fire-and-forget progress notification, not part of a request/response pair.
    Progress {
        session_id: Uuid,
        text: String,
    },
    /// Cooperative cancellation notice for a session.
    Cancel { session_id: Uuid },
}

/// An envelope carried by the Message Bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: Role,
    pub to: Option<Role>,
    pub priority: Priority,
    /// Set on requests so the response can be correlated back by the sender;
    /// echoed unchanged on the corresponding response.
    pub correlation_id: Option<Uuid>,
    pub payload: MessagePayload,
    pub created_at_ms: i64,
    /// Caller-supplied deadline (spec.md §3's Message.timeout). Governs both
    /// how long `Send` backpressure-waits for inbox room and, for a
    /// `Request`, how long the caller waits for a correlated response.
    pub timeout_ms: Option<u64>,
}

impl MessagePayload {
    /// Every variant carries the session it belongs to; used by the bus to
    /// correlate pending requests with a session's cancellation token
    /// without widening the `request` signature.
    pub fn session_id(&self) -> Uuid {
        match self {
            MessagePayload::StageRequest { session_id, .. }
            | MessagePayload::StageResponse { session_id, .. }
            | MessagePayload::ExecuteRequest { session_id, .. }
            | MessagePayload::ExecuteResponse { session_id, .. }
            | MessagePayload::Progress { session_id, .. }
            | MessagePayload::Cancel { session_id } => *session_id,
        }
    }
}

impl Message {
    pub fn new(from: Role, to: Option<Role>, priority: Priority, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            priority,
            correlation_id: None,
            payload,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }

    pub fn reply_to(&self, from: Role, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to: Some(self.from),
            priority: self.priority,
            correlation_id: Some(self.correlation_id.unwrap_or(self.id)),
            payload,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            timeout_ms: None,
        }
    }
}

/// What an agent worker reports back to the Workflow Engine after processing
/// a stage, independent of the message-bus envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub role: Role,
    pub session_id: Uuid,
    pub iteration: u32,
    pub succeeded: bool,
    pub script: Option<String>,
    pub notes: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}
