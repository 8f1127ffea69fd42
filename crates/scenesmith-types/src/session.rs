use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::progress::ProgressEvent;
use crate::role::Role;

/// Lifecycle status of a workflow session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    RateLimiting,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed { .. } | SessionStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::RateLimiting => "rate_limiting",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed { .. } => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

/// Terminal outcome payload, attached once a session finishes (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub success: bool,
    pub output_path: Option<String>,
    pub iterations: u32,
    pub render_time_s: f64,
    pub error: Option<String>,
}

/// Persisted record for one scene-generation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub prompt: String,
    pub roles: Vec<Role>,
    pub status: SessionStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub current_stage: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub output_dir: String,
    #[serde(default)]
    pub progress: Vec<ProgressEvent>,
    #[serde(default)]
    pub result: Option<SessionResult>,
    #[serde(default)]
    pub recovered_from_disk: bool,
}

impl Session {
    pub fn new(prompt: impl Into<String>, roles: Vec<Role>, output_dir: impl Into<String>, max_iterations: u32) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            roles,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            current_stage: None,
            iteration: 0,
            max_iterations,
            output_dir: output_dir.into(),
            progress: Vec::new(),
            result: None,
            recovered_from_disk: false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        if status.is_terminal() {
            self.completed_at = Some(chrono::Utc::now());
        }
        self.status = status;
        self.touch();
    }

    pub fn push_progress(&mut self, event: ProgressEvent) {
        self.current_stage = Some(event.stage.clone());
        self.progress.push(event);
        self.touch();
    }

    /// A session is stale if it is non-terminal and hasn't been touched
    /// within `threshold`; used by the recovery pass and the background
    /// reaper to distinguish a crashed session from one still in flight.
    pub fn is_stale(&self, threshold: chrono::Duration, now: chrono::DateTime<chrono::Utc>) -> bool {
        !self.status.is_terminal() && now - self.updated_at > threshold
    }
}
