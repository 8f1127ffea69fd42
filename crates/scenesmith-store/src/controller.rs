use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scenesmith_types::{ProgressEvent, Role, Session, SessionResult, SessionStatus};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::Result;
use crate::recovery::recover_session;
use crate::store::ArtifactStore;

/// Optional filters for `SessionController::list`, generalizing spec.md
/// §4.7's `List(filter)` contract (SPEC_FULL §4, modeled on the teacher's
/// `ListSessionsQuery`).
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Creates sessions, records every state transition to disk, and recovers
/// the in-memory index from disk at startup (spec.md §4.7). All mutation
/// goes through `ArtifactStore::atomic_write_state`, which holds the
/// per-session lock for the duration of the write, so transitions for one
/// session are totally ordered even under concurrent callers.
pub struct SessionController {
    store: Arc<ArtifactStore>,
    sessions: RwLock<HashMap<Uuid, Session>>,
    events: broadcast::Sender<ProgressEvent>,
}

impl SessionController {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Broadcast stream of status transitions and progress reports across
    /// every session, consumed by the server's `/events` SSE endpoint.
    /// Informational only: a missed event never desyncs a client, since
    /// `status()`/`list()` remain the source of truth.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn publish(&self, id: Uuid, stage: &str, role: Option<Role>, message: impl Into<String>) {
        let _ = self.events.send(ProgressEvent::new(id, stage, role, message));
    }

    /// Scans the store root and rebuilds the in-memory index per the
    /// recovery rule in spec.md §4.1, returning how many sessions were
    /// recovered.
    pub async fn recover(&self, staleness: Duration) -> Result<usize> {
        let ids = self.store.list_sessions().await?;
        let mut sessions = self.sessions.write().await;
        let mut count = 0;
        for id in ids {
            if let Some(session) = recover_session(&self.store, id, staleness).await {
                sessions.insert(id, session);
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn create_session(&self, prompt: impl Into<String>, roles: Vec<Role>, max_iterations: u32) -> Result<Session> {
        let prompt = prompt.into();
        let mut session = Session::new(prompt, roles, "", max_iterations);
        let dir = self.store.open_session(session.id).await?;
        session.output_dir = dir.to_string_lossy().to_string();
        self.store.atomic_write_state(&session).await?;
        self.sessions.write().await.insert(session.id, session.clone());
        Ok(session)
    }

    pub async fn mark_running(&self, id: Uuid) -> Result<()> {
        self.mutate(id, |s| s.set_status(SessionStatus::Running)).await?;
        self.publish(id, "status", None, "session running");
        Ok(())
    }

    pub async fn mark_rate_limiting(&self, id: Uuid) -> Result<()> {
        self.mutate(id, |s| s.set_status(SessionStatus::RateLimiting)).await?;
        self.publish(id, "status", None, "rate limited, backing off");
        Ok(())
    }

    pub async fn mark_completed(&self, id: Uuid, result: SessionResult) -> Result<()> {
        self.mutate(id, |s| {
            s.result = Some(result);
            s.set_status(SessionStatus::Completed);
        })
        .await?;
        self.publish(id, "status", None, "session completed");
        Ok(())
    }

    pub async fn mark_failed(&self, id: Uuid, reason: impl Into<String>, result: Option<SessionResult>) -> Result<()> {
        let reason = reason.into();
        self.mutate(id, |s| {
            if result.is_some() {
                s.result = result;
            }
            s.set_status(SessionStatus::Failed { reason: reason.clone() });
        })
        .await?;
        self.publish(id, "status", None, format!("session failed: {reason}"));
        Ok(())
    }

    /// Cancelling an already-terminal session is a no-op (testable property
    /// 7): no status change, no new artifact write.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let already_terminal = {
            let sessions = self.sessions.read().await;
            sessions.get(&id).map(|s| s.status.is_terminal()).unwrap_or(true)
        };
        if already_terminal {
            return Ok(());
        }
        self.mutate(id, |s| s.set_status(SessionStatus::Cancelled)).await?;
        self.publish(id, "status", None, "session cancelled");
        Ok(())
    }

    pub async fn record_progress(&self, id: Uuid, event: ProgressEvent) -> Result<()> {
        self.mutate(id, |s| s.push_progress(event.clone())).await?;
        let _ = self.events.send(event);
        Ok(())
    }

    pub async fn set_iteration(&self, id: Uuid, iteration: u32) -> Result<()> {
        self.mutate(id, |s| s.iteration = iteration).await
    }

    async fn mutate(&self, id: Uuid, f: impl FnOnce(&mut Session)) -> Result<()> {
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(&id) else {
                return Ok(());
            };
            f(session);
            session.clone()
        };
        self.store.atomic_write_state(&snapshot).await
    }

    pub async fn status(&self, id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn list(&self, filter: SessionFilter) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut matched: Vec<Session> = sessions
            .values()
            .filter(|s| filter.status.as_deref().map(|st| s.status.label() == st).unwrap_or(true))
            .filter(|s| filter.since.map(|since| s.created_at >= since).unwrap_or(true))
            .filter(|s| filter.until.map(|until| s.created_at <= until).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let matched = matched.into_iter().skip(filter.offset);
        match filter.limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let ctrl = SessionController::new(store);
        let session = ctrl.create_session("a red cube", vec![Role::Concept], 3).await.unwrap();
        let status = ctrl.status(session.id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn cancelling_a_completed_session_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let ctrl = SessionController::new(store);
        let session = ctrl.create_session("x", vec![], 1).await.unwrap();
        ctrl.mark_completed(
            session.id,
            SessionResult {
                success: true,
                output_path: None,
                iterations: 1,
                render_time_s: 1.0,
                error: None,
            },
        )
        .await
        .unwrap();
        ctrl.cancel(session.id).await.unwrap();
        let status = ctrl.status(session.id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn list_sorts_newest_first_and_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let ctrl = SessionController::new(store);
        let mut ids = Vec::new();
        for i in 0..3 {
            let s = ctrl.create_session(format!("prompt {i}"), vec![], 1).await.unwrap();
            ids.push(s.id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let listed = ctrl.list(SessionFilter { limit: Some(2), ..Default::default() }).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[1].id, ids[1]);
    }

    #[tokio::test]
    async fn subscribers_observe_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let ctrl = SessionController::new(store);
        let session = ctrl.create_session("x", vec![], 1).await.unwrap();
        let mut rx = ctrl.subscribe();
        ctrl.mark_running(session.id).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, session.id);
        assert_eq!(event.stage, "status");
    }

    #[tokio::test]
    async fn recover_rebuilds_index_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let id = {
            let ctrl = SessionController::new(store.clone());
            let s = ctrl.create_session("x", vec![], 1).await.unwrap();
            ctrl.mark_running(s.id).await.unwrap();
            s.id
        };
        let ctrl2 = SessionController::new(store);
        let recovered = ctrl2.recover(Duration::from_secs(1800)).await.unwrap();
        assert_eq!(recovered, 1);
        let status = ctrl2.status(id).await.unwrap();
        assert!(status.recovered_from_disk);
        assert_eq!(status.status, SessionStatus::Running);
    }
}
