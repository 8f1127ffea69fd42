use std::collections::HashMap;
use std::sync::Arc;

use scenesmith_bus::Bus;
use scenesmith_context::ContextRegistry;
use scenesmith_executor::Executor;
use scenesmith_store::{ArtifactStore, SessionController};
use scenesmith_types::{CancellationRegistry, Config, Role, WorkerStats};
use scenesmith_workflow::WorkflowEngine;
use tokio::sync::{Mutex, RwLock};

/// Everything an HTTP handler needs, cloned cheaply per request (every field
/// is an `Arc` or a type that is itself a cheap handle).
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ArtifactStore>,
    pub controller: Arc<SessionController>,
    pub context: ContextRegistry,
    pub executor: Arc<Executor>,
    pub bus: Bus,
    pub cancellation: CancellationRegistry,
    pub config: Arc<Config>,
    pub engine: Arc<WorkflowEngine>,
    worker_stats: Arc<RwLock<HashMap<Role, Arc<Mutex<WorkerStats>>>>>,
}

impl AppState {
    pub fn new(
        store: Arc<ArtifactStore>,
        controller: Arc<SessionController>,
        context: ContextRegistry,
        executor: Arc<Executor>,
        bus: Bus,
        cancellation: CancellationRegistry,
        config: Arc<Config>,
        engine: Arc<WorkflowEngine>,
    ) -> Self {
        Self {
            store,
            controller,
            context,
            executor,
            bus,
            cancellation,
            config,
            engine,
            worker_stats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Called once per spawned `AgentWorker` at startup so `GET /stats` has
    /// something to report.
    pub async fn register_worker_stats(&self, role: Role, handle: Arc<Mutex<WorkerStats>>) {
        self.worker_stats.write().await.insert(role, handle);
    }

    pub async fn stats_snapshot(&self) -> HashMap<Role, WorkerStats> {
        let mut snapshot = HashMap::new();
        for (role, handle) in self.worker_stats.read().await.iter() {
            snapshot.insert(*role, handle.lock().await.clone());
        }
        snapshot
    }
}
