use std::sync::Arc;

use scenesmith_bus::{Bus, BusError};
use scenesmith_context::{ContextRegistry, SharedContext};
use scenesmith_executor::{Executor, ExecutorError};
use scenesmith_store::{ArtifactStore, SessionController};
use scenesmith_types::{
    stage_script_filename, CancellationRegistry, Config, Message, MessagePayload, Priority, ProgressEvent, Role,
    SessionResult,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::assembly::{assemble_combined_script, bootstrap_header};
use crate::dag::{producing_stage_groups, refinement_stage_groups};
use crate::error::{Result, WorkflowError};

/// Drives one session's stage DAG to completion, per spec.md §4.6. One
/// engine instance is shared across every concurrently-running session; all
/// per-session state lives in the `ContextRegistry` and `SessionController`,
/// not here.
pub struct WorkflowEngine {
    bus: Bus,
    store: Arc<ArtifactStore>,
    controller: Arc<SessionController>,
    context: ContextRegistry,
    executor: Arc<Executor>,
    cancellation: CancellationRegistry,
    config: Arc<Config>,
}

enum StageRunOutcome {
    Fragments(Vec<(Role, String)>),
    Failed { role: Role, error: String },
    AllSiblingsFailed { roles: Vec<Role> },
    Cancelled,
}

impl WorkflowEngine {
    pub fn new(
        bus: Bus,
        store: Arc<ArtifactStore>,
        controller: Arc<SessionController>,
        context: ContextRegistry,
        executor: Arc<Executor>,
        cancellation: CancellationRegistry,
        config: Arc<Config>,
    ) -> Self {
        Self { bus, store, controller, context, executor, cancellation, config }
    }

    /// Runs a session from `pending` to a terminal state. The returned
    /// `Err` mirrors the session's persisted `result.error`; callers that
    /// only care about the session record can discard it.
    pub async fn run(&self, session_id: Uuid, prompt: String, roles: Vec<Role>) -> Result<SessionResult> {
        let token = self.cancellation.token_for(session_id);
        let ctx = self.context.get_or_create(session_id).await;

        let watch_bus = self.bus.clone();
        let watch_token = token.clone();
        let watcher = tokio::spawn(async move {
            watch_token.cancelled().await;
            watch_bus.cancel_session(session_id).await;
        });

        // Rate-limit backoff happens inside the Agent Runtime, several
        // layers below anything this engine awaits directly, so it
        // surfaces here as an out-of-band bus notice rather than a stage
        // response (spec.md §4.4 item 4, §4.1's status invariant).
        let mut progress_rx = self.bus.subscribe_progress();
        let progress_controller = self.controller.clone();
        let progress_listener = tokio::spawn(async move {
            loop {
                match progress_rx.recv().await {
                    Ok((sid, text)) if sid == session_id && text.starts_with("rate_limiting") => {
                        if let Err(err) = progress_controller.mark_rate_limiting(sid).await {
                            warn!(%sid, %err, "failed to record rate_limiting status");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let outcome = self
            .run_inner(session_id, &prompt, &roles, &ctx, &token)
            .instrument(info_span!("workflow_run", %session_id))
            .await;

        watcher.abort();
        progress_listener.abort();
        self.context.clear(session_id).await;
        self.cancellation.remove(session_id);
        outcome
    }

    async fn run_inner(
        &self,
        session_id: Uuid,
        prompt: &str,
        roles: &[Role],
        ctx: &Arc<SharedContext>,
        token: &CancellationToken,
    ) -> Result<SessionResult> {
        self.controller.mark_running(session_id).await?;
        let groups = producing_stage_groups(roles);
        let refine_groups = refinement_stage_groups(&groups);
        let reviewer_enabled = self.config.reviewer_enabled && roles.contains(&Role::Reviewer);
        let max_iterations = self.config.max_iterations.max(1);

        let mut iteration = 1u32;
        loop {
            if token.is_cancelled() {
                return self.finish_cancelled(session_id).await;
            }
            self.controller.set_iteration(session_id, iteration).await?;
            self.emit_progress(session_id, "iteration", None, format!("starting iteration {iteration}")).await;

            let stage_groups = if iteration == 1 { &groups } else { &refine_groups };
            let outcome = self.run_stages(session_id, iteration, prompt, stage_groups, ctx, token).await?;
            let fragments = match outcome {
                StageRunOutcome::Cancelled => return self.finish_cancelled(session_id).await,
                StageRunOutcome::Failed { role, error } => {
                    return self.finish_failed(session_id, iteration, 0.0, format!("{role} stage failed: {error}")).await;
                }
                StageRunOutcome::AllSiblingsFailed { roles } => {
                    return self
                        .finish_failed(session_id, iteration, 0.0, format!("every sibling in parallel stage failed: {roles:?}"))
                        .await;
                }
                StageRunOutcome::Fragments(fragments) => fragments,
            };
            // A stage may have flipped status to `rate_limiting` while
            // retrying; having produced fragments, the session is back to
            // running regardless.
            self.controller.mark_running(session_id).await?;

            let render_path = self.store.render_path(session_id, iteration);
            let header = bootstrap_header(&self.config, iteration, &render_path.to_string_lossy());
            let combined = assemble_combined_script(&header, &fragments);
            let combined_path = self.store.combined_script_path(session_id, iteration);
            self.store.write_artifact(&combined_path, combined.into_bytes()).await?;

            self.emit_progress(session_id, "executor", None, "running blender").await;
            let exec_result = self
                .executor
                .run(&combined_path, &self.config.blender_path, self.config.executor_timeout, token)
                .await;
            if matches!(exec_result, Err(ExecutorError::Cancelled)) {
                return self.finish_cancelled(session_id).await;
            }
            let (executor_ok, render_time_s, exec_error) = match &exec_result {
                Ok(outcome) => (true, outcome.wall_time.as_secs_f64(), None),
                Err(err) => (false, 0.0, Some(err.to_string())),
            };

            if !executor_ok && !reviewer_enabled {
                return self.finish_failed(session_id, iteration, render_time_s, exec_error.unwrap_or_default()).await;
            }

            let should_refine = if reviewer_enabled {
                // The session stays `running` while the reviewer runs
                // (spec.md §3's closed status set has no intermediate
                // value for this); the reviewer stage is still visible via
                // the progress feed.
                self.emit_progress(session_id, "reviewer", Some(Role::Reviewer), "awaiting review").await;
                self.run_reviewer(session_id, iteration, prompt, ctx).await
            } else {
                false
            };

            if reviewer_enabled && should_refine && iteration < max_iterations {
                iteration += 1;
                continue;
            }

            if executor_ok {
                return self
                    .finish_completed(session_id, iteration, render_time_s, combined_path.to_string_lossy().into_owned())
                    .await;
            }
            return self.finish_failed(session_id, iteration, render_time_s, exec_error.unwrap_or_default()).await;
        }
    }

    /// Dispatches every stage group in order, merging each successful
    /// response's script and hints into the artifact store and shared
    /// context as it completes, and collecting fragments for final assembly.
    async fn run_stages(
        &self,
        session_id: Uuid,
        iteration: u32,
        prompt: &str,
        groups: &[Vec<Role>],
        ctx: &Arc<SharedContext>,
        token: &CancellationToken,
    ) -> Result<StageRunOutcome> {
        let mut fragments = Vec::new();
        for group in groups {
            if token.is_cancelled() {
                return Ok(StageRunOutcome::Cancelled);
            }
            self.emit_progress(
                session_id,
                "stage",
                group.first().copied(),
                format!("dispatching {}", group.iter().map(|r| r.as_str()).collect::<Vec<_>>().join("+")),
            )
            .await;

            let snapshot = ctx.snapshot().await;
            let context_snapshot = serde_json::to_value(&snapshot).unwrap_or(serde_json::json!({}));
            let results = self.dispatch_group(session_id, iteration, prompt, group, context_snapshot).await;

            if token.is_cancelled() {
                return Ok(StageRunOutcome::Cancelled);
            }

            let mut succeeded_any = false;
            let mut last_role = group[0];
            let mut last_error = String::new();
            for (role, outcome) in results {
                match outcome {
                    Ok(response) => {
                        succeeded_any = true;
                        if let Some(script) = self.merge_response(session_id, iteration, role, response, ctx).await? {
                            fragments.push((role, script));
                        }
                    }
                    Err(BusError::Cancelled(_)) => return Ok(StageRunOutcome::Cancelled),
                    Err(err) => {
                        warn!(role = %role, %err, "stage dispatch failed");
                        last_role = role;
                        last_error = err.to_string();
                    }
                }
            }
            if !succeeded_any {
                if group.len() > 1 {
                    return Ok(StageRunOutcome::AllSiblingsFailed { roles: group.clone() });
                }
                return Ok(StageRunOutcome::Failed { role: last_role, error: last_error });
            }
        }
        Ok(StageRunOutcome::Fragments(fragments))
    }

    /// Persists the responding agent's script as an artifact and merges its
    /// notes/hints into the session's shared context. Returns the script, if
    /// any, so the caller can fold it into the combined-script assembly.
    async fn merge_response(
        &self,
        session_id: Uuid,
        iteration: u32,
        role: Role,
        response: Message,
        ctx: &Arc<SharedContext>,
    ) -> Result<Option<String>> {
        let MessagePayload::StageResponse { script, notes, hints, .. } = response.payload else {
            return Ok(None);
        };
        if let Some(script) = &script {
            let filename = stage_script_filename(role, iteration);
            let path = self.store.stage_script_path(session_id, &filename);
            self.store.write_artifact(&path, script.clone().into_bytes()).await?;
        }
        if role == Role::Concept {
            let concept_doc = format!("# Concept\n\n{notes}\n");
            self.store.write_artifact(&self.store.concept_path(session_id), concept_doc.into_bytes()).await?;
        }
        ctx.put(format!("{}.notes", role.as_str()), serde_json::Value::String(notes)).await;
        if let serde_json::Value::Object(map) = hints {
            for (key, value) in map {
                ctx.put(format!("{}.{key}", role.as_str()), value).await;
            }
        }
        Ok(script)
    }

    async fn dispatch_group(
        &self,
        session_id: Uuid,
        iteration: u32,
        prompt: &str,
        group: &[Role],
        context_snapshot: serde_json::Value,
    ) -> Vec<(Role, std::result::Result<Message, BusError>)> {
        let futures = group.iter().map(|&role| {
            let bus = self.bus.clone();
            let snapshot = context_snapshot.clone();
            let prompt = prompt.to_string();
            let timeout = self.config.stage_timeout;
            async move {
                let payload = MessagePayload::StageRequest { session_id, iteration, prompt, context_snapshot: snapshot };
                let result = bus.request(role, role, Priority::Normal, payload, timeout).await;
                (role, result)
            }
        });
        futures::future::join_all(futures).await
    }

    async fn run_reviewer(&self, session_id: Uuid, iteration: u32, prompt: &str, ctx: &Arc<SharedContext>) -> bool {
        let snapshot = ctx.snapshot().await;
        let context_snapshot = serde_json::to_value(&snapshot).unwrap_or(serde_json::json!({}));
        let payload = MessagePayload::StageRequest {
            session_id,
            iteration,
            prompt: prompt.to_string(),
            context_snapshot,
        };
        let response = self
            .bus
            .request(Role::Reviewer, Role::Reviewer, Priority::Normal, payload, self.config.stage_timeout)
            .await;
        match response {
            Ok(msg) => {
                let MessagePayload::StageResponse { notes, hints, .. } = msg.payload else {
                    return false;
                };
                ctx.put("reviewer.notes", serde_json::Value::String(notes)).await;
                let rating = hints.get("rating").and_then(|v| v.as_i64());
                let explicit_refine = hints.get("should_refine").and_then(|v| v.as_bool()).unwrap_or(false);
                explicit_refine || rating.map(|r| r < 7).unwrap_or(false)
            }
            Err(err) => {
                warn!(%err, "reviewer stage failed, treating as no-refine");
                false
            }
        }
    }

    async fn emit_progress(&self, session_id: Uuid, stage: &str, role: Option<Role>, message: impl Into<String>) {
        let event = ProgressEvent::new(session_id, stage, role, message);
        if let Err(err) = self.controller.record_progress(session_id, event).await {
            warn!(%session_id, %err, "failed to persist progress event");
        }
    }

    async fn finish_completed(&self, session_id: Uuid, iteration: u32, render_time_s: f64, output_path: String) -> Result<SessionResult> {
        let result = SessionResult { success: true, output_path: Some(output_path), iterations: iteration, render_time_s, error: None };
        self.controller.mark_completed(session_id, result.clone()).await?;
        info!(%session_id, iterations = iteration, "session completed");
        Ok(result)
    }

    async fn finish_failed(&self, session_id: Uuid, iteration: u32, render_time_s: f64, error: String) -> Result<SessionResult> {
        let result = SessionResult { success: false, output_path: None, iterations: iteration, render_time_s, error: Some(error.clone()) };
        self.controller.mark_failed(session_id, error.clone(), Some(result)).await?;
        Err(WorkflowError::ExecutorFailed(error))
    }

    async fn finish_cancelled(&self, session_id: Uuid) -> Result<SessionResult> {
        self.controller.cancel(session_id).await?;
        Err(WorkflowError::Cancelled)
    }
}
