use std::sync::Arc;
use std::time::Duration;

use scenesmith_bus::Bus;
use scenesmith_types::{CancellationRegistry, Message, MessagePayload, Priority, Role, WorkerStats};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::completion::{ChatMessage, CompletionClient, CompletionError};
use crate::error::AgentError;
use crate::parser::ResponseParser;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BACKOFF_FACTOR: u32 = 2;

/// One agent worker: pulls `StageRequest`s for a single role off the bus,
/// drives the completion client with rate-limit backoff, parses the result,
/// and publishes a `StageResponse` (spec.md §4.4).
///
/// A role's worker pool is just N of these sharing the same `Bus`, `role`,
/// and `stats` handle; the bus's inbox already load-balances across
/// whichever worker calls `pop` first.
pub struct AgentWorker {
    role: Role,
    bus: Bus,
    completion: Arc<dyn CompletionClient>,
    parser: Arc<dyn ResponseParser>,
    cancellation: CancellationRegistry,
    stats: Arc<Mutex<WorkerStats>>,
}

impl AgentWorker {
    pub fn new(
        role: Role,
        bus: Bus,
        completion: Arc<dyn CompletionClient>,
        parser: Arc<dyn ResponseParser>,
        cancellation: CancellationRegistry,
    ) -> Self {
        Self {
            role,
            bus,
            completion,
            parser,
            cancellation,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats_handle(&self) -> Arc<Mutex<WorkerStats>> {
        self.stats.clone()
    }

    /// Runs until the process shuts down. Intended to be spawned as its own
    /// task, one per pool member.
    pub async fn run(&self) {
        let inbox = self.bus.inbox_for(self.role).await;
        loop {
            let msg = inbox.pop().await;
            match &msg.payload {
                MessagePayload::StageRequest { .. } => self.handle_stage_request(msg).await,
                MessagePayload::Cancel { session_id } => {
                    info!(role = %self.role, %session_id, "cancel notice observed by idle worker, nothing in flight");
                }
                other => {
                    warn!(role = %self.role, payload = ?other, "agent worker received a message kind it does not handle");
                }
            }
        }
    }

    async fn handle_stage_request(&self, request: Message) {
        let MessagePayload::StageRequest { session_id, iteration, prompt, context_snapshot } = &request.payload else {
            unreachable!("guarded by caller match");
        };
        let session_id = *session_id;
        let iteration = *iteration;

        let token = self.cancellation.token_for(session_id);
        if token.is_cancelled() {
            info!(role = %self.role, %session_id, "stage request abandoned, session already cancelled");
            return;
        }

        let started = std::time::Instant::now();
        let system_prompt = format!(
            "You are the {} stage of a multi-agent Blender scene generation pipeline.",
            self.role
        );
        let user_prompt = format!("{prompt}\n\ncontext:\n{context_snapshot}");
        let history: Vec<ChatMessage> = Vec::new();

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(role = %self.role, %session_id, "stage request cancelled mid-flight, suppressing response");
                return;
            }
            outcome = self.drive_completion(&system_prompt, &user_prompt, &history, session_id, iteration, &token) => outcome,
        };

        if token.is_cancelled() {
            info!(role = %self.role, %session_id, "stage request cancelled before its response could be published");
            return;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let (script, notes, hints) = match outcome {
            Ok(parsed) => {
                self.stats.lock().await.record(true, duration_ms);
                (parsed.script, parsed.notes, parsed.hints)
            }
            Err(err) => {
                self.stats.lock().await.record(false, duration_ms);
                (None, format!("{} stage failed: {err}", self.role), serde_json::json!({}))
            }
        };

        let reply = request.reply_to(
            self.role,
            MessagePayload::StageResponse { session_id, script, notes, hints },
        );
        self.bus.respond(request.id, reply).await;
    }

    /// Drives the completion client to a parsed result, retrying on
    /// `RateLimited` with exponential backoff (spec.md §4.4: initial 2s,
    /// factor 2, max 60s, up to 5 attempts), notifying the bus's progress
    /// channel between attempts so the Workflow Engine can surface a
    /// `rate_limiting` status for this session.
    async fn drive_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        history: &[ChatMessage],
        session_id: uuid::Uuid,
        iteration: u32,
        token: &tokio_util::sync::CancellationToken,
    ) -> Result<crate::parser::ParsedResponse, AgentError> {
        let mut delay = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.completion.complete(system_prompt, user_prompt, history).await {
                Ok(outcome) => return self.parser.parse(self.role, &outcome.text),
                Err(CompletionError::RateLimited) if attempt < MAX_ATTEMPTS => {
                    warn!(role = %self.role, %session_id, attempt, "llm rate-limited, backing off");
                    self.bus.notify_progress(
                        session_id,
                        format!("rate_limiting: attempt {attempt} of {MAX_ATTEMPTS}, iteration {iteration}"),
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(AgentError::LlmUnavailable("cancelled during rate-limit backoff".into())),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = std::cmp::min(delay * BACKOFF_FACTOR, MAX_BACKOFF);
                }
                Err(CompletionError::RateLimited) => {
                    return Err(AgentError::LlmUnavailable("rate-limited on every retry attempt".into()));
                }
                Err(CompletionError::Unavailable(reason)) => {
                    return Err(AgentError::LlmUnavailable(reason));
                }
            }
        }
        unreachable!("loop always returns by its final iteration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionOutcome, CompletionUsage};
    use crate::parser::FencedCodeBlockParser;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    struct FlakyOnceClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompletionClient for FlakyOnceClient {
        async fn complete(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _history: &[ChatMessage],
        ) -> Result<CompletionOutcome, CompletionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(CompletionError::RateLimited)
            } else {
                Ok(CompletionOutcome {
                    text: "```python\nimport bpy\n```".into(),
                    usage: Some(CompletionUsage { prompt_tokens: 10, completion_tokens: 5 }),
                })
            }
        }
    }

    struct AlwaysUnavailableClient;

    #[async_trait]
    impl CompletionClient for AlwaysUnavailableClient {
        async fn complete(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _history: &[ChatMessage],
        ) -> Result<CompletionOutcome, CompletionError> {
            Err(CompletionError::Unavailable("connection refused".into()))
        }
    }

    fn worker(completion: Arc<dyn CompletionClient>) -> AgentWorker {
        AgentWorker::new(
            Role::Builder,
            Bus::new(8),
            completion,
            Arc::new(FencedCodeBlockParser),
            CancellationRegistry::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn a_rate_limit_then_success_recovers_within_one_backoff_step() {
        let w = worker(Arc::new(FlakyOnceClient { calls: AtomicU32::new(0) }));
        let token = w.cancellation.token_for(uuid::Uuid::nil());
        let result = tokio::time::timeout(
            StdDuration::from_secs(600),
            w.drive_completion("sys", "user", &[], uuid::Uuid::nil(), 1, &token),
        )
        .await
        .unwrap();
        assert!(result.unwrap().script.unwrap().contains("import bpy"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_retries_surfaces_llm_unavailable() {
        let w = worker(Arc::new(AlwaysUnavailableClient));
        let token = w.cancellation.token_for(uuid::Uuid::nil());
        let err = w.drive_completion("sys", "user", &[], uuid::Uuid::nil(), 1, &token).await.unwrap_err();
        assert!(matches!(err, AgentError::LlmUnavailable(_)));
    }

    #[tokio::test]
    async fn full_stage_request_round_trip_publishes_a_stage_response() {
        let bus = Bus::new(8);
        let w = AgentWorker::new(
            Role::Builder,
            bus.clone(),
            Arc::new(FlakyOnceClient { calls: AtomicU32::new(1) }),
            Arc::new(FencedCodeBlockParser),
            CancellationRegistry::new(),
        );
        let worker_bus = bus.clone();
        let session_id = uuid::Uuid::new_v4();
        let worker_task = tokio::spawn(async move {
            let inbox = worker_bus.inbox_for(Role::Builder).await;
            let received = inbox.pop().await;
            w.handle_stage_request(received).await;
        });

        let response = bus
            .request(
                Role::Validator,
                Role::Builder,
                Priority::Normal,
                MessagePayload::StageRequest {
                    session_id,
                    iteration: 1,
                    prompt: "build a cube".into(),
                    context_snapshot: serde_json::json!({}),
                },
                StdDuration::from_secs(2),
            )
            .await
            .unwrap();

        worker_task.await.unwrap();
        match response.payload {
            MessagePayload::StageResponse { script, .. } => {
                assert!(script.unwrap().contains("import bpy"));
            }
            other => panic!("expected StageResponse, got {other:?}"),
        }
    }
}
