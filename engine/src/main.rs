use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use scenesmith_agents::{AgentWorker, ChatMessage, CompletionClient, CompletionError, CompletionOutcome, FencedCodeBlockParser};
use scenesmith_bus::Bus;
use scenesmith_context::ContextRegistry;
use scenesmith_executor::Executor;
use scenesmith_server::{serve, AppState};
use scenesmith_store::{ArtifactStore, SessionController, SessionFilter};
use scenesmith_types::{CancellationRegistry, Config, Role};
use scenesmith_workflow::WorkflowEngine;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "scenesmith-engine")]
#[command(about = "Multi-agent Blender scene workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server (spec.md §6).
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run a single session to completion from the CLI and print the result.
    Run {
        prompt: String,
        #[arg(long, value_delimiter = ',')]
        roles: Option<Vec<Role>>,
    },
    /// List known sessions from the configured output directory.
    Sessions {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("info").with_target(false).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Arc::new(Config::from_env().context("configuration error")?);

    match cli.command {
        Command::Serve { hostname, port } => {
            let (state, _workers) = build_state(config.clone()).await?;
            let recovered = state.controller.recover(config.stale_session_threshold).await?;
            info!(recovered, "recovered sessions from disk");
            let addr: SocketAddr = format!("{hostname}:{port}").parse().context("invalid hostname or port")?;
            info!(%addr, "starting scenesmith-engine");
            serve(addr, state).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { prompt, roles } => {
            let (state, _workers) = build_state(config.clone()).await?;
            let roles = roles.unwrap_or_else(|| Role::ALL.to_vec());
            let session = state.controller.create_session(prompt.clone(), roles.clone(), config.max_iterations).await?;
            match state.engine.run(session.id, prompt, roles).await {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    Ok(if result.success { ExitCode::SUCCESS } else { ExitCode::from(2) })
                }
                Err(scenesmith_workflow::WorkflowError::Cancelled) => Ok(ExitCode::from(130)),
                Err(err) => {
                    eprintln!("session failed: {err}");
                    Ok(ExitCode::from(2))
                }
            }
        }
        Command::Sessions { status, limit } => {
            let store = Arc::new(ArtifactStore::new(&config.output_dir));
            let controller = Arc::new(SessionController::new(store));
            controller.recover(config.stale_session_threshold).await?;
            let sessions = controller.list(SessionFilter { status, limit, ..Default::default() }).await;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Wires every component the Workflow Engine needs and spawns one
/// `AgentWorker` per role. Returns the spawned worker task handles so `Run`
/// (which exits as soon as its one session finishes) doesn't need them,
/// while `Serve` keeps the process alive regardless.
async fn build_state(config: Arc<Config>) -> anyhow::Result<(AppState, Vec<tokio::task::JoinHandle<()>>)> {
    let store = Arc::new(ArtifactStore::new(config.output_dir.clone()));
    let controller = Arc::new(SessionController::new(store.clone()));
    let context = ContextRegistry::new();
    let executor = Arc::new(Executor::new(config.executor_concurrency));
    let bus = Bus::new(config.inbox_capacity);
    let cancellation = CancellationRegistry::new();
    let engine = Arc::new(WorkflowEngine::new(
        bus.clone(),
        store.clone(),
        controller.clone(),
        context.clone(),
        executor.clone(),
        cancellation.clone(),
        config.clone(),
    ));

    let state = AppState::new(store, controller, context, executor, bus.clone(), cancellation.clone(), config, engine);

    let completion: Arc<dyn CompletionClient> = Arc::new(HttpCompletionClient::from_env()?);
    let parser = Arc::new(FencedCodeBlockParser);
    let mut handles = Vec::with_capacity(Role::ALL.len());
    for role in Role::ALL {
        let worker = AgentWorker::new(role, bus.clone(), completion.clone(), parser.clone(), cancellation.clone());
        state.register_worker_stats(role, worker.stats_handle()).await;
        handles.push(tokio::spawn(async move { worker.run().await }));
    }
    Ok((state, handles))
}

/// The concrete `CompletionClient` the spec leaves as an external
/// collaborator (spec.md §1): an OpenAI-chat-completions-compatible HTTP
/// endpoint, configured the way the teacher's `OpenAICompatibleProvider`
/// reads its base URL, API key, and model from the environment.
struct HttpCompletionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpCompletionClient {
    fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("LLM_API_KEY").ok();
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Ok(Self { client: reqwest::Client::new(), base_url, api_key, model })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str, history: &[ChatMessage]) -> Result<CompletionOutcome, CompletionError> {
        let mut messages = vec![serde_json::json!({ "role": "system", "content": system_prompt })];
        for turn in history {
            messages.push(serde_json::json!({ "role": turn.role, "content": turn.content }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": user_prompt }));

        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(url).json(&serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| CompletionError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(CompletionError::RateLimited);
        }
        let value: serde_json::Value = response.json().await.map_err(|e| CompletionError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            let detail = value["error"]["message"].as_str().unwrap_or("llm request failed").to_string();
            return Err(CompletionError::Unavailable(detail));
        }

        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CompletionError::Unavailable("no completion content in llm response".to_string()))?
            .to_string();
        let usage = value.get("usage").map(|u| scenesmith_agents::CompletionUsage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
        Ok(CompletionOutcome { text, usage })
    }
}
