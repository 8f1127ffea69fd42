use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One turn of prior conversation, passed to `Completion` so an agent can
/// ground a retry or a refinement pass in what it said before.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub text: String,
    pub usage: Option<CompletionUsage>,
}

/// Error taxonomy for the external LLM capability (spec.md §6). Rate-limit
/// is distinguished so the Agent Runtime's backoff loop can react to it
/// specifically; every other failure is a terminal `Unavailable`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("llm provider is rate-limiting requests")]
    RateLimited,
    #[error("llm provider unavailable: {0}")]
    Unavailable(String),
}

/// The single capability this crate consumes from an external LLM
/// provider. The core never speaks a provider's wire protocol directly;
/// this trait is the seam (spec.md §1's "Out of scope: the LLM provider
/// client").
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<CompletionOutcome, CompletionError>;
}
