/// Error taxonomy for the Agent Runtime, per spec.md §4.4/§7.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("llm provider unavailable after exhausting retries: {0}")]
    LlmUnavailable(String),
    #[error("could not parse a usable response out of the llm's completion: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
