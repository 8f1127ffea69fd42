use scenesmith_types::Role;

/// Error taxonomy for the Workflow Engine, per spec.md §4.6/§7. Only config
/// and unrecoverable storage errors are meant to terminate the process; the
/// rest are carried in a session's terminal `result.error`.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{role} stage failed: {error}")]
    AgentFailure { role: Role, error: String },
    #[error("every sibling in a parallel stage failed: {0:?}")]
    AllSiblingsFailed(Vec<Role>),
    #[error("blender execution failed: {0}")]
    ExecutorFailed(String),
    #[error("session cancelled")]
    Cancelled,
    #[error("storage error: {0}")]
    Storage(#[from] scenesmith_store::StorageError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
