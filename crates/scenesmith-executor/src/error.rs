/// Error taxonomy for a single Blender subprocess invocation, per spec.md §4.2/§7.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to spawn blender at {path}: {source}")]
    SpawnFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blender execution timed out after {timeout_s}s")]
    Timeout {
        timeout_s: u64,
        captured_stderr: String,
    },
    #[error("blender exited with status {code:?}")]
    NonZeroExit {
        code: Option<i32>,
        captured_stderr: String,
    },
    #[error("executor cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn captured_stderr(&self) -> Option<&str> {
        match self {
            ExecutorError::Timeout { captured_stderr, .. } => Some(captured_stderr),
            ExecutorError::NonZeroExit { captured_stderr, .. } => Some(captured_stderr),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
