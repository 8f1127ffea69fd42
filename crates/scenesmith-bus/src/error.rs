use uuid::Uuid;

/// Error taxonomy for the Message Bus, per spec.md §4.3/§7.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("inbox full, backpressure wait exceeded its deadline")]
    BackpressureTimeout,
    #[error("message has no recipient role")]
    NoRecipient,
    #[error("no worker registered for role")]
    NoSuchRole,
    #[error("request {0} timed out waiting for a response")]
    ResponseTimeout(Uuid),
    #[error("the worker handling request {0} failed before responding")]
    WorkerFailed(Uuid),
    #[error("request {0} was cancelled")]
    Cancelled(Uuid),
}

pub type Result<T> = std::result::Result<T, BusError>;
