pub mod artifact;
pub mod cancel;
pub mod config;
pub mod message;
pub mod progress;
pub mod role;
pub mod session;
pub mod stats;

pub use artifact::{stage_script_filename, ArtifactKind, ArtifactMeta};
pub use cancel::CancellationRegistry;
pub use config::{Config, ConfigError};
pub use message::{AgentResult, Message, MessagePayload, Priority};
pub use progress::ProgressEvent;
pub use role::Role;
pub use session::{Session, SessionResult, SessionStatus};
pub use stats::WorkerStats;
