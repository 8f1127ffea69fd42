//! The HTTP surface spec.md §6 documents as an "optional collaborator
//! interface the core exposes": session submission, status, downloads, and
//! the observability endpoints SPEC_FULL adds (stats, config, SSE events).

mod error;
mod http;
mod state;

pub use error::ApiError;
pub use http::{router, serve};
pub use state::AppState;
