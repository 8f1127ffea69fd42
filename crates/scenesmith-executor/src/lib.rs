//! The Executor component (spec.md §4.2): runs a Blender binary headless
//! against a generated script, under a wall-clock timeout and a
//! process-count ceiling, and returns a structured result instead of
//! raising — so a reviewer downstream can critique a failing run.

mod error;
mod process;

pub use error::{ExecutorError, Result};
pub use process::{ExecutionOutcome, Executor};
