mod assembly;
mod dag;
mod engine;
mod error;

pub use assembly::{assemble_combined_script, bootstrap_header};
pub use dag::producing_stage_groups;
pub use engine::WorkflowEngine;
pub use error::{Result, WorkflowError};
