//! The Artifact Store and Session Controller persistence layer (spec.md
//! §4.1/§4.7): per-session directory layout, write-once atomic artifacts,
//! and the durable session index with its disk-recovery rule.

mod controller;
mod error;
mod io;
mod recovery;
mod store;

pub use controller::{SessionController, SessionFilter};
pub use error::{Result, StorageError};
pub use io::{atomic_write, ArtifactIo, FsArtifactIo};
pub use recovery::recover_session;
pub use store::ArtifactStore;
