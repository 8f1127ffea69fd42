//! The Message Bus component (spec.md §4.3): typed request/response routing
//! between agent roles over bounded priority inboxes, with cancellation
//! fan-out.

mod bus;
mod error;
mod inbox;

pub use bus::Bus;
pub use error::{BusError, Result};
pub use inbox::Inbox;
