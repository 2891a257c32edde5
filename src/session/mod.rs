//! Shell sessions.
//!
//! This module provides the serialized command queue that runs several
//! commands over one shell, its lifecycle state machine, and the marker
//! framing used to find where each command's output ends.

mod id;
mod marker;
mod shell;
mod state;

pub use id::SessionId;
pub use shell::{Session, SessionExec};
pub use state::SessionState;
