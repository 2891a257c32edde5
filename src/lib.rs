//! # unishell
//!
//! Run shell commands on the local machine or over SSH through one API.
//!
//! Every `exec` returns an [`Execution`]: a handle to a single run that can be
//! awaited for its trimmed output, inspected with [`Execution::details`],
//! made strict with [`Execution::reject`], and piped to any number of sinks
//! while it is still being awaited. Sessions run several commands, strictly
//! in order, over one long-lived shell.
//!
//! ## Quick Start
//!
//! ```no_run
//! use unishell::{PipeSinks, Unishell};
//!
//! #[tokio::main]
//! async fn main() -> unishell::Result<()> {
//!     unishell::logging::try_init().ok();
//!
//!     let client = Unishell::local_default();
//!
//!     // Awaiting yields trimmed output, even for a non-zero exit
//!     let kernel = client.exec("uname -r").await?;
//!
//!     // A strict run turns a failed exit into an error carrying the result
//!     if let Err(e) = client.exec("test -d /nope").reject().await {
//!         println!("rejected: {}", e);
//!     }
//!
//!     // Serialized commands over one shell, forwarded to our stdout
//!     client
//!         .shell(|exec| async move {
//!             exec.exec("cd /tmp").await?;
//!             exec.exec("pwd").await?;
//!             Ok(())
//!         })
//!         .pipe(PipeSinks::inherit())
//!         .await?;
//!
//!     println!("kernel {}", kernel);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod execution;
pub mod io;
pub mod logging;
pub mod session;

// Re-export commonly used types
pub use backend::{Backend, LocalBackend, RemoteBackend, SshConnection};
pub use client::{Client, LocalClient, RemoteClient, Unishell};
pub use config::{Config, LocalConfig, RemoteConfig};
pub use error::{RejectionError, Result, UnishellError};
pub use execution::{
    Details, ExecOptions, Execution, ExecutionRequest, ExecutionResult, ExecutionState,
    OutputChunk, OutputSource,
};
pub use io::{PipeSinks, ProcessIo, Termination};
pub use session::{Session, SessionExec, SessionId, SessionState};
