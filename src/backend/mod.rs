//! Execution backends.
//!
//! A backend turns an [`ExecutionRequest`] into a running command and hands
//! back its [`ProcessIo`]. The engine depends on nothing else, so local
//! processes and remote channels are interchangeable behind [`Backend`].

mod local;
mod process;
mod remote;

pub use local::{default_shell, LocalBackend};
pub use remote::{RemoteBackend, SshConnection};

use futures_util::future::BoxFuture;

use crate::execution::{ExecOptions, ExecutionRequest};
use crate::io::ProcessIo;
use crate::Result;

/// Capability set every backend provides.
///
/// `start` and `open_shell` must be called from within a tokio runtime.
pub trait Backend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Make the backend ready. Calling it again while ready is a no-op.
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    /// Release whatever `connect` established.
    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Start one command. Its streams are readable once this returns.
    ///
    /// Fails with [`UnishellError::Spawn`](crate::UnishellError::Spawn) when
    /// the command cannot be launched at all.
    fn start(&self, request: &ExecutionRequest) -> Result<ProcessIo>;

    /// Start a long-lived POSIX shell reading commands from its stdin.
    fn open_shell(&self, options: &ExecOptions) -> Result<ProcessIo>;
}
