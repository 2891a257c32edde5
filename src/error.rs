//! Error types for unishell.

use std::fmt;

use thiserror::Error;

use crate::execution::ExecutionResult;

/// Main error type for unishell operations.
#[derive(Error, Debug)]
pub enum UnishellError {
    /// The backend could not start the command at all.
    #[error("failed to spawn `{cmd}`: {reason}")]
    Spawn { cmd: String, reason: String },

    /// A strict handle observed a non-zero or killed exit.
    #[error(transparent)]
    Rejection(Box<RejectionError>),

    /// A rejected command aborted its shell session.
    #[error("shell session aborted: {0}")]
    SessionPropagation(Box<UnishellError>),

    /// Establishing the backend connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The shell session no longer accepts or runs commands.
    #[error("shell session closed")]
    SessionClosed,

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// Channel receive error.
    #[error("channel closed")]
    ChannelClosed,
}

impl UnishellError {
    /// Returns the rejection payload if this error (or the error it wraps)
    /// came from a strict handle.
    pub fn as_rejection(&self) -> Option<&RejectionError> {
        match self {
            Self::Rejection(rejection) => Some(rejection),
            Self::SessionPropagation(inner) => inner.as_rejection(),
            _ => None,
        }
    }
}

impl From<RejectionError> for UnishellError {
    fn from(err: RejectionError) -> Self {
        Self::Rejection(Box::new(err))
    }
}

/// Raised by handles created through `.reject()` when the command exits
/// non-zero or is killed.
#[derive(Debug, Clone)]
pub struct RejectionError {
    /// Combined output of the command as text.
    pub message: String,
    /// The full result of the failed run.
    pub result: ExecutionResult,
}

impl RejectionError {
    pub(crate) fn new(result: ExecutionResult) -> Self {
        Self {
            message: result.output_string(),
            result,
        }
    }

    /// Exit code of the failed command.
    pub fn code(&self) -> i32 {
        self.result.code
    }

    /// Whether the command was killed by a signal.
    pub fn killed(&self) -> bool {
        self.result.killed
    }
}

impl fmt::Display for RejectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command `{}` failed with exit code {}",
            self.result.cmd, self.result.code
        )?;
        if self.result.killed {
            write!(f, " (killed)")?;
        }
        let message = self.message.trim();
        if !message.is_empty() {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for RejectionError {}

/// Convenience Result type for unishell operations.
pub type Result<T> = std::result::Result<T, UnishellError>;
