//! Process IO contract and byte plumbing.
//!
//! Every backend hands the engine a [`ProcessIo`]: three byte streams plus a
//! termination future. The engine drains them with [`pump`] tasks and hands
//! the bytes to a [`fanout`] hub that buffers them and copies them to every
//! attached sink.

pub(crate) mod fanout;
pub(crate) mod pump;

use std::fmt;
use std::process::ExitStatus;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed byte source.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed byte sink.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How a process or channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    /// Exit code. Signals are reported as `128 + signo`.
    pub code: i32,
    /// Whether the process was killed by a signal.
    pub killed: bool,
}

impl Termination {
    /// Normal exit with `code`.
    pub fn exited(code: i32) -> Self {
        Self {
            code,
            killed: false,
        }
    }

    /// Death by signal `signo`.
    pub fn signalled(signo: i32) -> Self {
        Self {
            code: 128 + signo,
            killed: true,
        }
    }

    /// Termination whose cause could not be observed.
    pub fn unknown() -> Self {
        Self {
            code: -1,
            killed: true,
        }
    }

    /// Exit code 0 and not killed.
    pub fn success(&self) -> bool {
        self.code == 0 && !self.killed
    }
}

impl From<ExitStatus> for Termination {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signo) = status.signal() {
                return Self::signalled(signo);
            }
        }
        Self::unknown()
    }
}

/// The three byte streams and termination event of one running command.
///
/// Streams are readable as soon as the backend returns this value. `exit`
/// resolves exactly once, after which the process or channel is released.
pub struct ProcessIo {
    /// Input stream, if the backend exposes one.
    pub stdin: Option<BoxWriter>,
    /// Output stream.
    pub stdout: BoxReader,
    /// Error stream.
    pub stderr: BoxReader,
    /// Resolves when the process or channel terminates.
    pub exit: BoxFuture<'static, std::io::Result<Termination>>,
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Destinations (and an optional input source) to wire to an execution or
/// session.
///
/// Sinks are only borrowed for forwarding: each receives an independent copy
/// of its stream and is shut down once the stream ends.
#[derive(Default)]
pub struct PipeSinks {
    pub(crate) stdout: Option<BoxWriter>,
    pub(crate) stderr: Option<BoxWriter>,
    pub(crate) output: Option<BoxWriter>,
    pub(crate) stdin: Option<BoxReader>,
}

impl PipeSinks {
    /// No sinks attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward standard output to `sink`.
    pub fn stdout(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    /// Forward standard error to `sink`.
    pub fn stderr(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(sink));
        self
    }

    /// Forward the combined, interleaved output to `sink`.
    pub fn output(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.output = Some(Box::new(sink));
        self
    }

    /// Feed `source` into the command's standard input.
    pub fn stdin(mut self, source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(source));
        self
    }

    /// Wire the current process's stdout and stderr.
    pub fn inherit() -> Self {
        Self::new()
            .stdout(tokio::io::stdout())
            .stderr(tokio::io::stderr())
    }

    /// Check whether nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.stdout.is_none()
            && self.stderr.is_none()
            && self.output.is_none()
            && self.stdin.is_none()
    }
}

impl fmt::Debug for PipeSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeSinks")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("output", &self.output.is_some())
            .field("stdin", &self.stdin.is_some())
            .finish()
    }
}
