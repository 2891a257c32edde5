//! Execution result types.

use std::time::Duration;

use crate::io::Termination;

/// Result of one command run. Produced exactly once, when the backing
/// process or channel terminates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Invoking command.
    pub cmd: String,
    /// Exit code.
    pub code: i32,
    /// Whether the command was killed by a signal.
    pub killed: bool,
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
    /// Combined stdout and stderr, in arrival order.
    pub output: Vec<u8>,
    /// Time from start to termination.
    pub duration: Duration,
}

impl ExecutionResult {
    pub(crate) fn from_parts(
        cmd: impl Into<String>,
        termination: Termination,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        output: Vec<u8>,
        duration: Duration,
    ) -> Self {
        Self {
            cmd: cmd.into(),
            code: termination.code,
            killed: termination.killed,
            stdout,
            stderr,
            output,
            duration,
        }
    }

    /// Check if command succeeded (exit code 0, not killed).
    pub fn success(&self) -> bool {
        self.code == 0 && !self.killed
    }

    /// Check if command failed (non-zero exit code or killed).
    pub fn failed(&self) -> bool {
        !self.success()
    }

    /// Combined output as text (lossy UTF-8).
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Standard output as text (lossy UTF-8).
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as text (lossy UTF-8).
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Combined output, trimmed. This is what awaiting a plain handle yields.
    pub fn output_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.output).trim().to_string()
    }
}

/// Streaming output chunk from execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Raw bytes.
    pub raw: Vec<u8>,
    /// Decoded text (best effort).
    pub text: String,
    /// Stream source.
    pub source: OutputSource,
}

/// Source of output data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputSource {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// Combined output.
    Combined,
}

impl OutputChunk {
    /// Create a new output chunk.
    pub fn new(raw: Vec<u8>, source: OutputSource) -> Self {
        let text = String::from_utf8_lossy(&raw).into_owned();
        Self { raw, text, source }
    }

    /// Create a stdout chunk.
    pub fn stdout(raw: Vec<u8>) -> Self {
        Self::new(raw, OutputSource::Stdout)
    }

    /// Create a stderr chunk.
    pub fn stderr(raw: Vec<u8>) -> Self {
        Self::new(raw, OutputSource::Stderr)
    }
}
