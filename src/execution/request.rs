//! Execution requests and per-call options.

use std::collections::HashMap;
use std::path::PathBuf;

/// Options passed through to the backend for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Working directory override (if any).
    pub cwd: Option<PathBuf>,
    /// Environment variables to set.
    pub env: HashMap<String, String>,
}

impl ExecOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Layer these options over `defaults`; values set here win.
    pub fn merged_over(&self, defaults: &ExecOptions) -> ExecOptions {
        let mut env = defaults.env.clone();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        ExecOptions {
            cwd: self.cwd.clone().or_else(|| defaults.cwd.clone()),
            env,
        }
    }
}

/// A command submitted for execution. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    command: String,
    options: ExecOptions,
}

impl ExecutionRequest {
    /// A request for `command` with default options.
    pub fn new(command: impl Into<String>) -> Self {
        Self::with_options(command, ExecOptions::default())
    }

    /// A request for `command` with explicit options.
    pub fn with_options(command: impl Into<String>, options: ExecOptions) -> Self {
        Self {
            command: command.into(),
            options,
        }
    }

    /// The command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The execution options.
    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    /// Whether this command ends the shell it is sent to: `exit` or `exit N`.
    pub fn is_exit_directive(&self) -> bool {
        let mut words = self.command.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("exit"), None, _) => true,
            (Some("exit"), Some(code), None) => code.parse::<i32>().is_ok(),
            _ => false,
        }
    }
}
