//! Local process backend.

use futures_util::future::BoxFuture;
use tokio::process::Command;

use super::process::spawn_piped;
use super::Backend;
use crate::config::LocalConfig;
use crate::execution::{ExecOptions, ExecutionRequest};
use crate::io::ProcessIo;
use crate::Result;

/// Get the default shell for the current platform.
pub fn default_shell() -> &'static str {
    #[cfg(unix)]
    {
        "/bin/sh"
    }
    #[cfg(windows)]
    {
        "cmd.exe"
    }
}

/// Runs commands as child processes of the current process.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    config: LocalConfig,
    defaults: ExecOptions,
}

impl LocalBackend {
    /// Create a backend with the given defaults.
    pub fn new(config: LocalConfig) -> Self {
        let defaults = ExecOptions {
            cwd: config.cwd.clone(),
            env: config.env.clone(),
        };
        Self { config, defaults }
    }

    /// The configuration this backend was built from.
    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    fn shell(&self) -> &str {
        self.config.shell.as_deref().unwrap_or(default_shell())
    }

    fn command(&self, program: &str, options: &ExecOptions) -> Command {
        let options = options.merged_over(&self.defaults);
        let mut command = Command::new(program);
        if let Some(dir) = &options.cwd {
            command.current_dir(dir);
        }
        command.envs(&options.env);
        command
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn start(&self, request: &ExecutionRequest) -> Result<ProcessIo> {
        let mut command = self.command(self.shell(), request.options());

        #[cfg(unix)]
        command.arg("-c").arg(request.command());

        #[cfg(windows)]
        command.arg("/C").arg(request.command());

        spawn_piped(command, request.command())
    }

    fn open_shell(&self, options: &ExecOptions) -> Result<ProcessIo> {
        let shell = self.shell();
        spawn_piped(self.command(shell, options), shell)
    }
}
