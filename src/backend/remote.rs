//! Remote backend over a multiplexed OpenSSH connection.
//!
//! [`SshConnection::connect`] starts a background master connection bound to
//! a private control socket. Every [`Backend::start`] then opens its own
//! channel through that socket, so independent executions never share a
//! byte stream and only the first one pays for the handshake.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::process::spawn_piped;
use super::Backend;
use crate::config::RemoteConfig;
use crate::error::UnishellError;
use crate::execution::{ExecOptions, ExecutionRequest};
use crate::io::ProcessIo;
use crate::Result;

/// How long to wait for the master's diagnostics after it exited.
const STDERR_GRACE: Duration = Duration::from_millis(200);

/// Extra slack on top of the handshake timeout before we give up on the
/// master process ourselves.
const CONNECT_SLACK: Duration = Duration::from_secs(5);

/// An OpenSSH master connection and its control socket.
///
/// Shared by the backend and exposed through
/// [`RemoteClient::connection`](crate::RemoteClient::connection) for anything
/// the engine does not mediate, such as port forwarding.
#[derive(Debug)]
pub struct SshConnection {
    config: RemoteConfig,
    target: String,
    control_path: PathBuf,
    connected: AtomicBool,
    connect_lock: Mutex<()>,
}

impl SshConnection {
    /// Describe a connection to `config`'s target. Nothing is opened yet.
    pub fn new(config: RemoteConfig) -> Self {
        let target = config.target();
        let control_path = build_control_path(&target);
        Self {
            config,
            target,
            control_path,
            connected: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
        }
    }

    /// The SSH destination (`user@host`).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Path of the control socket.
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// The parameters this connection was built from.
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Whether the master connection is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the master connection. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            debug!(host = %self.target, "ssh: already connected");
            return Ok(());
        }

        self.config
            .validate()
            .map_err(|e| UnishellError::Connection(e.to_string()))?;

        let mut command = self.program();
        command
            .arg("-M")
            .arg("-N")
            .arg("-f")
            .args(["-o", "ControlMaster=yes"])
            .args(["-o", "ControlPersist=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs));
        self.identity_args(&mut command);
        command
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(host = %self.target, control_path = %self.control_path.display(), "ssh: opening master");
        let mut child = command
            .spawn()
            .map_err(|e| UnishellError::Connection(format!("failed to run ssh: {}", e)))?;

        // The backgrounded master may keep stderr open, so wait on the
        // process rather than on its pipes.
        let limit = Duration::from_secs(self.config.connect_timeout_secs) + CONNECT_SLACK;
        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    debug!("ssh: failed to kill stalled master: {}", e);
                }
                return Err(UnishellError::Connection(format!(
                    "timed out connecting to {}",
                    self.target
                )));
            }
        };

        if !status.success() {
            let mut diagnostics = Vec::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = tokio::time::timeout(STDERR_GRACE, stderr.read_to_end(&mut diagnostics))
                    .await;
            }
            let message = String::from_utf8_lossy(&diagnostics).trim().to_string();
            return Err(UnishellError::Connection(if message.is_empty() {
                format!("ssh to {} exited with {}", self.target, status)
            } else {
                message
            }));
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(host = %self.target, "ssh: connected");
        Ok(())
    }

    /// Close the master connection. A no-op when not connected.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let status = self
            .close_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if !status.success() => {
                warn!(host = %self.target, %status, "ssh: master exit request failed")
            }
            Ok(_) => info!(host = %self.target, "ssh: disconnected"),
            Err(e) => warn!(host = %self.target, "ssh: failed to request master exit: {}", e),
        }
        let _ = std::fs::remove_file(&self.control_path);
        Ok(())
    }

    /// An `ssh` invocation bound to the control socket, without destination.
    ///
    /// Append your own options, then [`target`](Self::target) and the remote
    /// command.
    pub fn ssh_command(&self) -> Command {
        let mut command = self.program();
        command
            .arg("-S")
            .arg(&self.control_path)
            .args(["-o", "ControlMaster=no"]);
        self.identity_args(&mut command);
        command
    }

    fn channel_command(&self, remote_command: &str) -> Command {
        let mut command = self.ssh_command();
        command.arg("-T").arg(&self.target).arg(remote_command);
        command
    }

    fn program(&self) -> Command {
        let mut command = Command::new(&self.config.ssh_program);
        command.args(&self.config.extra_args);
        command
    }

    fn identity_args(&self, command: &mut Command) {
        if let Some(port) = self.config.port {
            command.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &self.config.identity {
            command.arg("-i").arg(identity);
        }
    }

    fn close_command(&self) -> Command {
        let mut command = self.program();
        command
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.target);
        command
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(host = %self.target, "ssh: closing master on drop");

        // Inside a runtime the exit request must not block a worker thread.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let mut command = self.close_command();
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            match command.spawn() {
                Ok(mut child) => {
                    let control_path = self.control_path.clone();
                    runtime.spawn(async move {
                        let _ = child.wait().await;
                        let _ = std::fs::remove_file(&control_path);
                    });
                }
                Err(e) => warn!(host = %self.target, "ssh: failed to request master exit: {}", e),
            }
            return;
        }

        let _ = std::process::Command::new(&self.config.ssh_program)
            .args(&self.config.extra_args)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let _ = std::fs::remove_file(&self.control_path);
    }
}

/// Runs commands on a remote host, one SSH channel per command.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    connection: Arc<SshConnection>,
}

impl RemoteBackend {
    /// Create a backend for `config`. Call [`Backend::connect`] before use.
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            connection: Arc::new(SshConnection::new(config)),
        }
    }

    /// The shared master connection.
    pub fn connection(&self) -> &Arc<SshConnection> {
        &self.connection
    }

    fn open_channel(&self, remote_command: &str, display: &str) -> Result<ProcessIo> {
        if !self.connection.is_connected() {
            return Err(UnishellError::Spawn {
                cmd: display.to_string(),
                reason: format!("not connected to {}", self.connection.target()),
            });
        }
        spawn_piped(self.connection.channel_command(remote_command), display)
    }
}

impl Backend for RemoteBackend {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.connection.connect())
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.connection.disconnect())
    }

    fn start(&self, request: &ExecutionRequest) -> Result<ProcessIo> {
        let rendered = render_remote_command(request.options(), request.command())
            .map_err(|reason| UnishellError::Spawn {
                cmd: request.command().to_string(),
                reason,
            })?;
        self.open_channel(&rendered, request.command())
    }

    fn open_shell(&self, options: &ExecOptions) -> Result<ProcessIo> {
        let rendered = render_remote_command(options, "exec /bin/sh").map_err(|reason| {
            UnishellError::Spawn {
                cmd: "/bin/sh".into(),
                reason,
            }
        })?;
        self.open_channel(&rendered, "/bin/sh")
    }
}

/// Prefix `command` with the working directory and environment from
/// `options`, for evaluation by the remote login shell.
pub(crate) fn render_remote_command(
    options: &ExecOptions,
    command: &str,
) -> std::result::Result<String, String> {
    let mut rendered = String::new();

    if let Some(dir) = &options.cwd {
        let dir = dir.to_string_lossy();
        rendered.push_str(&format!("cd {} || exit 1; ", shell_quote(&dir)));
    }

    let mut env: Vec<_> = options.env.iter().collect();
    env.sort();
    for (key, value) in env {
        if !is_valid_env_key(key) {
            return Err(format!("invalid environment variable name: {:?}", key));
        }
        rendered.push_str(&format!("export {}={}; ", key, shell_quote(value)));
    }

    rendered.push_str(command);
    Ok(rendered)
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Quote `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".into()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

fn build_control_path(target: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::env::temp_dir().join(format!("unishell-{:x}.sock", hasher.finish()))
}
