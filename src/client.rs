//! Clients: a backend plus the operations every caller uses.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{Backend, LocalBackend, RemoteBackend, SshConnection};
use crate::config::{Config, LocalConfig, RemoteConfig};
use crate::error::UnishellError;
use crate::execution::driver;
use crate::execution::handle::ExecutionShared;
use crate::execution::{ExecOptions, Execution, ExecutionRequest};
use crate::session::{Session, SessionExec};
use crate::Result;

/// Runs commands on one backend.
///
/// Local and remote clients share this type; see [`LocalClient`] and
/// [`RemoteClient`].
#[derive(Debug)]
pub struct Client<B: Backend> {
    backend: Arc<B>,
}

/// A client for the local machine.
pub type LocalClient = Client<LocalBackend>;

/// A client for a remote machine reached over SSH.
pub type RemoteClient = Client<RemoteBackend>;

impl<B: Backend> Clone for Client<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> Client<B> {
    /// Wrap a backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// The backend this client runs on.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Make the backend ready. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        debug!(backend = self.backend.name(), "connect");
        self.backend.connect().await
    }

    /// Release the backend's connection, if it holds one.
    pub async fn disconnect(&self) -> Result<()> {
        debug!(backend = self.backend.name(), "disconnect");
        self.backend.disconnect().await
    }

    /// Start `command` now and return its handle.
    ///
    /// Independent calls may run concurrently. Must be called from within a
    /// tokio runtime.
    pub fn exec(&self, command: impl Into<String>) -> Execution {
        self.exec_with(command, ExecOptions::default())
    }

    /// Like [`exec`](Self::exec), with a working directory and environment.
    pub fn exec_with(&self, command: impl Into<String>, options: ExecOptions) -> Execution {
        let shared = ExecutionShared::new(ExecutionRequest::with_options(command, options));
        driver::launch(self.backend.as_ref(), &shared);
        Execution::new(shared)
    }

    /// Open a shell session driven by `callback`.
    ///
    /// ```no_run
    /// # async fn demo(client: unishell::LocalClient) -> unishell::Result<()> {
    /// let listing = client
    ///     .shell(|exec| async move {
    ///         exec.exec("cd /tmp").reject().await?;
    ///         let files = exec.exec("ls").await?;
    ///         exec.exec("exit").await?;
    ///         Ok(files)
    ///     })
    ///     .await?;
    /// # let _ = listing;
    /// # Ok(())
    /// # }
    /// ```
    pub fn shell<T, F, Fut>(&self, callback: F) -> Session<T>
    where
        T: Send + 'static,
        F: FnOnce(SessionExec) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.shell_with(ExecOptions::default(), callback)
    }

    /// Like [`shell`](Self::shell), starting the shell with `options`.
    pub fn shell_with<T, F, Fut>(&self, options: ExecOptions, callback: F) -> Session<T>
    where
        T: Send + 'static,
        F: FnOnce(SessionExec) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Session::spawn(Arc::clone(&self.backend), options, callback)
    }
}

impl Client<RemoteBackend> {
    /// The underlying SSH connection, for operations the engine does not
    /// mediate (port forwarding, extra channels).
    pub fn connection(&self) -> &Arc<SshConnection> {
        self.backend.connection()
    }
}

/// Entry point that builds clients from a [`Config`].
///
/// ```no_run
/// use unishell::{RemoteConfig, Unishell};
///
/// # async fn demo() -> unishell::Result<()> {
/// let local = Unishell::local_default();
/// println!("{}", local.exec("hostname").await?);
///
/// let remote = Unishell::ssh(RemoteConfig::new("example.com", "deploy"));
/// remote.connect().await?;
/// println!("{}", remote.exec("hostname").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Unishell {
    config: Config,
}

impl Unishell {
    /// Factory over `config`.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The configuration clients are built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A local client using the configured local parameters.
    pub fn local(&self) -> LocalClient {
        Client::new(LocalBackend::new(self.config.local.clone()))
    }

    /// A remote client for the configured remote target.
    pub fn remote(&self) -> Result<RemoteClient> {
        let remote = self
            .config
            .remote
            .clone()
            .ok_or_else(|| UnishellError::Connection("no remote target configured".into()))?;
        remote
            .validate()
            .map_err(|e| UnishellError::Connection(e.to_string()))?;
        Ok(Self::ssh(remote))
    }

    /// A local client with default parameters.
    pub fn local_default() -> LocalClient {
        Self::local_with(LocalConfig::default())
    }

    /// A local client with explicit parameters.
    pub fn local_with(config: LocalConfig) -> LocalClient {
        Client::new(LocalBackend::new(config))
    }

    /// A remote client for `config`. Call [`Client::connect`] before use.
    pub fn ssh(config: RemoteConfig) -> RemoteClient {
        Client::new(RemoteBackend::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_requires_configuration() {
        let err = Unishell::new(Config::default()).remote().unwrap_err();
        assert!(matches!(err, UnishellError::Connection(_)));

        let config = Config {
            remote: Some(RemoteConfig::new("", "root")),
            ..Config::default()
        };
        assert!(Unishell::new(config).remote().is_err());
    }

    #[test]
    fn test_remote_from_config() {
        let config = Config {
            remote: Some(RemoteConfig::new("db.internal", "ops")),
            ..Config::default()
        };
        let client = Unishell::new(config).remote().unwrap();
        assert_eq!(client.connection().target(), "ops@db.internal");
        assert!(!client.connection().is_connected());
    }

    #[test]
    fn test_local_uses_config() {
        let config = Config {
            local: LocalConfig::with_cwd("/srv"),
            ..Config::default()
        };
        let client = Unishell::new(config).local();
        assert_eq!(
            client.backend().config().cwd.as_deref(),
            Some(std::path::Path::new("/srv"))
        );
    }

    #[tokio::test]
    async fn test_local_connect_is_idempotent() {
        let client = Unishell::local_default();
        client.connect().await.unwrap();
        client.connect().await.unwrap();
        client.disconnect().await.unwrap();
    }
}
