//! Shell sessions: several commands serialized over one shell.
//!
//! A session owns one long-lived shell process (or remote channel). The
//! callback passed to `shell()` submits commands through [`SessionExec`];
//! they queue up and a single dispatcher task writes them to the shell one
//! at a time, waiting for each command's completion marker before the next
//! one is sent.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::stream::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::marker::{self, MarkerScanner, Scan};
use super::{SessionId, SessionState};
use crate::backend::Backend;
use crate::error::{RejectionError, UnishellError};
use crate::execution::handle::{ExecutionShared, Failure};
use crate::execution::{
    ExecOptions, Execution, ExecutionRequest, ExecutionResult, OutputChunk, OutputSource,
};
use crate::io::fanout::FanOut;
use crate::io::{pump, PipeSinks, Termination};
use crate::Result;

/// Capacity of the shell input channel.
const INPUT_CHANNEL_CAPACITY: usize = 64;

type Queue = mpsc::UnboundedSender<Arc<ExecutionShared>>;

/// State shared by the session handle, the callback and the dispatcher.
struct SessionCore {
    id: SessionId,
    state: Mutex<SessionState>,
    queue: Mutex<Option<Queue>>,
    fanout: FanOut,
    input: mpsc::WeakSender<Vec<u8>>,
    failure: Mutex<Option<UnishellError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionCore {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move to `target` unless the session is already there or closed.
    fn advance(&self, target: SessionState) {
        let mut state = lock(&self.state);
        if *state == target || state.is_terminal() {
            return;
        }
        match state.transition_to(target) {
            Ok(()) => debug!(session = %self.id, state = %target, "session state changed"),
            Err(e) => warn!(session = %self.id, "{}", e),
        }
    }

    /// Stop accepting commands. Returns whether the queue was still open.
    fn close_queue(&self) -> bool {
        lock(&self.queue).take().is_some()
    }

    /// Keep the first failure; later ones are consequences of it.
    fn record_failure(&self, error: UnishellError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn take_failure(&self) -> Option<UnishellError> {
        lock(&self.failure).take()
    }

    fn submit(&self, request: ExecutionRequest) -> Execution {
        let shared = ExecutionShared::for_session(request, self.input.clone());
        let queued = match lock(&self.queue).as_ref() {
            Some(queue) => queue.send(Arc::clone(&shared)).is_ok(),
            None => false,
        };
        if queued {
            debug!(session = %self.id, cmd = %shared.request().command(), "command queued");
        } else {
            debug!(session = %self.id, cmd = %shared.request().command(), "session closed; command refused");
            shared.fail(Failure::SessionClosed);
        }
        Execution::new(shared)
    }

    fn emit(&self, shared: Option<&Arc<ExecutionShared>>, source: OutputSource, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let chunk = OutputChunk::new(bytes, source);
        if let Some(shared) = shared {
            shared.publish(&chunk);
        }
        self.fanout.publish(&chunk);
    }
}

/// The `exec` function handed to a session callback.
///
/// Cheap to clone. Every call queues a command behind the ones already
/// submitted; the returned handle behaves like one from
/// [`Client::exec`](crate::Client::exec).
#[derive(Clone)]
pub struct SessionExec {
    core: Arc<SessionCore>,
}

impl SessionExec {
    /// Queue `command` on the session's shell.
    ///
    /// `exit` or `exit N` ends the shell; its handle settles with the
    /// shell's own exit status. Commands submitted after the session closed
    /// fail with [`UnishellError::SessionClosed`].
    pub fn exec(&self, command: impl Into<String>) -> Execution {
        self.core.submit(ExecutionRequest::new(command))
    }

    /// The session's identifier.
    pub fn session_id(&self) -> SessionId {
        self.core.id
    }
}

impl fmt::Debug for SessionExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionExec")
            .field("session", &self.core.id)
            .finish()
    }
}

/// A running shell session.
///
/// Awaiting it yields the callback's value once the callback has returned
/// and the shell has exited. A command run through `.reject()` that fails
/// aborts the session, which then fails with
/// [`UnishellError::SessionPropagation`].
///
/// The callback starts when the session is first awaited (or dropped), so
/// sinks attached with [`pipe`](Self::pipe) see the session from its first
/// byte.
pub struct Session<T> {
    core: Arc<SessionCore>,
    start: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> Session<T> {
    pub(crate) fn spawn<B, F, Fut>(backend: Arc<B>, options: ExecOptions, callback: F) -> Self
    where
        B: Backend + ?Sized,
        F: FnOnce(SessionExec) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let (start_tx, start_rx) = oneshot::channel();

        let core = Arc::new(SessionCore {
            id: SessionId::new(),
            state: Mutex::new(SessionState::Open),
            queue: Mutex::new(Some(queue_tx)),
            fanout: FanOut::new(),
            input: input_tx.downgrade(),
            failure: Mutex::new(None),
        });
        info!(session = %core.id, backend = backend.name(), "session created");

        let dispatcher = Dispatcher {
            core: Arc::clone(&core),
            queue: queue_rx,
            input: input_tx,
            seq: 0,
        };
        let exec = SessionExec {
            core: Arc::clone(&core),
        };
        let driver_core = Arc::clone(&core);

        let task = tokio::spawn(async move {
            // A dropped sender also starts the session.
            let _ = start_rx.await;

            let dispatch =
                tokio::spawn(dispatcher.run(backend, options, input_rx));
            let outcome = callback(exec).await;

            debug!(session = %driver_core.id, ok = outcome.is_ok(), "session callback returned");
            driver_core.close_queue();
            driver_core.advance(SessionState::Draining);

            if let Err(e) = dispatch.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                warn!(session = %driver_core.id, "session dispatcher cancelled");
            }
            driver_core.advance(SessionState::Closed);
            info!(session = %driver_core.id, "session closed");

            match driver_core.take_failure() {
                Some(failure) => Err(failure),
                None => outcome,
            }
        });

        Self {
            core,
            start: Some(start_tx),
            task,
        }
    }
}

impl<T> Session<T> {
    /// Attach sinks for the session's combined output. A stdin source is
    /// forwarded to the shell for the session's lifetime.
    pub fn pipe(self, sinks: PipeSinks) -> Self {
        let PipeSinks {
            stdout,
            stderr,
            output,
            stdin,
        } = sinks;

        if let Some(sink) = stdout {
            self.core.fanout.attach(OutputSource::Stdout, sink);
        }
        if let Some(sink) = stderr {
            self.core.fanout.attach(OutputSource::Stderr, sink);
        }
        if let Some(sink) = output {
            self.core.fanout.attach(OutputSource::Combined, sink);
        }
        if let Some(source) = stdin {
            match self.core.input.upgrade() {
                Some(tx) => {
                    tokio::spawn(pump::feed_source(source, tx));
                }
                None => warn!(session = %self.core.id, "session input closed; stdin source ignored"),
            }
        }
        self
    }

    /// Every chunk the session produces from now on.
    pub fn stream(&self) -> impl Stream<Item = OutputChunk> + Send + 'static {
        self.core.fanout.subscribe()
    }

    /// The session's identifier.
    pub fn id(&self) -> SessionId {
        self.core.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.core.state()
    }
}

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Send + 'static> IntoFuture for Session<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(mut self) -> Self::IntoFuture {
        if let Some(start) = self.start.take() {
            let _ = start.send(());
        }
        let task = self.task;
        Box::pin(async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => Err(UnishellError::ChannelClosed),
            }
        })
    }
}

/// Why the dispatcher stopped running commands.
enum Stop {
    /// Queue exhausted; the shell is still running.
    Drained,
    /// The shell exited.
    ShellExited,
}

/// The shell and what is left of its output, owned by the dispatcher.
struct Shell {
    chunks: mpsc::Receiver<OutputChunk>,
    exit: Option<BoxFuture<'static, std::io::Result<Termination>>>,
    stdout_carry: Vec<u8>,
    stderr_carry: Vec<u8>,
}

impl Shell {
    async fn termination(&mut self) -> Termination {
        match self.exit.take() {
            Some(exit) => exit.await.unwrap_or_else(|e| {
                warn!("failed to observe shell exit: {}", e);
                Termination::unknown()
            }),
            None => Termination::unknown(),
        }
    }
}

struct Dispatcher {
    core: Arc<SessionCore>,
    queue: mpsc::UnboundedReceiver<Arc<ExecutionShared>>,
    input: mpsc::Sender<Vec<u8>>,
    seq: u64,
}

impl Dispatcher {
    async fn run<B>(mut self, backend: Arc<B>, options: ExecOptions, input_rx: mpsc::Receiver<Vec<u8>>)
    where
        B: Backend + ?Sized,
    {
        let io = match backend.open_shell(&options) {
            Ok(io) => io,
            Err(e) => {
                warn!(session = %self.core.id, "failed to open shell: {}", e);
                let reason = e.to_string();
                self.core.record_failure(e);
                self.abandon_queue(Failure::Spawn(reason));
                self.core.fanout.close().await;
                return;
            }
        };

        let writer = match io.stdin {
            Some(stdin) => Some(tokio::spawn(pump::StdinWriter::new(stdin, input_rx).run())),
            None => {
                warn!(session = %self.core.id, "shell has no stdin; commands cannot be sent");
                drop(input_rx);
                None
            }
        };
        let mut shell = Shell {
            chunks: pump::spawn_output_pumps(io.stdout, io.stderr),
            exit: Some(io.exit),
            stdout_carry: Vec::new(),
            stderr_carry: Vec::new(),
        };

        let stop = self.dispatch_all(&mut shell).await;

        if matches!(stop, Stop::Drained) {
            debug!(session = %self.core.id, "queue drained; closing shell");
            if self.input.send(b"exit\n".to_vec()).await.is_err() {
                debug!(session = %self.core.id, "shell input already closed");
            }
            self.drain_into_session(&mut shell).await;
            shell.termination().await;
        }

        if let Some(writer) = writer {
            writer.abort();
        }
        self.core.emit(None, OutputSource::Stdout, std::mem::take(&mut shell.stdout_carry));
        self.core.emit(None, OutputSource::Stderr, std::mem::take(&mut shell.stderr_carry));
        self.core.advance(SessionState::Closed);
        self.core.fanout.close().await;
    }

    /// Run queued commands in order until the queue closes or the shell exits.
    async fn dispatch_all(&mut self, shell: &mut Shell) -> Stop {
        while let Some(shared) = self.queue.recv().await {
            let (termination, shell_alive) = if shared.request().is_exit_directive() {
                (self.run_exit(shell, &shared).await, false)
            } else {
                match self.run_framed(shell, &shared).await {
                    Some(code) => (Termination::exited(code), true),
                    None => {
                        let termination = shell.termination().await;
                        warn!(session = %self.core.id, code = termination.code, "shell exited mid-command");
                        (termination, false)
                    }
                }
            };

            // Decided before settling so that nothing submitted in reaction
            // to this result can slip into the queue.
            let rejected = shared.is_strict() && !termination.success();
            if rejected || !shell_alive {
                self.core.close_queue();
            }

            let result = shared.settle(termination).await;

            if rejected {
                info!(session = %self.core.id, cmd = %result.cmd, code = result.code, "rejected command aborts session");
                let rejection = RejectionError::new(ExecutionResult::clone(&result));
                self.core
                    .record_failure(UnishellError::SessionPropagation(Box::new(rejection.into())));
            }
            if rejected || !shell_alive {
                self.abandon_queue(Failure::SessionClosed);
                return if shell_alive {
                    Stop::Drained
                } else {
                    Stop::ShellExited
                };
            }
        }
        Stop::Drained
    }

    /// Send one framed command and collect its output until both markers
    /// arrived. Returns the exit code, or `None` if the shell went away.
    async fn run_framed(&mut self, shell: &mut Shell, shared: &Arc<ExecutionShared>) -> Option<i32> {
        self.seq += 1;
        let token = self.core.id.marker_token(self.seq);
        debug!(session = %self.core.id, cmd = %shared.request().command(), seq = self.seq, "dispatching command");

        let framed = marker::frame(shared.request().command(), &token);
        let sent = self.input.send(framed.into_bytes()).await.is_ok();
        shared.begin(None);
        if !sent {
            return None;
        }

        let mut stdout = MarkerScanner::stdout(&token);
        let mut stderr = MarkerScanner::stderr(&token);
        let mut code = None;
        let mut stdout_done = false;
        let mut stderr_done = false;

        // Bytes that followed the previous markers come first.
        let carried = [
            (OutputSource::Stdout, std::mem::take(&mut shell.stdout_carry)),
            (OutputSource::Stderr, std::mem::take(&mut shell.stderr_carry)),
        ];
        let mut pending: Vec<OutputChunk> = carried
            .into_iter()
            .filter(|(_, bytes)| !bytes.is_empty())
            .map(|(source, bytes)| OutputChunk::new(bytes, source))
            .collect();
        pending.reverse();

        while !(stdout_done && stderr_done) {
            let chunk = match pending.pop() {
                Some(chunk) => chunk,
                None => match shell.chunks.recv().await {
                    Some(chunk) => chunk,
                    None => {
                        self.core.emit(Some(shared), OutputSource::Stdout, stdout.flush());
                        self.core.emit(Some(shared), OutputSource::Stderr, stderr.flush());
                        return None;
                    }
                },
            };

            let (scanner, done, carry) = match chunk.source {
                OutputSource::Stderr => (&mut stderr, &mut stderr_done, &mut shell.stderr_carry),
                _ => (&mut stdout, &mut stdout_done, &mut shell.stdout_carry),
            };
            if *done {
                carry.extend_from_slice(&chunk.raw);
                continue;
            }
            match scanner.feed(&chunk.raw) {
                Scan::Pending { emit } => self.core.emit(Some(shared), chunk.source, emit),
                Scan::Found {
                    emit,
                    code: found,
                    rest,
                } => {
                    self.core.emit(Some(shared), chunk.source, emit);
                    carry.extend_from_slice(&rest);
                    *done = true;
                    if chunk.source == OutputSource::Stdout {
                        code = found;
                    }
                }
            }
        }

        Some(code.unwrap_or_else(|| {
            warn!(session = %self.core.id, "unreadable exit status in marker");
            -1
        }))
    }

    /// Send an exit directive raw and wait for the shell to go away.
    async fn run_exit(&mut self, shell: &mut Shell, shared: &Arc<ExecutionShared>) -> Termination {
        shared.begin(None);
        debug!(session = %self.core.id, cmd = %shared.request().command(), "exit directive");

        let carried = [
            (OutputSource::Stdout, std::mem::take(&mut shell.stdout_carry)),
            (OutputSource::Stderr, std::mem::take(&mut shell.stderr_carry)),
        ];
        for (source, bytes) in carried {
            self.core.emit(Some(shared), source, bytes);
        }

        let line = format!("{}\n", shared.request().command().trim());
        if self.input.send(line.into_bytes()).await.is_ok() {
            while let Some(chunk) = shell.chunks.recv().await {
                self.core.emit(Some(shared), chunk.source, chunk.raw);
            }
        }
        shell.termination().await
    }

    async fn drain_into_session(&mut self, shell: &mut Shell) {
        while let Some(chunk) = shell.chunks.recv().await {
            self.core.emit(None, chunk.source, chunk.raw);
        }
    }

    /// Stop accepting work and fail everything still queued.
    fn abandon_queue(&mut self, failure: Failure) {
        self.core.close_queue();
        while let Ok(shared) = self.queue.try_recv() {
            debug!(session = %self.core.id, cmd = %shared.request().command(), "abandoning queued command");
            shared.fail(failure.clone());
        }
    }
}
