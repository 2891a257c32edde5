//! The fluid execution handle.
//!
//! One [`ExecutionShared`] exists per command run. It owns the output
//! buffer, the sink fan-out and the settlement signal; [`Execution`] and
//! [`Details`] are thin views over it, so composing `.details()`,
//! `.reject()` and `.pipe()` never starts a second run.

use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::stream::Stream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{ExecutionRequest, ExecutionResult, OutputChunk, OutputSource};
use crate::error::{RejectionError, UnishellError};
use crate::io::fanout::FanOut;
use crate::io::{pump, BoxReader, BoxWriter, PipeSinks, Termination};
use crate::Result;

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionState {
    /// Submitted but not started (queued in a session).
    #[default]
    Pending,
    /// Running; output is being drained.
    Streaming,
    /// Terminated; the result is available.
    Settled,
    /// Never ran or was abandoned by its session.
    Failed,
}

impl ExecutionState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Settled | ExecutionState::Failed)
    }
}

/// Why an execution produced no result.
#[derive(Debug, Clone)]
pub(crate) enum Failure {
    Spawn(String),
    SessionClosed,
}

impl Failure {
    fn into_error(self, cmd: &str) -> UnishellError {
        match self {
            Failure::Spawn(reason) => UnishellError::Spawn {
                cmd: cmd.to_string(),
                reason,
            },
            Failure::SessionClosed => UnishellError::SessionClosed,
        }
    }
}

#[derive(Debug, Clone)]
enum Settlement {
    Exited(Arc<ExecutionResult>),
    Failed(Failure),
}

/// Where bytes from a stdin source go.
pub(crate) enum StdinSlot {
    /// The process's own stdin, not yet claimed by a source.
    Process(BoxWriter),
    /// The input channel of the session shell this command runs in.
    Session(mpsc::WeakSender<Vec<u8>>),
    Closed,
}

struct Lifecycle {
    state: ExecutionState,
    stdin: StdinSlot,
    queued_source: Option<BoxReader>,
    /// Set once nothing can attach a stdin source any more.
    stdin_released: bool,
    started_at: Option<Instant>,
}

/// Shared state machine behind every view of one execution.
pub(crate) struct ExecutionShared {
    request: ExecutionRequest,
    lifecycle: Mutex<Lifecycle>,
    fanout: FanOut,
    strict: AtomicBool,
    settled: watch::Sender<Option<Settlement>>,
}

impl ExecutionShared {
    fn with_stdin(request: ExecutionRequest, stdin: StdinSlot) -> Arc<Self> {
        let (settled, _) = watch::channel(None);
        Arc::new(Self {
            request,
            lifecycle: Mutex::new(Lifecycle {
                state: ExecutionState::Pending,
                stdin,
                queued_source: None,
                stdin_released: false,
                started_at: None,
            }),
            fanout: FanOut::new(),
            strict: AtomicBool::new(false),
            settled,
        })
    }

    /// A standalone execution; its stdin arrives with [`begin`](Self::begin).
    pub(crate) fn new(request: ExecutionRequest) -> Arc<Self> {
        Self::with_stdin(request, StdinSlot::Closed)
    }

    /// An execution queued on a session whose shell reads from `input`.
    pub(crate) fn for_session(
        request: ExecutionRequest,
        input: mpsc::WeakSender<Vec<u8>>,
    ) -> Arc<Self> {
        Self::with_stdin(request, StdinSlot::Session(input))
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    pub(crate) fn state(&self) -> ExecutionState {
        self.lock().state
    }

    pub(crate) fn mark_strict(&self) {
        self.strict.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_strict(&self) -> bool {
        self.strict.load(Ordering::SeqCst)
    }

    /// Pending -> Streaming. `stdin` is the process's own input, if any.
    pub(crate) fn begin(&self, stdin: Option<BoxWriter>) {
        let mut lifecycle = self.lock();
        lifecycle.state = ExecutionState::Streaming;
        lifecycle.started_at = Some(Instant::now());

        match (stdin, lifecycle.queued_source.take()) {
            (Some(writer), Some(source)) => {
                tokio::spawn(pump::copy_to_stdin(source, writer));
            }
            (Some(writer), None) if !lifecycle.stdin_released => {
                lifecycle.stdin = StdinSlot::Process(writer)
            }
            (Some(_), None) => debug!(cmd = %self.request.command(), "stdin released before start"),
            (None, Some(source)) => self.feed_session(&lifecycle.stdin, source),
            (None, None) => {}
        }
        debug!(cmd = %self.request.command(), "execution started");
    }

    /// Buffer a chunk and copy it to every attached consumer.
    pub(crate) fn publish(&self, chunk: &OutputChunk) {
        self.fanout.publish(chunk);
    }

    /// Streaming -> Settled. Waits until every sink has seen end-of-stream.
    pub(crate) async fn settle(&self, termination: Termination) -> Arc<ExecutionResult> {
        let started_at = {
            let mut lifecycle = self.lock();
            lifecycle.stdin = StdinSlot::Closed;
            lifecycle.queued_source = None;
            lifecycle.started_at
        };

        let captured = self.fanout.close().await;
        let duration = started_at.map(|t| t.elapsed()).unwrap_or_default();
        let result = Arc::new(ExecutionResult::from_parts(
            self.request.command(),
            termination,
            captured.stdout,
            captured.stderr,
            captured.output,
            duration,
        ));

        debug!(
            cmd = %self.request.command(),
            code = result.code,
            killed = result.killed,
            "execution settled"
        );
        self.lock().state = ExecutionState::Settled;
        self.settled
            .send_replace(Some(Settlement::Exited(Arc::clone(&result))));
        result
    }

    /// Settle without a result. Attached sinks still receive end-of-stream.
    pub(crate) fn fail(&self, failure: Failure) {
        {
            let mut lifecycle = self.lock();
            lifecycle.state = ExecutionState::Failed;
            lifecycle.stdin = StdinSlot::Closed;
            lifecycle.queued_source = None;
        }
        self.fanout.close_now();
        debug!(cmd = %self.request.command(), ?failure, "execution failed");
        self.settled.send_replace(Some(Settlement::Failed(failure)));
    }

    pub(crate) fn attach(&self, sinks: PipeSinks) {
        let PipeSinks {
            stdout,
            stderr,
            output,
            stdin,
        } = sinks;

        if let Some(sink) = stdout {
            self.fanout.attach(OutputSource::Stdout, sink);
        }
        if let Some(sink) = stderr {
            self.fanout.attach(OutputSource::Stderr, sink);
        }
        if let Some(sink) = output {
            self.fanout.attach(OutputSource::Combined, sink);
        }
        if let Some(source) = stdin {
            self.attach_stdin(source);
        }
    }

    fn attach_stdin(&self, source: BoxReader) {
        let mut lifecycle = self.lock();
        if lifecycle.state == ExecutionState::Pending {
            if lifecycle.queued_source.is_none() {
                lifecycle.queued_source = Some(source);
            } else {
                warn!(cmd = %self.request.command(), "stdin source already attached; ignored");
            }
            return;
        }

        match std::mem::replace(&mut lifecycle.stdin, StdinSlot::Closed) {
            StdinSlot::Process(writer) => {
                tokio::spawn(pump::copy_to_stdin(source, writer));
            }
            StdinSlot::Session(input) => {
                lifecycle.stdin = StdinSlot::Session(input);
                self.feed_session(&lifecycle.stdin, source);
            }
            StdinSlot::Closed => warn!(
                cmd = %self.request.command(),
                "stdin already claimed or closed; source ignored"
            ),
        }
    }

    fn feed_session(&self, slot: &StdinSlot, source: BoxReader) {
        let tx = match slot {
            StdinSlot::Session(input) => input.upgrade(),
            _ => None,
        };
        match tx {
            Some(tx) => {
                tokio::spawn(pump::feed_source(source, tx));
            }
            None => warn!(
                cmd = %self.request.command(),
                "no shell input to feed; stdin source ignored"
            ),
        }
    }

    /// Close the process's stdin unless a source has claimed it.
    fn close_idle_stdin(&self) {
        let mut lifecycle = self.lock();
        lifecycle.stdin_released = true;
        if matches!(lifecycle.stdin, StdinSlot::Process(_)) {
            debug!(cmd = %self.request.command(), "closing unclaimed stdin");
            lifecycle.stdin = StdinSlot::Closed;
        }
    }

    pub(crate) fn subscribe(&self) -> impl Stream<Item = OutputChunk> + Send + 'static {
        self.fanout.subscribe()
    }

    async fn settlement(&self) -> Result<Settlement> {
        let mut rx = self.settled.subscribe();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| UnishellError::ChannelClosed)?;
        let settlement = (*settled).clone();
        drop(settled);
        settlement.ok_or(UnishellError::ChannelClosed)
    }

    /// Wait for the run to finish; `strict` turns a failed exit into an error.
    pub(crate) async fn resolve(&self, strict: bool) -> Result<Arc<ExecutionResult>> {
        self.close_idle_stdin();
        match self.settlement().await? {
            Settlement::Exited(result) if strict && result.failed() => {
                Err(RejectionError::new(ExecutionResult::clone(&result)).into())
            }
            Settlement::Exited(result) => Ok(result),
            Settlement::Failed(failure) => Err(failure.into_error(self.request.command())),
        }
    }
}

/// Held by every user-facing view of one execution. When the last view is
/// gone nobody can attach a stdin source, so an unclaimed stdin is closed and
/// the process can run to completion.
struct ViewGuard {
    shared: Arc<ExecutionShared>,
}

impl Drop for ViewGuard {
    fn drop(&mut self) {
        self.shared.close_idle_stdin();
    }
}

/// Handle to one command run.
///
/// Awaiting it yields the trimmed combined output, whatever the exit code.
/// The command starts as soon as the handle is created; dropping the handle
/// does not stop it.
///
/// ```no_run
/// # async fn demo(client: unishell::LocalClient) -> unishell::Result<()> {
/// let out = client.exec("echo foo").await?;
/// let details = client.exec("ls /nope").details().await?;
/// let strict = client.exec("make").reject().details().await;
/// # let _ = (out, details, strict);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Execution {
    shared: Arc<ExecutionShared>,
    views: Arc<ViewGuard>,
    strict: bool,
}

impl Execution {
    pub(crate) fn new(shared: Arc<ExecutionShared>) -> Self {
        let views = Arc::new(ViewGuard {
            shared: Arc::clone(&shared),
        });
        Self {
            shared,
            views,
            strict: false,
        }
    }

    /// View that resolves to the full [`ExecutionResult`].
    pub fn details(&self) -> Details {
        Details {
            shared: Arc::clone(&self.shared),
            views: Arc::clone(&self.views),
            strict: self.strict,
        }
    }

    /// Strict view: a non-zero or killed exit becomes a
    /// [`RejectionError`](crate::RejectionError).
    pub fn reject(&self) -> Execution {
        self.shared.mark_strict();
        Execution {
            shared: Arc::clone(&self.shared),
            views: Arc::clone(&self.views),
            strict: true,
        }
    }

    /// Attach sinks (and optionally a stdin source). Sinks receive bytes from
    /// the current position on.
    pub fn pipe(self, sinks: PipeSinks) -> Execution {
        self.shared.attach(sinks);
        self
    }

    /// Output chunks from the current position until the run settles.
    pub fn stream(&self) -> impl Stream<Item = OutputChunk> + Send + 'static {
        self.shared.subscribe()
    }

    /// The submitted request.
    pub fn request(&self) -> &ExecutionRequest {
        self.shared.request()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutionState {
        self.shared.state()
    }

    /// Whether the run reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether this view is strict.
    pub fn is_strict(&self) -> bool {
        self.strict
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("cmd", &self.shared.request().command())
            .field("state", &self.state())
            .field("strict", &self.strict)
            .finish()
    }
}

impl IntoFuture for Execution {
    type Output = Result<String>;
    type IntoFuture = BoxFuture<'static, Result<String>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let result = self.shared.resolve(self.strict).await?;
            Ok(result.output_trimmed())
        })
    }
}

/// View over an [`Execution`] that resolves to the full result.
#[derive(Clone)]
pub struct Details {
    shared: Arc<ExecutionShared>,
    views: Arc<ViewGuard>,
    strict: bool,
}

impl Details {
    /// Strict variant. Same as `execution.reject().details()`.
    pub fn reject(&self) -> Details {
        self.shared.mark_strict();
        Details {
            shared: Arc::clone(&self.shared),
            views: Arc::clone(&self.views),
            strict: true,
        }
    }

    /// Attach sinks; see [`Execution::pipe`].
    pub fn pipe(self, sinks: PipeSinks) -> Details {
        self.shared.attach(sinks);
        self
    }

    /// Output chunks from the current position until the run settles.
    pub fn stream(&self) -> impl Stream<Item = OutputChunk> + Send + 'static {
        self.shared.subscribe()
    }

    /// Whether this view is strict.
    pub fn is_strict(&self) -> bool {
        self.strict
    }
}

impl fmt::Debug for Details {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Details")
            .field("cmd", &self.shared.request().command())
            .field("strict", &self.strict)
            .finish()
    }
}

impl IntoFuture for Details {
    type Output = Result<ExecutionResult>;
    type IntoFuture = BoxFuture<'static, Result<ExecutionResult>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let result = self.shared.resolve(self.strict).await?;
            Ok(ExecutionResult::clone(&result))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::AsyncReadExt;

    fn streaming(cmd: &str) -> Arc<ExecutionShared> {
        let shared = ExecutionShared::new(ExecutionRequest::new(cmd));
        shared.begin(None);
        shared
    }

    #[tokio::test]
    async fn test_await_yields_trimmed_output() {
        let shared = streaming("echo hi");
        let exec = Execution::new(Arc::clone(&shared));

        shared.publish(&OutputChunk::stdout(b"  hi\n".to_vec()));
        shared.settle(Termination::exited(0)).await;

        assert_eq!(exec.await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_data() {
        let shared = streaming("false");
        let exec = Execution::new(Arc::clone(&shared));
        shared.settle(Termination::exited(1)).await;

        assert_eq!(exec.clone().await.unwrap(), "");
        let details = exec.details().await.unwrap();
        assert_eq!(details.code, 1);
        assert!(!details.killed);
    }

    #[tokio::test]
    async fn test_reject_composes_in_either_order() {
        let shared = streaming("exit 4");
        let exec = Execution::new(Arc::clone(&shared));
        shared.publish(&OutputChunk::stderr(b"bad\n".to_vec()));
        shared.settle(Termination::exited(4)).await;

        let a = exec.reject().details().await.unwrap_err();
        let b = exec.details().reject().await.unwrap_err();
        let c = exec.reject().await.unwrap_err();
        for err in [a, b, c] {
            let rejection = err.as_rejection().expect("rejection");
            assert_eq!(rejection.code(), 4);
            assert_eq!(rejection.message, "bad\n");
        }
        assert!(shared.is_strict());
    }

    #[tokio::test]
    async fn test_reject_on_success_behaves_normally() {
        let shared = streaming("true");
        let exec = Execution::new(Arc::clone(&shared));
        shared.publish(&OutputChunk::stdout(b"ok\n".to_vec()));
        shared.settle(Termination::exited(0)).await;

        assert_eq!(exec.reject().await.unwrap(), "ok");
        assert_eq!(exec.reject().details().await.unwrap().stdout, b"ok\n");
    }

    #[tokio::test]
    async fn test_killed_is_rejected() {
        let shared = streaming("sleep 100");
        let exec = Execution::new(Arc::clone(&shared));
        shared.settle(Termination::signalled(9)).await;

        let err = exec.reject().await.unwrap_err();
        assert!(err.as_rejection().unwrap().killed());
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_on_every_view() {
        let shared = ExecutionShared::new(ExecutionRequest::new("nope"));
        let exec = Execution::new(Arc::clone(&shared));
        shared.fail(Failure::Spawn("No such file or directory".into()));

        assert_eq!(exec.state(), ExecutionState::Failed);
        assert!(matches!(
            exec.clone().await,
            Err(UnishellError::Spawn { .. })
        ));
        assert!(matches!(
            exec.details().await,
            Err(UnishellError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_pipe_and_details_share_one_stream() {
        let shared = streaming("echo");
        let (mut read, write) = tokio::io::duplex(256);
        let exec = Execution::new(Arc::clone(&shared)).pipe(PipeSinks::new().stdout(write));
        let stream = exec.stream();

        shared.publish(&OutputChunk::stdout(b"abc".to_vec()));
        shared.settle(Termination::exited(0)).await;

        let mut piped = Vec::new();
        read.read_to_end(&mut piped).await.unwrap();
        assert_eq!(piped, b"abc");
        assert_eq!(exec.details().await.unwrap().stdout, b"abc");

        let chunks: Vec<OutputChunk> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_queued_stdin_source_is_wired_on_begin() {
        let shared = ExecutionShared::new(ExecutionRequest::new("cat"));
        shared.attach(PipeSinks::new().stdin(std::io::Cursor::new(b"in".to_vec())));

        let (mut read, write) = tokio::io::duplex(64);
        shared.begin(Some(Box::new(write)));

        let mut received = Vec::new();
        read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"in");
    }

    #[tokio::test]
    async fn test_dropping_last_view_closes_idle_stdin() {
        let shared = ExecutionShared::new(ExecutionRequest::new("cat"));
        let (mut read, write) = tokio::io::duplex(64);
        shared.begin(Some(Box::new(write)));

        let exec = Execution::new(Arc::clone(&shared));
        let details = exec.details();
        drop(exec);
        assert!(matches!(shared.lock().stdin, StdinSlot::Process(_)));

        drop(details);
        assert!(matches!(shared.lock().stdin, StdinSlot::Closed));
        let mut received = Vec::new();
        read.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_stdin_released_before_begin_is_dropped() {
        let shared = ExecutionShared::new(ExecutionRequest::new("cat"));
        drop(Execution::new(Arc::clone(&shared)));

        let (_read, write) = tokio::io::duplex(64);
        shared.begin(Some(Box::new(write)));
        assert!(matches!(shared.lock().stdin, StdinSlot::Closed));
    }

    #[test]
    fn test_state_terminal() {
        assert!(!ExecutionState::Pending.is_terminal());
        assert!(!ExecutionState::Streaming.is_terminal());
        assert!(ExecutionState::Settled.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
    }
}
