//! Buffering fan-out of output chunks.
//!
//! A [`FanOut`] keeps the complete stdout, stderr and combined streams of one
//! execution (or one session) and hands each attached consumer its own copy.
//! Consumers are fed through unbounded channels, so a slow sink never stalls
//! the buffer or any other sink.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, Stream};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::BoxWriter;
use crate::execution::{OutputChunk, OutputSource};

/// Everything a closed [`FanOut`] collected.
#[derive(Debug, Default, Clone)]
pub(crate) struct Captured {
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) output: Vec<u8>,
}

struct SinkTx {
    filter: OutputSource,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct FanOutState {
    captured: Captured,
    sinks: Vec<SinkTx>,
    streams: Vec<mpsc::UnboundedSender<OutputChunk>>,
    writers: Vec<JoinHandle<()>>,
    closed: bool,
}

/// Buffer plus independent copies for every consumer.
#[derive(Default)]
pub(crate) struct FanOut {
    state: Mutex<FanOutState>,
}

impl FanOut {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FanOutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a sink for `filter` (`Combined` receives both streams).
    ///
    /// The sink sees bytes published from now on and is shut down when the
    /// fan-out closes. Must be called from within a tokio runtime.
    pub(crate) fn attach(&self, filter: OutputSource, writer: BoxWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_sink(writer, rx, filter));

        let mut state = self.lock();
        if state.closed {
            trace!(?filter, "fan-out: sink attached after close");
            return;
        }
        state.sinks.push(SinkTx { filter, tx });
        state.writers.push(handle);
    }

    /// A stream of every chunk published from now on.
    pub(crate) fn subscribe(&self) -> impl Stream<Item = OutputChunk> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            if !state.closed {
                state.streams.push(tx);
            }
        }
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) })
    }

    /// Buffer `chunk` and copy it to every matching consumer.
    pub(crate) fn publish(&self, chunk: &OutputChunk) {
        let mut state = self.lock();
        if state.closed {
            warn!("fan-out: dropping {} bytes published after close", chunk.raw.len());
            return;
        }

        match chunk.source {
            OutputSource::Stdout => state.captured.stdout.extend_from_slice(&chunk.raw),
            OutputSource::Stderr => state.captured.stderr.extend_from_slice(&chunk.raw),
            OutputSource::Combined => {}
        }
        state.captured.output.extend_from_slice(&chunk.raw);

        for sink in &state.sinks {
            if sink.filter == OutputSource::Combined || sink.filter == chunk.source {
                // A failed sink has already logged and stopped reading.
                let _ = sink.tx.send(chunk.raw.clone());
            }
        }
        state.streams.retain(|tx| tx.send(chunk.clone()).is_ok());
    }

    /// Stop accepting consumers and signal end-of-stream to all of them.
    ///
    /// Returns the collected bytes and the sink tasks still flushing.
    pub(crate) fn close_now(&self) -> (Captured, Vec<JoinHandle<()>>) {
        let mut state = self.lock();
        state.closed = true;
        state.sinks.clear();
        state.streams.clear();
        let writers = std::mem::take(&mut state.writers);
        (std::mem::take(&mut state.captured), writers)
    }

    /// Close and wait until every sink has received end-of-stream.
    pub(crate) async fn close(&self) -> Captured {
        let (captured, writers) = self.close_now();
        for writer in writers {
            if let Err(e) = writer.await {
                warn!("fan-out: sink task failed: {}", e);
            }
        }
        captured
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

async fn write_sink(
    mut writer: BoxWriter,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    filter: OutputSource,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            warn!(?filter, "pipe sink write failed: {}", e);
            return;
        }
    }
    if let Err(e) = writer.flush().await {
        warn!(?filter, "pipe sink flush failed: {}", e);
    }
    if let Err(e) = writer.shutdown().await {
        trace!(?filter, "pipe sink shutdown: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::AsyncReadExt;

    fn stdout(data: &str) -> OutputChunk {
        OutputChunk::stdout(data.as_bytes().to_vec())
    }

    fn stderr(data: &str) -> OutputChunk {
        OutputChunk::new(data.as_bytes().to_vec(), OutputSource::Stderr)
    }

    #[tokio::test]
    async fn test_buffers_by_source() {
        let fanout = FanOut::new();
        fanout.publish(&stdout("out1 "));
        fanout.publish(&stderr("err1 "));
        fanout.publish(&stdout("out2"));

        let captured = fanout.close().await;
        assert_eq!(captured.stdout, b"out1 out2");
        assert_eq!(captured.stderr, b"err1 ");
        assert_eq!(captured.output, b"out1 err1 out2");
        assert!(fanout.is_closed());
    }

    #[tokio::test]
    async fn test_two_sinks_receive_identical_bytes() {
        let fanout = FanOut::new();
        let (mut a_read, a_write) = tokio::io::duplex(1024);
        let (mut b_read, b_write) = tokio::io::duplex(1024);
        fanout.attach(OutputSource::Stdout, Box::new(a_write));
        fanout.attach(OutputSource::Stdout, Box::new(b_write));

        fanout.publish(&stdout("hello "));
        fanout.publish(&stderr("ignored"));
        fanout.publish(&stdout("world"));
        fanout.close().await;

        let mut a = String::new();
        let mut b = String::new();
        a_read.read_to_string(&mut a).await.unwrap();
        b_read.read_to_string(&mut b).await.unwrap();
        assert_eq!(a, "hello world");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_combined_sink_gets_both_streams() {
        let fanout = FanOut::new();
        let (mut read, write) = tokio::io::duplex(1024);
        fanout.attach(OutputSource::Combined, Box::new(write));

        fanout.publish(&stdout("a"));
        fanout.publish(&stderr("b"));
        fanout.close().await;

        let mut received = String::new();
        read.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "ab");
    }

    #[tokio::test]
    async fn test_late_sink_sees_only_remaining_bytes() {
        let fanout = FanOut::new();
        fanout.publish(&stdout("early "));

        let (mut read, write) = tokio::io::duplex(1024);
        fanout.attach(OutputSource::Stdout, Box::new(write));
        fanout.publish(&stdout("late"));
        let captured = fanout.close().await;

        let mut received = String::new();
        read.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "late");
        assert_eq!(captured.stdout, b"early late");
    }

    #[tokio::test]
    async fn test_sink_attached_after_close_gets_eof() {
        let fanout = FanOut::new();
        fanout.close().await;

        let (mut read, write) = tokio::io::duplex(64);
        fanout.attach(OutputSource::Stdout, Box::new(write));

        let mut received = Vec::new();
        read.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_stream_ends_on_close() {
        let fanout = FanOut::new();
        let stream = fanout.subscribe();
        fanout.publish(&stdout("x"));
        fanout.publish(&stderr("y"));
        fanout.close().await;

        let chunks: Vec<OutputChunk> = stream.collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source, OutputSource::Stdout);
        assert_eq!(chunks[1].text, "y");
    }
}
