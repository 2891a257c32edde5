//! Async byte pumps between process streams and channels.
//!
//! Readers are drained into a channel of [`OutputChunk`]s so that stdout and
//! stderr of one process can be consumed by a single loop. Input runs the
//! other way: every producer sends byte vectors to one writer task, which is
//! the only thing that ever touches the process's stdin.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::execution::{OutputChunk, OutputSource};

/// Default read buffer size.
const READ_BUFFER_SIZE: usize = 8192;

/// Capacity of the chunk channel shared by a process's output pumps.
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Spawn pumps for both output streams of one process.
///
/// The returned receiver yields chunks in arrival order and ends once both
/// streams reached EOF.
pub(crate) fn spawn_output_pumps<O, E>(stdout: O, stderr: E) -> mpsc::Receiver<OutputChunk>
where
    O: AsyncRead + Send + Unpin + 'static,
    E: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    tokio::spawn(StreamPump::new(stdout, OutputSource::Stdout, tx.clone()).run());
    tokio::spawn(StreamPump::new(stderr, OutputSource::Stderr, tx).run());
    rx
}

/// Drains one output stream into a chunk channel.
pub(crate) struct StreamPump<R: AsyncRead + Send + Unpin> {
    reader: R,
    source: OutputSource,
    tx: mpsc::Sender<OutputChunk>,
    buffer_size: usize,
}

impl<R: AsyncRead + Send + Unpin> StreamPump<R> {
    pub(crate) fn new(reader: R, source: OutputSource, tx: mpsc::Sender<OutputChunk>) -> Self {
        Self {
            reader,
            source,
            tx,
            buffer_size: READ_BUFFER_SIZE,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Read until EOF, a read error, or the receiver going away.
    ///
    /// Returns the number of bytes forwarded.
    pub(crate) async fn run(mut self) -> u64 {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;

        loop {
            match self.reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(source = ?self.source, total, "stream pump: EOF");
                    break;
                }
                Ok(n) => {
                    trace!(source = ?self.source, "stream pump: read {} bytes", n);
                    total += n as u64;
                    let chunk = OutputChunk::new(buf[..n].to_vec(), self.source);
                    if self.tx.send(chunk).await.is_err() {
                        debug!(source = ?self.source, "stream pump: channel closed");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Either way the stream is finished.
                    if e.kind() == std::io::ErrorKind::BrokenPipe {
                        debug!(source = ?self.source, "stream pump: broken pipe");
                    } else {
                        error!(source = ?self.source, "stream pump error: {}", e);
                    }
                    break;
                }
            }
        }

        total
    }
}

/// Owns a process's stdin and writes whatever arrives on its channel.
pub(crate) struct StdinWriter<W: AsyncWrite + Send + Unpin> {
    writer: W,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl<W: AsyncWrite + Send + Unpin> StdinWriter<W> {
    pub(crate) fn new(writer: W, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { writer, rx }
    }

    /// Write until every sender is dropped, then shut the stream down.
    pub(crate) async fn run(mut self) {
        while let Some(data) = self.rx.recv().await {
            trace!("stdin writer: writing {} bytes", data.len());
            if let Err(e) = self.writer.write_all(&data).await {
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    debug!("stdin writer: broken pipe");
                } else {
                    error!("stdin writer error: {}", e);
                }
                return;
            }
            if let Err(e) = self.writer.flush().await {
                error!("stdin writer flush error: {}", e);
                return;
            }
        }

        debug!("stdin writer: channel closed");
        if let Err(e) = self.writer.shutdown().await {
            debug!("stdin writer shutdown: {}", e);
        }
    }
}

/// Copy `source` into an input channel until EOF or the channel closes.
pub(crate) async fn feed_source<R>(mut source: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    debug!("stdin source: input channel closed");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("stdin source read error: {}", e);
                break;
            }
        }
    }
}

/// Copy `source` straight into a process stdin and close it at EOF.
pub(crate) async fn copy_to_stdin<R, W>(mut source: R, mut stdin: W)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    match tokio::io::copy(&mut source, &mut stdin).await {
        Ok(n) => trace!("stdin source: copied {} bytes", n),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("stdin source: process closed its input")
        }
        Err(e) => error!("stdin source copy error: {}", e),
    }
    if let Err(e) = stdin.shutdown().await {
        debug!("stdin shutdown: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_pump_basic() {
        let data = b"Hello, World!\nTest line 2\n";
        let (tx, mut rx) = mpsc::channel(32);
        let pump = StreamPump::new(Cursor::new(data.to_vec()), OutputSource::Stdout, tx);

        let handle = tokio::spawn(pump.with_buffer_size(8).run());

        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            assert_eq!(chunk.source, OutputSource::Stdout);
            received.extend(chunk.raw);
        }

        assert_eq!(received, data);
        assert_eq!(handle.await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_stream_pump_mock_reads() {
        let reader = tokio_test::io::Builder::new()
            .read(b"first ")
            .wait(Duration::from_millis(10))
            .read(b"second")
            .build();
        let (tx, mut rx) = mpsc::channel(4);

        tokio::spawn(StreamPump::new(reader, OutputSource::Stderr, tx).run());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "first ");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.text, "second");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_pump_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let pump = StreamPump::new(Cursor::new(vec![1u8; 64]), OutputSource::Stdout, tx);
        let result = tokio::time::timeout(Duration::from_millis(500), pump.run()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_output_pumps_merges_streams() {
        let mut rx = spawn_output_pumps(
            Cursor::new(b"out".to_vec()),
            Cursor::new(b"err".to_vec()),
        );

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = rx.recv().await {
            match chunk.source {
                OutputSource::Stdout => stdout.extend(chunk.raw),
                OutputSource::Stderr => stderr.extend(chunk.raw),
                OutputSource::Combined => unreachable!(),
            }
        }
        assert_eq!(stdout, b"out");
        assert_eq!(stderr, b"err");
    }

    #[tokio::test]
    async fn test_stdin_writer_writes_in_order() {
        let writer = tokio_test::io::Builder::new()
            .write(b"echo one\n")
            .write(b"echo two\n")
            .build();
        let (tx, rx) = mpsc::channel(4);

        tx.send(b"echo one\n".to_vec()).await.unwrap();
        tx.send(b"echo two\n".to_vec()).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), StdinWriter::new(writer, rx).run())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_feed_source_forwards_all_bytes() {
        let (tx, mut rx) = mpsc::channel(4);
        feed_source(Cursor::new(b"abc".to_vec()), tx).await;

        let mut received = Vec::new();
        while let Some(data) = rx.recv().await {
            received.extend(data);
        }
        assert_eq!(received, b"abc");
    }

    #[tokio::test]
    async fn test_copy_to_stdin() {
        let (mut client, server) = tokio::io::duplex(64);
        copy_to_stdin(Cursor::new(b"payload".to_vec()), server).await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"payload");
    }
}
