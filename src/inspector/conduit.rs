//! Bounded handoff between the runtime's copy-out stream and the tar
//! materializer.
//!
//! The producer runs as its own task and the consumer runs on the blocking
//! pool, started together and joined together: the producer's sends stall as
//! soon as the channel is full, so draining has to happen while it is still
//! running.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};
use futures::StreamExt;
use tokio::sync::mpsc;

use super::materialize::{self, MaterializeError, MaterializeSummary};
use crate::runtime::ByteStream;

/// Chunks buffered between producer and consumer.
pub const DEFAULT_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    #[error("copying the container filesystem failed: {0}")]
    Producer(#[source] io::Error),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error("extraction task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Create a conduit holding at most `capacity` in-flight chunks.
pub fn pipe(capacity: usize) -> (ConduitWriter, ConduitReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ConduitWriter { tx },
        ConduitReader {
            rx,
            chunk: Bytes::new(),
        },
    )
}

/// Async producer end.
pub struct ConduitWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ConduitWriter {
    /// Waits for room in the conduit. Fails with `BrokenPipe` once the reader is gone.
    pub async fn send(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "conduit reader closed"))
    }

    /// Hand an error to the reader so it stops where the producer stopped.
    pub async fn abort(self, err: &io::Error) {
        let forwarded = io::Error::new(err.kind(), err.to_string());
        let _ = self.tx.send(Err(forwarded)).await;
    }
}

/// Blocking consumer end. Must only be read from outside the async runtime
/// (e.g. inside `spawn_blocking`).
pub struct ConduitReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    chunk: Bytes,
}

impl Read for ConduitReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while !self.chunk.has_remaining() {
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.remaining());
        self.chunk.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}

/// Pump `source` into the conduit until it ends, fails, or the reader goes away.
async fn produce(mut source: ByteStream, writer: ConduitWriter) -> io::Result<u64> {
    let mut total = 0u64;
    while let Some(chunk) = source.next().await {
        match chunk {
            Ok(chunk) => {
                total += chunk.len() as u64;
                writer.send(chunk).await?;
            }
            Err(err) => {
                writer.abort(&err).await;
                return Err(err);
            }
        }
    }
    Ok(total)
}

/// Stream a tar archive from `source` onto disk under `destination`.
///
/// Returns once both sides have finished. The producer's error wins over the
/// consumer's; entries written before a failure stay on disk.
pub async fn extract(
    source: ByteStream,
    destination: &Path,
    capacity: usize,
) -> Result<MaterializeSummary, ConduitError> {
    let (writer, reader) = pipe(capacity);
    let destination: PathBuf = destination.to_path_buf();

    let producer = tokio::spawn(produce(source, writer));
    let consumer =
        tokio::task::spawn_blocking(move || materialize::materialize(reader, &destination));

    let (produced, consumed) = tokio::join!(producer, consumer);

    match produced? {
        Ok(bytes) => tracing::debug!(bytes, "Container filesystem copy finished"),
        // The reader stopped early; its own error explains why.
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
        Err(err) => return Err(ConduitError::Producer(err)),
    }

    Ok(consumed??)
}
