// SPDX-License-Identifier: MIT

//! Async adapter over the sync encoder: stream a filesystem tree as
//! [Bytes] chunks.
//!
//! The encoder runs on the blocking pool and sends chunks through a
//! bounded channel, so it can work ahead of the consumer (hasher,
//! scanner, socket) while back-pressure bounds memory use.

use std::io::{self, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::mpsc;

use crate::dump::dump_path;

/// Default chunk size for yielded [Bytes] (64 KiB).
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered in the channel before the encoder blocks.
const CHANNEL_CAPACITY: usize = 4;

struct ChannelWriter {
    sender: mpsc::Sender<io::Result<Bytes>>,
    buffer: BytesMut,
    chunk_size: usize,
}

impl ChannelWriter {
    fn emit(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        self.sender
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "consumer dropped"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.buffer.len() >= self.chunk_size {
            self.emit()?;
        }
        let n = buf.len().min(self.chunk_size - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()
    }
}

/// A [Stream] of archive bytes for a filesystem path.
pub struct NarByteStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl NarByteStream {
    pub fn new(path: PathBuf) -> Self {
        Self::with_chunk_size(path, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(path: PathBuf, chunk_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            let mut writer = ChannelWriter {
                sender: tx.clone(),
                buffer: BytesMut::with_capacity(chunk_size),
                chunk_size,
            };
            let result = dump_path(&path, &mut writer).and_then(|()| writer.flush());
            if let Err(e) = result {
                // A send failure means the consumer went away; nothing
                // left to report to.
                if tx.blocking_send(Err(e)).is_err() {
                    tracing::debug!(path = %path.display(), "archive consumer dropped");
                }
            }
        });

        Self { rx }
    }
}

impl Stream for NarByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::NarByteStream;

    #[tokio::test]
    async fn streams_same_bytes_as_sync_dump() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("data"), vec![7u8; 100_000]).unwrap();

        let mut expected = Vec::new();
        crate::dump::dump_path(&root, &mut expected).unwrap();

        let mut stream = NarByteStream::with_chunk_size(root, 4096);
        let mut streamed = Vec::new();
        while let Some(chunk) = stream.next().await {
            streamed.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(expected, streamed);
    }

    #[tokio::test]
    async fn missing_path_yields_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = NarByteStream::new(dir.path().join("absent"));
        let first = stream.next().await.unwrap();
        assert!(first.is_err());
    }
}
