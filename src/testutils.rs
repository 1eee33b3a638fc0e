use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::protocol::{self, FileDescriptor, Message};
use crate::receiver::{FileSink, SinkFactory};

/// Writer that accepts a few bytes per call and yields between calls, so
/// unguarded concurrent writes would interleave.
#[derive(Default)]
pub struct TrickleWriter {
    pub written: Vec<u8>,
    ready: bool,
}

impl AsyncWrite for TrickleWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.ready {
            self.ready = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        self.ready = false;
        let n = buf.len().min(7);
        self.written.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Writer whose peer has gone away.
pub struct BrokenWriter;

impl AsyncWrite for BrokenWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Reader that yields `data` and then fails.
pub struct FailingReader {
    data: Option<Vec<u8>>,
}

impl FailingReader {
    pub fn after(data: &[u8]) -> Self {
        Self {
            data: Some(data.to_vec()),
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.data.take() {
            Some(data) => {
                buf.put_slice(&data[..data.len().min(buf.remaining())]);
                Poll::Ready(Ok(()))
            }
            None => Poll::Ready(Err(io::Error::other("device went away"))),
        }
    }
}

/// Reassembled files kept in memory, keyed by `relative/name`.
#[derive(Clone, Default)]
pub struct MemorySinks {
    pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

pub struct MemorySink {
    key: String,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl SinkFactory for MemorySinks {
    type Sink = MemorySink;

    async fn create(&mut self, file: &FileDescriptor) -> io::Result<MemorySink> {
        let key = file.display_path();
        self.files.lock().unwrap().insert(key.clone(), Vec::new());
        Ok(MemorySink {
            key,
            files: self.files.clone(),
        })
    }
}

impl FileSink for MemorySink {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .get_mut(&self.key)
            .expect("sink created")
            .extend_from_slice(data);
        Ok(())
    }

    async fn finish(self) -> io::Result<()> {
        Ok(())
    }
}

pub async fn decode_all(wire: &[u8]) -> Vec<Message> {
    let mut reader = wire;
    let mut frames = Vec::new();
    while let Some(msg) = protocol::read_frame(&mut reader).await.unwrap() {
        frames.push(msg);
    }
    frames
}
