use bytesize::ByteSize;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::debug;

use crate::config::SessionConfig;
use crate::progress::{self, BAR_WIDTH};
use crate::protocol::{FileChunk, FileDescriptor, Message};
use crate::session::{SessionError, TransferSession};

#[derive(Debug, thiserror::Error)]
pub enum SendFileError {
    #[error("error opening file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error reading file {path} after {chunks} chunks: {source}")]
    Read {
        path: String,
        chunks: u64,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl SendFileError {
    /// Whether the shared connection itself failed, as opposed to this file.
    pub fn is_transport(&self) -> bool {
        matches!(self, SendFileError::Session(SessionError::Transport(_)))
    }
}

/// Opens source files for reading.
pub trait FileSource: Send + Sync + 'static {
    type Reader: AsyncRead + Unpin + Send;

    fn open(&self, path: &Path) -> impl Future<Output = io::Result<Self::Reader>> + Send;
}

/// Reads files straight from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskSource;

impl FileSource for DiskSource {
    type Reader = tokio::fs::File;

    async fn open(&self, path: &Path) -> io::Result<tokio::fs::File> {
        tokio::fs::File::open(path).await
    }
}

/// Sends one file: a File frame followed by its chunks. Nothing is sent when
/// the file cannot be opened. Returns the number of payload bytes sent.
pub async fn send_file<W, S>(
    session: &TransferSession<W>,
    source: &S,
    config: &SessionConfig,
    file: &FileDescriptor,
) -> Result<u64, SendFileError>
where
    W: AsyncWrite + Unpin + Send,
    S: FileSource,
{
    let path = file.path_under(&config.root);
    let reader = source
        .open(&path)
        .await
        .map_err(|source| SendFileError::Open { path, source })?;

    println!("{} ({})", file.display_path(), ByteSize(file.size));
    stream_file(session, file, reader, config.read_buffer_size).await
}

/// Announces `file` and streams `reader` as sequenced chunks of at most
/// `buffer_size` bytes. A read error stops the file where it is.
pub async fn stream_file<W, R>(
    session: &TransferSession<W>,
    file: &FileDescriptor,
    mut reader: R,
    buffer_size: usize,
) -> Result<u64, SendFileError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin,
{
    session.send(&Message::File(file.clone())).await?;

    let mut buf = vec![0u8; buffer_size];
    let mut seq: u64 = 0;
    let mut bytes_sent: u64 = 0;
    let mut shown = None;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(SendFileError::Read {
                    path: file.display_path(),
                    chunks: seq,
                    source,
                })
            }
        };

        session
            .send(&Message::FileChunk(FileChunk {
                id: file.id,
                connection_id: file.connection_id,
                seq,
                data: buf[..n].to_vec(),
            }))
            .await?;
        seq += 1;
        bytes_sent += n as u64;

        redraw(&mut shown, seq, file, buffer_size);
    }

    // empty files never enter the loop
    redraw(&mut shown, seq, file, buffer_size);
    debug!("Sent {} in {} chunks", file.display_path(), seq);
    Ok(bytes_sent)
}

fn redraw(shown: &mut Option<usize>, chunks_sent: u64, file: &FileDescriptor, buffer_size: usize) {
    let (bar, bucket) = progress::render(chunks_sent, BAR_WIDTH, file, buffer_size);
    if shown.map_or(true, |last| bucket > last) {
        println!("{} {}", bar, file.display_path());
        *shown = Some(bucket);
    }
}
