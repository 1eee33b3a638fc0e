use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

/// Upper bound on a single frame (tag + payload). Guards the reader against
/// allocating whatever length a corrupt prefix claims.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Bytes a FileChunk frame body spends on everything but the data: tag, two
/// ids, sequence and length varints, rounded up.
pub const CHUNK_FRAME_OVERHEAD: usize = 64;

/// Largest chunk payload that still fits in one frame.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - CHUNK_FRAME_OVERHEAD;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Unknown message tag {0}")]
    UnknownTag(u8),
    #[error("Empty frame")]
    Empty,
    #[error("Frame of {0} bytes exceeds maximum size")]
    TooLarge(usize),
    #[error("Stream ended in the middle of a frame")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Discriminant written in front of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Config = 1,
    File = 2,
    FileChunk = 3,
    Close = 4,
    ConnectionClose = 5,
}

impl TryFrom<u8> for Tag {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Tag::Config),
            2 => Ok(Tag::File),
            3 => Ok(Tag::FileChunk),
            4 => Ok(Tag::Close),
            5 => Ok(Tag::ConnectionClose),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

/// Opens a session. Thread count and working directory are informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub connection_id: Uuid,
    pub read_buffer_size: u32,
    pub threads: u16,
    pub working_directory: String,
}

/// One regular file queued for transfer, also the payload of a File frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub name: String,
    /// Directory of the file relative to the source root, `/`-separated,
    /// empty for files directly under the root.
    pub relative_path: String,
    pub size: u64,
}

impl FileDescriptor {
    /// `relative_path/name`, as shown to the user.
    pub fn display_path(&self) -> String {
        if self.relative_path.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.relative_path, self.name)
        }
    }

    /// Location of the file beneath `root`.
    pub fn path_under(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(self.relative_path.split('/').filter(|c| !c.is_empty()));
        path.push(&self.name);
        path
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub seq: u64,
    pub data: Vec<u8>,
}

/// End of the file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionClose {
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Config(Config),
    File(FileDescriptor),
    FileChunk(FileChunk),
    Close(Close),
    ConnectionClose(ConnectionClose),
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Config(_) => Tag::Config,
            Message::File(_) => Tag::File,
            Message::FileChunk(_) => Tag::FileChunk,
            Message::Close(_) => Tag::Close,
            Message::ConnectionClose(_) => Tag::ConnectionClose,
        }
    }
}

/// Serializes `msg` into one complete frame: `[u32 len][u8 tag][payload]`,
/// where `len` counts the tag and payload bytes.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let mut frame = vec![0u8; LEN_PREFIX];
    frame.push(msg.tag() as u8);
    frame = match msg {
        Message::Config(m) => postcard::to_extend(m, frame)?,
        Message::File(m) => postcard::to_extend(m, frame)?,
        Message::FileChunk(m) => postcard::to_extend(m, frame)?,
        Message::Close(m) => postcard::to_extend(m, frame)?,
        Message::ConnectionClose(m) => postcard::to_extend(m, frame)?,
    };
    let body_len = frame.len() - LEN_PREFIX;
    if body_len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body_len));
    }
    frame[..LEN_PREFIX].copy_from_slice(&(body_len as u32).to_be_bytes());
    Ok(frame)
}

/// Decodes a frame body (tag followed by payload).
pub fn decode(body: &[u8]) -> Result<Message> {
    let (&tag, payload) = body.split_first().ok_or(FrameError::Empty)?;
    let msg = match Tag::try_from(tag)? {
        Tag::Config => Message::Config(postcard::from_bytes(payload)?),
        Tag::File => Message::File(postcard::from_bytes(payload)?),
        Tag::FileChunk => Message::FileChunk(postcard::from_bytes(payload)?),
        Tag::Close => Message::Close(postcard::from_bytes(payload)?),
        Tag::ConnectionClose => Message::ConnectionClose(postcard::from_bytes(payload)?),
    };
    Ok(msg)
}

/// Reads exactly one frame. Returns `Ok(None)` when the stream closes cleanly
/// on a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_buf = [0u8; LEN_PREFIX];
    let n = reader.read(&mut len_buf).await?;
    if n == 0 {
        return Ok(None);
    }
    read_exact_or_truncated(reader, &mut len_buf[n..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    read_exact_or_truncated(reader, &mut body).await?;
    decode(&body).map(Some)
}

async fn read_exact_or_truncated<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
        Err(e) => Err(e.into()),
    }
}
