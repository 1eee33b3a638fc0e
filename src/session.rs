use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::protocol::{self, Close, Config, ConnectionClose, FrameError, Message};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// The one connection of a copy operation. Every frame goes through
/// [`TransferSession::send`], which holds the writer lock for the whole frame.
pub struct TransferSession<W> {
    connection_id: Uuid,
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> TransferSession<W> {
    pub fn new(connection_id: Uuid, writer: W) -> Self {
        Self {
            connection_id,
            writer: Mutex::new(writer),
        }
    }

    /// Writes `msg` as a single frame. Concurrent callers never interleave.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let frame = protocol::encode(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Announces the session to the receiver. Must precede any file frames.
    pub async fn open(&self, config: &SessionConfig) -> Result<()> {
        debug!("Opening session {}", self.connection_id);
        self.send(&Message::Config(Config {
            connection_id: self.connection_id,
            read_buffer_size: config.read_buffer_size as u32,
            threads: config.threads,
            working_directory: config.root.display().to_string(),
        }))
        .await
    }

    /// Ends the file list, closes the connection and hands back the writer.
    pub async fn close(self) -> Result<W> {
        info!("Closing connection {}", self.connection_id);
        self.send(&Message::Close(Close {
            connection_id: self.connection_id,
        }))
        .await?;
        self.send(&Message::ConnectionClose(ConnectionClose {
            connection_id: self.connection_id,
        }))
        .await?;
        let mut writer = self.writer.into_inner();
        writer.shutdown().await?;
        Ok(writer)
    }
}
