use std::path::PathBuf;
use uuid::Uuid;

use crate::protocol::MAX_CHUNK_SIZE;

/// Default read buffer size per chunk.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("thread count must be at least 1")]
    ZeroThreads,
    #[error("read buffer size must be at least 1 byte")]
    ZeroBufferSize,
    #[error("read buffer size {0} exceeds the maximum of {max}", max = u32::MAX)]
    BufferTooLarge(usize),
    #[error(
        "read buffer size {0} does not fit in one frame (at most {max} bytes)",
        max = MAX_CHUNK_SIZE
    )]
    BufferExceedsFrame(usize),
}

/// Identifies one copy operation. Built once before the session starts and
/// shared read-only with every component afterwards.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connection_id: Uuid,
    pub host: String,
    pub port: u16,
    pub root: PathBuf,
    pub read_buffer_size: usize,
    pub threads: u16,
}

impl SessionConfig {
    pub fn new(
        host: String,
        port: u16,
        root: PathBuf,
        read_buffer_size: usize,
        threads: u16,
    ) -> Result<Self, ConfigError> {
        if threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if read_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if u32::try_from(read_buffer_size).is_err() {
            return Err(ConfigError::BufferTooLarge(read_buffer_size));
        }
        if read_buffer_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::BufferExceedsFrame(read_buffer_size));
        }
        Ok(Self {
            connection_id: Uuid::new_v4(),
            host,
            port,
            root,
            read_buffer_size,
            threads,
        })
    }
}
