use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::{config::SessionConfig, scheduler};

pub async fn run(
    host: String,
    port: u16,
    working_dir: PathBuf,
    threads: u16,
    buffer_size: usize,
) -> Result<()> {
    let root = std::fs::canonicalize(&working_dir)
        .with_context(|| format!("Failed to resolve working directory {:?}", working_dir))?;
    if !root.is_dir() {
        anyhow::bail!("{:?} is not a directory", root);
    }
    let config = Arc::new(SessionConfig::new(host, port, root, buffer_size, threads)?);

    info!("Connecting to {}:{}...", config.host, config.port);
    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to connect to {}:{}", config.host, config.port))?;
    info!("Connected! Session {}", config.connection_id);

    let (summary, _) = scheduler::copy_tree(config, stream)
        .await
        .context("Transfer aborted")?;

    info!(
        "Sent {} files ({}) in {} rounds",
        summary.files_sent,
        bytesize::ByteSize(summary.bytes_sent),
        summary.rounds
    );
    if summary.files_failed > 0 {
        warn!("{} files could not be sent", summary.files_failed);
    }
    Ok(())
}
