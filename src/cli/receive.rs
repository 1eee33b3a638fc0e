use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::receiver::{self, DiskSinks};

pub async fn run(bind: String, port: u16, working_dir: PathBuf) -> Result<()> {
    tokio::fs::create_dir_all(&working_dir)
        .await
        .with_context(|| format!("Failed to create {:?}", working_dir))?;
    let dest = std::fs::canonicalize(&working_dir).context("Failed to resolve path")?;

    let listener = TcpListener::bind((bind.as_str(), port))
        .await
        .with_context(|| format!("Failed to listen on {}:{}", bind, port))?;
    info!("Listening on {}, writing to {:?}", listener.local_addr()?, dest);

    // Loop to accept incoming connections
    loop {
        let (stream, peer) = listener.accept().await?;
        let sinks = DiskSinks::new(dest.clone());
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, sinks).await {
                error!("Connection error from {}: {:?}", peer, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, sinks: DiskSinks) -> Result<()> {
    info!("Accepted connection from {}", peer);
    let summary = receiver::receive(stream, sinks).await?;
    info!(
        "Connection from {} closed: {} files received ({})",
        peer,
        summary.files_completed,
        bytesize::ByteSize(summary.bytes_received)
    );
    if summary.files_failed > 0 {
        warn!("{} files from {} are incomplete", summary.files_failed, peer);
    }
    Ok(())
}
