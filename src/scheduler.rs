use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::SessionConfig;
use crate::enumerate::enumerate;
use crate::protocol::FileDescriptor;
use crate::sender::{self, DiskSource, FileSource};
use crate::session::{SessionError, TransferSession};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub files_sent: u64,
    pub files_failed: u64,
    pub bytes_sent: u64,
    pub rounds: u64,
}

/// Drains `queue` in rounds of up to `config.threads` concurrent file
/// transfers. A round must finish completely before the next one starts.
///
/// Per-file failures are logged and counted, including a frame that cannot
/// be encoded. A transport failure lets the current round finish, then stops
/// the run.
pub async fn run<W, S>(
    session: Arc<TransferSession<W>>,
    source: Arc<S>,
    config: Arc<SessionConfig>,
    mut queue: VecDeque<FileDescriptor>,
) -> Result<TransferSummary, SessionError>
where
    W: AsyncWrite + Unpin + Send + 'static,
    S: FileSource,
{
    let mut summary = TransferSummary::default();

    while !queue.is_empty() {
        let take = queue.len().min(config.threads as usize);
        summary.rounds += 1;
        debug!(
            "Round {}: {} files, {} still queued",
            summary.rounds,
            take,
            queue.len() - take
        );

        let mut workers = JoinSet::new();
        for file in queue.drain(..take) {
            let session = session.clone();
            let source = source.clone();
            let config = config.clone();
            workers.spawn(async move {
                let result = sender::send_file(&session, source.as_ref(), &config, &file).await;
                (file, result)
            });
        }

        // barrier: wait until every worker of the round has reported
        let mut transport_failure = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(bytes))) => {
                    summary.files_sent += 1;
                    summary.bytes_sent += bytes;
                }
                Ok((file, Err(e))) => {
                    error!("Failed to send {}: {}", file.display_path(), e);
                    summary.files_failed += 1;
                    if e.is_transport() && transport_failure.is_none() {
                        transport_failure = Some(e);
                    }
                }
                Err(e) => {
                    error!("Transfer worker panicked: {}", e);
                    summary.files_failed += 1;
                }
            }
        }
        if let Some(sender::SendFileError::Session(e)) = transport_failure {
            return Err(e);
        }
    }

    Ok(summary)
}

/// Runs a whole copy over `writer`: Config, every file under the root, then
/// Close and ConnectionClose. Hands back the writer once closed.
pub async fn copy_tree<W>(
    config: Arc<SessionConfig>,
    writer: W,
) -> Result<(TransferSummary, W), SessionError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = Arc::new(TransferSession::new(config.connection_id, writer));
    session.open(&config).await?;

    let queue = enumerate(&config.root, config.connection_id);
    info!("Found {} files under {:?}", queue.len(), config.root);

    let summary = run(session.clone(), Arc::new(DiskSource), config, queue).await?;

    // every worker has been joined, so this is the last handle
    let session = Arc::into_inner(session).ok_or_else(|| {
        SessionError::Transport(std::io::Error::other("session still shared after transfer"))
    })?;
    let writer = session.close().await?;
    Ok((summary, writer))
}
