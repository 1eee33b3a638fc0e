use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{self, FileChunk, FileDescriptor, FrameError, Message};

/// Protocol violations. Any of these ends the connection.
#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error("{0:?} frame received before Config")]
    MissingConfig(protocol::Tag),
    #[error("Config received twice")]
    DuplicateConfig,
    #[error("frame for connection {got} on connection {expected}")]
    ConnectionMismatch { expected: Uuid, got: Uuid },
    #[error("file {0} announced twice")]
    DuplicateFile(Uuid),
    #[error("chunk for unannounced file {0}")]
    UnknownFile(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ReassemblyError),
    #[error("connection closed before ConnectionClose")]
    UnexpectedEof,
}

/// Destination of one reassembled file.
pub trait FileSink: Send {
    fn append(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
    fn finish(self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Opens a sink for each announced file.
pub trait SinkFactory: Send {
    type Sink: FileSink;

    fn create(
        &mut self,
        file: &FileDescriptor,
    ) -> impl Future<Output = io::Result<Self::Sink>> + Send;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub files_completed: u64,
    pub files_failed: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// ConnectionClose seen; all session state has been released.
    Closed,
}

struct Partial<S> {
    file: FileDescriptor,
    sink: S,
    next_seq: u64,
    received: u64,
}

/// Rebuilds files from an interleaved stream of File and FileChunk frames of
/// one connection. Failures of a single file are logged and counted; only
/// protocol violations are returned as errors.
pub struct Reassembler<F: SinkFactory> {
    factory: F,
    connection_id: Option<Uuid>,
    /// Every file announced on this connection, by display path.
    announced: HashMap<Uuid, String>,
    open: HashMap<Uuid, Partial<F::Sink>>,
    /// Files that failed; their remaining chunks are dropped.
    abandoned: HashSet<Uuid>,
    summary: ReceiveSummary,
}

impl<F: SinkFactory> Reassembler<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            connection_id: None,
            announced: HashMap::new(),
            open: HashMap::new(),
            abandoned: HashSet::new(),
            summary: ReceiveSummary::default(),
        }
    }

    pub fn summary(&self) -> &ReceiveSummary {
        &self.summary
    }

    pub async fn handle(&mut self, msg: Message) -> Result<Flow, ReassemblyError> {
        let connection_id = match self.connection_id {
            Some(id) => id,
            None => match msg {
                Message::Config(config) => {
                    info!(
                        "Session {} from {} ({} byte chunks, {} threads)",
                        config.connection_id,
                        config.working_directory,
                        config.read_buffer_size,
                        config.threads
                    );
                    self.connection_id = Some(config.connection_id);
                    return Ok(Flow::Continue);
                }
                other => return Err(ReassemblyError::MissingConfig(other.tag())),
            },
        };

        match msg {
            Message::Config(_) => return Err(ReassemblyError::DuplicateConfig),
            Message::File(file) => {
                check_connection(connection_id, file.connection_id)?;
                self.open_file(file).await?;
            }
            Message::FileChunk(chunk) => {
                check_connection(connection_id, chunk.connection_id)?;
                self.append_chunk(chunk).await?;
            }
            Message::Close(close) => {
                check_connection(connection_id, close.connection_id)?;
                self.fail_incomplete();
            }
            Message::ConnectionClose(close) => {
                check_connection(connection_id, close.connection_id)?;
                self.fail_incomplete();
                self.announced.clear();
                self.abandoned.clear();
                self.connection_id = None;
                return Ok(Flow::Closed);
            }
        }
        Ok(Flow::Continue)
    }

    async fn open_file(&mut self, file: FileDescriptor) -> Result<(), ReassemblyError> {
        if self.announced.insert(file.id, file.display_path()).is_some() {
            return Err(ReassemblyError::DuplicateFile(file.id));
        }
        debug!("Receiving {} ({} bytes)", file.display_path(), file.size);

        let sink = match self.factory.create(&file).await {
            Ok(sink) => sink,
            Err(e) => {
                self.abandon(&file, format!("cannot create: {}", e));
                return Ok(());
            }
        };
        let partial = Partial {
            file,
            sink,
            next_seq: 0,
            received: 0,
        };
        if partial.file.size == 0 {
            self.complete(partial).await;
        } else {
            self.open.insert(partial.file.id, partial);
        }
        Ok(())
    }

    async fn append_chunk(&mut self, chunk: FileChunk) -> Result<(), ReassemblyError> {
        if self.abandoned.contains(&chunk.id) {
            return Ok(());
        }
        let Some(mut partial) = self.open.remove(&chunk.id) else {
            let Some(path) = self.announced.get(&chunk.id) else {
                return Err(ReassemblyError::UnknownFile(chunk.id));
            };
            // announced, not open, not abandoned: it already completed
            error!("Dropping {}: data past the declared size", path);
            self.abandoned.insert(chunk.id);
            self.summary.files_completed = self.summary.files_completed.saturating_sub(1);
            self.summary.files_failed += 1;
            return Ok(());
        };

        if chunk.seq != partial.next_seq {
            let reason = format!("expected chunk {}, got {}", partial.next_seq, chunk.seq);
            self.abandon(&partial.file, reason);
            return Ok(());
        }
        let len = chunk.data.len() as u64;
        if partial.received + len > partial.file.size {
            let reason = format!("more data than the declared {} bytes", partial.file.size);
            self.abandon(&partial.file, reason);
            return Ok(());
        }
        if let Err(e) = partial.sink.append(&chunk.data).await {
            self.abandon(&partial.file, format!("write failed: {}", e));
            return Ok(());
        }

        partial.next_seq += 1;
        partial.received += len;
        self.summary.bytes_received += len;
        if partial.received == partial.file.size {
            self.complete(partial).await;
        } else {
            self.open.insert(chunk.id, partial);
        }
        Ok(())
    }

    async fn complete(&mut self, partial: Partial<F::Sink>) {
        let Partial { file, sink, .. } = partial;
        match sink.finish().await {
            Ok(()) => {
                info!("Received {}", file.display_path());
                self.summary.files_completed += 1;
            }
            Err(e) => self.abandon(&file, format!("finish failed: {}", e)),
        }
    }

    fn abandon(&mut self, file: &FileDescriptor, reason: impl std::fmt::Display) {
        error!("Dropping {}: {}", file.display_path(), reason);
        self.abandoned.insert(file.id);
        self.summary.files_failed += 1;
    }

    fn fail_incomplete(&mut self) {
        for (id, partial) in self.open.drain() {
            warn!(
                "Incomplete file {}: {} of {} bytes received",
                partial.file.display_path(),
                partial.received,
                partial.file.size
            );
            self.abandoned.insert(id);
            self.summary.files_failed += 1;
        }
    }
}

fn check_connection(expected: Uuid, got: Uuid) -> Result<(), ReassemblyError> {
    if expected == got {
        Ok(())
    } else {
        Err(ReassemblyError::ConnectionMismatch { expected, got })
    }
}

/// Reads frames from `reader` until ConnectionClose, rebuilding files into
/// sinks from `factory`.
pub async fn receive<R, F>(mut reader: R, factory: F) -> Result<ReceiveSummary, ReceiveError>
where
    R: AsyncRead + Unpin,
    F: SinkFactory,
{
    let mut reassembler = Reassembler::new(factory);
    loop {
        let Some(msg) = protocol::read_frame(&mut reader).await? else {
            reassembler.fail_incomplete();
            return Err(ReceiveError::UnexpectedEof);
        };
        if reassembler.handle(msg).await? == Flow::Closed {
            return Ok(reassembler.summary().clone());
        }
    }
}

/// Writes reassembled files beneath a destination directory.
#[derive(Debug, Clone)]
pub struct DiskSinks {
    dest: PathBuf,
}

impl DiskSinks {
    pub fn new(dest: PathBuf) -> Self {
        Self { dest }
    }

    /// Resolves `file` beneath the destination, refusing anything that would
    /// escape it.
    pub fn target_path(&self, file: &FileDescriptor) -> io::Result<PathBuf> {
        let mut path = self.dest.clone();
        let parts = file
            .relative_path
            .split('/')
            .filter(|c| !c.is_empty())
            .chain(std::iter::once(file.name.as_str()));
        for part in parts {
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(c)), None) => path.push(c),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unsafe path component {:?}", part),
                    ))
                }
            }
        }
        Ok(path)
    }
}

impl SinkFactory for DiskSinks {
    type Sink = BufWriter<tokio::fs::File>;

    async fn create(&mut self, file: &FileDescriptor) -> io::Result<Self::Sink> {
        let path = self.target_path(file)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let out = tokio::fs::File::create(&path).await?;
        Ok(BufWriter::new(out))
    }
}

impl FileSink for BufWriter<tokio::fs::File> {
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await
    }

    async fn finish(mut self) -> io::Result<()> {
        self.flush().await?;
        self.into_inner().sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Close, Config, ConnectionClose};
    use crate::testutils::MemorySinks;

    struct Session {
        conn: Uuid,
    }

    impl Session {
        fn new() -> Self {
            Self { conn: Uuid::new_v4() }
        }

        fn config(&self) -> Message {
            Message::Config(Config {
                connection_id: self.conn,
                read_buffer_size: 2,
                threads: 2,
                working_directory: "/src".into(),
            })
        }

        fn file(&self, name: &str, size: u64) -> FileDescriptor {
            FileDescriptor {
                id: Uuid::new_v4(),
                connection_id: self.conn,
                name: name.into(),
                relative_path: String::new(),
                size,
            }
        }

        fn chunk(&self, file: &FileDescriptor, seq: u64, data: &[u8]) -> Message {
            Message::FileChunk(FileChunk {
                id: file.id,
                connection_id: self.conn,
                seq,
                data: data.to_vec(),
            })
        }

        fn close(&self) -> Message {
            Message::Close(Close {
                connection_id: self.conn,
            })
        }

        fn connection_close(&self) -> Message {
            Message::ConnectionClose(ConnectionClose {
                connection_id: self.conn,
            })
        }
    }

    async fn feed(
        reassembler: &mut Reassembler<MemorySinks>,
        frames: Vec<Message>,
    ) -> Result<Flow, ReassemblyError> {
        let mut flow = Flow::Continue;
        for frame in frames {
            flow = reassembler.handle(frame).await?;
        }
        Ok(flow)
    }

    #[tokio::test]
    async fn interleaved_files_are_demultiplexed() {
        let s = Session::new();
        let a = s.file("a", 4);
        let b = s.file("b", 3);
        let sinks = MemorySinks::default();
        let mut r = Reassembler::new(sinks.clone());

        let flow = feed(
            &mut r,
            vec![
                s.config(),
                Message::File(a.clone()),
                Message::File(b.clone()),
                s.chunk(&b, 0, b"xy"),
                s.chunk(&a, 0, b"12"),
                s.chunk(&b, 1, b"z"),
                s.chunk(&a, 1, b"34"),
                s.close(),
                s.connection_close(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(flow, Flow::Closed);
        assert_eq!(r.summary().files_completed, 2);
        assert_eq!(r.summary().files_failed, 0);
        assert_eq!(r.summary().bytes_received, 7);
        let files = sinks.files.lock().unwrap();
        assert_eq!(files["a"], b"1234");
        assert_eq!(files["b"], b"xyz");
    }

    #[tokio::test]
    async fn partially_sent_file_fails_alone_on_close() {
        let s = Session::new();
        let a = s.file("a", 4);
        let b = s.file("b", 1);
        let mut r = Reassembler::new(MemorySinks::default());

        feed(
            &mut r,
            vec![
                s.config(),
                Message::File(a.clone()),
                s.chunk(&a, 0, b"12"),
                Message::File(b.clone()),
                s.chunk(&b, 0, b"!"),
                s.close(),
                s.connection_close(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(r.summary().files_completed, 1);
        assert_eq!(r.summary().files_failed, 1);
    }

    #[tokio::test]
    async fn sequence_gap_abandons_the_file() {
        let s = Session::new();
        let a = s.file("a", 6);
        let mut r = Reassembler::new(MemorySinks::default());

        feed(
            &mut r,
            vec![
                s.config(),
                Message::File(a.clone()),
                s.chunk(&a, 0, b"12"),
                s.chunk(&a, 2, b"56"),
                s.chunk(&a, 1, b"34"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(r.summary().files_failed, 1);
        assert_eq!(r.summary().files_completed, 0);
    }

    #[tokio::test]
    async fn overflowing_the_declared_size_abandons_the_file() {
        let s = Session::new();
        let a = s.file("a", 1);
        let mut r = Reassembler::new(MemorySinks::default());

        feed(
            &mut r,
            vec![s.config(), Message::File(a.clone()), s.chunk(&a, 0, b"12")],
        )
        .await
        .unwrap();
        assert_eq!(r.summary().files_failed, 1);
    }

    #[tokio::test]
    async fn data_after_completion_fails_only_that_file() {
        let s = Session::new();
        let a = s.file("a", 2);
        let b = s.file("b", 2);
        let sinks = MemorySinks::default();
        let mut r = Reassembler::new(sinks.clone());

        let flow = feed(
            &mut r,
            vec![
                s.config(),
                Message::File(a.clone()),
                Message::File(b.clone()),
                s.chunk(&a, 0, b"12"),
                s.chunk(&a, 1, b"34"),
                s.chunk(&a, 2, b"56"),
                s.chunk(&b, 0, b"xy"),
                s.close(),
                s.connection_close(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(flow, Flow::Closed);
        assert_eq!(r.summary().files_completed, 1);
        assert_eq!(r.summary().files_failed, 1);
        assert_eq!(sinks.files.lock().unwrap()["b"], b"xy");
    }

    #[tokio::test]
    async fn frames_before_config_are_rejected() {
        let s = Session::new();
        let mut r = Reassembler::new(MemorySinks::default());
        let err = r.handle(Message::File(s.file("a", 1))).await.unwrap_err();
        assert!(matches!(err, ReassemblyError::MissingConfig(protocol::Tag::File)));
    }

    #[tokio::test]
    async fn chunk_for_unknown_file_is_rejected() {
        let s = Session::new();
        let ghost = s.file("ghost", 2);
        let mut r = Reassembler::new(MemorySinks::default());
        let err = feed(&mut r, vec![s.config(), s.chunk(&ghost, 0, b"..")])
            .await
            .unwrap_err();
        assert!(matches!(err, ReassemblyError::UnknownFile(id) if id == ghost.id));
    }

    #[tokio::test]
    async fn foreign_connection_is_rejected() {
        let s = Session::new();
        let other = Session::new();
        let mut r = Reassembler::new(MemorySinks::default());
        let err = feed(&mut r, vec![s.config(), Message::File(other.file("a", 1))])
            .await
            .unwrap_err();
        assert!(matches!(err, ReassemblyError::ConnectionMismatch { .. }));
    }

    #[tokio::test]
    async fn eof_before_connection_close_is_an_error() {
        let s = Session::new();
        let mut wire = protocol::encode(&s.config()).unwrap();
        wire.extend(protocol::encode(&s.close()).unwrap());
        let err = receive(wire.as_slice(), MemorySinks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiveError::UnexpectedEof));
    }

    #[test]
    fn target_path_refuses_to_escape() {
        let sinks = DiskSinks::new(PathBuf::from("/dest"));
        let s = Session::new();

        let mut file = s.file("ok.txt", 0);
        file.relative_path = "a/b".into();
        assert_eq!(sinks.target_path(&file).unwrap(), PathBuf::from("/dest/a/b/ok.txt"));

        file.relative_path = "../etc".into();
        assert!(sinks.target_path(&file).is_err());

        file.relative_path = String::new();
        file.name = "..".into();
        assert!(sinks.target_path(&file).is_err());
    }

    #[tokio::test]
    async fn disk_sinks_write_files() {
        let tmp = tempfile::tempdir().unwrap();
        let s = Session::new();
        let mut file = s.file("out.bin", 3);
        file.relative_path = "nested".into();

        let mut wire = Vec::new();
        for msg in [
            s.config(),
            Message::File(file.clone()),
            s.chunk(&file, 0, b"ab"),
            s.chunk(&file, 1, b"c"),
            s.close(),
            s.connection_close(),
        ] {
            wire.extend(protocol::encode(&msg).unwrap());
        }

        let summary = receive(wire.as_slice(), DiskSinks::new(tmp.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(summary.files_completed, 1);
        assert_eq!(std::fs::read(tmp.path().join("nested/out.bin")).unwrap(), b"abc");
    }
}
