//! Put-transaction state machine.
//!
//! A [`PutTransaction`] buffers up to one pending write per [`FileKind`] for
//! a single `(guid, hash)` version.  Writes count their bytes against the
//! declared size; `finalize` succeeds only when every pending write is
//! complete, so a partially written version can never be published.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};

use vcache_types::{
    make_error, make_error_msg, AssetGuid, ContentHash, FileKind, Result, Status, TrxCode, TrxId,
};

/// Digest of one staged payload, used by the admission filter.
pub type PayloadDigest = [u8; 32];

/// Lifecycle of a put-transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxState {
    /// Accepting write streams.
    Open,
    /// Every pending write validated complete; content ready to publish.
    Committed,
    /// A write ended short of its declared size.
    Failed,
    /// Explicitly discarded by the caller.
    Invalidated,
}

/// Where a transaction stages its pending bytes.
#[derive(Debug, Clone)]
pub enum StagingMode {
    /// Buffer in memory (paged backend).
    Memory,
    /// Stage to files under the given per-transaction directory
    /// (filesystem backend).
    Directory(PathBuf),
}

enum WriteSink {
    Buffer(Vec<u8>),
    File {
        path: PathBuf,
        file: Option<tokio::fs::File>,
    },
}

struct PendingWrite {
    kind: FileKind,
    declared_size: u64,
    bytes_written: u64,
    hasher: Sha256,
    sink: WriteSink,
}

/// Bytes of one completed file, either still staged or already committed.
#[derive(Debug, Clone)]
pub enum FileSource {
    Buffer(Bytes),
    Path(PathBuf),
}

/// One completed file of a finalized transaction.
#[derive(Debug, Clone)]
pub struct TrxFile {
    pub kind: FileKind,
    pub size: u64,
    pub digest: PayloadDigest,
    pub source: FileSource,
}

struct TrxInner {
    state: TrxState,
    pending: Vec<PendingWrite>,
    /// Kinds whose last byte has arrived, in arrival order.
    completed_order: Vec<FileKind>,
    manifest: Vec<FileKind>,
    files: Vec<TrxFile>,
}

/// An ephemeral staging object for one upload of a `(guid, hash)` version.
#[derive(Clone)]
pub struct PutTransaction {
    id: TrxId,
    guid: AssetGuid,
    hash: ContentHash,
    staging: StagingMode,
    inner: Arc<Mutex<TrxInner>>,
    finalize_tx: Arc<watch::Sender<bool>>,
}

impl PutTransaction {
    pub fn new(id: TrxId, guid: AssetGuid, hash: ContentHash, staging: StagingMode) -> Self {
        let (finalize_tx, _) = watch::channel(false);
        Self {
            id,
            guid,
            hash,
            staging,
            inner: Arc::new(Mutex::new(TrxInner {
                state: TrxState::Open,
                pending: Vec::new(),
                completed_order: Vec::new(),
                manifest: Vec::new(),
                files: Vec::new(),
            })),
            finalize_tx: Arc::new(finalize_tx),
        }
    }

    pub fn id(&self) -> TrxId {
        self.id
    }

    pub fn guid(&self) -> AssetGuid {
        self.guid
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub async fn state(&self) -> TrxState {
        self.inner.lock().await.state
    }

    /// Whether the transaction is still publishable: not invalidated and not
    /// failed by an incomplete write.
    pub async fn is_valid(&self) -> bool {
        !matches!(
            self.inner.lock().await.state,
            TrxState::Failed | TrxState::Invalidated
        )
    }

    /// Kinds whose writes completed, in completion order. Empty until
    /// finalize succeeds.
    pub async fn manifest(&self) -> Vec<FileKind> {
        self.inner.lock().await.manifest.clone()
    }

    /// Completed files. Empty until finalize succeeds.
    pub async fn files(&self) -> Vec<TrxFile> {
        self.inner.lock().await.files.clone()
    }

    /// Per-kind payload digests of the completed files, in manifest order.
    pub async fn file_digests(&self) -> Vec<(FileKind, PayloadDigest)> {
        self.inner
            .lock()
            .await
            .files
            .iter()
            .map(|f| (f.kind, f.digest))
            .collect()
    }

    /// Subscribe to the finalize notification.  The channel value flips to
    /// `true` exactly once, when finalize succeeds; late subscribers observe
    /// the already-fired state.
    pub fn subscribe_finalize(&self) -> watch::Receiver<bool> {
        self.finalize_tx.subscribe()
    }

    /// Open a counting write stream for one kind.
    ///
    /// `declared_size` must be positive and each kind may be written at most
    /// once per transaction.
    pub async fn get_write_stream(
        &self,
        kind: FileKind,
        declared_size: u64,
    ) -> Result<WriteStream> {
        if declared_size == 0 {
            return Err(Status::invalid_arg("declared size must be positive"));
        }

        let mut inner = self.inner.lock().await;
        if inner.state != TrxState::Open {
            return make_error_msg(
                TrxCode::ALREADY_FINALIZED,
                format!("transaction {} is no longer open", self.id),
            );
        }
        if inner.pending.iter().any(|p| p.kind == kind) {
            return make_error_msg(
                TrxCode::DUPLICATE_KIND,
                format!("kind '{}' already has a write stream", kind),
            );
        }

        let sink = match &self.staging {
            StagingMode::Memory => WriteSink::Buffer(Vec::with_capacity(declared_size as usize)),
            StagingMode::Directory(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let path = dir.join(kind.as_char().to_string());
                let file = tokio::fs::File::create(&path).await?;
                WriteSink::File {
                    path,
                    file: Some(file),
                }
            }
        };

        inner.pending.push(PendingWrite {
            kind,
            declared_size,
            bytes_written: 0,
            hasher: Sha256::new(),
            sink,
        });

        Ok(WriteStream {
            kind,
            declared_size,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Validate every pending write and seal the transaction.
    ///
    /// On success the manifest and file list are populated and the finalize
    /// notification fires.  An incomplete write fails the transaction with
    /// `IncompleteWrite`; nothing is published either way (publication is the
    /// engine's job).
    pub async fn finalize(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            TrxState::Open => {}
            TrxState::Invalidated => {
                return make_error_msg(
                    TrxCode::INVALIDATED,
                    format!("transaction {} was invalidated", self.id),
                )
            }
            _ => {
                return make_error_msg(
                    TrxCode::ALREADY_FINALIZED,
                    format!("transaction {} already finalized", self.id),
                )
            }
        }

        for pw in &inner.pending {
            if pw.bytes_written != pw.declared_size {
                let msg = format!(
                    "kind '{}' wrote {} of {} declared bytes",
                    pw.kind, pw.bytes_written, pw.declared_size
                );
                inner.state = TrxState::Failed;
                return make_error_msg(TrxCode::INCOMPLETE_WRITE, msg);
            }
        }

        let pending = std::mem::take(&mut inner.pending);
        let mut files = Vec::with_capacity(pending.len());
        for pw in pending {
            let digest: PayloadDigest = pw.hasher.finalize().into();
            let source = match pw.sink {
                WriteSink::Buffer(buf) => FileSource::Buffer(Bytes::from(buf)),
                WriteSink::File { path, file } => {
                    if let Some(file) = file {
                        if let Err(e) = file.sync_all().await {
                            inner.state = TrxState::Failed;
                            return Err(e.into());
                        }
                    }
                    FileSource::Path(path)
                }
            };
            files.push(TrxFile {
                kind: pw.kind,
                size: pw.declared_size,
                digest,
                source,
            });
        }

        // Report files in the order their writes completed.
        let order = inner.completed_order.clone();
        files.sort_by_key(|f| order.iter().position(|k| *k == f.kind));

        inner.manifest = order;
        inner.files = files;
        inner.state = TrxState::Committed;
        self.finalize_tx.send_replace(true);
        Ok(())
    }

    /// Discard the transaction.  Clears the manifest and file list; safe to
    /// call in any state, including after a successful finalize.
    pub async fn invalidate(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = TrxState::Invalidated;
            inner.pending.clear();
            inner.completed_order.clear();
            inner.manifest.clear();
            inner.files.clear();
        }
        self.discard_staging().await;
    }

    /// Remove any staged on-disk bytes.  Called by engines when a version is
    /// held back or dropped instead of committed.
    pub async fn discard_staging(&self) {
        if let StagingMode::Directory(dir) = &self.staging {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        trx_id = %self.id,
                        dir = %dir.display(),
                        error = %e,
                        "failed to remove staging directory"
                    );
                }
            }
        }
    }

    /// Repoint one completed file at its committed location.  Used by the
    /// filesystem backend after the atomic rename so the bytes stay
    /// reachable for [`Self::write_files_to_path`].
    pub async fn set_file_path(&self, kind: FileKind, path: PathBuf) {
        let mut inner = self.inner.lock().await;
        if let Some(f) = inner.files.iter_mut().find(|f| f.kind == kind) {
            f.source = FileSource::Path(path);
        }
    }

    /// Materialize each completed file into `target`, returning the written
    /// paths.  Valid only after a successful finalize.
    pub async fn write_files_to_path(&self, target: &Path) -> Result<Vec<PathBuf>> {
        let inner = self.inner.lock().await;
        if inner.state != TrxState::Committed {
            return make_error(TrxCode::NOT_FINALIZED);
        }

        tokio::fs::create_dir_all(target).await?;
        let mut written = Vec::with_capacity(inner.files.len());
        for f in &inner.files {
            let dest = target.join(format!("{}-{}.{}", self.guid, self.hash, f.kind));
            match &f.source {
                FileSource::Buffer(bytes) => tokio::fs::write(&dest, bytes).await?,
                FileSource::Path(path) => {
                    tokio::fs::copy(path, &dest).await?;
                }
            }
            written.push(dest);
        }
        Ok(written)
    }
}

impl std::fmt::Debug for PutTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutTransaction")
            .field("id", &self.id)
            .field("guid", &self.guid)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// A counting writer bound to one pending write slot.
pub struct WriteStream {
    kind: FileKind,
    declared_size: u64,
    inner: Arc<Mutex<TrxInner>>,
}

impl std::fmt::Debug for WriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStream")
            .field("kind", &self.kind)
            .field("declared_size", &self.declared_size)
            .finish_non_exhaustive()
    }
}

impl WriteStream {
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    /// Append bytes to the staged payload.
    ///
    /// Writing past the declared size fails with `WriteOverflow` and leaves
    /// the counter untouched.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != TrxState::Open {
            return make_error(TrxCode::ALREADY_FINALIZED);
        }

        let idx = inner
            .pending
            .iter()
            .position(|p| p.kind == self.kind)
            .ok_or_else(|| Status::invalid_arg("write stream has no pending slot"))?;

        {
            let pw = &mut inner.pending[idx];
            let new_total = pw.bytes_written + data.len() as u64;
            if new_total > pw.declared_size {
                return make_error_msg(
                    TrxCode::WRITE_OVERFLOW,
                    format!(
                        "kind '{}': {} bytes exceed declared size {}",
                        pw.kind, new_total, pw.declared_size
                    ),
                );
            }
            match &mut pw.sink {
                WriteSink::Buffer(buf) => buf.extend_from_slice(data),
                WriteSink::File { file, .. } => match file {
                    Some(file) => file.write_all(data).await?,
                    None => return Err(Status::io("staging file already closed")),
                },
            }
            pw.hasher.update(data);
            pw.bytes_written = new_total;
        }

        let done = inner.pending[idx].bytes_written == inner.pending[idx].declared_size;
        if done && !inner.completed_order.contains(&self.kind) {
            let kind = self.kind;
            inner.completed_order.push(kind);
        }
        Ok(())
    }

    /// Flush the staged bytes.  Dropping the stream without closing is
    /// allowed; completion is judged by the byte count at finalize.
    pub async fn close(self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(pw) = inner.pending.iter_mut().find(|p| p.kind == self.kind) {
            if let WriteSink::File { file, .. } = &mut pw.sink {
                if let Some(file) = file {
                    file.flush().await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid() -> AssetGuid {
        AssetGuid::from_bytes([0x01; 16])
    }

    fn hash() -> ContentHash {
        ContentHash::from_bytes([0x02; 16])
    }

    fn memory_trx() -> PutTransaction {
        PutTransaction::new(TrxId(1), guid(), hash(), StagingMode::Memory)
    }

    #[tokio::test]
    async fn test_write_and_finalize() {
        let trx = memory_trx();
        let mut stream = trx.get_write_stream(FileKind::Info, 4).await.unwrap();
        stream.write(b"ab").await.unwrap();
        stream.write(b"cd").await.unwrap();
        stream.close().await.unwrap();

        trx.finalize().await.unwrap();
        assert_eq!(trx.state().await, TrxState::Committed);
        assert!(trx.is_valid().await);

        let files = trx.files().await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, FileKind::Info);
        assert_eq!(files[0].size, 4);
        match &files[0].source {
            FileSource::Buffer(bytes) => assert_eq!(&bytes[..], b"abcd"),
            FileSource::Path(_) => panic!("memory staging should buffer"),
        }
    }

    #[tokio::test]
    async fn test_zero_declared_size_rejected() {
        let trx = memory_trx();
        let err = trx
            .get_write_stream(FileKind::Asset, 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), vcache_types::StatusCode::INVALID_ARG);
    }

    #[tokio::test]
    async fn test_duplicate_kind_rejected() {
        let trx = memory_trx();
        let _first = trx.get_write_stream(FileKind::Info, 8).await.unwrap();
        let err = trx.get_write_stream(FileKind::Info, 8).await.unwrap_err();
        assert_eq!(err.code(), TrxCode::DUPLICATE_KIND);
    }

    #[tokio::test]
    async fn test_incomplete_write_fails_finalize() {
        let trx = memory_trx();
        let mut stream = trx.get_write_stream(FileKind::Info, 1024).await.unwrap();
        stream.write(&[0xAA]).await.unwrap();

        let err = trx.finalize().await.unwrap_err();
        assert_eq!(err.code(), TrxCode::INCOMPLETE_WRITE);
        assert_eq!(trx.state().await, TrxState::Failed);
        assert!(!trx.is_valid().await);
        assert!(trx.files().await.is_empty());
    }

    #[tokio::test]
    async fn test_write_overflow_rejected() {
        let trx = memory_trx();
        let mut stream = trx.get_write_stream(FileKind::Asset, 4).await.unwrap();
        stream.write(b"abcd").await.unwrap();
        let err = stream.write(b"e").await.unwrap_err();
        assert_eq!(err.code(), TrxCode::WRITE_OVERFLOW);

        // The complete write is still valid.
        trx.finalize().await.unwrap();
        assert_eq!(trx.manifest().await, vec![FileKind::Asset]);
    }

    #[tokio::test]
    async fn test_manifest_in_completion_order() {
        let trx = memory_trx();
        let mut info = trx.get_write_stream(FileKind::Info, 2).await.unwrap();
        let mut asset = trx.get_write_stream(FileKind::Asset, 2).await.unwrap();

        // Asset finishes first even though info's stream was opened first.
        asset.write(b"xy").await.unwrap();
        info.write(b"ab").await.unwrap();

        trx.finalize().await.unwrap();
        assert_eq!(
            trx.manifest().await,
            vec![FileKind::Asset, FileKind::Info]
        );
        let files = trx.files().await;
        assert_eq!(files[0].kind, FileKind::Asset);
        assert_eq!(files[1].kind, FileKind::Info);
    }

    #[tokio::test]
    async fn test_finalize_twice_rejected() {
        let trx = memory_trx();
        trx.finalize().await.unwrap();
        let err = trx.finalize().await.unwrap_err();
        assert_eq!(err.code(), TrxCode::ALREADY_FINALIZED);
    }

    #[tokio::test]
    async fn test_invalidate_clears_results() {
        let trx = memory_trx();
        let mut stream = trx.get_write_stream(FileKind::Info, 2).await.unwrap();
        stream.write(b"ab").await.unwrap();
        trx.finalize().await.unwrap();
        assert!(!trx.files().await.is_empty());

        trx.invalidate().await;
        assert!(!trx.is_valid().await);
        assert!(trx.files().await.is_empty());
        assert!(trx.manifest().await.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_after_invalidate_rejected() {
        let trx = memory_trx();
        trx.invalidate().await;
        let err = trx.finalize().await.unwrap_err();
        assert_eq!(err.code(), TrxCode::INVALIDATED);
    }

    #[tokio::test]
    async fn test_write_after_finalize_rejected() {
        let trx = memory_trx();
        let mut stream = trx.get_write_stream(FileKind::Info, 4).await.unwrap();
        stream.write(b"ab").await.unwrap();
        // Finalize fails (incomplete), after which the stream is dead.
        let _ = trx.finalize().await;
        let err = stream.write(b"cd").await.unwrap_err();
        assert_eq!(err.code(), TrxCode::ALREADY_FINALIZED);
    }

    #[tokio::test]
    async fn test_digests_match_payload() {
        let trx = memory_trx();
        let mut stream = trx.get_write_stream(FileKind::Info, 3).await.unwrap();
        stream.write(b"abc").await.unwrap();
        trx.finalize().await.unwrap();

        let digests = trx.file_digests().await;
        assert_eq!(digests.len(), 1);
        let expected: PayloadDigest = Sha256::digest(b"abc").into();
        assert_eq!(digests[0], (FileKind::Info, expected));
    }

    #[tokio::test]
    async fn test_finalize_event_fires_once() {
        let trx = memory_trx();
        let mut rx = trx.subscribe_finalize();
        assert!(!*rx.borrow());

        trx.finalize().await.unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        // A late subscriber sees the fired state without waiting.
        let late = trx.subscribe_finalize();
        assert!(*late.borrow());
    }

    #[tokio::test]
    async fn test_directory_staging_writes_files() {
        let dir = std::env::temp_dir().join("vcache-test-trx-staging");
        let _ = std::fs::remove_dir_all(&dir);

        let trx = PutTransaction::new(
            TrxId(7),
            guid(),
            hash(),
            StagingMode::Directory(dir.clone()),
        );
        let mut stream = trx.get_write_stream(FileKind::Resource, 5).await.unwrap();
        stream.write(b"12345").await.unwrap();
        stream.close().await.unwrap();
        trx.finalize().await.unwrap();

        let staged = dir.join("r");
        assert_eq!(std::fs::read(&staged).unwrap(), b"12345");

        trx.discard_staging().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_write_files_to_path() {
        let target = std::env::temp_dir().join("vcache-test-trx-export");
        let _ = std::fs::remove_dir_all(&target);

        let trx = memory_trx();
        let mut stream = trx.get_write_stream(FileKind::Info, 4).await.unwrap();
        stream.write(b"data").await.unwrap();

        // Before finalize the export is rejected.
        let err = trx.write_files_to_path(&target).await.unwrap_err();
        assert_eq!(err.code(), TrxCode::NOT_FINALIZED);

        trx.finalize().await.unwrap();
        let written = trx.write_files_to_path(&target).await.unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(std::fs::read(&written[0]).unwrap(), b"data");
        assert!(written[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(".i"));

        let _ = std::fs::remove_dir_all(&target);
    }
}
