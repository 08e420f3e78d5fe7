//! Filesystem cache engine.
//!
//! Committed files are plain files in a hashed directory tree; the commit
//! step is an atomic rename per file, so a replace during an open read lets
//! the reader finish the pre-rename bytes.  The only engine-internal shared
//! state is the index of known keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use vcache_engine::{
    Admission, CacheConfig, FileInfo, FileSource, ICacheEngine, PutTransaction, ReadStream,
    ReliabilityFilter, StagingMode,
};
use vcache_types::{
    make_error, AssetGuid, ContentHash, FileKey, FileKind, Result, Status, StatusCode, TrxId,
    VersionKey,
};

use crate::layout::{self, STAGING_DIR};

struct FsState {
    config: CacheConfig,
    /// Keys known to be committed, with their sizes.  Filled by the init
    /// scan and maintained by commits.
    known: Arc<DashMap<FileKey, u64>>,
    reliability: Option<ReliabilityFilter>,
    /// Serializes the multi-file rename sequence of concurrent commits.
    commit_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Point-in-time usage numbers for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub files: usize,
    pub bytes: u64,
}

/// The filesystem backend.
pub struct FsCacheEngine {
    state: Mutex<Option<FsState>>,
    next_trx_id: AtomicU64,
}

impl Default for FsCacheEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FsCacheEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            next_trx_id: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> Result<FsStats> {
        let state_lock = self.state.lock();
        let state = state_lock
            .as_ref()
            .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;
        Ok(FsStats {
            files: state.known.len(),
            bytes: state.known.iter().map(|entry| *entry.value()).sum(),
        })
    }

    async fn scan_tree(config: &CacheConfig, known: &DashMap<FileKey, u64>) -> Result<()> {
        let mut dirs = tokio::fs::read_dir(&config.cache_path).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let prefix = dir.file_name().to_string_lossy().to_string();
            if prefix.len() != 2 {
                continue;
            }

            let mut files = tokio::fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().to_string();
                match layout::parse_file_name(&prefix, &name) {
                    Some(key) => {
                        let size = file.metadata().await?.len();
                        known.insert(key, size);
                    }
                    None => {
                        tracing::warn!(
                            path = %file.path().display(),
                            "ignoring unrecognized file in cache tree"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn check_visible(state: &FsState, key: &FileKey) -> Result<u64> {
        if let Some(filter) = &state.reliability {
            if !filter.is_locked(&key.version()) {
                return Err(Status::not_found(format!("{} not yet confirmed", key)));
            }
        }
        state
            .known
            .get(key)
            .map(|size| *size)
            .ok_or_else(|| Status::not_found(format!("{} not in cache", key)))
    }
}

#[async_trait]
impl ICacheEngine for FsCacheEngine {
    fn clustering(&self) -> bool {
        false
    }

    async fn init(&self, config: &CacheConfig) -> Result<()> {
        config.validate()?;

        // Soft reconfiguration on a live engine.
        {
            let mut state_lock = self.state.lock();
            if let Some(state) = state_lock.as_mut() {
                match (config.high_reliability, state.reliability.as_mut()) {
                    (true, Some(filter)) => filter.set_threshold(config.reliability_threshold),
                    (true, None) => {
                        let mut filter = ReliabilityFilter::new(config.reliability_threshold);
                        for entry in state.known.iter() {
                            filter.mark_locked(entry.key().version());
                        }
                        state.reliability = Some(filter);
                    }
                    (false, _) => state.reliability = None,
                }
                state.config = config.clone();
                tracing::info!(
                    high_reliability = config.high_reliability,
                    "filesystem cache reconfigured"
                );
                return Ok(());
            }
        }

        tokio::fs::create_dir_all(&config.cache_path).await?;

        // Drop leftover staging from a previous process.
        let staging_root = config.cache_path.join(STAGING_DIR);
        match tokio::fs::remove_dir_all(&staging_root).await {
            Ok(()) => tracing::info!("removed leftover staging directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let known = Arc::new(DashMap::new());
        Self::scan_tree(config, &known).await?;

        let mut reliability = config
            .high_reliability
            .then(|| ReliabilityFilter::new(config.reliability_threshold));
        if let Some(filter) = reliability.as_mut() {
            for entry in known.iter() {
                filter.mark_locked(entry.key().version());
            }
        }

        tracing::info!(
            cache_path = %config.cache_path.display(),
            files = known.len(),
            high_reliability = config.high_reliability,
            "filesystem cache initialized"
        );

        *self.state.lock() = Some(FsState {
            config: config.clone(),
            known,
            reliability,
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let state = self
            .state
            .lock()
            .take()
            .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;
        tracing::info!(files = state.known.len(), "filesystem cache shut down");
        Ok(())
    }

    async fn create_put_transaction(
        &self,
        guid: AssetGuid,
        hash: ContentHash,
    ) -> Result<PutTransaction> {
        let staging = {
            let state_lock = self.state.lock();
            let state = state_lock
                .as_ref()
                .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;
            state.config.cache_path.clone()
        };
        let id = TrxId(self.next_trx_id.fetch_add(1, Ordering::Relaxed) + 1);
        let dir = layout::staging_path(&staging, id);
        Ok(PutTransaction::new(
            id,
            guid,
            hash,
            StagingMode::Directory(dir),
        ))
    }

    async fn end_put_transaction(&self, trx: &PutTransaction) -> Result<()> {
        if self.state.lock().is_none() {
            return make_error(StatusCode::NOT_INITIALIZED);
        }

        trx.finalize().await?;
        let files = trx.files().await;
        let version = VersionKey::new(trx.guid(), trx.hash());

        let (cache_path, known, commit_lock, admitted) = {
            let mut state_lock = self.state.lock();
            let state = state_lock
                .as_mut()
                .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;

            let admitted = match state.reliability.as_mut() {
                Some(filter) => {
                    let digests = files.iter().map(|f| (f.kind, f.digest)).collect();
                    filter.observe(version, digests)
                }
                None => Admission::Admit,
            };
            (
                state.config.cache_path.clone(),
                Arc::clone(&state.known),
                Arc::clone(&state.commit_lock),
                admitted,
            )
        };

        match admitted {
            Admission::Hold => {
                tracing::debug!(%version, "version held for confirmation");
                trx.discard_staging().await;
                return Ok(());
            }
            Admission::AlreadyLocked => {
                tracing::warn!(%version, "upload for locked version ignored");
                trx.discard_staging().await;
                return Ok(());
            }
            Admission::Admit => {}
        }

        {
            let _commit = commit_lock.lock().await;
            for file in &files {
                let staged = match &file.source {
                    FileSource::Path(path) => path.clone(),
                    FileSource::Buffer(_) => {
                        return Err(Status::invalid_arg(
                            "transaction was not staged for the filesystem backend",
                        ))
                    }
                };
                let key = FileKey::new(file.kind, trx.guid(), trx.hash());
                let final_path = layout::file_path(&cache_path, &key);
                if let Some(parent) = final_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&staged, &final_path).await?;
                trx.set_file_path(file.kind, final_path).await;
                known.insert(key, file.size);
            }
        }

        trx.discard_staging().await;
        tracing::debug!(%version, files = files.len(), "version committed");
        Ok(())
    }

    async fn get_file_info(
        &self,
        kind: FileKind,
        guid: AssetGuid,
        hash: ContentHash,
    ) -> Result<FileInfo> {
        let state_lock = self.state.lock();
        let state = state_lock
            .as_ref()
            .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;
        let key = FileKey::new(kind, guid, hash);
        let size = Self::check_visible(state, &key)?;
        Ok(FileInfo { size })
    }

    async fn get_file_stream(
        &self,
        kind: FileKind,
        guid: AssetGuid,
        hash: ContentHash,
    ) -> Result<Box<dyn ReadStream>> {
        let key = FileKey::new(kind, guid, hash);
        let path = {
            let state_lock = self.state.lock();
            let state = state_lock
                .as_ref()
                .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;
            Self::check_visible(state, &key)?;
            layout::file_path(&state.config.cache_path, &key)
        };

        // Open before returning: the stream snapshots whatever inode is
        // current now, regardless of later renames over the path.
        let file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok(Box::new(FsReadStream { file, size }))
    }
}

/// Reader over one committed file's inode.
struct FsReadStream {
    file: tokio::fs::File,
    size: u64,
}

impl std::fmt::Debug for FsReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsReadStream")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ReadStream for FsReadStream {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(name: &str) -> CacheConfig {
        CacheConfig {
            cache_path: std::env::temp_dir().join(name),
            ..Default::default()
        }
    }

    async fn make_engine(name: &str) -> (FsCacheEngine, CacheConfig) {
        let config = test_config(name);
        let _ = std::fs::remove_dir_all(&config.cache_path);
        let engine = FsCacheEngine::new();
        engine.init(&config).await.unwrap();
        (engine, config)
    }

    fn guid(n: u8) -> AssetGuid {
        AssetGuid::from_bytes([n; 16])
    }

    fn hash(n: u8) -> ContentHash {
        ContentHash::from_bytes([n; 16])
    }

    async fn put_version(
        engine: &FsCacheEngine,
        guid: AssetGuid,
        hash: ContentHash,
        payloads: &[(FileKind, &[u8])],
    ) {
        let trx = engine.create_put_transaction(guid, hash).await.unwrap();
        for (kind, payload) in payloads {
            let mut stream = trx
                .get_write_stream(*kind, payload.len() as u64)
                .await
                .unwrap();
            stream.write(payload).await.unwrap();
            stream.close().await.unwrap();
        }
        engine.end_put_transaction(&trx).await.unwrap();
    }

    #[tokio::test]
    async fn test_basic_commit_roundtrip() {
        let (engine, config) = make_engine("vcache-test-fs-basic").await;
        let g = AssetGuid::zero();
        let h = ContentHash::zero();

        let info = vec![0xAA; 1024];
        let asset = vec![0xBB; 1024];
        let resource = vec![0xCC; 1024];
        put_version(
            &engine,
            g,
            h,
            &[
                (FileKind::Info, &info),
                (FileKind::Asset, &asset),
                (FileKind::Resource, &resource),
            ],
        )
        .await;

        for (kind, payload) in [
            (FileKind::Info, &info),
            (FileKind::Asset, &asset),
            (FileKind::Resource, &resource),
        ] {
            assert_eq!(engine.get_file_info(kind, g, h).await.unwrap().size, 1024);
            let mut stream = engine.get_file_stream(kind, g, h).await.unwrap();
            assert_eq!(&stream.read_to_end().await.unwrap(), payload);
        }

        // The staging directory is gone once the commit lands.
        assert!(!config.cache_path.join(STAGING_DIR).join("1").exists());

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[tokio::test]
    async fn test_files_land_in_hashed_tree() {
        let (engine, config) = make_engine("vcache-test-fs-layout").await;
        let (g, h) = (guid(0xAB), hash(0xCD));
        put_version(&engine, g, h, &[(FileKind::Info, &[1u8; 16])]).await;

        let expected = layout::file_path(
            &config.cache_path,
            &FileKey::new(FileKind::Info, g, h),
        );
        assert!(expected.exists());
        assert_eq!(
            expected.parent().unwrap().file_name().unwrap(),
            "ab",
        );

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[tokio::test]
    async fn test_partial_write_publishes_nothing() {
        let (engine, config) = make_engine("vcache-test-fs-partial").await;
        let (g, h) = (guid(1), hash(1));

        let trx = engine.create_put_transaction(g, h).await.unwrap();
        let mut stream = trx.get_write_stream(FileKind::Info, 1024).await.unwrap();
        stream.write(&[0x11]).await.unwrap();

        let err = engine.end_put_transaction(&trx).await.unwrap_err();
        assert_eq!(err.code(), vcache_types::TrxCode::INCOMPLETE_WRITE);

        let err = engine.get_file_info(FileKind::Info, g, h).await.unwrap_err();
        assert_eq!(err.code(), vcache_types::EngineCode::NOT_FOUND);

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[tokio::test]
    async fn test_replace_under_read_keeps_snapshot() {
        let (engine, config) = make_engine("vcache-test-fs-replace").await;
        let (g, h) = (guid(2), hash(2));

        let v1: Vec<u8> = (0..131072u32).map(|i| (i % 251) as u8).collect();
        let v2: Vec<u8> = (0..131072u32).map(|i| (i % 241) as u8).collect();

        put_version(&engine, g, h, &[(FileKind::Info, &v1)]).await;

        let mut reader = engine.get_file_stream(FileKind::Info, g, h).await.unwrap();
        let mut first_half = vec![0u8; 65536];
        let mut got = 0;
        while got < first_half.len() {
            let n = reader.read(&mut first_half[got..]).await.unwrap();
            assert!(n > 0);
            got += n;
        }

        put_version(&engine, g, h, &[(FileKind::Info, &v2)]).await;

        let rest = reader.read_to_end().await.unwrap();
        let mut seen = first_half;
        seen.extend_from_slice(&rest);
        assert_eq!(seen, v1);

        let mut fresh = engine.get_file_stream(FileKind::Info, g, h).await.unwrap();
        assert_eq!(fresh.read_to_end().await.unwrap(), v2);

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[tokio::test]
    async fn test_reliability_threshold_and_lock() {
        let config = CacheConfig {
            high_reliability: true,
            reliability_threshold: 1,
            ..test_config("vcache-test-fs-reliability")
        };
        let _ = std::fs::remove_dir_all(&config.cache_path);
        let engine = FsCacheEngine::new();
        engine.init(&config).await.unwrap();

        let (g, h) = (guid(3), hash(3));
        let payload = vec![0x33; 1024];

        put_version(&engine, g, h, &[(FileKind::Info, &payload)]).await;
        assert!(engine.get_file_info(FileKind::Info, g, h).await.is_err());

        put_version(&engine, g, h, &[(FileKind::Info, &payload)]).await;
        assert_eq!(
            engine.get_file_info(FileKind::Info, g, h).await.unwrap().size,
            1024
        );

        // A different payload submitted twice does not displace the version.
        let other = vec![0x44; 2048];
        put_version(&engine, g, h, &[(FileKind::Info, &other)]).await;
        put_version(&engine, g, h, &[(FileKind::Info, &other)]).await;
        assert_eq!(
            engine.get_file_info(FileKind::Info, g, h).await.unwrap().size,
            1024
        );
        let mut stream = engine.get_file_stream(FileKind::Info, g, h).await.unwrap();
        assert_eq!(stream.read_to_end().await.unwrap(), payload);

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[tokio::test]
    async fn test_reliability_manifest_mismatch_resets() {
        let config = CacheConfig {
            high_reliability: true,
            reliability_threshold: 1,
            ..test_config("vcache-test-fs-manifest")
        };
        let _ = std::fs::remove_dir_all(&config.cache_path);
        let engine = FsCacheEngine::new();
        engine.init(&config).await.unwrap();

        let (g, h) = (guid(4), hash(4));
        let info = vec![0x10; 256];
        let asset = vec![0x20; 256];

        put_version(
            &engine,
            g,
            h,
            &[(FileKind::Info, &info), (FileKind::Asset, &asset)],
        )
        .await;
        put_version(&engine, g, h, &[(FileKind::Info, &info)]).await;

        assert!(engine.get_file_info(FileKind::Info, g, h).await.is_err());
        assert!(engine.get_file_info(FileKind::Asset, g, h).await.is_err());

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[tokio::test]
    async fn test_init_scan_discovers_existing_files() {
        let (engine, config) = make_engine("vcache-test-fs-rescan").await;
        let (g, h) = (guid(5), hash(5));
        let payload = vec![0x55; 512];
        put_version(&engine, g, h, &[(FileKind::Resource, &payload)]).await;
        engine.shutdown().await.unwrap();

        // A fresh engine over the same tree picks the file up by scanning.
        let revived = FsCacheEngine::new();
        revived.init(&config).await.unwrap();
        let stats = revived.stats().unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.bytes, 512);
        assert_eq!(
            revived
                .get_file_info(FileKind::Resource, g, h)
                .await
                .unwrap()
                .size,
            512
        );
        let mut stream = revived
            .get_file_stream(FileKind::Resource, g, h)
            .await
            .unwrap();
        assert_eq!(stream.read_to_end().await.unwrap(), payload);

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[tokio::test]
    async fn test_init_clears_leftover_staging() {
        let config = test_config("vcache-test-fs-staging-cleanup");
        let _ = std::fs::remove_dir_all(&config.cache_path);

        let leftover = config.cache_path.join(STAGING_DIR).join("99");
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::write(leftover.join("i"), b"orphan").unwrap();

        let engine = FsCacheEngine::new();
        engine.init(&config).await.unwrap();
        assert!(!config.cache_path.join(STAGING_DIR).exists());

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[tokio::test]
    async fn test_write_files_to_path_after_commit() {
        let (engine, config) = make_engine("vcache-test-fs-export").await;
        let (g, h) = (guid(6), hash(6));

        let trx = engine.create_put_transaction(g, h).await.unwrap();
        let mut stream = trx.get_write_stream(FileKind::Info, 4).await.unwrap();
        stream.write(b"data").await.unwrap();
        stream.close().await.unwrap();
        engine.end_put_transaction(&trx).await.unwrap();

        // After the commit the file list points at the final tree, so the
        // export still works.
        let target = config.cache_path.join("export");
        let written = trx.write_files_to_path(&target).await.unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(std::fs::read(&written[0]).unwrap(), b"data");

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[tokio::test]
    async fn test_operations_require_init() {
        let engine = FsCacheEngine::new();
        let err = engine
            .get_file_info(FileKind::Info, guid(1), hash(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::NOT_INITIALIZED);
        assert!(engine.shutdown().await.is_err());
        assert!(!engine.clustering());
    }

    #[tokio::test]
    async fn test_missing_key_not_found() {
        let (engine, config) = make_engine("vcache-test-fs-missing").await;
        let err = engine
            .get_file_stream(FileKind::Asset, guid(9), hash(9))
            .await
            .unwrap_err();
        assert_eq!(err.code(), vcache_types::EngineCode::NOT_FOUND);

        let _ = std::fs::remove_dir_all(&config.cache_path);
    }

    #[test]
    fn test_staging_dir_name_is_hidden() {
        assert_eq!(PathBuf::from(STAGING_DIR), PathBuf::from(".staging"));
    }
}
