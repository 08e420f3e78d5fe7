//! Paged in-memory cache engine.
//!
//! Committed payloads live in a [`PagePool`]; the index maps a [`FileKey`]
//! to a reference-counted extent handle.  Publishing a new version swaps the
//! index entry; the old block returns to the free list only once the last
//! read snapshot referencing it is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use vcache_engine::{
    Admission, CacheConfig, FileInfo, FileSource, ICacheEngine, PutTransaction, ReadStream,
    ReliabilityFilter, StagingMode,
};
use vcache_types::{
    make_error, AssetGuid, ContentHash, FileKey, FileKind, Result, Status, StatusCode, TrxId,
    VersionKey,
};

use crate::alloc::{Extent, PageLayout, PagePool};
use crate::persistence::{FilePersistenceAdapter, IPersistenceAdapter};

const METADATA_FILE: &str = "vcache-mem.json";
const PAGES_DIR: &str = "pages";

/// Reference-counted hold on an allocated block.  The block returns to the
/// free list when the last handle is dropped; a handle outliving the pool is
/// a no-op.
struct ExtentHandle {
    extent: Extent,
    /// Logical payload size; the carved block may be longer.
    size: u64,
    pool: Weak<Mutex<PagePool>>,
}

impl Drop for ExtentHandle {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.lock().free(self.extent);
        }
    }
}

/// Serialized metadata handed to the persistence adapter.
#[derive(Serialize, Deserialize)]
struct MemMetadata {
    page_size: u64,
    min_free_block_size: u64,
    pages: Vec<PageLayout>,
    entries: Vec<IndexEntry>,
}

#[derive(Serialize, Deserialize)]
struct IndexEntry {
    key: FileKey,
    extent: Extent,
    size: u64,
}

struct MemState {
    config: CacheConfig,
    pool: Arc<Mutex<PagePool>>,
    index: HashMap<FileKey, Arc<ExtentHandle>>,
    reliability: Option<ReliabilityFilter>,
    adapter: Arc<dyn IPersistenceAdapter>,
}

/// Point-in-time usage numbers for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStats {
    pub entries: usize,
    pub pages: usize,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// The paged in-memory backend.
pub struct MemCacheEngine {
    state: Mutex<Option<MemState>>,
    custom_adapter: Option<Arc<dyn IPersistenceAdapter>>,
    next_trx_id: AtomicU64,
}

impl Default for MemCacheEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCacheEngine {
    /// Create an engine that persists metadata to a file under `cache_path`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            custom_adapter: None,
            next_trx_id: AtomicU64::new(0),
        }
    }

    /// Create an engine with a custom persistence adapter.
    pub fn with_adapter(adapter: Arc<dyn IPersistenceAdapter>) -> Self {
        Self {
            state: Mutex::new(None),
            custom_adapter: Some(adapter),
            next_trx_id: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> Result<MemStats> {
        let state_lock = self.state.lock();
        let state = state_lock
            .as_ref()
            .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;
        let pool = state.pool.lock();
        Ok(MemStats {
            entries: state.index.len(),
            pages: pool.page_count(),
            total_bytes: pool.total_bytes(),
            free_bytes: pool.free_bytes(),
        })
    }

    fn parse_metadata(blob: &[u8]) -> Option<MemMetadata> {
        match serde_json::from_slice(blob) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable cache metadata");
                None
            }
        }
    }

    async fn restore_page_contents(config: &CacheConfig, pool: &Mutex<PagePool>, pages: usize) {
        let pages_dir = config.cache_path.join(PAGES_DIR);
        for idx in 0..pages {
            let path = pages_dir.join(format!("{}.bin", idx));
            match tokio::fs::read(&path).await {
                Ok(data) => {
                    if !pool.lock().set_page_data(idx, data) {
                        tracing::warn!(page = idx, "page file size mismatch, contents dropped");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(page = idx, error = %e, "failed to read page file");
                }
            }
        }
    }
}

#[async_trait]
impl ICacheEngine for MemCacheEngine {
    fn clustering(&self) -> bool {
        false
    }

    async fn init(&self, config: &CacheConfig) -> Result<()> {
        config.validate()?;

        // Soft reconfiguration: keep the index and in-flight transactions,
        // adjust only the admission filter.
        {
            let mut state_lock = self.state.lock();
            if let Some(state) = state_lock.as_mut() {
                match (config.high_reliability, state.reliability.as_mut()) {
                    (true, Some(filter)) => filter.set_threshold(config.reliability_threshold),
                    (true, None) => {
                        let mut filter = ReliabilityFilter::new(config.reliability_threshold);
                        for key in state.index.keys() {
                            filter.mark_locked(key.version());
                        }
                        state.reliability = Some(filter);
                    }
                    (false, _) => state.reliability = None,
                }
                state.config = config.clone();
                tracing::info!(
                    high_reliability = config.high_reliability,
                    "memory cache reconfigured"
                );
                return Ok(());
            }
        }

        tokio::fs::create_dir_all(&config.cache_path).await?;

        let adapter: Arc<dyn IPersistenceAdapter> = match &self.custom_adapter {
            Some(adapter) => Arc::clone(adapter),
            None => Arc::new(FilePersistenceAdapter::new(
                config.cache_path.join(METADATA_FILE),
            )),
        };

        let metadata = adapter
            .load_database()
            .await?
            .and_then(|blob| Self::parse_metadata(&blob));

        let (pool, entries) = match metadata {
            Some(meta) => (
                Arc::new(Mutex::new(PagePool::restore(
                    config.page_size,
                    config.min_free_block_size,
                    meta.pages,
                ))),
                meta.entries,
            ),
            None => (
                Arc::new(Mutex::new(PagePool::new(
                    config.page_size,
                    config.min_free_block_size,
                ))),
                Vec::new(),
            ),
        };

        let page_count = pool.lock().page_count();
        if page_count > 0 {
            Self::restore_page_contents(config, &pool, page_count).await;
        }

        let mut index = HashMap::with_capacity(entries.len());
        for entry in entries {
            index.insert(
                entry.key,
                Arc::new(ExtentHandle {
                    extent: entry.extent,
                    size: entry.size,
                    pool: Arc::downgrade(&pool),
                }),
            );
        }

        let mut reliability = config
            .high_reliability
            .then(|| ReliabilityFilter::new(config.reliability_threshold));
        if let Some(filter) = reliability.as_mut() {
            for key in index.keys() {
                filter.mark_locked(key.version());
            }
        }

        tracing::info!(
            cache_path = %config.cache_path.display(),
            entries = index.len(),
            pages = page_count,
            high_reliability = config.high_reliability,
            "memory cache initialized"
        );

        *self.state.lock() = Some(MemState {
            config: config.clone(),
            pool,
            index,
            reliability,
            adapter,
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let state = self
            .state
            .lock()
            .take()
            .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;

        let (blob, page_datas) = {
            let pool = state.pool.lock();
            let metadata = MemMetadata {
                page_size: state.config.page_size,
                min_free_block_size: state.config.min_free_block_size,
                pages: pool.layout(),
                entries: state
                    .index
                    .iter()
                    .map(|(key, handle)| IndexEntry {
                        key: *key,
                        extent: handle.extent,
                        size: handle.size,
                    })
                    .collect(),
            };
            let blob = serde_json::to_vec(&metadata).map_err(|e| {
                Status::with_message(
                    vcache_types::EngineCode::METADATA_SAVE_FAILED,
                    e.to_string(),
                )
            })?;
            let page_datas: Vec<Vec<u8>> = (0..pool.page_count())
                .map(|idx| pool.page_data(idx).to_vec())
                .collect();
            (blob, page_datas)
        };

        let pages_dir = state.config.cache_path.join(PAGES_DIR);
        if let Err(e) = tokio::fs::create_dir_all(&pages_dir).await {
            tracing::warn!(error = %e, "failed to create page directory");
        } else {
            for (idx, data) in page_datas.iter().enumerate() {
                let path = pages_dir.join(format!("{}.bin", idx));
                if let Err(e) = tokio::fs::write(&path, data).await {
                    tracing::warn!(page = idx, error = %e, "failed to persist page");
                }
            }
        }

        // Adapter failures are logged but never block termination.
        if let Err(e) = state.adapter.save_database(&blob).await {
            tracing::warn!(error = %e, "failed to persist cache metadata");
        }

        tracing::info!(entries = state.index.len(), "memory cache shut down");
        Ok(())
    }

    async fn create_put_transaction(
        &self,
        guid: AssetGuid,
        hash: ContentHash,
    ) -> Result<PutTransaction> {
        if self.state.lock().is_none() {
            return make_error(StatusCode::NOT_INITIALIZED);
        }
        let id = TrxId(self.next_trx_id.fetch_add(1, Ordering::Relaxed) + 1);
        Ok(PutTransaction::new(id, guid, hash, StagingMode::Memory))
    }

    async fn end_put_transaction(&self, trx: &PutTransaction) -> Result<()> {
        if self.state.lock().is_none() {
            return make_error(StatusCode::NOT_INITIALIZED);
        }

        trx.finalize().await?;
        let files = trx.files().await;
        let version = VersionKey::new(trx.guid(), trx.hash());

        // Memory staging never produces path-backed files.
        for file in &files {
            if matches!(file.source, FileSource::Path(_)) {
                return Err(Status::invalid_arg(
                    "transaction was not staged for the memory backend",
                ));
            }
        }

        let mut state_lock = self.state.lock();
        let state = state_lock
            .as_mut()
            .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;

        if let Some(filter) = state.reliability.as_mut() {
            let digests = files.iter().map(|f| (f.kind, f.digest)).collect();
            match filter.observe(version, digests) {
                Admission::Hold => {
                    tracing::debug!(%version, "version held for confirmation");
                    return Ok(());
                }
                Admission::AlreadyLocked => {
                    tracing::warn!(%version, "upload for locked version ignored");
                    return Ok(());
                }
                Admission::Admit => {
                    tracing::debug!(%version, "version admitted");
                }
            }
        }

        for file in &files {
            let bytes = match &file.source {
                FileSource::Buffer(bytes) => bytes,
                FileSource::Path(_) => unreachable!("checked above"),
            };
            let extent = {
                let mut pool = state.pool.lock();
                let extent = pool.allocate(file.size);
                pool.write(&extent, bytes);
                extent
            };
            let handle = Arc::new(ExtentHandle {
                extent,
                size: file.size,
                pool: Arc::downgrade(&state.pool),
            });
            let key = FileKey::new(file.kind, trx.guid(), trx.hash());
            // The displaced handle frees its block once all readers drop it.
            state.index.insert(key, handle);
        }

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
        if let Some(filter) = &state.reliability {
            if !filter.is_locked(&key.version()) {
                return Err(Status::not_found(format!("{} not yet confirmed", key)));
            }
        }
        state
            .index
            .get(&key)
            .map(|handle| FileInfo { size: handle.size })
            .ok_or_else(|| Status::not_found(format!("{} not in cache", key)))
    }

    async fn get_file_stream(
        &self,
        kind: FileKind,
        guid: AssetGuid,
        hash: ContentHash,
    ) -> Result<Box<dyn ReadStream>> {
        let state_lock = self.state.lock();
        let state = state_lock
            .as_ref()
            .ok_or_else(|| Status::new(StatusCode::NOT_INITIALIZED))?;

        let key = FileKey::new(kind, guid, hash);
        if let Some(filter) = &state.reliability {
            if !filter.is_locked(&key.version()) {
                return Err(Status::not_found(format!("{} not yet confirmed", key)));
            }
        }
        let handle = state
            .index
            .get(&key)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("{} not in cache", key)))?;

        Ok(Box::new(MemReadStream {
            handle,
            pool: Arc::clone(&state.pool),
            pos: 0,
        }))
    }
}

/// Snapshot reader over one committed extent.  Holding the handle keeps the
/// block allocated even after the index moves on to a newer version.
struct MemReadStream {
    handle: Arc<ExtentHandle>,
    pool: Arc<Mutex<PagePool>>,
    pos: u64,
}

impl std::fmt::Debug for MemReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemReadStream")
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ReadStream for MemReadStream {
    fn size(&self) -> u64 {
        self.handle.size
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self
            .pool
            .lock()
            .read_at(&self.handle.extent, self.pos, buf, self.handle.size);
        self.pos += n as u64;
        Ok(n)
    }
}
