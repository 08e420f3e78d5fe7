//! Pluggable metadata persistence for the paged in-memory backend.
//!
//! The engine hands the adapter an opaque serialized blob on shutdown and
//! asks for it back on init; the adapter decides where the blob lives.

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

use vcache_types::Result;
use vcache_utils::file_utils;

#[async_trait]
pub trait IPersistenceAdapter: Send + Sync {
    /// Persist the serialized metadata blob, replacing any previous one.
    async fn save_database(&self, blob: &[u8]) -> Result<()>;

    /// Load the previously saved blob, or `None` on first start.
    async fn load_database(&self) -> Result<Option<Vec<u8>>>;
}

/// Keeps the blob in memory.  For tests and throwaway engines.
#[derive(Default)]
pub struct MemoryPersistenceAdapter {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryPersistenceAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IPersistenceAdapter for MemoryPersistenceAdapter {
    async fn save_database(&self, blob: &[u8]) -> Result<()> {
        *self.blob.lock() = Some(blob.to_vec());
        Ok(())
    }

    async fn load_database(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().clone())
    }
}

/// Stores the blob as a single file, written atomically.
pub struct FilePersistenceAdapter {
    path: PathBuf,
}

impl FilePersistenceAdapter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl IPersistenceAdapter for FilePersistenceAdapter {
    async fn save_database(&self, blob: &[u8]) -> Result<()> {
        file_utils::atomic_write(&self.path, blob)
    }

    async fn load_database(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        file_utils::read_file_bytes(&self.path).map(Some)
    }
}
