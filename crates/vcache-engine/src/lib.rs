//! Cache engine contract shared by the paged in-memory and filesystem
//! backends.
//!
//! An engine stores versioned binary assets addressed by `(guid, hash)`.
//! Producers stage a version through a [`PutTransaction`] and publish it with
//! [`ICacheEngine::end_put_transaction`]; consumers read committed files back
//! through [`ICacheEngine::get_file_stream`].  Backends implement the same
//! trait so the service layer does not care where the bytes live.

pub mod config;
pub mod reliability;
pub mod transaction;

use async_trait::async_trait;

use vcache_types::{AssetGuid, ContentHash, FileKind, Result};

pub use config::{CacheConfig, ConfigError};
pub use reliability::{Admission, ReliabilityFilter};
pub use transaction::{
    FileSource, PayloadDigest, PutTransaction, StagingMode, TrxFile, TrxState, WriteStream,
};

/// Size information for one committed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
}

/// A readable snapshot of one committed file.
///
/// The stream yields the bytes of the version that was current when it was
/// opened, even if a newer version is published mid-read.
#[async_trait]
pub trait ReadStream: Send + std::fmt::Debug {
    /// Total number of bytes this stream will yield.
    fn size(&self) -> u64;

    /// Read the next bytes into `buf`, returning 0 at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Drain all remaining bytes.
    async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size() as usize);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }
}

/// The cache engine contract.
///
/// `init` must be called before any other operation; `shutdown` releases
/// resources and makes subsequent operations fail until the engine is
/// re-initialized.  A second `init` on a live engine is a soft
/// reconfiguration: the index is preserved and no transactions are aborted.
#[async_trait]
pub trait ICacheEngine: Send + Sync {
    /// Whether multiple engine instances may safely share one `cache_path`.
    fn clustering(&self) -> bool {
        false
    }

    /// Prepare the backing store.
    async fn init(&self, config: &CacheConfig) -> Result<()>;

    /// Persist metadata where applicable and release resources.
    async fn shutdown(&self) -> Result<()>;

    /// Allocate a staging transaction for one `(guid, hash)` version.
    async fn create_put_transaction(
        &self,
        guid: AssetGuid,
        hash: ContentHash,
    ) -> Result<PutTransaction>;

    /// Finalize the transaction and atomically publish its files.
    ///
    /// With high reliability enabled the version is instead offered to the
    /// admission filter and may be silently held back or dropped.
    async fn end_put_transaction(&self, trx: &PutTransaction) -> Result<()>;

    /// Look up the size of a committed file.
    async fn get_file_info(
        &self,
        kind: FileKind,
        guid: AssetGuid,
        hash: ContentHash,
    ) -> Result<FileInfo>;

    /// Open a read stream over the currently-published bytes for the key.
    async fn get_file_stream(
        &self,
        kind: FileKind,
        guid: AssetGuid,
        hash: ContentHash,
    ) -> Result<Box<dyn ReadStream>>;
}
