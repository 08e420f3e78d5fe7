//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vcache_types::{Status, StatusCode};

/// Default page size for the paged in-memory backend (1 MiB).
pub const DEFAULT_PAGE_SIZE: u64 = 1024 * 1024;

/// Default lower bound on tracked free blocks (1 KiB).
pub const DEFAULT_MIN_FREE_BLOCK_SIZE: u64 = 1024;

/// Configuration validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("page_size must be positive")]
    ZeroPageSize,
    #[error("min_free_block_size {0} exceeds page_size {1}")]
    MinFreeBlockTooLarge(u64, u64),
}

impl From<ConfigError> for Status {
    fn from(err: ConfigError) -> Self {
        Status::with_message(StatusCode::INVALID_CONFIG, err.to_string())
    }
}

/// Options accepted by [`crate::ICacheEngine::init`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory for cached data and metadata.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Page size in bytes (paged in-memory backend).
    #[serde(default = "default_page_size")]
    pub page_size: u64,

    /// Smallest residual worth keeping on the free list; anything smaller is
    /// absorbed into the allocation (paged in-memory backend).
    #[serde(default = "default_min_free_block_size")]
    pub min_free_block_size: u64,

    /// Defer visibility of a new version until enough identical uploads
    /// confirm it.
    #[serde(default)]
    pub high_reliability: bool,

    /// Additional matching uploads required beyond the first before a
    /// version becomes visible.
    #[serde(default = "default_reliability_threshold")]
    pub reliability_threshold: u32,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

fn default_min_free_block_size() -> u64 {
    DEFAULT_MIN_FREE_BLOCK_SIZE
}

fn default_reliability_threshold() -> u32 {
    1
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            page_size: default_page_size(),
            min_free_block_size: default_min_free_block_size(),
            high_reliability: false,
            reliability_threshold: default_reliability_threshold(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        if self.min_free_block_size > self.page_size {
            return Err(ConfigError::MinFreeBlockTooLarge(
                self.min_free_block_size,
                self.page_size,
            ));
        }
        Ok(())
    }
}
