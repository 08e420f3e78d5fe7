//! Paged in-memory cache backend.
//!
//! Committed payloads are copied into a pool of fixed-size pages managed by
//! a first-fit free-list allocator ([`alloc::PagePool`]).  Index metadata is
//! persisted through a pluggable [`persistence::IPersistenceAdapter`] so a
//! restart can rebuild the index without scanning page contents.

pub mod alloc;
pub mod engine;
pub mod persistence;

pub use alloc::{Extent, FreeBlock, PageLayout, PagePool};
pub use engine::{MemCacheEngine, MemStats};
pub use persistence::{FilePersistenceAdapter, IPersistenceAdapter, MemoryPersistenceAdapter};
