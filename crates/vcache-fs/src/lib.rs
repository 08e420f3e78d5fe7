//! Filesystem cache backend.
//!
//! Blobs are files under a directory tree derived from the key; writes stage
//! into a per-transaction directory and commit with an atomic rename.

pub mod engine;
pub mod layout;

pub use engine::{FsCacheEngine, FsStats};
pub use layout::{file_path, parse_file_name, staging_path};
