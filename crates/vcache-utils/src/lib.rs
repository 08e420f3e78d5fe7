pub mod file_utils;

pub use file_utils::{atomic_write, read_file_bytes, write_file};
