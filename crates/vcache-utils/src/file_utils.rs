use std::path::Path;

use vcache_types::{Result, Status};

/// Read an entire file to bytes.
pub fn read_file_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Status::io(format!("read {}: {}", path.display(), e)))
}

/// Write data to a file.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data)
        .map_err(|e| Status::io(format!("write {}: {}", path.display(), e)))
}

/// Atomic write: write to a temp file in the same directory, then rename over
/// the destination.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let tmp_path = dir.join(format!(".tmp.{}", std::process::id()));
    write_file(&tmp_path, data)?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        Status::io(format!("rename {}: {}", path.display(), e))
    })
}
