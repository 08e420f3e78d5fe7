//! On-disk path derivation.
//!
//! A committed file lives at `<cache_path>/<guid-prefix>/<guid-suffix><hash><kind>`,
//! where the prefix is the first two hex characters of the guid.  Staged
//! files live under `<cache_path>/.staging/<trxid>/<kind>` until commit.

use std::path::{Path, PathBuf};

use vcache_types::{AssetGuid, ContentHash, FileKey, FileKind, TrxId};

pub const STAGING_DIR: &str = ".staging";

const GUID_PREFIX_LEN: usize = 2;
const FILE_NAME_LEN: usize = 32 - GUID_PREFIX_LEN + 32 + 1;

/// Final path for a committed file.
pub fn file_path(cache_path: &Path, key: &FileKey) -> PathBuf {
    let guid_hex = key.guid.to_hex();
    let (prefix, suffix) = guid_hex.split_at(GUID_PREFIX_LEN);
    cache_path.join(prefix).join(format!(
        "{}{}{}",
        suffix,
        key.hash.to_hex(),
        key.kind.as_char()
    ))
}

/// Per-transaction staging directory.
pub fn staging_path(cache_path: &Path, trx_id: TrxId) -> PathBuf {
    cache_path.join(STAGING_DIR).join(trx_id.to_string())
}

/// Reverse of [`file_path`]: rebuild the key from a prefix directory name
/// and a file name.  Returns `None` for anything that does not parse.
pub fn parse_file_name(prefix: &str, name: &str) -> Option<FileKey> {
    if prefix.len() != GUID_PREFIX_LEN || name.len() != FILE_NAME_LEN || !name.is_ascii() {
        return None;
    }
    let guid_suffix_len = 32 - GUID_PREFIX_LEN;
    let guid = AssetGuid::from_hex(&format!("{}{}", prefix, &name[..guid_suffix_len])).ok()?;
    let hash = ContentHash::from_hex(&name[guid_suffix_len..guid_suffix_len + 32]).ok()?;
    let kind = FileKind::from_char(name.as_bytes()[FILE_NAME_LEN - 1] as char).ok()?;
    Some(FileKey::new(kind, guid, hash))
}
