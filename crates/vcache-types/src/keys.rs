//! Key types that address cached content.
//!
//! A version of an asset is named by a 16-byte [`AssetGuid`] plus a 16-byte
//! [`ContentHash`]; each of its files is further qualified by a [`FileKind`].
//! All three together form a [`FileKey`], the unit the cache engines index by.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::result::{make_error_msg, Result};
use crate::status_code::StatusCode;

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Macro for fixed-length binary identifiers compared byte-wise and rendered
/// as lowercase hex.
macro_rules! byte_id {
    ($name:ident, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            /// Wrap a raw byte array.
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Build from a slice, failing if the length is not exactly
            /// [`Self::LEN`].
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                if bytes.len() != $len {
                    return make_error_msg(
                        StatusCode::INVALID_ARG,
                        format!(
                            "{} must be {} bytes, got {}",
                            stringify!($name),
                            $len,
                            bytes.len()
                        ),
                    );
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(bytes);
                Ok(Self(out))
            }

            /// Parse a lowercase or uppercase hex string of length `2 * LEN`.
            pub fn from_hex(s: &str) -> Result<Self> {
                let raw = s.as_bytes();
                if raw.len() != $len * 2 {
                    return make_error_msg(
                        StatusCode::INVALID_FORMAT,
                        format!("{} hex must be {} chars", stringify!($name), $len * 2),
                    );
                }
                let mut out = [0u8; $len];
                for (i, chunk) in raw.chunks(2).enumerate() {
                    let hi = hex_nibble(chunk[0]);
                    let lo = hex_nibble(chunk[1]);
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => out[i] = (hi << 4) | lo,
                        _ => {
                            return make_error_msg(
                                StatusCode::INVALID_FORMAT,
                                format!("{} hex contains non-hex characters", stringify!($name)),
                            )
                        }
                    }
                }
                Ok(Self(out))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                self.to_string()
            }

            /// The all-zero identifier.
            pub const fn zero() -> Self {
                Self([0u8; $len])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

byte_id!(AssetGuid, 16);
byte_id!(ContentHash, 16);

/// The role a file plays within a cached version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileKind {
    Info,
    Asset,
    Resource,
}

impl FileKind {
    pub const ALL: [FileKind; 3] = [FileKind::Info, FileKind::Asset, FileKind::Resource];

    /// The single-character wire/path representation.
    pub fn as_char(self) -> char {
        match self {
            FileKind::Info => 'i',
            FileKind::Asset => 'a',
            FileKind::Resource => 'r',
        }
    }

    /// Parse the single-character representation; any other character is an
    /// invalid argument.
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'i' => Ok(FileKind::Info),
            'a' => Ok(FileKind::Asset),
            'r' => Ok(FileKind::Resource),
            other => make_error_msg(
                StatusCode::INVALID_ARG,
                format!("unknown file kind '{}'", other),
            ),
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// The `(guid, hash)` pair naming one version of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    pub guid: AssetGuid,
    pub hash: ContentHash,
}

impl VersionKey {
    pub fn new(guid: AssetGuid, hash: ContentHash) -> Self {
        Self { guid, hash }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.guid, self.hash)
    }
}

/// The full address of a single cached file: `(kind, guid, hash)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub kind: FileKind,
    pub guid: AssetGuid,
    pub hash: ContentHash,
}

impl FileKey {
    pub fn new(kind: FileKind, guid: AssetGuid, hash: ContentHash) -> Self {
        Self { kind, guid, hash }
    }

    /// The version this file belongs to.
    pub fn version(&self) -> VersionKey {
        VersionKey::new(self.guid, self.hash)
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.guid, self.hash, self.kind)
    }
}

/// Identifier for a put-transaction, unique within one engine instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrxId(pub u64);

impl fmt::Debug for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrxId({})", self.0)
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
