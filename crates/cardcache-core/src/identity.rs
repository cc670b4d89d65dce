//! Content identity for uploaded scans.
//!
//! An upload is identified by the SHA-256 digest of its raw bytes. The role
//! it was uploaded in (face, verso, ...) is *not* part of the hash; the
//! catalog keys on `(content_hash, role)`.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{CacheError, CacheResult};

const READ_CHUNK: usize = 64 * 1024;

/// Lower-case hex SHA-256 digest of an image's bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse a previously computed digest (e.g. from the command line).
    pub fn from_hex(hex: &str) -> CacheResult<Self> {
        let normalized = hex.trim().to_ascii_lowercase();
        if normalized.len() != 64 || !normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CacheError::InvalidMetadata(format!(
                "not a SHA-256 hex digest: {hex:?}"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..16).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = CacheError;

    fn try_from(value: String) -> CacheResult<Self> {
        Self::from_hex(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the catalog needs to know about an upload that can be read
/// from the file itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadIdentity {
    pub content_hash: ContentHash,
    pub byte_size: u64,
    pub original_filename: Option<String>,
}

/// Hash an in-memory buffer.
pub fn resolve_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentHash(format!("{:x}", hasher.finalize()))
}

/// Hash a file on disk, streaming it in fixed-size chunks.
pub fn resolve(path: &Path) -> CacheResult<ContentHash> {
    Ok(hash_file(path)?.0)
}

/// Hash a file and collect its size and file name in the same pass.
pub fn probe(path: &Path) -> CacheResult<UploadIdentity> {
    let (content_hash, byte_size) = hash_file(path)?;
    Ok(UploadIdentity {
        content_hash,
        byte_size,
        original_filename: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
    })
}

fn hash_file(path: &Path) -> CacheResult<(ContentHash, u64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(READ_CHUNK, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((ContentHash(format!("{:x}", hasher.finalize())), total))
}
