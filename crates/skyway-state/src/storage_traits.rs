//! Storage trait definitions for skyway
//!
//! The engine persists snapshots through a path-addressed blob store. All
//! implementations are async and backend-agnostic; an in-memory fake is
//! provided for testing via the `fakes` module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw 32 digest bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        if let Ok(decoded) = hex::decode(&self.0) {
            if decoded.len() == out.len() {
                out.copy_from_slice(&decoded);
            }
        }
        out
    }

    /// Rebuild a digest from its raw bytes.
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        ContentDigest(hex::encode(bytes))
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

/// Reject paths that are empty, absolute, or contain `.`/`..` segments.
///
/// Paths are `/`-separated relative keys such as `workspaces/ws-1.snapshot`.
pub fn validate_path(path: &str) -> StorageResult<()> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        return Err(StorageError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Path-addressed blob store.
///
/// Guarantees:
/// - `put(path, data)` replaces any previous object atomically; readers see
///   either the old or the new bytes, never a partial write.
/// - `get(path)` returns the exact bytes last stored, or
///   `StorageError::NotFound`.
/// - `delete(path)` is a no-op when the object is absent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `path`, replacing any existing object.
    async fn put(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    /// Retrieve bytes by path. Returns `StorageError::NotFound` if absent.
    async fn get(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Delete the object at `path`. No-op if absent.
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Check whether an object exists at `path`.
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match self.get(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
