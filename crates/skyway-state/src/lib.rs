//! Skyway-State: object-store backends for workspace snapshots
//!
//! This crate provides the persistence layer for the skyway workspace engine.
//! The engine only needs a byte-blob store addressed by path; everything
//! above that (encoding, framing, deadlines) lives in `skyway-core`.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durability of opaque blobs and atomic replacement.
//!
//! ## Key Components
//!
//! - `ObjectStore`: async `put` / `get` / `delete` / `exists` by path
//! - `MemoryObjectStore`: in-memory fake for tests and ephemeral workspaces
//! - `FsObjectStore`: directory-backed store with atomic temp-file writes
//! - `ContentDigest`: SHA-256 digest used to checksum stored payloads

mod error;
pub mod fakes;
mod fs;
pub mod storage_traits;

pub use error::StorageError;
pub use fakes::MemoryObjectStore;
pub use fs::FsObjectStore;
pub use storage_traits::{validate_path, ContentDigest, ObjectStore, StorageResult};
