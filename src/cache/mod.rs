//! Dedupe cache
//!
//! Persistent multimap from blob digest to the paths holding that content.
//! The first path recorded for a digest is the primary; deleting the primary
//! promotes the next entry. The store is free to run without a cache, in
//! which case dedupe is skipped entirely.

use crate::error::Result;

pub mod sqlite;

pub use sqlite::SqliteCache;

/// Blob digest to path multimap consulted by the dedupe protocol
///
/// Implementations must be safe for concurrent readers; the store serializes
/// mutations under its write lock. A missing digest surfaces as
/// [`crate::StoreError::CacheMiss`], distinguished from I/O failures.
pub trait BlobCache: Send + Sync {
    /// Primary path recorded for a digest
    fn get_blob(&self, digest: &str) -> Result<String>;

    /// Record a path for a digest; idempotent, appends if new
    fn put_blob(&self, digest: &str, path: &str) -> Result<()>;

    /// True if the exact (digest, path) pair is recorded
    fn has_blob(&self, digest: &str, path: &str) -> bool;

    /// Remove one (digest, path) entry; a deleted primary promotes the next
    fn delete_blob(&self, digest: &str, path: &str) -> Result<()>;

    /// True when recorded paths are relative to the store root
    fn uses_relative_paths(&self) -> bool;
}
