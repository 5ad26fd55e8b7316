//! Storage driver abstraction
//!
//! The store persists everything through this capability set so the same
//! engine can run on a local filesystem or an object store. Object stores
//! have no hardlinks and no visible empty directories; `link` is allowed to
//! be a server-side copy as long as `same_file` then reports the pair as
//! identical, and `is_local` gates checks that assume visible directories.

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub mod local;

pub use local::LocalFsDriver;

/// File metadata returned by [`StorageDriver::stat`]
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    /// Size in bytes
    pub size: u64,
    /// Modification time
    pub mtime: DateTime<Utc>,
    /// True for directories
    pub is_dir: bool,
}

/// Streaming writer for blob data
pub trait BlobWriter: Write + Send {
    /// Bytes accumulated at the backing path so far
    fn size(&self) -> u64;

    /// Flush and persist the written content
    fn commit(&mut self) -> Result<()>;

    /// Abort the write and remove the backing file
    fn cancel(&mut self) -> Result<()>;

    /// Close the writer, leaving the backing file in place
    fn close(&mut self) -> Result<()>;
}

/// Capability set the store depends on for persistence
///
/// Missing paths surface as [`crate::StoreError::PathNotFound`]; the store
/// translates them contextually (repo not found, blob not found, empty
/// store).
pub trait StorageDriver: Send + Sync {
    /// Driver name, e.g. "local"
    fn name(&self) -> &'static str;

    /// True for local filesystem drivers
    fn is_local(&self) -> bool;

    /// Create a directory and its parents
    fn ensure_dir(&self, path: &Path) -> Result<()>;

    /// True if the directory exists
    fn dir_exists(&self, path: &Path) -> bool;

    /// File metadata
    fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Entries directly under a directory
    fn list(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Depth-first walk below a root
    fn walk(
        &self,
        root: &Path,
        visit: &mut dyn FnMut(&Path, &FileInfo) -> Result<()>,
    ) -> Result<()>;

    /// Read a whole file
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write a whole file atomically (temp file + rename)
    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Move a file, atomically where the backend allows
    fn move_file(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Delete a file or directory tree
    fn delete(&self, path: &Path) -> Result<()>;

    /// Make `dst` reference the content of `src`, replacing `dst` atomically
    fn link(&self, src: &Path, dst: &Path) -> Result<()>;

    /// True when both paths resolve to the same stored content
    fn same_file(&self, a: &Path, b: &Path) -> bool;

    /// Open a file for reading at the given offset
    fn reader(&self, path: &Path, offset: u64) -> Result<Box<dyn Read + Send>>;

    /// Open a streaming writer; append mode fails on a missing path
    fn writer(&self, path: &Path, append: bool) -> Result<Box<dyn BlobWriter>>;
}
