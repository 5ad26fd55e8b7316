//! Error types for the image store

use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Image store error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid repository name: {0}")]
    InvalidRepositoryName(String),

    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("Unsupported layout version in repository: {0}")]
    RepoBadVersion(String),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("Bad manifest: {0}")]
    BadManifest(String),

    #[error("Manifest is referenced by an image index: {0}")]
    ManifestReferenced(String),

    #[error("Manifest digest matches multiple tags: {0}")]
    ManifestConflict(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Bad blob digest: {0}")]
    BadBlobDigest(String),

    #[error("Blob is referenced by a manifest: {0}")]
    BlobReferenced(String),

    #[error("Bad blob range: {from}-{to}")]
    BadRange { from: u64, to: u64 },

    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    #[error("Bad upload range: offset {offset} does not match upload size {size}")]
    BadUploadRange { offset: u64, size: u64 },

    #[error("Cache miss: {0}")]
    CacheMiss(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Dedupe rebuild failed: {0}")]
    DedupeRebuild(String),

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
