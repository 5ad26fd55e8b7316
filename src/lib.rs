//! ocistore - a content-addressed image store for OCI registries
//!
//! The store manages per-repository OCI layouts (an append-only
//! `index.json` plus a pool of content-addressed blobs) and provides:
//!
//! - Resumable chunked blob uploads with digest verification
//! - Cross-tag and cross-repo blob dedupe backed by a persistent cache
//! - A garbage collector for orphan blobs, untagged manifests and dangling
//!   referrers, with retention delays
//! - Safe concurrent access through a per-store reader/writer lock and
//!   hooks for an external task scheduler

pub mod cache;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod oci;
pub mod scheduler;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{ImageStore, Lint, StoreConfig};
