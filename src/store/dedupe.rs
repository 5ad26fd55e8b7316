//! Dedupe protocol
//!
//! Finalize-time sharing of identical blob content across paths, rebuilds
//! when dedupe is switched on or off for existing data, and reconciliation
//! with a cache that may have drifted from disk.

use super::ImageStore;
use crate::error::{Result, StoreError};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

impl ImageStore {
    /// Land a verified upload at its content-addressed path, sharing
    /// content through the cache
    ///
    /// The loop self-heals drift: a cache record whose path no longer
    /// exists is dropped and the lookup retried.
    pub(crate) fn dedupe_finalize(&self, digest: &str, src: &Path, dst: &Path) -> Result<()> {
        let cache = self
            .cache()
            .ok_or_else(|| StoreError::Cache("dedupe requires a cache".to_string()))?;

        loop {
            let record = match cache.get_blob(digest) {
                Ok(record) => record,
                Err(StoreError::CacheMiss(_)) => {
                    // first copy on disk
                    cache.put_blob(digest, &self.cache_path_for(dst))?;
                    return self.driver().move_file(src, dst);
                }
                Err(e) => return Err(e),
            };

            let record_path = self.resolve_cache_path(&record);
            if self.driver().stat(&record_path).is_err() {
                // drift: the recorded path is gone
                cache.delete_blob(digest, &record)?;
                continue;
            }

            if !self.driver().same_file(dst, &record_path) {
                self.driver().link(&record_path, dst)?;
                cache.put_blob(digest, &self.cache_path_for(dst))?;
            }

            // content is shared, the upload file is redundant
            return self.driver().delete(src);
        }
    }

    /// Apply (`dedupe = true`) or undo (`dedupe = false`) dedupe for one
    /// digest across its candidate paths
    pub fn run_dedupe_for_digest(
        &self,
        digest: &str,
        dedupe: bool,
        paths: &[PathBuf],
    ) -> Result<()> {
        let _guard = self.write_lock()?;
        if dedupe {
            self.dedupe_blobs(digest, paths)
        } else {
            self.restore_deduped_blobs(digest, paths)
        }
    }

    fn dedupe_blobs(&self, digest: &str, paths: &[PathBuf]) -> Result<()> {
        let cache = self.cache().ok_or_else(|| {
            StoreError::DedupeRebuild(format!("no cache configured to dedupe {}", digest))
        })?;

        // the original keeps the content, every other path links to it
        let original = paths
            .iter()
            .find(|p| matches!(self.driver().stat(p), Ok(info) if info.size > 0))
            .ok_or_else(|| {
                StoreError::DedupeRebuild(format!("no non-empty candidate for {}", digest))
            })?;

        cache.put_blob(digest, &self.cache_path_for(original))?;

        for path in paths {
            if path == original {
                continue;
            }
            let info = match self.driver().stat(path) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Skipping dedupe candidate {}: {}", path.display(), e);
                    continue;
                }
            };
            if info.size > 0 && !self.driver().same_file(original, path) {
                self.driver().link(original, path)?;
            }
            cache.put_blob(digest, &self.cache_path_for(path))?;
        }

        debug!("Deduped {} across {} paths", digest, paths.len());
        Ok(())
    }

    fn restore_deduped_blobs(&self, digest: &str, paths: &[PathBuf]) -> Result<()> {
        // the content lives at the first non-empty candidate, else at the
        // cache primary
        let mut original: Option<PathBuf> = paths
            .iter()
            .find(|p| matches!(self.driver().stat(p), Ok(info) if info.size > 0))
            .cloned();
        if original.is_none() {
            if let Some(cache) = self.cache() {
                if let Ok(record) = cache.get_blob(digest) {
                    let record_path = self.resolve_cache_path(&record);
                    if matches!(self.driver().stat(&record_path), Ok(info) if info.size > 0) {
                        original = Some(record_path);
                    }
                }
            }
        }
        let Some(original) = original else {
            return Err(StoreError::DedupeRebuild(format!(
                "no content found for {}",
                digest
            )));
        };

        let content = self.driver().read_file(&original)?;
        for path in paths {
            if *path == original {
                continue;
            }
            if let Ok(info) = self.driver().stat(path) {
                if info.size == 0 {
                    // materialize the placeholder so the path stands alone
                    self.driver().write_file(path, &content)?;
                }
            }
        }

        debug!("Restored {} across {} paths", digest, paths.len());
        Ok(())
    }

    /// Lexically-first digest not in `seen`, with every path holding it
    /// across all repositories
    pub fn get_next_digest_with_blob_paths(
        &self,
        seen: &[String],
    ) -> Result<Option<(String, Vec<PathBuf>)>> {
        let _guard = self.read_lock()?;
        let repos = self.get_repositories_inner()?;

        let mut target: Option<String> = None;
        for repo in &repos {
            let entries = match self.driver().list(&self.blobs_path(repo)) {
                Ok(entries) => entries,
                Err(StoreError::PathNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for path in entries {
                let Some(hex) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !is_blob_file_name(hex) {
                    continue;
                }
                let digest = format!("sha256:{}", hex);
                if seen.iter().any(|s| s == &digest) {
                    continue;
                }
                if target.as_ref().map(|t| digest < *t).unwrap_or(true) {
                    target = Some(digest);
                }
            }
        }

        let Some(target) = target else {
            return Ok(None);
        };

        let (_, encoded) = crate::oci::split_digest(&target)?;
        let mut paths = Vec::new();
        for repo in &repos {
            let path = self.blobs_path(repo).join(encoded);
            if self.driver().stat(&path).is_ok() {
                paths.push(path);
            }
        }

        Ok(Some((target, paths)))
    }
}

/// Blob files are 64 hex characters; anything else in the directory is
/// transient state
pub(crate) fn is_blob_file_name(name: &str) -> bool {
    name.len() == 64
        && name
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
