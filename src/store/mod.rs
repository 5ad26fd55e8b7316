//! Image store
//!
//! Content-addressed store backing an OCI registry: per-repository layouts
//! (`oci-layout`, `index.json`, `blobs/`, `.uploads/`) over a pluggable
//! storage driver, with blob dedupe through a persistent cache and a
//! three-phase garbage collector.
//!
//! One reader/writer lock serializes index mutation per store; streaming
//! uploads run outside the lock and only finalize under it.

use crate::cache::BlobCache;
use crate::driver::StorageDriver;
use crate::error::{Result, StoreError};
use crate::metrics::{LockKind, MetricsObserver};
use crate::oci::{self, ImageIndex, OciLayout};
use chrono::{DateTime, Utc};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

pub mod dedupe;
pub mod gc;
pub mod manifest;
pub mod upload;

pub(crate) const BLOBS_DIR: &str = "blobs";
pub(crate) const BLOB_ALGORITHM: &str = "sha256";
pub(crate) const UPLOADS_DIR: &str = ".uploads";
pub(crate) const LAYOUT_FILE: &str = "oci-layout";
pub(crate) const INDEX_FILE: &str = "index.json";

/// Linter hook run over a manifest before `index.json` is updated
///
/// Returning `Ok(false)` rejects the manifest; the index is left untouched.
pub trait Lint: Send + Sync {
    fn lint(&self, repo: &str, manifest_digest: &str, index: &ImageIndex) -> Result<bool>;
}

/// Store construction record
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory owned by the store
    pub root_dir: PathBuf,
    /// Share identical blob content across paths
    pub dedupe: bool,
    /// Fsync after each write
    pub commit: bool,
    /// Enable garbage collection
    pub gc: bool,
    /// Enable the referrer sweep (GC phase one)
    pub gc_referrers: bool,
    /// Minimum age before an orphan blob or referrer is reclaimed
    pub gc_delay: Duration,
    /// Minimum age before an untagged manifest is reclaimed
    pub retention_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/ocistore"),
            dedupe: true,
            commit: false,
            gc: true,
            gc_referrers: true,
            gc_delay: Duration::from_secs(60 * 60),
            retention_delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Content-addressed image store rooted at a single directory
pub struct ImageStore {
    /// Configuration
    config: StoreConfig,
    /// Storage backend
    driver: Box<dyn StorageDriver>,
    /// Dedupe cache, absent when dedupe is not wanted
    cache: Option<Box<dyn BlobCache>>,
    /// Manifest linter hook
    linter: Option<Box<dyn Lint>>,
    /// Latency observer
    metrics: Box<dyn MetricsObserver>,
    /// Per-store reader/writer lock
    lock: RwLock<()>,
}

/// Read guard observing its hold latency on release
pub(crate) struct ReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    acquired: Instant,
    metrics: &'a dyn MetricsObserver,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.metrics
            .observe_lock_latency(LockKind::Read, self.acquired.elapsed());
    }
}

/// Write guard observing its hold latency on release
pub(crate) struct WriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    acquired: Instant,
    metrics: &'a dyn MetricsObserver,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.metrics
            .observe_lock_latency(LockKind::Write, self.acquired.elapsed());
    }
}

impl ImageStore {
    /// Create a store rooted at `config.root_dir`, creating the root if
    /// needed
    pub fn new(
        config: StoreConfig,
        driver: Box<dyn StorageDriver>,
        cache: Option<Box<dyn BlobCache>>,
        linter: Option<Box<dyn Lint>>,
        metrics: Box<dyn MetricsObserver>,
    ) -> Result<Self> {
        driver.ensure_dir(&config.root_dir)?;

        Ok(Self {
            config,
            driver,
            cache,
            linter,
            metrics,
            lock: RwLock::new(()),
        })
    }

    /// Store root directory
    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    /// True when dedupe is enabled and a cache is configured
    pub fn dedupe_enabled(&self) -> bool {
        self.config.dedupe && self.cache.is_some()
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn driver(&self) -> &dyn StorageDriver {
        self.driver.as_ref()
    }

    pub(crate) fn cache(&self) -> Option<&dyn BlobCache> {
        self.cache.as_deref()
    }

    pub(crate) fn linter(&self) -> Option<&dyn Lint> {
        self.linter.as_deref()
    }

    pub(crate) fn read_lock(&self) -> Result<ReadGuard<'_>> {
        let guard = self
            .lock
            .read()
            .map_err(|_| StoreError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(ReadGuard {
            _guard: guard,
            acquired: Instant::now(),
            metrics: self.metrics.as_ref(),
        })
    }

    pub(crate) fn write_lock(&self) -> Result<WriteGuard<'_>> {
        let guard = self
            .lock
            .write()
            .map_err(|_| StoreError::Lock("Failed to acquire write lock".to_string()))?;
        Ok(WriteGuard {
            _guard: guard,
            acquired: Instant::now(),
            metrics: self.metrics.as_ref(),
        })
    }

    // Path layout

    pub(crate) fn repo_path(&self, repo: &str) -> PathBuf {
        self.config.root_dir.join(repo)
    }

    pub(crate) fn blobs_path(&self, repo: &str) -> PathBuf {
        self.repo_path(repo).join(BLOBS_DIR).join(BLOB_ALGORITHM)
    }

    pub(crate) fn blob_path(&self, repo: &str, digest: &str) -> Result<PathBuf> {
        let (algorithm, encoded) = oci::split_digest(digest)?;
        Ok(self
            .repo_path(repo)
            .join(BLOBS_DIR)
            .join(algorithm)
            .join(encoded))
    }

    pub(crate) fn upload_path(&self, repo: &str, uuid: &str) -> PathBuf {
        self.repo_path(repo).join(UPLOADS_DIR).join(uuid)
    }

    /// Path as recorded in the cache (relative to the root when configured)
    pub(crate) fn cache_path_for(&self, path: &Path) -> String {
        let relative = self
            .cache
            .as_ref()
            .map(|c| c.uses_relative_paths())
            .unwrap_or(false);
        let path = if relative {
            path.strip_prefix(&self.config.root_dir).unwrap_or(path)
        } else {
            path
        };
        path.to_string_lossy().into_owned()
    }

    /// Absolute path for a cache record
    pub(crate) fn resolve_cache_path(&self, record: &str) -> PathBuf {
        let path = PathBuf::from(record);
        if path.is_absolute() {
            path
        } else {
            self.config.root_dir.join(path)
        }
    }

    // Repo layout engine

    /// Initialize a repository layout; idempotent
    pub fn init_repo(&self, repo: &str) -> Result<()> {
        let _guard = self.write_lock()?;
        self.init_repo_inner(repo)
    }

    pub(crate) fn init_repo_inner(&self, repo: &str) -> Result<()> {
        if !valid_repo_name(repo) {
            return Err(StoreError::InvalidRepositoryName(repo.to_string()));
        }

        let repo_path = self.repo_path(repo);
        self.driver.ensure_dir(&self.blobs_path(repo))?;
        self.driver.ensure_dir(&repo_path.join(UPLOADS_DIR))?;

        let layout_path = repo_path.join(LAYOUT_FILE);
        if self.driver.stat(&layout_path).is_err() {
            let layout = serde_json::to_vec(&OciLayout::default())?;
            self.driver.write_file(&layout_path, &layout)?;
        }

        let index_path = repo_path.join(INDEX_FILE);
        if self.driver.stat(&index_path).is_err() {
            let index = serde_json::to_vec(&ImageIndex::default())?;
            self.driver.write_file(&index_path, &index)?;
        }

        Ok(())
    }

    /// Check that a directory holds a valid repository layout
    pub fn validate_repo(&self, repo: &str) -> Result<bool> {
        if !valid_repo_name(repo) {
            return Err(StoreError::InvalidRepositoryName(repo.to_string()));
        }

        let repo_path = self.repo_path(repo);
        if !self.driver.dir_exists(&repo_path) {
            return Ok(false);
        }

        let layout_bytes = match self.driver.read_file(&repo_path.join(LAYOUT_FILE)) {
            Ok(bytes) => bytes,
            Err(StoreError::PathNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let layout: OciLayout = match serde_json::from_slice(&layout_bytes) {
            Ok(layout) => layout,
            Err(_) => return Ok(false),
        };
        if layout.image_layout_version != oci::LAYOUT_VERSION {
            return Err(StoreError::RepoBadVersion(repo.to_string()));
        }

        if self.driver.stat(&repo_path.join(INDEX_FILE)).is_err() {
            return Ok(false);
        }

        // object stores have no empty directories to see
        if self.driver.is_local() && !self.driver.dir_exists(&repo_path.join(BLOBS_DIR)) {
            return Ok(false);
        }

        Ok(true)
    }

    /// List all valid repositories under the root
    pub fn get_repositories(&self) -> Result<Vec<String>> {
        let _guard = self.read_lock()?;
        self.get_repositories_inner()
    }

    pub(crate) fn get_repositories_inner(&self) -> Result<Vec<String>> {
        let root = self.config.root_dir.clone();
        let mut repos = Vec::new();

        let walked = self.driver.walk(&root, &mut |path, info| {
            if !info.is_dir {
                return Ok(());
            }
            let Ok(relative) = path.strip_prefix(&root) else {
                return Ok(());
            };
            let Some(name) = relative.to_str() else {
                return Ok(());
            };
            if matches!(self.validate_repo(name), Ok(true)) {
                repos.push(name.to_string());
            }
            Ok(())
        });
        match walked {
            Ok(()) => {}
            // empty store
            Err(StoreError::PathNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        repos.sort();
        Ok(repos)
    }

    /// Repository sorted after `prev` in walk order; empty `prev` returns
    /// the first
    pub fn get_next_repository(&self, prev: &str) -> Result<Option<String>> {
        let _guard = self.read_lock()?;
        let repos = self.get_repositories_inner()?;
        if prev.is_empty() {
            return Ok(repos.into_iter().next());
        }
        Ok(repos.into_iter().find(|r| r.as_str() > prev))
    }

    /// Tags carried by the repository index
    pub fn get_image_tags(&self, repo: &str) -> Result<Vec<String>> {
        let _guard = self.read_lock()?;
        let index = self.load_index(repo)?;
        Ok(index
            .manifests
            .iter()
            .filter_map(|d| d.tag().map(str::to_string))
            .collect())
    }

    /// Raw `index.json` bytes
    pub fn get_index_content(&self, repo: &str) -> Result<Vec<u8>> {
        let _guard = self.read_lock()?;
        match self.driver.read_file(&self.repo_path(repo).join(INDEX_FILE)) {
            Err(StoreError::PathNotFound(_)) => Err(StoreError::RepoNotFound(repo.to_string())),
            result => result,
        }
    }

    pub(crate) fn load_index(&self, repo: &str) -> Result<ImageIndex> {
        let bytes = match self.driver.read_file(&self.repo_path(repo).join(INDEX_FILE)) {
            Err(StoreError::PathNotFound(_)) => {
                return Err(StoreError::RepoNotFound(repo.to_string()))
            }
            result => result?,
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub(crate) fn store_index(&self, repo: &str, index: &ImageIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)?;
        self.driver
            .write_file(&self.repo_path(repo).join(INDEX_FILE), &bytes)
    }

    // Blob read surface

    /// Check that a blob is present, materializing a dedupe link if needed
    pub fn check_blob(&self, repo: &str, digest: &str) -> Result<(bool, u64)> {
        oci::split_digest(digest)?;

        // the dedupe branch may create a link, hence the write lock
        if self.dedupe_enabled() {
            let _guard = self.write_lock()?;
            self.check_blob_dedupe(repo, digest)
        } else {
            let _guard = self.read_lock()?;
            let blob_path = self.blob_path(repo, digest)?;
            match self.driver.stat(&blob_path) {
                Ok(info) => Ok((true, info.size)),
                Err(StoreError::PathNotFound(_)) => {
                    Err(StoreError::BlobNotFound(digest.to_string()))
                }
                Err(e) => Err(e),
            }
        }
    }

    fn check_blob_dedupe(&self, repo: &str, digest: &str) -> Result<(bool, u64)> {
        let blob_path = self.blob_path(repo, digest)?;
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| StoreError::BlobNotFound(digest.to_string()))?;

        if let Ok(info) = self.driver.stat(&blob_path) {
            if info.size > 0 {
                let record = self.cache_path_for(&blob_path);
                if !cache.has_blob(digest, &record) {
                    cache.put_blob(digest, &record)?;
                }
                return Ok((true, info.size));
            }
        }

        // not on disk here (or only a placeholder): resolve via the cache,
        // healing records whose path no longer exists
        loop {
            let record = match cache.get_blob(digest) {
                Ok(record) => record,
                Err(StoreError::CacheMiss(_)) => {
                    return Err(StoreError::BlobNotFound(digest.to_string()))
                }
                Err(e) => return Err(e),
            };
            let record_path = self.resolve_cache_path(&record);
            match self.driver.stat(&record_path) {
                Ok(info) => {
                    if !self.driver.same_file(&blob_path, &record_path) {
                        self.driver.link(&record_path, &blob_path)?;
                        cache.put_blob(digest, &self.cache_path_for(&blob_path))?;
                    }
                    return Ok((true, info.size));
                }
                Err(StoreError::PathNotFound(_)) => {
                    cache.delete_blob(digest, &record)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Blob presence, size and modification time
    pub fn stat_blob(&self, repo: &str, digest: &str) -> Result<(bool, u64, DateTime<Utc>)> {
        oci::split_digest(digest)?;
        let _guard = self.read_lock()?;

        let blob_path = self.blob_path(repo, digest)?;
        let info = match self.driver.stat(&blob_path) {
            Ok(info) => info,
            Err(StoreError::PathNotFound(_)) => {
                return Err(StoreError::BlobNotFound(digest.to_string()))
            }
            Err(e) => return Err(e),
        };

        // zero size marks a dedupe placeholder, report the primary's size
        if info.size == 0 {
            if let Some(cache) = &self.cache {
                if let Ok(record) = cache.get_blob(digest) {
                    let record_path = self.resolve_cache_path(&record);
                    if let Ok(original) = self.driver.stat(&record_path) {
                        if original.size > 0 {
                            return Ok((true, original.size, info.mtime));
                        }
                    }
                }
            }
        }

        Ok((true, info.size, info.mtime))
    }

    /// Path and size of the readable content for a blob, resolving dedupe
    /// placeholders through the cache
    pub(crate) fn blob_content_path(&self, repo: &str, digest: &str) -> Result<(PathBuf, u64)> {
        let blob_path = self.blob_path(repo, digest)?;
        let info = match self.driver.stat(&blob_path) {
            Ok(info) => info,
            Err(StoreError::PathNotFound(_)) => {
                return Err(StoreError::BlobNotFound(digest.to_string()))
            }
            Err(e) => return Err(e),
        };

        if info.size == 0 {
            if let Some(cache) = &self.cache {
                if let Ok(record) = cache.get_blob(digest) {
                    let record_path = self.resolve_cache_path(&record);
                    if let Ok(original) = self.driver.stat(&record_path) {
                        if original.size > 0 {
                            return Ok((record_path, original.size));
                        }
                    }
                }
            }
        }

        Ok((blob_path, info.size))
    }

    /// Open a blob for reading
    pub fn get_blob(
        &self,
        repo: &str,
        digest: &str,
        _media_type: &str,
    ) -> Result<(Box<dyn Read + Send>, u64)> {
        oci::split_digest(digest)?;
        let _guard = self.read_lock()?;
        let (path, size) = self.blob_content_path(repo, digest)?;
        let reader = self.driver.reader(&path, 0)?;
        Ok((reader, size))
    }

    /// Open a blob range for reading; `to = None` reads to the end
    pub fn get_blob_partial(
        &self,
        repo: &str,
        digest: &str,
        _media_type: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<(Box<dyn Read + Send>, u64, u64)> {
        oci::split_digest(digest)?;
        let _guard = self.read_lock()?;
        let (path, size) = self.blob_content_path(repo, digest)?;

        if from >= size {
            return Err(StoreError::BadRange {
                from,
                to: to.unwrap_or(size),
            });
        }
        let to = match to {
            Some(to) if to < size => to,
            _ => size - 1,
        };
        if from > to {
            return Err(StoreError::BadRange { from, to });
        }

        let length = to - from + 1;
        let reader = self.driver.reader(&path, from)?;
        Ok((Box::new(reader.take(length)), length, size))
    }

    /// Read a whole blob into memory
    pub fn get_blob_content(&self, repo: &str, digest: &str) -> Result<Vec<u8>> {
        oci::split_digest(digest)?;
        let _guard = self.read_lock()?;
        self.blob_content(repo, digest)
    }

    pub(crate) fn blob_content(&self, repo: &str, digest: &str) -> Result<Vec<u8>> {
        let (path, _) = self.blob_content_path(repo, digest)?;
        self.driver.read_file(&path)
    }

    /// Hex digests of every blob file in the repository
    pub fn get_all_blobs(&self, repo: &str) -> Result<Vec<String>> {
        let _guard = self.read_lock()?;
        let entries = match self.driver.list(&self.blobs_path(repo)) {
            Ok(entries) => entries,
            Err(StoreError::PathNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(entries
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect())
    }

    /// Delete a blob unless a manifest still references it
    pub fn delete_blob(&self, repo: &str, digest: &str) -> Result<()> {
        oci::split_digest(digest)?;
        let _guard = self.write_lock()?;
        self.delete_blob_inner(repo, digest)
    }

    pub(crate) fn delete_blob_inner(&self, repo: &str, digest: &str) -> Result<()> {
        let blob_path = self.blob_path(repo, digest)?;
        if self.driver.stat(&blob_path).is_err() {
            return Err(StoreError::BlobNotFound(digest.to_string()));
        }

        if self.is_blob_referenced(repo, digest)? {
            return Err(StoreError::BlobReferenced(digest.to_string()));
        }

        self.delete_blob_path(digest, &blob_path)
    }

    /// Physically remove a blob path, keeping the cache consistent: when the
    /// removed path was the primary and the promoted candidate is a
    /// zero-byte placeholder, the content moves there instead of dying
    pub(crate) fn delete_blob_path(&self, digest: &str, blob_path: &Path) -> Result<()> {
        if let Some(cache) = &self.cache {
            let record = self.cache_path_for(blob_path);
            let was_primary = matches!(cache.get_blob(digest), Ok(p) if p == record);
            cache.delete_blob(digest, &record)?;

            if was_primary {
                if let Ok(next) = cache.get_blob(digest) {
                    let next_path = self.resolve_cache_path(&next);
                    if let Ok(info) = self.driver.stat(&next_path) {
                        if info.size == 0 {
                            return self.driver.move_file(blob_path, &next_path);
                        }
                    }
                }
            }
        }

        self.driver.delete(blob_path)
    }
}

/// Repository names are slash-separated lowercase path components
pub(crate) fn valid_repo_name(name: &str) -> bool {
    let re = regex::Regex::new(
        r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$",
    )
    .unwrap();
    re.is_match(name)
}


#[cfg(test)]
mod tests {
    use super::testing::store_at;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_valid_repo_name() {
        assert!(valid_repo_name("alpine"));
        assert!(valid_repo_name("library/alpine"));
        assert!(valid_repo_name("a/b/c"));
        assert!(valid_repo_name("repo-1.2_3"));
        assert!(!valid_repo_name(""));
        assert!(!valid_repo_name("Alpine"));
        assert!(!valid_repo_name("repo/"));
        assert!(!valid_repo_name("/repo"));
        assert!(!valid_repo_name(".uploads"));
        assert!(!valid_repo_name("a//b"));
    }

    #[test]
    fn test_init_repo_layout() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());

        store.init_repo("alpine").unwrap();
        assert!(temp.path().join("alpine/oci-layout").exists());
        assert!(temp.path().join("alpine/index.json").exists());
        assert!(temp.path().join("alpine/blobs/sha256").is_dir());
        assert!(temp.path().join("alpine/.uploads").is_dir());

        // idempotent
        store.init_repo("alpine").unwrap();
        assert!(store.validate_repo("alpine").unwrap());
    }

    #[test]
    fn test_init_repo_rejects_bad_names() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());

        assert!(matches!(
            store.init_repo("Not-Valid"),
            Err(StoreError::InvalidRepositoryName(_))
        ));
    }

    #[test]
    fn test_validate_repo_bad_version() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());
        store.init_repo("alpine").unwrap();

        std::fs::write(
            temp.path().join("alpine/oci-layout"),
            br#"{"imageLayoutVersion":"0.9.0"}"#,
        )
        .unwrap();
        assert!(matches!(
            store.validate_repo("alpine"),
            Err(StoreError::RepoBadVersion(_))
        ));
    }

    #[test]
    fn test_get_repositories() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());

        assert!(store.get_repositories().unwrap().is_empty());

        store.init_repo("zeta").unwrap();
        store.init_repo("alpha").unwrap();
        store.init_repo("library/alpine").unwrap();
        std::fs::create_dir_all(temp.path().join("not-a-repo")).unwrap();

        assert_eq!(
            store.get_repositories().unwrap(),
            vec!["alpha", "library/alpine", "zeta"]
        );
    }

    #[test]
    fn test_get_next_repository() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());
        store.init_repo("a").unwrap();
        store.init_repo("b").unwrap();
        store.init_repo("c").unwrap();

        assert_eq!(store.get_next_repository("").unwrap(), Some("a".to_string()));
        assert_eq!(store.get_next_repository("a").unwrap(), Some("b".to_string()));
        assert_eq!(store.get_next_repository("c").unwrap(), None);
    }

    #[test]
    fn test_blob_lookups_on_missing_blob() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());
        store.init_repo("alpine").unwrap();
        let digest = oci::sha256_digest(b"nope");

        assert!(matches!(
            store.check_blob("alpine", &digest),
            Err(StoreError::BlobNotFound(_))
        ));
        assert!(matches!(
            store.stat_blob("alpine", &digest),
            Err(StoreError::BlobNotFound(_))
        ));
        assert!(matches!(
            store.check_blob("alpine", "garbage"),
            Err(StoreError::BadBlobDigest(_))
        ));
    }
}
