//! Garbage collector
//!
//! Three phases under the repository write lock: a fixed-point sweep of
//! referrers whose subject left the index, retention-delayed removal of
//! untagged manifests, and an orphan blob sweep coordinated with the
//! dedupe cache. Per-item failures are logged and skipped so an
//! interrupted sweep always leaves a valid store.

use super::ImageStore;
use crate::error::{Result, StoreError};
use crate::oci::{self, Descriptor, ImageIndex, ImageManifest};
use chrono::Utc;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

impl ImageStore {
    /// Run garbage collection for one repository
    pub fn run_gc_repo(&self, repo: &str) -> Result<()> {
        if !self.config().gc {
            return Ok(());
        }
        let _guard = self.write_lock()?;
        self.garbage_collect(repo)
    }

    pub(crate) fn garbage_collect(&self, repo: &str) -> Result<()> {
        if !self.driver().dir_exists(&self.repo_path(repo)) {
            return Ok(());
        }

        if self.config().gc_referrers {
            self.sweep_orphan_referrers(repo)?;
        }
        self.sweep_untagged_manifests(repo)?;
        self.sweep_orphan_blobs(repo)?;

        Ok(())
    }

    /// Remove referrers whose subject left the index
    ///
    /// Each removal can orphan the next referrer in a chain, so sweeps
    /// repeat until a full pass deletes nothing.
    fn sweep_orphan_referrers(&self, repo: &str) -> Result<()> {
        loop {
            let mut index = self.load_index(repo)?;
            let mut reclaim = Vec::new();
            let mut changed = false;

            let snapshot = index.manifests.clone();
            for desc in &snapshot {
                let Some(target) = self.referrer_target(repo, desc) else {
                    continue;
                };
                if index.contains_digest(&target) {
                    continue;
                }
                let old_enough =
                    match self.blob_older_than(repo, &desc.digest, self.config().gc_delay) {
                        Ok(old_enough) => old_enough,
                        Err(e) => {
                            warn!("Failed to stat referrer {}: {}", desc.digest, e);
                            continue;
                        }
                    };
                if !old_enough {
                    continue;
                }

                let Some(pos) = index
                    .manifests
                    .iter()
                    .position(|m| m.digest == desc.digest && m.tag() == desc.tag())
                else {
                    continue;
                };
                info!(
                    "Garbage collecting referrer {} with missing subject {} in {}",
                    desc.digest, target, repo
                );
                index.manifests.remove(pos);
                changed = true;
                if !index.contains_digest(&desc.digest) {
                    reclaim.push(desc.digest.clone());
                }
            }

            if !changed {
                return Ok(());
            }
            self.store_index(repo, &index)?;
            self.reclaim_blobs(repo, &reclaim);
        }
    }

    /// Untagged manifests outside the set referenced by image indexes are
    /// removed once older than the retention delay
    fn sweep_untagged_manifests(&self, repo: &str) -> Result<()> {
        let mut index = self.load_index(repo)?;
        let referenced = self.index_referenced_digests(repo, &index)?;

        let mut reclaim = Vec::new();
        let mut changed = false;
        let snapshot = index.manifests.clone();
        for desc in &snapshot {
            if desc.tag().is_some() {
                continue;
            }
            if !oci::is_manifest_media_type(&desc.media_type)
                && !oci::is_index_media_type(&desc.media_type)
            {
                continue;
            }
            if referenced.contains(&desc.digest) {
                continue;
            }
            // referrers live and die with their subject (phase one)
            if self.referrer_target(repo, desc).is_some() {
                continue;
            }
            let old_enough =
                match self.blob_older_than(repo, &desc.digest, self.config().retention_delay) {
                    Ok(old_enough) => old_enough,
                    Err(e) => {
                        warn!("Failed to stat manifest {}: {}", desc.digest, e);
                        continue;
                    }
                };
            if !old_enough {
                continue;
            }

            let Some(pos) = index
                .manifests
                .iter()
                .position(|m| m.digest == desc.digest && m.tag().is_none())
            else {
                continue;
            };
            info!("Garbage collecting untagged manifest {} in {}", desc.digest, repo);
            index.manifests.remove(pos);
            changed = true;
            if !index.contains_digest(&desc.digest) {
                reclaim.push(desc.digest.clone());
            }
        }

        if changed {
            self.store_index(repo, &index)?;
            self.reclaim_blobs(repo, &reclaim);
        }
        Ok(())
    }

    /// Blobs unreachable from any descriptor are deleted once older than
    /// the gc delay; a repository left with nothing is removed entirely
    fn sweep_orphan_blobs(&self, repo: &str) -> Result<()> {
        let index = self.load_index(repo)?;
        let referenced = self.referenced_blobs(repo, &index)?;

        let entries = match self.driver().list(&self.blobs_path(repo)) {
            Ok(entries) => entries,
            Err(StoreError::PathNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut remaining = 0usize;
        for path in &entries {
            let Some(hex) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !super::dedupe::is_blob_file_name(hex) {
                continue;
            }
            let digest = format!("sha256:{}", hex);
            if referenced.contains(&digest) {
                remaining += 1;
                continue;
            }

            let old_enough = match self.driver().stat(path) {
                Ok(stat) => {
                    (Utc::now() - stat.mtime).to_std().unwrap_or_default()
                        >= self.config().gc_delay
                }
                Err(_) => false,
            };
            if !old_enough {
                remaining += 1;
                continue;
            }

            match self.delete_orphan_blob(repo, &digest) {
                Ok(()) => debug!("Garbage collected blob {} in {}", digest, repo),
                Err(e) => {
                    warn!("Failed to garbage collect blob {} in {}: {}", digest, repo, e);
                    remaining += 1;
                }
            }
        }

        let index = self.load_index(repo)?;
        if index.manifests.is_empty() && remaining == 0 {
            info!("Removing empty repository {}", repo);
            self.driver().delete(&self.repo_path(repo))?;
        }
        Ok(())
    }

    /// Reclaim one orphan, falling back to manifest deletion when a
    /// concurrent put made the digest referenced again
    fn delete_orphan_blob(&self, repo: &str, digest: &str) -> Result<()> {
        match self.delete_blob_inner(repo, digest) {
            Ok(()) => Ok(()),
            Err(StoreError::BlobReferenced(_)) => {
                match self.delete_image_manifest_inner(repo, digest, true) {
                    Ok(()) => Ok(()),
                    // the digest is tagged more than once, leave it alone
                    Err(StoreError::ManifestConflict(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Digest a descriptor refers to, through its manifest subject or a
    /// cosign-style sibling tag
    fn referrer_target(&self, repo: &str, desc: &Descriptor) -> Option<String> {
        if let Some(tag) = desc.tag() {
            if let Some(target) = oci::sibling_tag_digest(tag) {
                return Some(target);
            }
        }
        if oci::is_manifest_media_type(&desc.media_type) {
            let bytes = self.blob_content(repo, &desc.digest).ok()?;
            let manifest: ImageManifest = serde_json::from_slice(&bytes).ok()?;
            return manifest.subject.map(|s| s.digest);
        }
        if oci::is_index_media_type(&desc.media_type) {
            let bytes = self.blob_content(repo, &desc.digest).ok()?;
            let index: ImageIndex = serde_json::from_slice(&bytes).ok()?;
            return index.subject.map(|s| s.digest);
        }
        None
    }

    fn blob_older_than(&self, repo: &str, digest: &str, min_age: Duration) -> Result<bool> {
        let path = self.blob_path(repo, digest)?;
        let stat = self.driver().stat(&path)?;
        let age = (Utc::now() - stat.mtime).to_std().unwrap_or_default();
        Ok(age >= min_age)
    }

    /// Digests transitively referenced by image-index descriptors
    pub(crate) fn index_referenced_digests(
        &self,
        repo: &str,
        index: &ImageIndex,
    ) -> Result<HashSet<String>> {
        let mut referenced = HashSet::new();
        let mut queue: Vec<String> = index
            .manifests
            .iter()
            .filter(|d| oci::is_index_media_type(&d.media_type))
            .map(|d| d.digest.clone())
            .collect();
        let mut visited: HashSet<String> = queue.iter().cloned().collect();

        while let Some(digest) = queue.pop() {
            let Ok(bytes) = self.blob_content(repo, &digest) else {
                continue;
            };
            let Ok(child_index) = serde_json::from_slice::<ImageIndex>(&bytes) else {
                continue;
            };
            for child in &child_index.manifests {
                referenced.insert(child.digest.clone());
                if oci::is_index_media_type(&child.media_type)
                    && visited.insert(child.digest.clone())
                {
                    queue.push(child.digest.clone());
                }
            }
        }

        Ok(referenced)
    }

    /// Every digest reachable from the index: descriptors, their configs,
    /// layers, subjects and nested index members
    pub(crate) fn referenced_blobs(
        &self,
        repo: &str,
        index: &ImageIndex,
    ) -> Result<HashSet<String>> {
        let mut referenced = HashSet::new();
        let mut visited = HashSet::new();
        let mut queue: Vec<Descriptor> = index.manifests.clone();

        while let Some(desc) = queue.pop() {
            if !visited.insert(desc.digest.clone()) {
                continue;
            }
            referenced.insert(desc.digest.clone());

            let Ok(bytes) = self.blob_content(repo, &desc.digest) else {
                continue;
            };
            if oci::is_manifest_media_type(&desc.media_type) {
                let Ok(manifest) = serde_json::from_slice::<ImageManifest>(&bytes) else {
                    continue;
                };
                referenced.insert(manifest.config.digest.clone());
                for layer in &manifest.layers {
                    referenced.insert(layer.digest.clone());
                }
                if let Some(subject) = &manifest.subject {
                    referenced.insert(subject.digest.clone());
                }
            } else if oci::is_index_media_type(&desc.media_type) {
                let Ok(child_index) = serde_json::from_slice::<ImageIndex>(&bytes) else {
                    continue;
                };
                for child in &child_index.manifests {
                    queue.push(child.clone());
                }
                if let Some(subject) = &child_index.subject {
                    referenced.insert(subject.digest.clone());
                }
            }
        }

        Ok(referenced)
    }

    /// True when the digest is reachable from the repository index
    pub(crate) fn is_blob_referenced(&self, repo: &str, digest: &str) -> Result<bool> {
        let index = match self.load_index(repo) {
            Ok(index) => index,
            Err(StoreError::RepoNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self.referenced_blobs(repo, &index)?.contains(digest))
    }
}

#[cfg(test)]
mod tests {
    use crate::driver::LocalFsDriver;
    use crate::error::StoreError;
    use crate::metrics::NoopMetrics;
    use crate::oci::{self, media_types, Descriptor};
    use crate::store::testing::{self, make_manifest, store_at};
    use crate::store::ImageStore;
    use std::time::Duration;
    use tempfile::tempdir;

    fn store_with(root: &std::path::Path, f: impl FnOnce(&mut crate::store::StoreConfig)) -> ImageStore {
        let mut config = testing::config(root);
        f(&mut config);
        ImageStore::new(
            config,
            Box::new(LocalFsDriver::new(false)),
            None,
            None,
            Box::new(NoopMetrics),
        )
        .unwrap()
    }

    #[test]
    fn test_untagged_manifest_is_reclaimed() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());

        let (keep, _) = make_manifest(&store, "alpine", b"keep", None);
        store
            .put_image_manifest("alpine", "v1", media_types::IMAGE_MANIFEST, &keep)
            .unwrap();

        let (untagged, untagged_digest) = make_manifest(&store, "alpine", b"drop", None);
        store
            .put_image_manifest("alpine", &untagged_digest, media_types::IMAGE_MANIFEST, &untagged)
            .unwrap();

        store.run_gc_repo("alpine").unwrap();

        assert_eq!(store.get_image_tags("alpine").unwrap(), vec!["v1"]);
        assert!(matches!(
            store.get_image_manifest("alpine", &untagged_digest),
            Err(StoreError::ManifestNotFound(_))
        ));
        assert!(store.get_image_manifest("alpine", "v1").is_ok());
    }

    #[test]
    fn test_retention_delay_protects_untagged_manifests() {
        let temp = tempdir().unwrap();
        let store = store_with(temp.path(), |c| {
            c.retention_delay = Duration::from_secs(3600);
        });

        let (untagged, untagged_digest) = make_manifest(&store, "alpine", b"young", None);
        store
            .put_image_manifest("alpine", &untagged_digest, media_types::IMAGE_MANIFEST, &untagged)
            .unwrap();

        store.run_gc_repo("alpine").unwrap();
        assert!(store.get_image_manifest("alpine", &untagged_digest).is_ok());
    }

    #[test]
    fn test_orphan_blob_sweep() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());

        let (keep, _) = make_manifest(&store, "alpine", b"keep", None);
        store
            .put_image_manifest("alpine", "v1", media_types::IMAGE_MANIFEST, &keep)
            .unwrap();

        let stray = oci::sha256_digest(b"stray");
        store.full_blob_upload("alpine", b"stray", &stray).unwrap();

        store.run_gc_repo("alpine").unwrap();

        assert!(matches!(
            store.get_blob_content("alpine", &stray),
            Err(StoreError::BlobNotFound(_))
        ));
        // everything the tagged manifest references survives
        assert!(store.get_image_manifest("alpine", "v1").is_ok());
        let index = store.load_index("alpine").unwrap();
        assert_eq!(index.manifests.len(), 1);
    }

    #[test]
    fn test_gc_delay_protects_orphan_blobs() {
        let temp = tempdir().unwrap();
        let store = store_with(temp.path(), |c| {
            c.gc_delay = Duration::from_secs(3600);
        });

        let stray = oci::sha256_digest(b"stray");
        store.full_blob_upload("alpine", b"stray", &stray).unwrap();

        store.run_gc_repo("alpine").unwrap();
        assert!(store.get_blob_content("alpine", &stray).is_ok());
    }

    #[test]
    fn test_referrer_cascade_collapses_in_one_run() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());

        let (keep, _) = make_manifest(&store, "alpine", b"keep", None);
        store
            .put_image_manifest("alpine", "keep", media_types::IMAGE_MANIFEST, &keep)
            .unwrap();

        let (image, image_digest) = make_manifest(&store, "alpine", b"img", None);
        store
            .put_image_manifest("alpine", "v1", media_types::IMAGE_MANIFEST, &image)
            .unwrap();

        let subject = Descriptor::new(media_types::IMAGE_MANIFEST, &image_digest, image.len() as u64);
        let (r1, r1_digest) = make_manifest(&store, "alpine", b"sig", Some(subject));
        store
            .put_image_manifest("alpine", &r1_digest, media_types::IMAGE_MANIFEST, &r1)
            .unwrap();

        let subject = Descriptor::new(media_types::IMAGE_MANIFEST, &r1_digest, r1.len() as u64);
        let (r2, r2_digest) = make_manifest(&store, "alpine", b"sig-of-sig", Some(subject));
        store
            .put_image_manifest("alpine", &r2_digest, media_types::IMAGE_MANIFEST, &r2)
            .unwrap();

        // referrers stay while their subject chain is intact
        store.run_gc_repo("alpine").unwrap();
        assert!(store.get_image_manifest("alpine", &r1_digest).is_ok());
        assert!(store.get_image_manifest("alpine", &r2_digest).is_ok());

        store.delete_image_manifest("alpine", "v1", false).unwrap();
        store.run_gc_repo("alpine").unwrap();

        assert!(matches!(
            store.get_image_manifest("alpine", &r1_digest),
            Err(StoreError::ManifestNotFound(_))
        ));
        assert!(matches!(
            store.get_image_manifest("alpine", &r2_digest),
            Err(StoreError::ManifestNotFound(_))
        ));
        assert!(store.get_image_manifest("alpine", "keep").is_ok());
    }

    #[test]
    fn test_sibling_tag_referrer_is_reclaimed() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());

        let (keep, _) = make_manifest(&store, "alpine", b"keep", None);
        store
            .put_image_manifest("alpine", "keep", media_types::IMAGE_MANIFEST, &keep)
            .unwrap();

        let (image, image_digest) = make_manifest(&store, "alpine", b"img", None);
        store
            .put_image_manifest("alpine", "v1", media_types::IMAGE_MANIFEST, &image)
            .unwrap();

        let (_, hex) = oci::split_digest(&image_digest).unwrap();
        let sig_tag = format!("sha256-{}.sig", hex);
        let (sig, sig_digest) = make_manifest(&store, "alpine", b"cosig", None);
        store
            .put_image_manifest("alpine", &sig_tag, media_types::IMAGE_MANIFEST, &sig)
            .unwrap();

        store.run_gc_repo("alpine").unwrap();
        assert!(store.get_image_manifest("alpine", &sig_tag).is_ok());

        store.delete_image_manifest("alpine", "v1", false).unwrap();
        store.run_gc_repo("alpine").unwrap();

        assert!(matches!(
            store.get_image_manifest("alpine", &sig_tag),
            Err(StoreError::ManifestNotFound(_))
        ));
        assert!(matches!(
            store.get_blob_content("alpine", &sig_digest),
            Err(StoreError::BlobNotFound(_))
        ));
    }

    #[test]
    fn test_empty_repo_is_removed() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());

        let (body, _) = make_manifest(&store, "alpine", b"v1", None);
        store
            .put_image_manifest("alpine", "v1", media_types::IMAGE_MANIFEST, &body)
            .unwrap();

        store.delete_image_manifest("alpine", "v1", false).unwrap();
        store.run_gc_repo("alpine").unwrap();

        assert!(!temp.path().join("alpine").exists());
        // collecting a repo that no longer exists is a no-op
        store.run_gc_repo("alpine").unwrap();
    }

    #[test]
    fn test_gc_is_idempotent() {
        let temp = tempdir().unwrap();
        let store = store_at(temp.path());

        let (body, _) = make_manifest(&store, "alpine", b"v1", None);
        store
            .put_image_manifest("alpine", "v1", media_types::IMAGE_MANIFEST, &body)
            .unwrap();
        let stray = oci::sha256_digest(b"stray");
        store.full_blob_upload("alpine", b"stray", &stray).unwrap();

        store.run_gc_repo("alpine").unwrap();
        let index_after_first = store.get_index_content("alpine").unwrap();
        let blobs_after_first = store.get_all_blobs("alpine").unwrap();

        store.run_gc_repo("alpine").unwrap();
        assert_eq!(store.get_index_content("alpine").unwrap(), index_after_first);
        assert_eq!(store.get_all_blobs("alpine").unwrap(), blobs_after_first);
    }

    #[test]
    fn test_gc_disabled_is_a_noop() {
        let temp = tempdir().unwrap();
        let store = store_with(temp.path(), |c| c.gc = false);

        let stray = oci::sha256_digest(b"stray");
        store.full_blob_upload("alpine", b"stray", &stray).unwrap();

        store.run_gc_repo("alpine").unwrap();
        assert!(store.get_blob_content("alpine", &stray).is_ok());
    }
}
