//! Manifest engine
//!
//! Put/get/delete of manifests and image indexes against the append-only
//! `index.json`, with tag collision handling and pruning of manifests
//! orphaned by a replacement or deletion.

use super::ImageStore;
use crate::error::{Result, StoreError};
use crate::oci::{self, media_types, Descriptor, ImageIndex, ImageManifest};

/// Artifact type of a manifest: the explicit field, else the config media
/// type when it is not a standard image config
pub(crate) fn manifest_artifact_type(manifest: &ImageManifest) -> Option<String> {
    manifest.artifact_type.clone().or_else(|| {
        if manifest.config.media_type != media_types::IMAGE_CONFIG {
            Some(manifest.config.media_type.clone())
        } else {
            None
        }
    })
}

impl ImageStore {
    /// Store a manifest or image index under a tag or digest reference
    ///
    /// Returns the manifest digest and, for referrers, the subject digest.
    pub fn put_image_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        body: &[u8],
    ) -> Result<(String, Option<String>)> {
        let _guard = self.write_lock()?;
        self.init_repo_inner(repo)?;

        let digest = oci::sha256_digest(body);

        // a digest reference must match the content
        let tag = if oci::split_digest(reference).is_ok() {
            if reference != digest {
                return Err(StoreError::BadManifest(format!(
                    "digest reference {} does not match manifest digest {}",
                    reference, digest
                )));
            }
            None
        } else {
            Some(reference)
        };

        self.validate_manifest_content(repo, media_type, body)?;

        let mut index = self.load_index(repo)?;

        let mut desc = Descriptor::new(media_type, &digest, body.len() as u64);
        if let Some(tag) = tag {
            desc.set_tag(tag);
        }

        let mut subject_digest = None;
        if oci::is_manifest_media_type(media_type) {
            let manifest: ImageManifest = serde_json::from_slice(body)
                .map_err(|e| StoreError::BadManifest(e.to_string()))?;
            subject_digest = manifest.subject.as_ref().map(|s| s.digest.clone());
            desc.artifact_type = manifest_artifact_type(&manifest);
        } else if oci::is_index_media_type(media_type) {
            let image_index: ImageIndex = serde_json::from_slice(body)
                .map_err(|e| StoreError::BadManifest(e.to_string()))?;
            subject_digest = image_index.subject.as_ref().map(|s| s.digest.clone());
            desc.artifact_type = image_index.artifact_type.clone();
        }

        // already present under the same reference: idempotent no-op
        if index
            .manifests
            .iter()
            .any(|m| m.digest == digest && m.tag() == desc.tag())
        {
            return Ok((digest, subject_digest));
        }
        if desc.tag().is_none() && index.contains_digest(&digest) {
            return Ok((digest, subject_digest));
        }

        // the tag moving to a new digest replaces the old descriptor
        let mut replaced: Option<Descriptor> = None;
        if let Some(tag) = desc.tag() {
            if let Some(pos) = index.manifests.iter().position(|m| m.tag() == Some(tag)) {
                replaced = Some(index.manifests.remove(pos));
            }
        }
        index.manifests.push(desc);

        let blob_path = self.blob_path(repo, &digest)?;
        self.driver().write_file(&blob_path, body)?;

        if let Some(linter) = self.linter() {
            if !linter.lint(repo, &digest, &index)? {
                return Err(StoreError::BadManifest(format!(
                    "linter rejected manifest {}",
                    digest
                )));
            }
        }

        let mut reclaim = Vec::new();
        if let Some(replaced) = &replaced {
            reclaim = self.update_index_with_pruned_manifests(repo, &mut index, replaced)?;
        }

        self.store_index(repo, &index)?;
        self.reclaim_blobs(repo, &reclaim);

        Ok((digest, subject_digest))
    }

    /// Fetch a manifest by tag or digest
    pub fn get_image_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(Vec<u8>, String, String)> {
        let _guard = self.read_lock()?;
        let index = self.load_index(repo)?;

        let is_digest_ref = oci::split_digest(reference).is_ok();
        let desc = index
            .manifests
            .iter()
            .find(|m| {
                if is_digest_ref {
                    m.digest == reference
                } else {
                    m.tag() == Some(reference)
                }
            })
            .ok_or_else(|| StoreError::ManifestNotFound(reference.to_string()))?;

        let bytes = match self.blob_content(repo, &desc.digest) {
            Err(StoreError::BlobNotFound(_)) => {
                return Err(StoreError::ManifestNotFound(reference.to_string()))
            }
            result => result?,
        };

        Ok((bytes, desc.digest.clone(), desc.media_type.clone()))
    }

    /// Remove a manifest by tag or digest
    ///
    /// With `detect_collisions`, a digest reference matching more than one
    /// tagged descriptor is refused. A manifest still referenced through an
    /// image index cannot be deleted.
    pub fn delete_image_manifest(
        &self,
        repo: &str,
        reference: &str,
        detect_collisions: bool,
    ) -> Result<()> {
        let _guard = self.write_lock()?;
        self.delete_image_manifest_inner(repo, reference, detect_collisions)
    }

    pub(crate) fn delete_image_manifest_inner(
        &self,
        repo: &str,
        reference: &str,
        detect_collisions: bool,
    ) -> Result<()> {
        let mut index = self.load_index(repo)?;

        let is_digest_ref = oci::split_digest(reference).is_ok();
        let matched: Vec<usize> = index
            .manifests
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                if is_digest_ref {
                    m.digest == reference
                } else {
                    m.tag() == Some(reference)
                }
            })
            .map(|(i, _)| i)
            .collect();

        if matched.is_empty() {
            return Err(StoreError::ManifestNotFound(reference.to_string()));
        }

        if detect_collisions && is_digest_ref {
            let tagged = matched
                .iter()
                .filter(|&&i| index.manifests[i].tag().is_some())
                .count();
            if tagged > 1 {
                return Err(StoreError::ManifestConflict(reference.to_string()));
            }
        }

        let target = index.manifests[matched[0]].clone();

        if oci::is_manifest_media_type(&target.media_type)
            && self
                .index_referenced_digests(repo, &index)?
                .contains(&target.digest)
        {
            return Err(StoreError::ManifestReferenced(target.digest.clone()));
        }

        for &i in matched.iter().rev() {
            index.manifests.remove(i);
        }

        let reclaim = self.update_index_with_pruned_manifests(repo, &mut index, &target)?;

        self.store_index(repo, &index)?;
        self.reclaim_blobs(repo, &reclaim);

        Ok(())
    }

    /// Manifests and indexes whose subject is the given digest
    pub fn get_referrers(
        &self,
        repo: &str,
        digest: &str,
        artifact_types: &[String],
    ) -> Result<ImageIndex> {
        oci::split_digest(digest)?;
        let _guard = self.read_lock()?;
        let index = self.load_index(repo)?;

        let mut referrers = Vec::new();
        for desc in &index.manifests {
            let Ok(bytes) = self.blob_content(repo, &desc.digest) else {
                continue;
            };

            let (subject, artifact_type, annotations) =
                if oci::is_manifest_media_type(&desc.media_type) {
                    let Ok(manifest) = serde_json::from_slice::<ImageManifest>(&bytes) else {
                        continue;
                    };
                    let artifact_type = manifest_artifact_type(&manifest);
                    (manifest.subject, artifact_type, manifest.annotations)
                } else if oci::is_index_media_type(&desc.media_type) {
                    let Ok(image_index) = serde_json::from_slice::<ImageIndex>(&bytes) else {
                        continue;
                    };
                    (
                        image_index.subject,
                        image_index.artifact_type,
                        image_index.annotations,
                    )
                } else {
                    continue;
                };

            let Some(subject) = subject else { continue };
            if subject.digest != digest {
                continue;
            }
            if !artifact_types.is_empty() {
                match &artifact_type {
                    Some(at) if artifact_types.contains(at) => {}
                    _ => continue,
                }
            }

            let mut referrer = Descriptor::new(&desc.media_type, &desc.digest, desc.size);
            referrer.artifact_type = artifact_type;
            referrer.annotations = annotations;
            referrers.push(referrer);
        }

        Ok(ImageIndex {
            manifests: referrers,
            ..Default::default()
        })
    }

    /// Syntactic validation plus referenced-blob presence checks
    fn validate_manifest_content(&self, repo: &str, media_type: &str, body: &[u8]) -> Result<()> {
        oci::validate_manifest(media_type, body)?;

        if oci::is_manifest_media_type(media_type) {
            let manifest: ImageManifest = serde_json::from_slice(body)
                .map_err(|e| StoreError::BadManifest(e.to_string()))?;
            if !self.blob_present(repo, &manifest.config.digest) {
                return Err(StoreError::BadManifest(format!(
                    "config blob {} not found",
                    manifest.config.digest
                )));
            }
            for layer in &manifest.layers {
                if !self.blob_present(repo, &layer.digest) {
                    return Err(StoreError::BadManifest(format!(
                        "layer blob {} not found",
                        layer.digest
                    )));
                }
            }
        } else if oci::is_index_media_type(media_type) {
            let image_index: ImageIndex = serde_json::from_slice(body)
                .map_err(|e| StoreError::BadManifest(e.to_string()))?;
            for child in &image_index.manifests {
                if !self.blob_present(repo, &child.digest) {
                    return Err(StoreError::BadManifest(format!(
                        "referenced manifest {} not found",
                        child.digest
                    )));
                }
            }
        }

        Ok(())
    }

    /// True when the blob is on disk here or resolvable through the cache
    pub(crate) fn blob_present(&self, repo: &str, digest: &str) -> bool {
        let Ok(blob_path) = self.blob_path(repo, digest) else {
            return false;
        };
        if self.driver().stat(&blob_path).is_ok() {
            return true;
        }
        if let Some(cache) = self.cache() {
            if let Ok(record) = cache.get_blob(digest) {
                return self.driver().stat(&self.resolve_cache_path(&record)).is_ok();
            }
        }
        false
    }

    /// Drop descriptors orphaned by the removal of `removed` and return the
    /// digests whose blobs can go with them
    ///
    /// A digest still carried by another descriptor, or referenced through
    /// any image index left in `index`, is kept. When the removed
    /// descriptor was itself an image index, its untagged children are
    /// pruned with it under the same conditions; deeper chains are the
    /// garbage collector's job.
    pub(crate) fn update_index_with_pruned_manifests(
        &self,
        repo: &str,
        index: &mut ImageIndex,
        removed: &Descriptor,
    ) -> Result<Vec<String>> {
        let mut reclaim = Vec::new();

        if index.contains_digest(&removed.digest) {
            return Ok(reclaim);
        }
        if self
            .index_referenced_digests(repo, index)?
            .contains(&removed.digest)
        {
            return Ok(reclaim);
        }

        reclaim.push(removed.digest.clone());

        if !oci::is_index_media_type(&removed.media_type) {
            return Ok(reclaim);
        }

        let Ok(bytes) = self.blob_content(repo, &removed.digest) else {
            return Ok(reclaim);
        };
        let Ok(removed_index) = serde_json::from_slice::<ImageIndex>(&bytes) else {
            return Ok(reclaim);
        };

        let referenced = self.index_referenced_digests(repo, index)?;
        for child in &removed_index.manifests {
            if referenced.contains(&child.digest) {
                continue;
            }
            let Some(pos) = index
                .manifests
                .iter()
                .position(|m| m.digest == child.digest && m.tag().is_none())
            else {
                continue;
            };
            index.manifests.remove(pos);
            if !index.contains_digest(&child.digest) {
                reclaim.push(child.digest.clone());
            }
        }

        Ok(reclaim)
    }

    /// Best-effort physical deletion of pruned manifest blobs
    pub(crate) fn reclaim_blobs(&self, repo: &str, digests: &[String]) {
        for digest in digests {
            let Ok(blob_path) = self.blob_path(repo, digest) else {
                continue;
            };
            if self.driver().stat(&blob_path).is_err() {
                continue;
            }
            if let Err(e) = self.delete_blob_path(digest, &blob_path) {
                tracing::warn!("Failed to delete pruned blob {}: {}", digest, e);
            }
        }
    }
}
