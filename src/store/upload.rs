//! Blob upload engine
//!
//! Chunked, resumable uploads staged under `.uploads/<uuid>`, verified
//! against their expected digest and finalized into the content-addressed
//! blob pool. Streaming writes run outside the store lock; only the
//! finalize step takes it.

use super::ImageStore;
use crate::error::{Result, StoreError};
use crate::oci;
use sha2::{Digest as _, Sha256};
use std::io::{self, Read, Write};
use uuid::Uuid;

impl ImageStore {
    /// Begin a new upload session, returning its uuid
    pub fn new_blob_upload(&self, repo: &str) -> Result<String> {
        self.init_repo(repo)?;

        let uuid = Uuid::new_v4().to_string();
        let path = self.upload_path(repo, &uuid);
        let mut writer = self.driver().writer(&path, false)?;
        writer.close()?;

        Ok(uuid)
    }

    /// Append a chunk; `from` must equal the current upload size
    pub fn put_blob_chunk(
        &self,
        repo: &str,
        uuid: &str,
        from: u64,
        _to: u64,
        body: &mut dyn Read,
    ) -> Result<u64> {
        let path = self.upload_path(repo, uuid);
        let mut writer = match self.driver().writer(&path, true) {
            Ok(writer) => writer,
            Err(StoreError::PathNotFound(_)) => {
                return Err(StoreError::UploadNotFound(uuid.to_string()))
            }
            Err(e) => return Err(e),
        };

        let size = writer.size();
        if from != size {
            writer.close()?;
            return Err(StoreError::BadUploadRange { offset: from, size });
        }

        let copied = io::copy(body, &mut writer)?;
        writer.commit()?;
        writer.close()?;
        Ok(copied)
    }

    /// Append a chunk without range verification
    pub fn put_blob_chunk_streamed(
        &self,
        repo: &str,
        uuid: &str,
        body: &mut dyn Read,
    ) -> Result<u64> {
        let path = self.upload_path(repo, uuid);
        let mut writer = match self.driver().writer(&path, true) {
            Ok(writer) => writer,
            Err(StoreError::PathNotFound(_)) => {
                return Err(StoreError::UploadNotFound(uuid.to_string()))
            }
            Err(e) => return Err(e),
        };

        let copied = io::copy(body, &mut writer)?;
        writer.commit()?;
        writer.close()?;
        Ok(copied)
    }

    /// Current size of an in-progress upload
    pub fn blob_upload_info(&self, repo: &str, uuid: &str) -> Result<u64> {
        let path = self.upload_path(repo, uuid);
        match self.driver().stat(&path) {
            Ok(info) => Ok(info.size),
            Err(StoreError::PathNotFound(_)) => Err(StoreError::UploadNotFound(uuid.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Alias for [`ImageStore::blob_upload_info`]
    pub fn get_blob_upload(&self, repo: &str, uuid: &str) -> Result<u64> {
        self.blob_upload_info(repo, uuid)
    }

    /// Finalize an upload into the blob pool
    ///
    /// Any trailing `body` bytes are appended first; the whole upload is
    /// re-read to verify the expected digest before the blob becomes
    /// addressable. A digest mismatch removes the upload and leaves nothing
    /// under `blobs/`.
    pub fn finish_blob_upload(
        &self,
        repo: &str,
        uuid: &str,
        body: Option<&[u8]>,
        expected_digest: &str,
    ) -> Result<()> {
        oci::split_digest(expected_digest)?;

        let upload_path = self.upload_path(repo, uuid);
        let mut writer = match self.driver().writer(&upload_path, true) {
            Ok(writer) => writer,
            Err(StoreError::PathNotFound(_)) => {
                return Err(StoreError::UploadNotFound(uuid.to_string()))
            }
            Err(e) => return Err(e),
        };
        if let Some(body) = body {
            if !body.is_empty() {
                writer.write_all(body)?;
            }
        }
        writer.commit()?;
        writer.close()?;

        let mut reader = self.driver().reader(&upload_path, 0)?;
        let mut hasher = Sha256::new();
        io::copy(&mut reader, &mut hasher)?;
        let actual_digest = format!("sha256:{:x}", hasher.finalize());

        if actual_digest != expected_digest {
            self.driver().delete(&upload_path)?;
            return Err(StoreError::BadBlobDigest(format!(
                "expected {}, got {}",
                expected_digest, actual_digest
            )));
        }

        self.driver().ensure_dir(&self.blobs_path(repo))?;
        let blob_path = self.blob_path(repo, &actual_digest)?;

        let _guard = self.write_lock()?;
        if self.dedupe_enabled() {
            self.dedupe_finalize(&actual_digest, &upload_path, &blob_path)
        } else {
            self.driver().move_file(&upload_path, &blob_path)
        }
    }

    /// Single-shot upload of a fully buffered body
    ///
    /// The body is buffered so the digest is known before anything is
    /// committed, which object-store writers require.
    pub fn full_blob_upload(
        &self,
        repo: &str,
        body: &[u8],
        expected_digest: &str,
    ) -> Result<(String, u64)> {
        oci::split_digest(expected_digest)?;
        self.init_repo(repo)?;

        let uuid = Uuid::new_v4().to_string();
        let upload_path = self.upload_path(repo, &uuid);
        let mut writer = self.driver().writer(&upload_path, false)?;
        writer.write_all(body)?;
        writer.commit()?;
        writer.close()?;

        let actual_digest = oci::sha256_digest(body);
        if actual_digest != expected_digest {
            self.driver().delete(&upload_path)?;
            return Err(StoreError::BadBlobDigest(format!(
                "expected {}, got {}",
                expected_digest, actual_digest
            )));
        }

        self.driver().ensure_dir(&self.blobs_path(repo))?;
        let blob_path = self.blob_path(repo, &actual_digest)?;

        let _guard = self.write_lock()?;
        if self.dedupe_enabled() {
            self.dedupe_finalize(&actual_digest, &upload_path, &blob_path)?;
        } else {
            self.driver().move_file(&upload_path, &blob_path)?;
        }

        Ok((uuid, body.len() as u64))
    }

    /// Abort an upload and remove its staged file
    pub fn delete_blob_upload(&self, repo: &str, uuid: &str) -> Result<()> {
        let path = self.upload_path(repo, uuid);
        let mut writer = match self.driver().writer(&path, true) {
            Ok(writer) => writer,
            Err(StoreError::PathNotFound(_)) => {
                return Err(StoreError::UploadNotFound(uuid.to_string()))
            }
            Err(e) => return Err(e),
        };
        writer.cancel()?;
        Ok(())
    }
}
