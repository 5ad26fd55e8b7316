//! Local filesystem storage driver

use super::{BlobWriter, FileInfo, StorageDriver};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Driver name reported by [`LocalFsDriver`]
pub const DRIVER_NAME: &str = "local";

/// POSIX filesystem driver
///
/// Moves are `rename(2)`, links are `link(2)`, `same_file` compares
/// device and inode numbers.
pub struct LocalFsDriver {
    /// Fsync file content after writes and commits
    commit: bool,
}

impl LocalFsDriver {
    /// Create a new local driver; `commit` requests fsync after writes
    pub fn new(commit: bool) -> Self {
        Self { commit }
    }
}

fn not_found(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |err| {
        if err.kind() == io::ErrorKind::NotFound {
            StoreError::PathNotFound(path.to_path_buf())
        } else {
            StoreError::Io(err)
        }
    }
}

fn file_info(meta: &fs::Metadata) -> FileInfo {
    let mtime = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    FileInfo {
        size: meta.len(),
        mtime,
        is_dir: meta.is_dir(),
    }
}

impl StorageDriver for LocalFsDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn is_local(&self) -> bool {
        true
    }

    fn ensure_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn stat(&self, path: &Path) -> Result<FileInfo> {
        let meta = fs::metadata(path).map_err(not_found(path))?;
        Ok(file_info(&meta))
    }

    fn list(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(path).map_err(not_found(path))?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        paths.sort();
        Ok(paths)
    }

    fn walk(
        &self,
        root: &Path,
        visit: &mut dyn FnMut(&Path, &FileInfo) -> Result<()>,
    ) -> Result<()> {
        if !root.exists() {
            return Err(StoreError::PathNotFound(root.to_path_buf()));
        }
        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
            if entry.path() == root {
                continue;
            }
            let meta = entry.metadata().map_err(|e| StoreError::Io(e.into()))?;
            visit(entry.path(), &file_info(&meta))?;
        }
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(not_found(path))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        if self.commit {
            file.sync_all()?;
        }
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn move_file(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dst).map_err(not_found(src))?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let meta = fs::metadata(path).map_err(not_found(path))?;
        if meta.is_dir() {
            fs::remove_dir_all(path).map_err(not_found(path))?;
        } else {
            fs::remove_file(path).map_err(not_found(path))?;
        }
        Ok(())
    }

    fn link(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dst.with_extension("lnk");
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::hard_link(src, &tmp).map_err(not_found(src))?;
        fs::rename(&tmp, dst)?;
        Ok(())
    }

    fn same_file(&self, a: &Path, b: &Path) -> bool {
        match (fs::metadata(a), fs::metadata(b)) {
            (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
            _ => false,
        }
    }

    fn reader(&self, path: &Path, offset: u64) -> Result<Box<dyn Read + Send>> {
        let mut file = File::open(path).map_err(not_found(path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(Box::new(file))
    }

    fn writer(&self, path: &Path, append: bool) -> Result<Box<dyn BlobWriter>> {
        if let Some(parent) = path.parent() {
            if !append {
                fs::create_dir_all(parent)?;
            }
        }
        let (file, len) = if append {
            let file = OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(not_found(path))?;
            let len = file.metadata()?.len();
            (file, len)
        } else {
            let file = File::create(path)?;
            (file, 0)
        };
        Ok(Box::new(LocalBlobWriter {
            file: Some(file),
            path: path.to_path_buf(),
            len,
            sync: self.commit,
        }))
    }
}

struct LocalBlobWriter {
    file: Option<File>,
    path: PathBuf,
    len: u64,
    sync: bool,
}

impl LocalBlobWriter {
    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer is closed"))
    }
}

impl Write for LocalBlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file_mut()?.write(buf)?;
        self.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl BlobWriter for LocalBlobWriter {
    fn size(&self) -> u64 {
        self.len
    }

    fn commit(&mut self) -> Result<()> {
        let sync = self.sync;
        let file = self.file_mut()?;
        file.flush()?;
        if sync {
            file.sync_all()?;
        }
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        self.file.take();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}
