//! SQLite-backed dedupe cache

use super::BlobCache;
use crate::error::{Result, StoreError};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// Extension trait to convert `rusqlite::Result` into `crate::Result`.
trait DbResultExt<T> {
    fn db(self) -> Result<T>;
}

impl<T> DbResultExt<T> for rusqlite::Result<T> {
    fn db(self) -> Result<T> {
        self.map_err(|e| StoreError::Cache(e.to_string()))
    }
}

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS blob_paths (
        pos    INTEGER PRIMARY KEY AUTOINCREMENT,
        digest TEXT NOT NULL,
        path   TEXT NOT NULL,
        UNIQUE (digest, path)
    );
    CREATE INDEX IF NOT EXISTS blob_paths_digest ON blob_paths (digest);
";

/// Dedupe cache persisted in a SQLite database
///
/// Insertion order is kept in the `pos` column; the primary path for a
/// digest is the surviving row with the lowest `pos`, so deleting the
/// primary promotes the next recorded path without extra bookkeeping.
pub struct SqliteCache {
    /// Database connection
    conn: Mutex<Connection>,
    /// Paths are stored relative to the store root
    relative_paths: bool,
}

impl SqliteCache {
    /// Open (or create) the cache database inside the given directory
    pub fn open(dir: &Path, relative_paths: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("cache.db")).db()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").db()?;
        conn.execute_batch(SCHEMA).db()?;

        Ok(Self {
            conn: Mutex::new(conn),
            relative_paths,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Lock("Failed to acquire cache lock".to_string()))
    }
}

impl BlobCache for SqliteCache {
    fn get_blob(&self, digest: &str) -> Result<String> {
        let conn = self.lock()?;
        let result: rusqlite::Result<String> = conn.query_row(
            "SELECT path FROM blob_paths WHERE digest = ?1 ORDER BY pos LIMIT 1",
            params![digest],
            |row| row.get(0),
        );
        match result {
            Ok(path) => Ok(path),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(StoreError::CacheMiss(digest.to_string()))
            }
            Err(e) => Err(StoreError::Cache(e.to_string())),
        }
    }

    fn put_blob(&self, digest: &str, path: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO blob_paths (digest, path) VALUES (?1, ?2)",
            params![digest, path],
        )
        .db()?;
        Ok(())
    }

    fn has_blob(&self, digest: &str, path: &str) -> bool {
        let Ok(conn) = self.lock() else {
            return false;
        };
        conn.query_row(
            "SELECT 1 FROM blob_paths WHERE digest = ?1 AND path = ?2",
            params![digest, path],
            |_| Ok(()),
        )
        .is_ok()
    }

    fn delete_blob(&self, digest: &str, path: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM blob_paths WHERE digest = ?1 AND path = ?2",
            params![digest, path],
        )
        .db()?;
        Ok(())
    }

    fn uses_relative_paths(&self) -> bool {
        self.relative_paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_miss_then_put_then_get() {
        let temp = tempdir().unwrap();
        let cache = SqliteCache::open(temp.path(), false).unwrap();

        assert!(matches!(
            cache.get_blob("sha256:aa"),
            Err(StoreError::CacheMiss(_))
        ));

        cache.put_blob("sha256:aa", "/root/a/blobs/sha256/aa").unwrap();
        assert_eq!(cache.get_blob("sha256:aa").unwrap(), "/root/a/blobs/sha256/aa");
        assert!(cache.has_blob("sha256:aa", "/root/a/blobs/sha256/aa"));
        assert!(!cache.has_blob("sha256:aa", "/root/b/blobs/sha256/aa"));
    }

    #[test]
    fn test_put_is_idempotent() {
        let temp = tempdir().unwrap();
        let cache = SqliteCache::open(temp.path(), false).unwrap();

        cache.put_blob("sha256:aa", "p1").unwrap();
        cache.put_blob("sha256:aa", "p1").unwrap();
        cache.put_blob("sha256:aa", "p2").unwrap();
        assert_eq!(cache.get_blob("sha256:aa").unwrap(), "p1");
    }

    #[test]
    fn test_delete_primary_promotes_next() {
        let temp = tempdir().unwrap();
        let cache = SqliteCache::open(temp.path(), false).unwrap();

        cache.put_blob("sha256:aa", "p1").unwrap();
        cache.put_blob("sha256:aa", "p2").unwrap();
        cache.put_blob("sha256:aa", "p3").unwrap();

        cache.delete_blob("sha256:aa", "p1").unwrap();
        assert_eq!(cache.get_blob("sha256:aa").unwrap(), "p2");

        cache.delete_blob("sha256:aa", "p2").unwrap();
        cache.delete_blob("sha256:aa", "p3").unwrap();
        assert!(matches!(
            cache.get_blob("sha256:aa"),
            Err(StoreError::CacheMiss(_))
        ));
    }

    #[test]
    fn test_relative_paths_flag() {
        let temp = tempdir().unwrap();
        let cache = SqliteCache::open(temp.path(), true).unwrap();
        assert!(cache.uses_relative_paths());
    }
}
