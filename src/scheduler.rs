//! Scheduling hooks
//!
//! The store does not run its own timers; it registers task generators
//! with an external scheduler, which calls them back one task at a time on
//! its interval. Exhausted generators are rearmed through `reset`.

use crate::error::{Result, StoreError};
use crate::store::ImageStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Task priority understood by the external scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

/// One unit of background work
pub trait Task: Send {
    /// Task name for logs
    fn name(&self) -> String;

    /// Run the task; implementations return promptly once `cancelled` is
    /// set
    fn run(&self, cancelled: &AtomicBool) -> Result<()>;
}

/// Yields tasks one at a time until exhausted
pub trait TaskGenerator: Send {
    fn next(&mut self) -> Result<Option<Box<dyn Task>>>;

    fn is_done(&self) -> bool;

    /// Rearm an exhausted generator for the next interval
    fn reset(&mut self);
}

/// External scheduler the store registers its generators with
pub trait Scheduler: Send + Sync {
    fn submit_generator(
        &self,
        generator: Box<dyn TaskGenerator>,
        interval: Duration,
        priority: TaskPriority,
    );
}

impl ImageStore {
    /// Register round-robin garbage collection, one repository per tick
    pub fn run_gc_periodically(self: &Arc<Self>, interval: Duration, scheduler: &dyn Scheduler) {
        if !self.config().gc {
            return;
        }
        let generator = GcTaskGenerator {
            store: Arc::clone(self),
            last_repo: None,
            done: false,
        };
        scheduler.submit_generator(Box::new(generator), interval, TaskPriority::Medium);
    }

    /// Register dedupe rebuilds for existing blobs, following the store's
    /// current dedupe setting
    pub fn run_dedupe_blobs(self: &Arc<Self>, interval: Duration, scheduler: &dyn Scheduler) {
        let generator = DedupeTaskGenerator {
            store: Arc::clone(self),
            seen: Vec::new(),
            done: false,
        };
        scheduler.submit_generator(Box::new(generator), interval, TaskPriority::Low);
    }
}

struct GcTaskGenerator {
    store: Arc<ImageStore>,
    last_repo: Option<String>,
    done: bool,
}

impl TaskGenerator for GcTaskGenerator {
    fn next(&mut self) -> Result<Option<Box<dyn Task>>> {
        if self.done {
            return Ok(None);
        }
        let prev = self.last_repo.clone().unwrap_or_default();
        match self.store.get_next_repository(&prev)? {
            Some(repo) => {
                self.last_repo = Some(repo.clone());
                Ok(Some(Box::new(GcTask {
                    store: Arc::clone(&self.store),
                    repo,
                })))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn reset(&mut self) {
        self.last_repo = None;
        self.done = false;
    }
}

struct GcTask {
    store: Arc<ImageStore>,
    repo: String,
}

impl Task for GcTask {
    fn name(&self) -> String {
        format!("gc:{}", self.repo)
    }

    fn run(&self, cancelled: &AtomicBool) -> Result<()> {
        if cancelled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.store.run_gc_repo(&self.repo)
    }
}

struct DedupeTaskGenerator {
    store: Arc<ImageStore>,
    seen: Vec<String>,
    done: bool,
}

impl TaskGenerator for DedupeTaskGenerator {
    fn next(&mut self) -> Result<Option<Box<dyn Task>>> {
        if self.done {
            return Ok(None);
        }
        match self.store.get_next_digest_with_blob_paths(&self.seen)? {
            Some((digest, paths)) => {
                self.seen.push(digest.clone());
                Ok(Some(Box::new(DedupeTask {
                    dedupe: self.store.dedupe_enabled(),
                    store: Arc::clone(&self.store),
                    digest,
                    paths,
                })))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn reset(&mut self) {
        self.seen.clear();
        self.done = false;
    }
}

struct DedupeTask {
    store: Arc<ImageStore>,
    digest: String,
    paths: Vec<PathBuf>,
    dedupe: bool,
}

impl Task for DedupeTask {
    fn name(&self) -> String {
        format!("dedupe:{}", self.digest)
    }

    fn run(&self, cancelled: &AtomicBool) -> Result<()> {
        if cancelled.load(Ordering::Relaxed) {
            return Ok(());
        }
        match self
            .store
            .run_dedupe_for_digest(&self.digest, self.dedupe, &self.paths)
        {
            // unrepairable candidates are skipped, the rebuild moves on
            Err(StoreError::DedupeRebuild(e)) => {
                warn!("Skipping dedupe rebuild for {}: {}", self.digest, e);
                Ok(())
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{self, media_types};
    use crate::store::testing::{dedupe_store_at, make_manifest, store_at};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingScheduler {
        submissions: Mutex<Vec<(Box<dyn TaskGenerator>, Duration, TaskPriority)>>,
    }

    impl Scheduler for RecordingScheduler {
        fn submit_generator(
            &self,
            generator: Box<dyn TaskGenerator>,
            interval: Duration,
            priority: TaskPriority,
        ) {
            self.submissions
                .lock()
                .unwrap()
                .push((generator, interval, priority));
        }
    }

    fn drain(generator: &mut Box<dyn TaskGenerator>) -> usize {
        let cancelled = AtomicBool::new(false);
        let mut ran = 0;
        while let Some(task) = generator.next().unwrap() {
            task.run(&cancelled).unwrap();
            ran += 1;
        }
        ran
    }

    #[test]
    fn test_gc_generator_visits_every_repo() {
        let temp = tempdir().unwrap();
        let store = Arc::new(store_at(temp.path()));

        for repo in ["a", "b", "c"] {
            let (body, _) = make_manifest(&store, repo, b"img", None);
            store
                .put_image_manifest(repo, "v1", media_types::IMAGE_MANIFEST, &body)
                .unwrap();
            let stray = oci::sha256_digest(b"stray");
            store.full_blob_upload(repo, b"stray", &stray).unwrap();
        }

        let scheduler = RecordingScheduler::default();
        store.run_gc_periodically(Duration::from_secs(60), &scheduler);

        let mut submissions = scheduler.submissions.into_inner().unwrap();
        assert_eq!(submissions.len(), 1);
        let (generator, _, priority) = &mut submissions[0];
        assert_eq!(*priority, TaskPriority::Medium);

        assert_eq!(drain(generator), 3);
        assert!(generator.is_done());

        let stray = oci::sha256_digest(b"stray");
        for repo in ["a", "b", "c"] {
            assert!(store.get_blob_content(repo, &stray).is_err());
        }

        // rearmed generators walk the repos again
        generator.reset();
        assert_eq!(drain(generator), 3);
    }

    #[test]
    fn test_dedupe_generator_rebuilds_existing_blobs() {
        let temp = tempdir().unwrap();
        let digest = oci::sha256_digest(b"layer");
        {
            let plain = store_at(temp.path());
            plain.full_blob_upload("a", b"layer", &digest).unwrap();
            plain.full_blob_upload("b", b"layer", &digest).unwrap();
        }

        let cache_dir = tempdir().unwrap();
        let store = Arc::new(dedupe_store_at(temp.path(), cache_dir.path()));

        let scheduler = RecordingScheduler::default();
        store.run_dedupe_blobs(Duration::from_secs(60), &scheduler);

        let mut submissions = scheduler.submissions.into_inner().unwrap();
        let (generator, _, priority) = &mut submissions[0];
        assert_eq!(*priority, TaskPriority::Low);

        assert!(drain(generator) >= 1);

        let (_, hex) = oci::split_digest(&digest).unwrap();
        let p_a = temp.path().join("a/blobs/sha256").join(hex);
        let p_b = temp.path().join("b/blobs/sha256").join(hex);
        assert!(store.driver().same_file(&p_a, &p_b));
    }

    #[test]
    fn test_cancelled_task_returns_promptly() {
        let temp = tempdir().unwrap();
        let store = Arc::new(store_at(temp.path()));
        store.init_repo("a").unwrap();

        let scheduler = RecordingScheduler::default();
        store.run_gc_periodically(Duration::from_secs(60), &scheduler);

        let mut submissions = scheduler.submissions.into_inner().unwrap();
        let (generator, _, _) = &mut submissions[0];
        let task = generator.next().unwrap().unwrap();

        let cancelled = AtomicBool::new(true);
        task.run(&cancelled).unwrap();
        // nothing was collected
        assert!(store.validate_repo("a").unwrap());
    }
}
