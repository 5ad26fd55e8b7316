//! Metrics interface
//!
//! The store emits latency observations; sinks live outside the core.

use std::time::Duration;

/// Which side of the store lock an observation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared reader lock
    Read,
    /// Exclusive writer lock
    Write,
}

/// Observer for store-emitted measurements
pub trait MetricsObserver: Send + Sync {
    /// Called on lock release with the hold duration
    fn observe_lock_latency(&self, kind: LockKind, elapsed: Duration);
}

/// Observer that discards all measurements
pub struct NoopMetrics;

impl MetricsObserver for NoopMetrics {
    fn observe_lock_latency(&self, _kind: LockKind, _elapsed: Duration) {}
}
