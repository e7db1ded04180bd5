//! # Metrics and Monitoring
//!
//! Lifecycle counters for restores, checkpoints, fork handoffs and maintenance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Restore
    restores: AtomicU64,
    restore_failures: AtomicU64,

    // Checkpoints and snapshots
    checkpoints_created: AtomicU64,
    checkpoint_failures: AtomicU64,
    snapshots_taken: AtomicU64,

    // Fork handoff
    handoffs_completed: AtomicU64,
    handoffs_abandoned: AtomicU64,

    // Maintenance
    flushes_submitted: AtomicU64,
    stats_refreshes: AtomicU64,
    disk_error_transitions: AtomicU64,
    disk_usage: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_restore(&self) {
        self.inner.restores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restore_failure(&self) {
        self.inner.restore_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.inner.checkpoints_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint_failure(&self) {
        self.inner.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.inner.snapshots_taken.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a checkpoint path delivered to a child
    pub fn record_handoff(&self) {
        self.inner.handoffs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a checkpoint built for a child that is no longer current
    pub fn record_handoff_abandoned(&self) {
        self.inner.handoffs_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_submitted(&self) {
        self.inner.flushes_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stats_refresh(&self) {
        self.inner.stats_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a change of the disk error flag (either direction)
    pub fn record_disk_error_transition(&self) {
        self.inner
            .disk_error_transitions
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Update disk usage
    pub fn update_disk(&self, bytes: u64) {
        self.inner.disk_usage.store(bytes, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            restores: self.inner.restores.load(Ordering::Relaxed),
            restore_failures: self.inner.restore_failures.load(Ordering::Relaxed),
            checkpoints_created: self.inner.checkpoints_created.load(Ordering::Relaxed),
            checkpoint_failures: self.inner.checkpoint_failures.load(Ordering::Relaxed),
            snapshots_taken: self.inner.snapshots_taken.load(Ordering::Relaxed),
            handoffs_completed: self.inner.handoffs_completed.load(Ordering::Relaxed),
            handoffs_abandoned: self.inner.handoffs_abandoned.load(Ordering::Relaxed),
            flushes_submitted: self.inner.flushes_submitted.load(Ordering::Relaxed),
            stats_refreshes: self.inner.stats_refreshes.load(Ordering::Relaxed),
            disk_error_transitions: self.inner.disk_error_transitions.load(Ordering::Relaxed),
            disk_usage: self.inner.disk_usage.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub restores: u64,
    pub restore_failures: u64,
    pub checkpoints_created: u64,
    pub checkpoint_failures: u64,
    pub snapshots_taken: u64,
    pub handoffs_completed: u64,
    pub handoffs_abandoned: u64,
    pub flushes_submitted: u64,
    pub stats_refreshes: u64,
    pub disk_error_transitions: u64,
    pub disk_usage: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    /// Start new timer
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and log duration
    pub fn stop(self) -> Duration {
        let duration = self.elapsed();
        tracing::debug!(
            name = %self.name,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
        duration
    }
}
