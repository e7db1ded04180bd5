//! # Periodic maintenance
//!
//! The host calls [`SwapStore::cron`] at a fixed cadence (`hz` ticks per
//! second). Each sub-task has its own period:
//!
//! | sub-task | period | guard |
//! |---|---|---|
//! | disk health probe | every tick | none |
//! | usage accounting | `usage_check_period_ms` | try-read |
//! | meta flush heuristic + stats refresh | `stats_refresh_period_ms` | read |
//!
//! Flushes and stats collection run on the task queue; the tick never waits
//! for them.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use swapdb_core::config::MaintenanceConfig;
use swapdb_core::error::Result;
use swapdb_core::utils::{format_bytes, now_micros, now_millis};
use swapdb_core::Partition;

use crate::guard::ConcurrencyGuard;
use crate::handle::EngineHandle;
use crate::stats::{MemtableCounters, StatsReport};
use crate::store::SwapStore;

/// Whether the meta partition carries enough tombstones to be worth flushing.
///
/// True when there are entries, at least `floor` deletes, and deletes make up at
/// least `percentage` percent of entries.
pub fn should_flush_meta(counters: &MemtableCounters, percentage: u32, floor: u64) -> bool {
    let entries = counters.entries();
    let deletes = counters.deletes();
    entries > 0
        && deletes >= floor
        && deletes.saturating_mul(100) >= (percentage as u64).saturating_mul(entries)
}

/// Disk health as seen by the sentinel-file probe
#[derive(Debug)]
pub struct DiskHealth {
    path: PathBuf,
    disk_error: bool,
    since_micros: Option<u64>,
}

impl DiskHealth {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            disk_error: false,
            since_micros: None,
        }
    }

    /// Rewrite the sentinel file. Returns the new state only when it changed.
    pub fn probe(&mut self) -> Option<bool> {
        let result = write_sentinel(&self.path);
        match (result, self.disk_error) {
            (Err(e), false) => {
                self.disk_error = true;
                self.since_micros = Some(now_micros());
                warn!(path = %self.path.display(), error = %e, "Disk error detected");
                Some(true)
            }
            (Ok(()), true) => {
                let down_ms = self
                    .since_micros
                    .map(|since| now_micros().saturating_sub(since) / 1000)
                    .unwrap_or(0);
                self.disk_error = false;
                self.since_micros = None;
                info!(path = %self.path.display(), down_ms, "Disk recovered");
                Some(false)
            }
            _ => None,
        }
    }

    pub fn disk_error(&self) -> bool {
        self.disk_error
    }

    /// When the current error began (micros since the Unix epoch)
    pub fn since_micros(&self) -> Option<u64> {
        self.since_micros
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_sentinel(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "{}", now_millis())?;
    file.flush()?;
    file.sync_data()
}

/// Which sub-tasks are due on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    pub check_usage: bool,
    pub refresh_stats: bool,
}

pub struct MaintenanceScheduler {
    config: MaintenanceConfig,
    ticks: u64,
    health: DiskHealth,
    used_db_size: u64,
}

impl MaintenanceScheduler {
    pub fn new(config: MaintenanceConfig, base_dir: &Path) -> Self {
        let health = DiskHealth::new(base_dir.join(&config.health_file));
        Self {
            config,
            ticks: 0,
            health,
            used_db_size: 0,
        }
    }

    /// Number of ticks in `period_ms`, at least one
    pub fn period_ticks(&self, period_ms: u64) -> u64 {
        (period_ms * self.config.hz as u64 / 1000).max(1)
    }

    /// Count one tick and report which periodic sub-tasks are due.
    pub fn advance(&mut self) -> TickPlan {
        self.ticks += 1;
        TickPlan {
            check_usage: self.ticks % self.period_ticks(self.config.usage_check_period_ms) == 0,
            refresh_stats: self.ticks % self.period_ticks(self.config.stats_refresh_period_ms) == 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    pub fn health(&self) -> &DiskHealth {
        &self.health
    }

    pub fn used_db_size(&self) -> u64 {
        self.used_db_size
    }
}

impl SwapStore {
    /// One maintenance tick.
    pub fn cron(&mut self) {
        self.process_completions();

        let plan = self.maintenance.advance();

        if self.maintenance.health.probe().is_some() {
            self.metrics.record_disk_error_transition();
        }

        if plan.check_usage {
            self.check_usage();
        }

        if plan.refresh_stats {
            self.evaluate_meta_flush();
            self.submit_stats_refresh();
        }
    }

    fn check_usage(&mut self) {
        // Diagnostics never wait behind a restore
        let Some(handle) = self.engine.try_acquire_read() else {
            debug!("Usage check skipped, engine busy");
            return;
        };
        let size = match handle.engine().and_then(|e| e.total_disk_size()) {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "Failed to read disk usage");
                return;
            }
        };
        drop(handle);

        self.maintenance.used_db_size = size;
        self.metrics.update_disk(size);

        let max = self.maintenance.config.max_db_size;
        if max > 0 && size > max {
            warn!(
                used = %format_bytes(size),
                max = %format_bytes(max),
                "Database size exceeds configured maximum"
            );
        }
    }

    fn evaluate_meta_flush(&mut self) {
        let Some(report) = self.stats.current() else {
            return;
        };
        let live_epoch = self.engine.acquire_read().epoch();
        // Counters from a superseded epoch say nothing about the live engine
        if report.epoch != live_epoch {
            return;
        }
        let Some(meta) = report.partition(Partition::Meta) else {
            return;
        };

        let config = &self.maintenance.config;
        if !should_flush_meta(
            &meta.counters,
            config.meta_flush_delete_percentage,
            config.meta_flush_delete_floor,
        ) {
            return;
        }

        info!(
            entries = meta.counters.entries(),
            deletes = meta.counters.deletes(),
            "Meta partition tombstone ratio high, submitting flush"
        );
        let guard = Arc::clone(&self.engine);
        if self.tasks.submit(
            "flush-meta",
            move || flush_partition(&guard, Partition::Meta),
            |_store: &mut SwapStore, result: Result<()>| {
                if let Err(e) = result {
                    warn!(error = %e, "Meta flush failed");
                }
            },
        ) {
            self.metrics.record_flush_submitted();
        }
    }

    fn submit_stats_refresh(&mut self) {
        let guard = Arc::clone(&self.engine);
        self.tasks.submit(
            "stats-refresh",
            move || collect_stats(&guard),
            |store: &mut SwapStore, report: Result<StatsReport>| match report {
                Ok(report) => {
                    store.stats.replace(report);
                    store.metrics.record_stats_refresh();
                }
                Err(e) => warn!(error = %e, "Stats refresh failed"),
            },
        );
    }
}

fn flush_partition(guard: &ConcurrencyGuard<EngineHandle>, partition: Partition) -> Result<()> {
    let handle = guard.acquire_read();
    handle.engine()?.flush(partition)
}

fn collect_stats(guard: &ConcurrencyGuard<EngineHandle>) -> Result<StatsReport> {
    let handle = guard.acquire_read();
    let engine = handle.engine()?;
    Ok(StatsReport::collect(engine, handle.epoch()))
}
