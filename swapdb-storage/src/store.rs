//! # Swap store
//!
//! The main-context owner of everything: the guarded engine handle, the
//! checkpoint registry, the cached stats report, the maintenance scheduler and
//! the background task queue. Completions from the queue run against
//! `&mut SwapStore`, so the registry and the stats model need no locks of
//! their own.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{error, info, warn};

use swapdb_core::error::{Error, Result};
use swapdb_core::metrics::Timer;
use swapdb_core::utils::format_bytes;
use swapdb_core::{ChildId, Config, Epoch, Metrics, Partition};

use crate::checkpoint::CheckpointRegistry;
use crate::epoch::remove_dir_logged;
use crate::fork::ForkController;
use crate::guard::ConcurrencyGuard;
use crate::handle::EngineHandle;
use crate::maintenance::MaintenanceScheduler;
use crate::stats::{StatsReport, StatsReportModel};
use crate::tasks::TaskQueue;

pub struct SwapStore {
    pub(crate) config: Config,
    pub(crate) engine: Arc<ConcurrencyGuard<EngineHandle>>,
    pub(crate) checkpoints: CheckpointRegistry,
    pub(crate) stats: StatsReportModel,
    pub(crate) maintenance: MaintenanceScheduler,
    pub(crate) tasks: Arc<TaskQueue<SwapStore>>,
    pub(crate) metrics: Metrics,
    /// Pid of the forked child a pending handoff is meant for
    pub(crate) active_child: Option<ChildId>,
}

impl SwapStore {
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let handle = EngineHandle::open(&config.engine)?;
        let tasks = TaskQueue::new(config.engine.background_workers)?;
        let maintenance =
            MaintenanceScheduler::new(config.maintenance.clone(), &config.engine.base_dir);

        info!(
            base_dir = %config.engine.base_dir.display(),
            epoch = handle.epoch(),
            "Swap store open"
        );
        Ok(Self {
            engine: Arc::new(ConcurrencyGuard::new(handle)),
            checkpoints: CheckpointRegistry::new(),
            stats: StatsReportModel::default(),
            maintenance,
            tasks: Arc::new(tasks),
            metrics: Metrics::new(),
            active_child: None,
            config,
        })
    }

    pub fn put(&self, partition: Partition, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<u64> {
        let handle = self.engine.acquire_read();
        handle
            .engine()?
            .put(partition, key.into(), value.into(), handle.write_opts())
    }

    pub fn get(&self, partition: Partition, key: &[u8]) -> Result<Option<Bytes>> {
        let handle = self.engine.acquire_read();
        let opts = match partition {
            Partition::Meta => handle.filter_meta_read_opts(),
            _ => handle.read_opts(),
        };
        handle.engine()?.get(partition, key, opts)
    }

    pub fn delete(&self, partition: Partition, key: impl Into<Bytes>) -> Result<u64> {
        let handle = self.engine.acquire_read();
        handle.engine()?.delete(partition, key.into(), handle.write_opts())
    }

    /// Run every task completion that has arrived.
    pub fn process_completions(&mut self) -> usize {
        let tasks = Arc::clone(&self.tasks);
        tasks.drain(self)
    }

    /// Run completions until no task is outstanding. Returns false on timeout.
    pub fn wait_for_tasks(&mut self, timeout: Duration) -> bool {
        let tasks = Arc::clone(&self.tasks);
        tasks.wait_idle(self, timeout)
    }

    /// Replace the live engine with the one in `source`.
    ///
    /// A failed rollback leaves no usable engine, so the process aborts.
    pub fn restore(&mut self, source: &Path) -> Result<()> {
        let timer = Timer::new("restore");

        // The checkpoint goes only once the source is in place
        let checkpoints = &mut self.checkpoints;
        let result = self
            .engine
            .acquire_write()
            .restore_with(source, || checkpoints.release());
        match result {
            Ok(superseded) => {
                self.stats.clear();
                self.metrics.record_restore();
                self.tasks.submit(
                    "remove-epoch",
                    move || remove_dir_logged(&superseded),
                    |_store: &mut SwapStore, _removed: bool| {},
                );
                timer.stop();
                Ok(())
            }
            Err(Error::RollbackFailed { epoch, source }) => {
                error!(epoch, error = %source, "Rollback after failed restore failed, aborting");
                std::process::abort();
            }
            Err(e) => {
                warn!(source = %source.display(), error = %e, "Restore failed");
                self.metrics.record_restore_failure();
                Err(e)
            }
        }
    }

    pub fn set_active_child(&mut self, pid: ChildId) {
        self.active_child = Some(pid);
    }

    /// Forget `pid` once it has been reaped. Pending handoffs to it are abandoned.
    pub fn child_exited(&mut self, pid: ChildId) {
        if self.active_child == Some(pid) {
            self.active_child = None;
        }
    }

    pub fn active_child(&self) -> Option<ChildId> {
        self.active_child
    }

    /// Controller for one fork using the configured strategy
    pub fn fork_controller(&self) -> ForkController {
        ForkController::new(self.config.fork.strategy)
    }

    pub fn epoch(&self) -> Epoch {
        self.engine.acquire_read().epoch()
    }

    pub fn engine(&self) -> &Arc<ConcurrencyGuard<EngineHandle>> {
        &self.engine
    }

    pub fn checkpoints(&self) -> &CheckpointRegistry {
        &self.checkpoints
    }

    pub fn stats(&self) -> Option<Arc<StatsReport>> {
        self.stats.current()
    }

    pub fn maintenance(&self) -> &MaintenanceScheduler {
        &self.maintenance
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.pending()
    }

    /// `key:value` lines describing the store
    pub fn info(&self) -> String {
        let mut out = String::new();
        {
            // Never wait behind a restore just to render diagnostics
            match self.engine.try_acquire_read() {
                Some(handle) => {
                    let _ = writeln!(out, "epoch:{}", handle.epoch());
                    let _ = writeln!(out, "dir:{}", handle.dir().display());
                }
                None => {
                    let _ = writeln!(out, "epoch:restoring");
                }
            }
        }

        let health = self.maintenance.health();
        let _ = writeln!(out, "disk_error:{}", u8::from(health.disk_error()));
        let _ = writeln!(out, "disk_error_since:{}", health.since_micros().unwrap_or(0));
        let _ = writeln!(out, "used_db_size:{}", self.maintenance.used_db_size());
        let _ = writeln!(
            out,
            "used_db_size_human:{}",
            format_bytes(self.maintenance.used_db_size())
        );
        let _ = writeln!(out, "max_db_size:{}", self.maintenance.config().max_db_size);
        let _ = writeln!(
            out,
            "checkpoint_dir:{}",
            self.checkpoints
                .checkpoint_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_default()
        );
        let _ = writeln!(out, "pending_tasks:{}", self.tasks.pending());

        let m = self.metrics.snapshot();
        let _ = writeln!(out, "restores:{}", m.restores);
        let _ = writeln!(out, "restore_failures:{}", m.restore_failures);
        let _ = writeln!(out, "checkpoints_created:{}", m.checkpoints_created);
        let _ = writeln!(out, "checkpoint_failures:{}", m.checkpoint_failures);
        let _ = writeln!(out, "snapshots_taken:{}", m.snapshots_taken);
        let _ = writeln!(out, "handoffs_completed:{}", m.handoffs_completed);
        let _ = writeln!(out, "handoffs_abandoned:{}", m.handoffs_abandoned);
        let _ = writeln!(out, "flushes_submitted:{}", m.flushes_submitted);
        let _ = writeln!(out, "stats_refreshes:{}", m.stats_refreshes);

        if let Some(report) = self.stats.current() {
            out.push_str(&report.format_info());
        }
        out
    }

    /// Wait for outstanding tasks, release the checkpoint and close the engine.
    pub fn shutdown(&mut self) -> Result<()> {
        let timeout = self.config.engine.cancel_timeout;
        if !self.wait_for_tasks(timeout) {
            warn!(pending = self.tasks.pending(), "Shutting down with tasks outstanding");
        }
        self.checkpoints.release();
        let result = self.engine.acquire_write().close();
        self.tasks.shutdown(timeout);
        info!("Swap store shut down");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(base: &Path) -> Config {
        let mut config = Config::default();
        config.engine.base_dir = base.to_path_buf();
        config.engine.background_workers = 2;
        config
    }

    #[test]
    fn test_data_path_passthrough() {
        let base = TempDir::new().unwrap();
        let store = SwapStore::open(config(base.path())).unwrap();

        store.put(Partition::Meta, "k", "v").unwrap();
        assert_eq!(store.get(Partition::Meta, b"k").unwrap(), Some(Bytes::from("v")));
        assert_eq!(store.get(Partition::Data, b"k").unwrap(), None);

        store.delete(Partition::Meta, "k").unwrap();
        assert_eq!(store.get(Partition::Meta, b"k").unwrap(), None);
    }

    #[test]
    fn test_child_registration() {
        let base = TempDir::new().unwrap();
        let mut store = SwapStore::open(config(base.path())).unwrap();
        store.set_active_child(41);
        store.child_exited(7);
        assert_eq!(store.active_child(), Some(41));
        store.child_exited(41);
        assert_eq!(store.active_child(), None);
    }

    #[test]
    fn test_info_and_shutdown() {
        let base = TempDir::new().unwrap();
        let mut store = SwapStore::open(config(base.path())).unwrap();
        let info = store.info();
        assert!(info.contains("epoch:0\n"));
        assert!(info.contains("disk_error:0\n"));
        assert!(info.contains("checkpoint_dir:\n"));

        store.shutdown().unwrap();
        assert!(matches!(store.get(Partition::Data, b"k"), Err(Error::Closed)));
        store.shutdown().unwrap();
    }
}
