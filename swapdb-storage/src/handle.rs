//! # Engine handle
//!
//! Owns the one open engine of the current epoch, its option objects and at
//! most one standing snapshot. The handle is either fully open or closed;
//! `Engine::open` never returns a partially opened engine.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use swapdb_core::config::EngineConfig;
use swapdb_core::error::{Error, Result};
use swapdb_core::Epoch;

use crate::engine::{Engine, EngineOptions, ReadOptions, Snapshot, WriteOptions};
use crate::epoch::EpochDirs;

pub struct EngineHandle {
    epochs: EpochDirs,
    epoch: Epoch,
    options: EngineOptions,
    persistence_enabled: bool,
    periodic_flush_secs: u64,
    engine: Option<Engine>,
    snapshot: Mutex<Option<Arc<Snapshot>>>,
    read_opts: ReadOptions,
    write_opts: WriteOptions,
    /// Metadata lookups always see the latest state, never a standing snapshot
    filter_meta_read_opts: ReadOptions,
}

impl EngineHandle {
    /// Open the engine at startup.
    ///
    /// With persistence the highest existing epoch is reopened with its data;
    /// without it every epoch directory is removed and epoch 0 starts empty.
    /// Leftover checkpoint directories are removed.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let epochs = EpochDirs::new(&config.base_dir);
        epochs.ensure_base()?;

        let stale = epochs.remove_stale_checkpoints();
        if stale > 0 {
            info!(removed = stale, "Removed stale checkpoint directories");
        }

        let epoch = if config.persistence_enabled {
            epochs.latest()?.unwrap_or(0)
        } else {
            let wiped = epochs.remove_all_epochs()?;
            if wiped > 0 {
                info!(removed = wiped, "Removed epoch directories, persistence is disabled");
            }
            0
        };

        let mut handle = Self {
            epochs,
            epoch,
            options: EngineOptions::from_config(config),
            persistence_enabled: config.persistence_enabled,
            periodic_flush_secs: config.periodic_flush_secs,
            engine: None,
            snapshot: Mutex::new(None),
            read_opts: ReadOptions::default(),
            write_opts: WriteOptions::default(),
            filter_meta_read_opts: ReadOptions::default(),
        };
        handle.open_engine(epoch, !config.persistence_enabled)?;
        Ok(handle)
    }

    /// Open the engine in `<base>/<epoch>` and make it current. With `wipe` any
    /// existing directory for that epoch is discarded first.
    pub(crate) fn open_engine(&mut self, epoch: Epoch, wipe: bool) -> Result<()> {
        debug_assert!(self.engine.is_none());
        let dir = self.epochs.prepare(epoch, wipe)?;
        let engine = Engine::open(&dir, &self.options)?;

        // Dynamic options are best-effort
        let periodic = self.periodic_flush_secs.to_string();
        if let Err(e) = engine.set_options(&[("periodic_flush_seconds", periodic.as_str())]) {
            warn!(epoch, error = %e, "Failed to apply dynamic engine options");
        }

        self.engine = Some(engine);
        self.epoch = epoch;
        info!(epoch, dir = %dir.display(), persistence = self.persistence_enabled, "Engine handle open");
        Ok(())
    }

    /// Release the standing snapshot and close the engine. A second call is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.release_snapshot();
        let Some(engine) = self.engine.take() else {
            return Ok(());
        };
        let result = engine.close();
        drop(engine);
        debug!(epoch = self.epoch, "Engine handle closed");
        result
    }

    /// The open engine, or `Error::Closed`
    pub fn engine(&self) -> Result<&Engine> {
        self.engine.as_ref().ok_or(Error::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn epochs(&self) -> &EpochDirs {
        &self.epochs
    }

    pub fn dir(&self) -> std::path::PathBuf {
        self.epochs.dir(self.epoch)
    }

    pub fn base_dir(&self) -> &Path {
        self.epochs.base()
    }

    /// Take a standing snapshot, replacing (and releasing) any previous one.
    pub fn take_snapshot(&self) -> Result<Arc<Snapshot>> {
        let engine = self.engine()?;
        self.release_snapshot();
        let snapshot = engine.snapshot().map_err(|e| Error::Snapshot {
            message: e.to_string(),
        })?;
        *self.snapshot.lock() = Some(Arc::clone(&snapshot));
        debug!(sequence = snapshot.sequence(), "Took standing snapshot");
        Ok(snapshot)
    }

    pub fn standing_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.lock().clone()
    }

    pub fn release_snapshot(&self) {
        if let Some(snapshot) = self.snapshot.lock().take() {
            debug!(sequence = snapshot.sequence(), "Released standing snapshot");
        }
    }

    /// Release the standing snapshot only if it is still `snapshot`. A later
    /// `take_snapshot` may have replaced it.
    pub fn release_snapshot_if_current(&self, snapshot: &Arc<Snapshot>) -> bool {
        let mut standing = self.snapshot.lock();
        if standing.as_ref().is_some_and(|s| Arc::ptr_eq(s, snapshot)) {
            *standing = None;
            debug!(sequence = snapshot.sequence(), "Released standing snapshot");
            return true;
        }
        false
    }

    pub fn read_opts(&self) -> &ReadOptions {
        &self.read_opts
    }

    pub fn write_opts(&self) -> &WriteOptions {
        &self.write_opts
    }

    pub fn filter_meta_read_opts(&self) -> &ReadOptions {
        &self.filter_meta_read_opts
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(epoch = self.epoch, error = %e, "Error closing engine handle on drop");
        }
    }
}
