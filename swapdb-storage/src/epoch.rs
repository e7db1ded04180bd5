//! # Epoch directories
//!
//! Every engine generation lives in `<base>/<epoch>`. Transient checkpoints
//! live next to them in `<base>/tmp_<micros>` until they are promoted by a
//! restore or discarded.
//!
//! ## Restore rotation
//!
//! ```text
//!  source ──rename──> <base>/<e+1>          (fails: RenameFailed, nothing changed)
//!  before_close hook
//!  close <base>/<e>
//!  open  <base>/<e+1> ── ok ──> epoch = e+1, <base>/<e> is superseded
//!          │ fails
//!          ▼
//!  open  <base>/<e>   ── ok ──> epoch = e, ReopenFailed
//!          │ fails
//!          ▼
//!     RollbackFailed (no open engine: fatal)
//! ```

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use swapdb_core::error::{Error, IoResultExt, Result};
use swapdb_core::utils::now_micros;
use swapdb_core::Epoch;

use crate::handle::EngineHandle;

pub const CHECKPOINT_PREFIX: &str = "tmp_";

/// Maps epochs and checkpoint names to paths under one base directory
#[derive(Debug, Clone)]
pub struct EpochDirs {
    base: PathBuf,
}

impl EpochDirs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn dir(&self, epoch: Epoch) -> PathBuf {
        self.base.join(epoch.to_string())
    }

    pub fn ensure_base(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base).with_path("create base dir", &self.base)
    }

    /// Highest numeric epoch directory present, if any
    pub fn latest(&self) -> Result<Option<Epoch>> {
        let mut latest = None;
        for entry in std::fs::read_dir(&self.base).with_path("read base dir", &self.base)? {
            let entry = entry.with_path("read base dir", &self.base)?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(epoch) = entry.file_name().to_str().and_then(|n| n.parse::<Epoch>().ok()) {
                latest = latest.max(Some(epoch));
            }
        }
        Ok(latest)
    }

    /// Remove every numeric epoch directory. Used at startup without
    /// persistence, where a leftover `<base>/<n>` would block a later restore.
    pub fn remove_all_epochs(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.base).with_path("read base dir", &self.base)? {
            let entry = entry.with_path("read base dir", &self.base)?;
            let is_epoch = entry.file_name().to_str().is_some_and(|n| n.parse::<Epoch>().is_ok());
            if !is_epoch || !entry.path().is_dir() {
                continue;
            }
            let dir = entry.path();
            std::fs::remove_dir_all(&dir).with_path("remove stale epoch dir", &dir)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Directory for `epoch`, created if absent. With `wipe`, an existing
    /// directory of the same name is removed first.
    pub fn prepare(&self, epoch: Epoch, wipe: bool) -> Result<PathBuf> {
        let dir = self.dir(epoch);
        if wipe && dir.exists() {
            info!(dir = %dir.display(), "Removing stale epoch directory");
            std::fs::remove_dir_all(&dir).with_path("remove stale epoch dir", &dir)?;
        }
        std::fs::create_dir_all(&dir).with_path("create epoch dir", &dir)?;
        Ok(dir)
    }

    /// Fresh `<base>/tmp_<micros>` path that does not exist yet.
    pub fn checkpoint_dir(&self) -> PathBuf {
        let mut stamp = now_micros();
        loop {
            let dir = self.base.join(format!("{}{}", CHECKPOINT_PREFIX, stamp));
            if !dir.exists() {
                return dir;
            }
            stamp += 1;
        }
    }

    /// Remove `tmp_*` directories left behind by a previous process. Returns how many were removed.
    pub fn remove_stale_checkpoints(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.base) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let is_checkpoint = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(CHECKPOINT_PREFIX));
            if !is_checkpoint {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(dir = %entry.path().display(), error = %e, "Failed to remove stale checkpoint"),
            }
        }
        removed
    }

    /// Move `source` to `<base>/<epoch>`. The target must not exist.
    pub fn rename_into(&self, source: &Path, epoch: Epoch) -> Result<PathBuf> {
        let target = self.dir(epoch);
        let rename_failed = |source_err: std::io::Error| Error::RenameFailed {
            from: source.to_path_buf(),
            to: target.clone(),
            source: source_err,
        };

        if target.exists() {
            return Err(rename_failed(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "target epoch directory exists",
            )));
        }
        std::fs::rename(source, &target).map_err(rename_failed)?;
        Ok(target)
    }
}

/// Remove a directory tree, logging instead of failing.
pub fn remove_dir_logged(dir: &Path) -> bool {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to remove directory");
            false
        }
    }
}

impl EngineHandle {
    /// Replace the live engine with the one in `source`, rotating to the next epoch.
    ///
    /// Returns the superseded epoch directory, which the caller removes. Must run
    /// under the write side of the guard. `RollbackFailed` leaves the handle closed.
    pub fn restore(&mut self, source: &Path) -> Result<PathBuf> {
        self.restore_with(source, || {})
    }

    /// [`restore`](Self::restore) with a hook that runs once the rename has
    /// succeeded and before the live engine is closed. A `RenameFailed`
    /// restore never calls it.
    pub fn restore_with(&mut self, source: &Path, before_close: impl FnOnce()) -> Result<PathBuf> {
        let old_epoch = self.epoch();
        let new_epoch = old_epoch.checked_add(1).ok_or_else(|| Error::Internal {
            message: "epoch counter exhausted".to_string(),
        })?;

        let new_dir = self.epochs().rename_into(source, new_epoch)?;
        info!(
            source = %source.display(),
            from_epoch = old_epoch,
            to_epoch = new_epoch,
            "Restoring engine"
        );

        before_close();
        if let Err(e) = self.close() {
            warn!(epoch = old_epoch, error = %e, "Error closing engine before restore");
        }

        let open_err = match self.open_engine(new_epoch, false) {
            Ok(()) => {
                info!(epoch = new_epoch, "Restore complete");
                return Ok(self.epochs().dir(old_epoch));
            }
            Err(e) => e,
        };

        error!(epoch = new_epoch, error = %open_err, "Failed to open restored engine, rolling back");
        match self.open_engine(old_epoch, false) {
            Ok(()) => {
                warn!(epoch = old_epoch, "Rolled back to previous epoch");
                remove_dir_logged(&new_dir);
                Err(Error::ReopenFailed {
                    epoch: new_epoch,
                    source: Box::new(open_err),
                })
            }
            Err(rollback_err) => {
                error!(epoch = old_epoch, error = %rollback_err, "Rollback failed, no engine is open");
                Err(Error::RollbackFailed {
                    epoch: old_epoch,
                    source: Box::new(rollback_err),
                })
            }
        }
    }
}
