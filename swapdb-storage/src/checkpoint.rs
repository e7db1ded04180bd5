//! # Checkpoint registry
//!
//! Tracks the single outstanding on-disk checkpoint. The checkpoint and its
//! directory are one value, so a registry never knows a directory without a
//! checkpoint or the reverse. Replacing or releasing deletes the directory.

use std::path::Path;

use tracing::{debug, error, info};

use swapdb_core::error::{Error, Result};

use crate::engine::{Checkpoint, Engine};
use crate::epoch::remove_dir_logged;

#[derive(Debug, Default)]
pub struct CheckpointRegistry {
    current: Option<Checkpoint>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release any existing checkpoint, then build a new one at `dest`.
    ///
    /// On failure the registry is empty and a partially written `dest` is left
    /// for the caller to remove.
    pub fn create(&mut self, engine: &Engine, dest: &Path) -> Result<&Checkpoint> {
        self.release();
        let checkpoint = engine.checkpoint(dest).map_err(|e| {
            error!(dest = %dest.display(), error = %e, "Failed to create checkpoint");
            match e {
                Error::Checkpoint { .. } => e,
                other => Error::Checkpoint {
                    message: other.to_string(),
                },
            }
        })?;
        Ok(&*self.current.insert(checkpoint))
    }

    /// Register a checkpoint built elsewhere, releasing the previous one.
    pub fn install(&mut self, checkpoint: Checkpoint) -> &Checkpoint {
        if self
            .current
            .as_ref()
            .is_some_and(|c| c.dir == checkpoint.dir)
        {
            // Same directory: do not delete what we are about to keep
            self.current = None;
        }
        self.release();
        info!(dir = %checkpoint.dir.display(), sequence = checkpoint.sequence, "Checkpoint installed");
        self.current.insert(checkpoint)
    }

    /// Drop the checkpoint and delete its directory. No-op when empty.
    pub fn release(&mut self) {
        let Some(checkpoint) = self.current.take() else {
            return;
        };
        if remove_dir_logged(&checkpoint.dir) {
            debug!(dir = %checkpoint.dir.display(), "Checkpoint released");
        }
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.current.as_ref()
    }

    pub fn checkpoint_dir(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.dir.as_path())
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }
}

impl Drop for CheckpointRegistry {
    fn drop(&mut self) {
        self.release();
    }
}

/// Remove a partially built checkpoint directory after a failed build.
pub fn discard_partial(dir: &Path) {
    if dir.exists() {
        remove_dir_logged(dir);
    }
}
