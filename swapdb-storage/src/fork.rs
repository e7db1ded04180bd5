//! # Fork consistency
//!
//! Gives a forked child a checkpoint directory consistent with one point in
//! time while the parent keeps writing. The caller drives five phases in order:
//!
//! ```text
//! init ─> before_fork ─> fork() ─┬─> after_fork_child   (child)
//!                                └─> after_fork_parent  (parent)
//!                                          ─> deinit
//! ```
//!
//! Two strategies:
//!
//! - **Snapshot**: `before_fork` only pins a snapshot. After the fork the parent
//!   builds the checkpoint from that snapshot on the task queue and sends its
//!   path down a pipe; the child blocks reading it.
//! - **Checkpoint**: `before_fork` builds the checkpoint synchronously, so the
//!   child opens the directory it already knows. No pipe.
//!
//! A handoff whose child has exited (the registered pid no longer matches) is
//! abandoned: nothing is written and the fresh directory is discarded.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use swapdb_core::error::{Error, Result};
use swapdb_core::{ChildId, ForkStrategy};

use crate::checkpoint::discard_partial;
use crate::engine::Checkpoint;
use crate::epoch::remove_dir_logged;
use crate::handoff::{self, HandoffReader, HandoffWriter, WriteProgress};
use crate::store::SwapStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPhase {
    Created,
    Initialized,
    BeforeForkDone,
    AfterForkChildDone,
    AfterForkParentDone,
    Deinitialized,
}

#[derive(Debug)]
enum StrategyState {
    Snapshot {
        reader: Option<HandoffReader>,
        writer: Option<HandoffWriter>,
    },
    Checkpoint {
        dir: Option<PathBuf>,
    },
}

#[derive(Debug)]
pub struct ForkController {
    strategy: ForkStrategy,
    phase: ForkPhase,
    state: StrategyState,
}

impl ForkController {
    pub fn new(strategy: ForkStrategy) -> Self {
        let state = match strategy {
            ForkStrategy::Snapshot => StrategyState::Snapshot {
                reader: None,
                writer: None,
            },
            ForkStrategy::Checkpoint => StrategyState::Checkpoint { dir: None },
        };
        Self {
            strategy,
            phase: ForkPhase::Created,
            state,
        }
    }

    pub fn strategy(&self) -> ForkStrategy {
        self.strategy
    }

    pub fn phase(&self) -> ForkPhase {
        self.phase
    }

    fn expect_phase(&self, expected: ForkPhase, operation: &str) -> Result<()> {
        if self.phase != expected {
            return Err(Error::Fork {
                message: format!(
                    "{} called in phase {:?}, expected {:?}",
                    operation, self.phase, expected
                ),
            });
        }
        Ok(())
    }

    pub fn init(&mut self) -> Result<()> {
        self.expect_phase(ForkPhase::Created, "init")?;
        if let StrategyState::Snapshot { reader, writer } = &mut self.state {
            let (r, w) = handoff::channel()?;
            *reader = Some(r);
            *writer = Some(w);
        }
        self.phase = ForkPhase::Initialized;
        debug!(strategy = %self.strategy.name(), "Fork controller initialized");
        Ok(())
    }

    /// Runs in the parent before `fork()`. On error the fork must not proceed.
    pub fn before_fork(&mut self, store: &mut SwapStore) -> Result<()> {
        self.expect_phase(ForkPhase::Initialized, "before_fork")?;

        match &mut self.state {
            StrategyState::Snapshot { .. } => {
                let handle = store.engine.acquire_read();
                handle.take_snapshot()?;
                store.metrics.record_snapshot();
            }
            StrategyState::Checkpoint { dir } => {
                let handle = store.engine.acquire_read();
                let dest = handle.epochs().checkpoint_dir();
                // Built aside and installed only on success, so a failed build
                // keeps the previous checkpoint
                match handle.engine().and_then(|engine| engine.checkpoint(&dest)) {
                    Ok(checkpoint) => {
                        store.checkpoints.install(checkpoint);
                        store.metrics.record_checkpoint();
                        *dir = Some(dest);
                    }
                    Err(e) => {
                        error!(dest = %dest.display(), error = %e, "Failed to create fork checkpoint");
                        discard_partial(&dest);
                        store.metrics.record_checkpoint_failure();
                        return Err(Error::Checkpoint {
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        self.phase = ForkPhase::BeforeForkDone;
        Ok(())
    }

    /// Runs in the child. Returns the checkpoint directory to open; an error
    /// means the child must exit.
    pub fn after_fork_child(&mut self) -> Result<PathBuf> {
        self.expect_phase(ForkPhase::BeforeForkDone, "after_fork_child")?;

        let dir = match &mut self.state {
            StrategyState::Snapshot { reader, writer } => {
                // Our copy of the write end must go or EOF never comes
                writer.take();
                let reader = reader.take().ok_or_else(|| Error::Fork {
                    message: "handoff reader already consumed".to_string(),
                })?;
                PathBuf::from(reader.read_message()?)
            }
            StrategyState::Checkpoint { dir } => dir.clone().ok_or_else(|| Error::Fork {
                message: "no checkpoint was created before fork".to_string(),
            })?,
        };

        self.phase = ForkPhase::AfterForkChildDone;
        Ok(dir)
    }

    /// Runs in the parent after `fork()`. `child` is `None` when the fork failed.
    pub fn after_fork_parent(&mut self, store: &mut SwapStore, child: Option<ChildId>) -> Result<()> {
        self.expect_phase(ForkPhase::BeforeForkDone, "after_fork_parent")?;
        self.phase = ForkPhase::AfterForkParentDone;

        let (reader, writer) = match &mut self.state {
            StrategyState::Checkpoint { .. } => {
                if let Some(pid) = child {
                    store.set_active_child(pid);
                }
                return Ok(());
            }
            StrategyState::Snapshot { reader, writer } => (reader.take(), writer.take()),
        };
        drop(reader);

        let Some(pid) = child else {
            drop(writer);
            store.engine.acquire_read().release_snapshot();
            return Err(Error::Fork {
                message: "fork failed".to_string(),
            });
        };
        store.set_active_child(pid);

        let writer = writer.ok_or_else(|| Error::Fork {
            message: "handoff writer already consumed".to_string(),
        })?;
        let (snapshot, dest) = {
            let handle = store.engine.acquire_read();
            // Dropping the writer on error hands the child an empty payload
            let snapshot = handle.standing_snapshot().ok_or_else(|| Error::Fork {
                message: "no standing snapshot to build from".to_string(),
            })?;
            (snapshot, handle.epochs().checkpoint_dir())
        };

        let build_dest = dest.clone();
        let build_snapshot = Arc::clone(&snapshot);
        let submitted = store.tasks.submit(
            "fork-checkpoint",
            move || build_snapshot.materialize(&build_dest),
            move |store: &mut SwapStore, built: Result<Checkpoint>| {
                finish_build(store, pid, dest, writer, built);
                store.engine.acquire_read().release_snapshot_if_current(&snapshot);
            },
        );
        if !submitted {
            return Err(Error::Fork {
                message: "task queue is shut down".to_string(),
            });
        }
        info!(child = pid, "Checkpoint build submitted for forked child");
        Ok(())
    }

    /// Free pipe state. Accepted in any phase.
    pub fn deinit(&mut self) {
        match &mut self.state {
            StrategyState::Snapshot { reader, writer } => {
                reader.take();
                writer.take();
            }
            StrategyState::Checkpoint { dir } => {
                dir.take();
            }
        }
        self.phase = ForkPhase::Deinitialized;
    }
}

fn finish_build(
    store: &mut SwapStore,
    child: ChildId,
    dest: PathBuf,
    mut writer: HandoffWriter,
    built: Result<Checkpoint>,
) {
    let checkpoint = match built {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            error!(child, dest = %dest.display(), error = %e, "Fork checkpoint build failed");
            discard_partial(&dest);
            store.metrics.record_checkpoint_failure();
            return;
        }
    };

    if store.active_child() != Some(child) {
        info!(child, dir = %checkpoint.dir.display(), "Child gone, abandoning checkpoint handoff");
        remove_dir_logged(&checkpoint.dir);
        store.metrics.record_handoff_abandoned();
        return;
    }

    let dir = store.checkpoints.install(checkpoint).dir.clone();
    store.metrics.record_checkpoint();

    let Some(path) = dir.to_str() else {
        error!(dir = %dir.display(), "Checkpoint path is not UTF-8, cannot hand off");
        return;
    };
    if let Err(e) = writer.set_payload(path) {
        error!(child, error = %e, "Failed to prepare checkpoint handoff");
        return;
    }
    write_handoff(store, child, writer);
}

/// Push the pending payload; on a full pipe, wait for writability on the task
/// queue and come back here from the completion.
fn write_handoff(store: &mut SwapStore, child: ChildId, mut writer: HandoffWriter) {
    if store.active_child() != Some(child) {
        info!(child, "Child gone, abandoning checkpoint handoff");
        store.metrics.record_handoff_abandoned();
        return;
    }

    match writer.write_pending() {
        Ok(WriteProgress::Done) => {
            info!(child, "Checkpoint path handed off");
            store.metrics.record_handoff();
        }
        Ok(WriteProgress::WouldBlock) => {
            let timeout = store.config.fork.handoff_wait_timeout;
            let submitted = store.tasks.submit(
                "handoff-wait",
                move || {
                    let ready = handoff::wait_writable(writer.raw_fd(), timeout);
                    (writer, ready)
                },
                move |store: &mut SwapStore, (writer, ready): (HandoffWriter, Result<bool>)| {
                    match ready {
                        Ok(_) => write_handoff(store, child, writer),
                        Err(e) => warn!(child, error = %e, "Handoff wait failed"),
                    }
                },
            );
            if !submitted {
                // The writer went with the task; the child sees a truncated message
                warn!(child, "Task queue is shut down, abandoning partial checkpoint handoff");
                store.metrics.record_handoff_abandoned();
            }
        }
        Err(e) => warn!(child, error = %e, "Checkpoint handoff failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_enforced() {
        let mut controller = ForkController::new(ForkStrategy::Checkpoint);
        assert!(matches!(controller.after_fork_child(), Err(Error::Fork { .. })));
        assert_eq!(controller.phase(), ForkPhase::Created);

        controller.init().unwrap();
        assert!(controller.init().is_err());
        assert_eq!(controller.phase(), ForkPhase::Initialized);

        controller.deinit();
        assert_eq!(controller.phase(), ForkPhase::Deinitialized);
    }

    #[test]
    fn test_handoff_abandoned_when_queue_is_down() {
        let base = tempfile::TempDir::new().unwrap();
        let mut config = swapdb_core::Config::default();
        config.engine.base_dir = base.path().to_path_buf();
        let mut store = SwapStore::open(config).unwrap();
        store.set_active_child(4242);
        store.tasks.shutdown(std::time::Duration::from_secs(1));

        let (reader, mut writer) = handoff::channel().unwrap();
        writer.set_payload(&"p".repeat(1 << 20)).unwrap();
        write_handoff(&mut store, 4242, writer);

        assert_eq!(store.metrics().snapshot().handoffs_abandoned, 1);
        assert_eq!(store.metrics().snapshot().handoffs_completed, 0);
        assert!(matches!(reader.read_message(), Err(Error::Handoff { .. })));
    }

    #[test]
    fn test_snapshot_init_opens_pipe() {
        let mut controller = ForkController::new(ForkStrategy::Snapshot);
        controller.init().unwrap();
        assert!(matches!(
            controller.state,
            StrategyState::Snapshot {
                reader: Some(_),
                writer: Some(_)
            }
        ));
        controller.deinit();
        assert!(matches!(
            controller.state,
            StrategyState::Snapshot {
                reader: None,
                writer: None
            }
        ));
    }
}
