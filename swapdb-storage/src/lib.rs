//! # swapdb Storage
//!
//! Lifecycle layer around a multi-partition LSM engine: epoch rotation on
//! restore, a reader/writer guard around the live handle, transient
//! checkpoints, fork-consistent handoff to child processes and periodic
//! maintenance.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SwapStore                             │
//! │                                                              │
//! │  ConcurrencyGuard<EngineHandle> ──> Engine (<base>/<epoch>)  │
//! │        │ read: data path, stats, admin, before_fork          │
//! │        │ write: restore (close + reopen)                     │
//! │                                                              │
//! │  CheckpointRegistry ──> <base>/tmp_<micros>                  │
//! │  StatsReportModel   <── stats refresh completions            │
//! │  MaintenanceScheduler (cron: health, usage, flush, stats)    │
//! │  TaskQueue ──> blocking pool ──> completions on main context │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Fork handoff                            │
//! │                                                              │
//! │  parent: snapshot ──fork──> build checkpoint ──pipe──┐       │
//! │  child:                         block on read ◄──────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod admin;
pub mod checkpoint;
pub mod engine;
pub mod epoch;
pub mod fork;
pub mod guard;
pub mod handle;
pub mod handoff;
pub mod keys;
pub mod lock;
pub mod maintenance;
pub mod stats;
pub mod store;
pub mod tasks;

pub use checkpoint::CheckpointRegistry;
pub use engine::{Checkpoint, Engine, EngineOptions, ReadOptions, Snapshot, WriteOptions};
pub use epoch::EpochDirs;
pub use fork::{ForkController, ForkPhase};
pub use guard::ConcurrencyGuard;
pub use handle::EngineHandle;
pub use keys::KeyRange;
pub use maintenance::{should_flush_meta, DiskHealth, MaintenanceScheduler};
pub use stats::{decode_report, StatsReport, StatsReportModel};
pub use store::SwapStore;
pub use tasks::TaskQueue;
