//! # Core Types
//!
//! Partitions (column families), epochs and fork strategies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Generation number of the on-disk engine directory (`<base>/<epoch>`).
pub type Epoch = u32;

/// Process id of a forked child, used as the handoff generation identifier.
pub type ChildId = i32;

/// A logical keyspace inside one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    /// Primary data partition
    Data,
    /// Object metadata
    Meta,
    /// Secondary index / score partition
    Score,
}

impl Partition {
    /// All partitions in canonical order
    pub const ALL: [Partition; 3] = [Partition::Data, Partition::Meta, Partition::Score];

    /// Number of partitions in one engine instance
    pub const COUNT: usize = Self::ALL.len();

    pub fn name(self) -> &'static str {
        match self {
            Partition::Data => "data",
            Partition::Meta => "meta",
            Partition::Score => "score",
        }
    }

    /// Position in canonical order
    pub fn index(self) -> usize {
        self as usize
    }

    /// Case-insensitive lookup by name
    pub fn from_name(name: &str) -> Option<Partition> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a forked child is handed a consistent view of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkStrategy {
    /// Pin a snapshot before fork, build the checkpoint afterwards and send its path over a pipe
    Snapshot,
    /// Build the checkpoint synchronously before fork
    Checkpoint,
}

impl ForkStrategy {
    pub fn name(self) -> &'static str {
        match self {
            ForkStrategy::Snapshot => "snapshot",
            ForkStrategy::Checkpoint => "checkpoint",
        }
    }
}

impl fmt::Display for ForkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
