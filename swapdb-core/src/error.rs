//! # Error Handling
//!
//! Error types for swapdb operations.
//!
//! ## Severity
//!
//! 1. **Caller errors**: unknown partition names, unavailable properties. No state is touched.
//! 2. **Recoverable**: failed checkpoint/snapshot, failed rename, failed reopen that was rolled back.
//! 3. **Fatal**: `RollbackFailed`. The store has no open engine and the process must not continue.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias for swapdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for swapdb
#[derive(Error, Debug)]
pub enum Error {
    // Engine lifecycle
    #[error("failed to open partition {partition} at {}: {message}", path.display())]
    Open {
        partition: String,
        path: PathBuf,
        message: String,
    },

    #[error("engine is closed")]
    Closed,

    #[error("engine was opened read-only")]
    ReadOnly,

    // Restore
    #[error("failed to rename {} to {}: {source}", from.display(), to.display())]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to reopen engine at epoch {epoch}: {source}")]
    ReopenFailed { epoch: u32, source: Box<Error> },

    #[error("failed to roll back to epoch {epoch}: {source}")]
    RollbackFailed { epoch: u32, source: Box<Error> },

    // Point-in-time views
    #[error("checkpoint error: {message}")]
    Checkpoint { message: String },

    #[error("snapshot error: {message}")]
    Snapshot { message: String },

    // Administrative input
    #[error("unknown partition: {name}")]
    UnknownPartition { name: String },

    #[error("property {property} unavailable for partition {partition}")]
    Property { partition: String, property: String },

    #[error("flush failed for partitions: {}", failed.join(","))]
    Flush { failed: Vec<String> },

    // Fork protocol
    #[error("checkpoint handoff failed: {message}")]
    Handoff {
        message: String,
        source: Option<std::io::Error>,
    },

    #[error("fork protocol error: {message}")]
    Fork { message: String },

    // System
    #[error("corrupted {what}: {message}")]
    Corruption { what: String, message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::RollbackFailed { .. } => false,
            Error::Corruption { .. } => false,
            Error::Closed => false,
            _ => true,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Open { .. } => "OPEN_FAILED",
            Error::Closed => "ENGINE_CLOSED",
            Error::ReadOnly => "READ_ONLY",
            Error::RenameFailed { .. } => "RESTORE_RENAME_FAILED",
            Error::ReopenFailed { .. } => "RESTORE_REOPEN_FAILED",
            Error::RollbackFailed { .. } => "RESTORE_ROLLBACK_FAILED",
            Error::Checkpoint { .. } => "CHECKPOINT_ERROR",
            Error::Snapshot { .. } => "SNAPSHOT_ERROR",
            Error::UnknownPartition { .. } => "UNKNOWN_PARTITION",
            Error::Property { .. } => "PROPERTY_UNAVAILABLE",
            Error::Flush { .. } => "FLUSH_FAILED",
            Error::Handoff { .. } => "HANDOFF_FAILED",
            Error::Fork { .. } => "FORK_PROTOCOL",
            Error::Corruption { .. } => "CORRUPTION",
            Error::Io { .. } => "IO_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

/// Extension trait for attaching the failing path to I/O results
pub trait IoResultExt<T> {
    fn with_path(self, action: &str, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, action: &str, path: &Path) -> Result<T> {
        self.map_err(|source| Error::Io {
            message: format!("{} {}: {}", action, path.display(), source),
            source,
        })
    }
}
