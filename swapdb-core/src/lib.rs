//! # swapdb Core
//!
//! Shared vocabulary for the swapdb crates:
//! - Error types
//! - Configuration
//! - Partition and fork-strategy types
//! - Metrics
//! - Common utilities
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  swapdb-core                    │
//! ├─────────────────────────────────────────────────┤
//! │  • types   - Partitions, epochs, strategies    │
//! │  • config  - Engine / maintenance / fork conf  │
//! │  • error   - Error handling                    │
//! │  • metrics - Lifecycle counters                │
//! │  • utils   - Time, formatting, magnitudes      │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, IoResultExt, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use types::{ChildId, Epoch, ForkStrategy, Partition};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
