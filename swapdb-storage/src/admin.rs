//! Administrative surface: partition name filters, property aggregation and
//! range flushes. Every call runs under the read side of the engine guard.

use std::fmt::Write as _;

use tracing::{info, warn};

use swapdb_core::error::{Error, Result};
use swapdb_core::Partition;

use crate::engine::Engine;
use crate::keys::db_range;
use crate::store::SwapStore;

/// Parse a comma/space separated list of partition names.
///
/// Empty input selects every partition in canonical order. Names match
/// case-insensitively and repeated names collapse to their first occurrence.
pub fn resolve_partitions_by_name(names: &str) -> Result<Vec<Partition>> {
    let mut resolved = Vec::new();
    for name in names
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|n| !n.is_empty())
    {
        let partition = Partition::from_name(name).ok_or_else(|| Error::UnknownPartition {
            name: name.to_string(),
        })?;
        if !resolved.contains(&partition) {
            resolved.push(partition);
        }
    }
    if resolved.is_empty() {
        resolved.extend(Partition::ALL);
    }
    Ok(resolved)
}

/// Sum an integer property over `partitions`. Every partition is attempted;
/// the error names the first one that failed.
pub fn property_sum(engine: &Engine, partitions: &[Partition], property: &str) -> Result<u64> {
    let mut total = 0u64;
    let mut first_failure = None;
    for &partition in partitions {
        match engine.property_int(partition, property) {
            Ok(value) => total = total.saturating_add(value),
            Err(e) => {
                warn!(partition = %partition, property, error = %e, "Property read failed");
                first_failure.get_or_insert(partition);
            }
        }
    }
    match first_failure {
        Some(partition) => Err(Error::Property {
            partition: partition.name().to_string(),
            property: property.to_string(),
        }),
        None => Ok(total),
    }
}

/// One `<partition>:<value>` line per partition; failed reads render as `error`.
pub fn property_report(engine: &Engine, partitions: &[Partition], property: &str) -> String {
    let mut out = String::new();
    for &partition in partitions {
        match engine.property_text(partition, property) {
            Ok(value) => {
                let _ = writeln!(out, "{}:{}", partition, value.trim_end());
            }
            Err(e) => {
                warn!(partition = %partition, property, error = %e, "Property read failed");
                let _ = writeln!(out, "{}:error", partition);
            }
        }
    }
    out
}

impl SwapStore {
    pub fn property_sum(&self, names: &str, property: &str) -> Result<u64> {
        let partitions = resolve_partitions_by_name(names)?;
        let handle = self.engine.acquire_read();
        property_sum(handle.engine()?, &partitions, property)
    }

    pub fn property_report(&self, names: &str, property: &str) -> Result<String> {
        let partitions = resolve_partitions_by_name(names)?;
        let handle = self.engine.acquire_read();
        Ok(property_report(handle.engine()?, &partitions, property))
    }

    /// Delete every key of logical database `db` (all databases for `None`)
    /// from every partition.
    pub fn flush_range(&mut self, db: Option<u32>) -> Result<u64> {
        self.process_completions();

        let range = db_range(db);
        let handle = self.engine.acquire_read();
        let engine = handle.engine()?;

        let mut removed = 0u64;
        let mut failed = Vec::new();
        for partition in Partition::ALL {
            match engine.delete_range(partition, &range) {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(partition = %partition, error = %e, "Range delete failed");
                    failed.push(partition.name().to_string());
                }
            }
        }

        if !failed.is_empty() {
            return Err(Error::Flush { failed });
        }
        info!(db = ?db, removed, "Flushed key range");
        Ok(removed)
    }
}
