//! # Statistics reports
//!
//! Background stats refresh collects each partition's free-text report plus
//! exact memtable counters. The decoder turns report text into fields:
//!
//! ```text
//! ** Partition [meta] **                          section header
//! Memtable: active-entries: 1.2K, imm-count: 0    <label>: <field>: <value>, ...
//! ```
//!
//! Values with a `K`/`M`/`G` suffix are scaled by 10^3/10^6/10^9; values that
//! are not numbers are kept as text. Lines that match neither form are skipped.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::warn;

use swapdb_core::error::Result;
use swapdb_core::utils::parse_magnitude;
use swapdb_core::{Epoch, Partition};

use crate::engine::Engine;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

/// One decoded `field: value` pair
#[derive(Debug, Clone, PartialEq)]
pub struct ReportField {
    /// Enclosing section from the last header line (empty before any header)
    pub section: String,
    /// Line label, e.g. `Memtable`
    pub label: String,
    pub name: String,
    pub value: FieldValue,
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(t) => f.write_str(t),
        }
    }
}

impl ReportField {
    pub fn as_number(&self) -> Option<f64> {
        match self.value {
            FieldValue::Number(n) => Some(n),
            FieldValue::Text(_) => None,
        }
    }
}

fn parse_header(line: &str) -> Option<&str> {
    let inner = line.strip_prefix("** ")?.strip_suffix(" **")?;
    let open = inner.find('[')?;
    let close = inner.rfind(']')?;
    (open < close).then(|| &inner[open + 1..close])
}

/// Decode a free-text report into fields, in order of appearance.
pub fn decode_report(text: &str) -> Vec<ReportField> {
    let mut fields = Vec::new();
    let mut section = String::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(name) = parse_header(line) {
            section = name.to_string();
            continue;
        }
        let Some((label, body)) = line.split_once(": ") else {
            continue;
        };
        for pair in body.split(", ") {
            let Some((name, raw)) = pair.split_once(": ") else {
                continue;
            };
            let raw = raw.trim();
            let value = match parse_magnitude(raw) {
                Some(n) => FieldValue::Number(n),
                None => FieldValue::Text(raw.to_string()),
            };
            fields.push(ReportField {
                section: section.clone(),
                label: label.trim().to_string(),
                name: name.trim().to_string(),
                value,
            });
        }
    }
    fields
}

/// Exact memtable counters used by the flush heuristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemtableCounters {
    pub active_entries: u64,
    pub active_deletes: u64,
    pub imm_entries: u64,
    pub imm_deletes: u64,
}

impl MemtableCounters {
    pub fn read(engine: &Engine, partition: Partition) -> Result<Self> {
        Ok(Self {
            active_entries: engine.property_int(partition, "num-entries-active-mem-table")?,
            active_deletes: engine.property_int(partition, "num-deletes-active-mem-table")?,
            imm_entries: engine.property_int(partition, "num-entries-imm-mem-tables")?,
            imm_deletes: engine.property_int(partition, "num-deletes-imm-mem-tables")?,
        })
    }

    pub fn entries(&self) -> u64 {
        self.active_entries + self.imm_entries
    }

    pub fn deletes(&self) -> u64 {
        self.active_deletes + self.imm_deletes
    }
}

/// Report for one partition
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionReport {
    pub partition: Partition,
    pub text: String,
    pub counters: MemtableCounters,
    pub fields: Vec<ReportField>,
}

/// Reports for every partition of one epoch's engine
#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub epoch: Epoch,
    pub collected_at_micros: u64,
    pub partitions: Vec<PartitionReport>,
}

impl StatsReport {
    /// Collect reports from every partition. A partition whose report cannot be
    /// read is logged and left out.
    pub fn collect(engine: &Engine, epoch: Epoch) -> Self {
        let mut partitions = Vec::with_capacity(Partition::COUNT);
        for partition in Partition::ALL {
            let report = engine.property_text(partition, "stats").and_then(|text| {
                let counters = MemtableCounters::read(engine, partition)?;
                Ok(PartitionReport {
                    partition,
                    fields: decode_report(&text),
                    text,
                    counters,
                })
            });
            match report {
                Ok(report) => partitions.push(report),
                Err(e) => warn!(partition = %partition, error = %e, "Failed to collect stats"),
            }
        }
        Self {
            epoch,
            collected_at_micros: swapdb_core::utils::now_micros(),
            partitions,
        }
    }

    pub fn partition(&self, partition: Partition) -> Option<&PartitionReport> {
        self.partitions.iter().find(|r| r.partition == partition)
    }

    /// `<partition>.<label>.<field>:<value>` lines for the info surface
    pub fn format_info(&self) -> String {
        let mut out = String::new();
        for report in &self.partitions {
            for field in &report.fields {
                let _ = writeln!(
                    out,
                    "{}.{}.{}:{}",
                    report.partition,
                    field.label.to_lowercase(),
                    field.name,
                    field.value
                );
            }
        }
        out
    }
}

/// Latest collected report, replaced wholesale on every refresh
#[derive(Debug, Default)]
pub struct StatsReportModel {
    current: Option<Arc<StatsReport>>,
}

impl StatsReportModel {
    pub fn replace(&mut self, report: StatsReport) {
        self.current = Some(Arc::new(report));
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<Arc<StatsReport>> {
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
** Partition [meta] **
Memtable: active-entries: 1.2K, active-deletes: 300, imm-count: 0
Segments: count: 2, size-bytes: 3.5M
Sequence: last: 42, mode: read-write
garbage line without separator
";

    #[test]
    fn test_decode_sections_and_magnitudes() {
        let fields = decode_report(SAMPLE);
        assert_eq!(fields.len(), 7);
        assert!(fields.iter().all(|f| f.section == "meta"));

        let get = |name: &str| fields.iter().find(|f| f.name == name).unwrap();
        assert_eq!(get("active-entries").as_number(), Some(1200.0));
        assert_eq!(get("active-deletes").as_number(), Some(300.0));
        assert_eq!(get("size-bytes").as_number(), Some(3_500_000.0));
        assert_eq!(get("size-bytes").label, "Segments");
        assert_eq!(get("mode").value, FieldValue::Text("read-write".to_string()));
    }

    #[test]
    fn test_decode_skips_malformed_pairs() {
        let fields = decode_report("Label: ok: 1, broken, also: 2G\n: \n");
        let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["ok", "also"]);
        assert_eq!(fields[1].as_number(), Some(2e9));
        assert_eq!(fields[0].section, "");
    }

    #[test]
    fn test_model_is_replaced_wholesale() {
        let mut model = StatsReportModel::default();
        assert!(model.current().is_none());

        model.replace(StatsReport {
            epoch: 1,
            collected_at_micros: 0,
            partitions: Vec::new(),
        });
        let first = model.current().unwrap();
        model.replace(StatsReport {
            epoch: 2,
            collected_at_micros: 0,
            partitions: Vec::new(),
        });
        assert_eq!(first.epoch, 1);
        assert_eq!(model.current().unwrap().epoch, 2);

        model.clear();
        assert!(model.current().is_none());
    }
}
