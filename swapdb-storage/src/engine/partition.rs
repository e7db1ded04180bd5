//! # Partition store
//!
//! One column family: an active memtable taking writes, a list of rotated
//! (immutable) memtables waiting for flush, and the segments already on disk.
//!
//! Writers hold the state lock shared while they take a sequence number and
//! insert. Rotation, segment publication and snapshot pinning take it
//! exclusively, so a pinned view never contains half of a write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, info};

use swapdb_core::config::PartitionConfig;
use swapdb_core::error::{Error, IoResultExt, Result};
use swapdb_core::utils::format_count;
use swapdb_core::Partition;

use super::manifest::Manifest;
use super::memtable::{MemTable, VersionedValue};
use super::segment::{segment_file_name, Segment};
use crate::keys::KeyRange;

/// Memtables and segments of one partition at one instant
pub struct PartitionState {
    pub active: Arc<MemTable>,
    /// Oldest first
    pub immutable: Vec<Arc<MemTable>>,
    /// Ascending segment id
    pub segments: Vec<Arc<Segment>>,
}

impl PartitionState {
    pub fn view(&self, partition: Partition) -> PartitionView {
        let mut memtables = self.immutable.clone();
        memtables.push(self.active.clone());
        PartitionView {
            partition,
            memtables,
            segments: self.segments.clone(),
        }
    }
}

/// Pinned, immutable set of sources for one partition
#[derive(Clone)]
pub struct PartitionView {
    pub partition: Partition,
    /// Oldest first, active last
    pub memtables: Vec<Arc<MemTable>>,
    /// Ascending segment id
    pub segments: Vec<Arc<Segment>>,
}

impl PartitionView {
    pub fn get(&self, key: &[u8], max_seq: u64) -> Option<Bytes> {
        for table in self.memtables.iter().rev() {
            if let Some(found) = table.get(key, max_seq) {
                return found;
            }
        }
        for segment in self.segments.iter().rev() {
            if let Some(found) = segment.get(key, max_seq) {
                return found;
            }
        }
        None
    }

    /// Newest version of every key at or below `max_seq` across all sources.
    pub fn visible(&self, max_seq: u64) -> Vec<VersionedValue> {
        merge_newest(
            self.segments
                .iter()
                .map(|s| {
                    s.entries()
                        .iter()
                        .filter(|e| e.seq <= max_seq)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .chain(self.memtables.iter().map(|t| t.visible(max_seq))),
        )
    }

    /// Memtable contents only, merged
    pub fn memtable_visible(&self, max_seq: u64) -> Vec<VersionedValue> {
        merge_newest(self.memtables.iter().map(|t| t.visible(max_seq)))
    }
}

/// Merge runs of versions, keeping the highest sequence per key. Output is sorted by key.
fn merge_newest(runs: impl Iterator<Item = Vec<VersionedValue>>) -> Vec<VersionedValue> {
    let mut merged: BTreeMap<Bytes, VersionedValue> = BTreeMap::new();
    for run in runs {
        for version in run {
            match merged.get(&version.key) {
                Some(existing) if existing.seq >= version.seq => {}
                _ => {
                    merged.insert(version.key.clone(), version);
                }
            }
        }
    }
    merged.into_values().collect()
}

/// Cumulative write counters since open
#[derive(Debug, Default)]
struct WriteCounters {
    puts: AtomicU64,
    deletes: AtomicU64,
    range_deletes: AtomicU64,
    flushes: AtomicU64,
}

pub struct PartitionStore {
    partition: Partition,
    dir: PathBuf,
    config: PartitionConfig,
    read_only: bool,
    /// Engine-wide sequence counter
    sequence: Arc<AtomicU64>,
    state: RwLock<PartitionState>,
    manifest: Mutex<Manifest>,
    /// Serializes flushes
    flush_lock: Mutex<()>,
    counters: WriteCounters,
}

impl PartitionStore {
    /// Open the partition stored in `dir`, creating it unless `read_only`.
    pub fn open(
        partition: Partition,
        dir: impl AsRef<Path>,
        config: PartitionConfig,
        sequence: Arc<AtomicU64>,
        read_only: bool,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !read_only {
            std::fs::create_dir_all(&dir).with_path("create partition dir", &dir)?;
        }

        let manifest = match Manifest::load(&dir)? {
            Some(manifest) => manifest,
            None if read_only => {
                return Err(Error::Corruption {
                    what: format!("partition {}", partition),
                    message: format!("no manifest in {}", dir.display()),
                })
            }
            None => {
                let manifest = Manifest::new(partition);
                manifest.save(&dir)?;
                manifest
            }
        };
        if manifest.partition != partition {
            return Err(Error::Corruption {
                what: format!("manifest {}", dir.display()),
                message: format!("belongs to partition {}", manifest.partition),
            });
        }

        let mut segments = Vec::with_capacity(manifest.segments.len());
        for entry in &manifest.segments {
            let segment = Segment::open(dir.join(&entry.file_name), entry.id, config.verify_checksums)?;
            segments.push(Arc::new(segment));
        }
        segments.sort_by_key(|s| s.id());

        sequence.fetch_max(manifest.last_sequence, Ordering::SeqCst);

        debug!(
            partition = %partition,
            segments = segments.len(),
            last_sequence = manifest.last_sequence,
            read_only,
            "Opened partition"
        );

        Ok(Self {
            partition,
            dir,
            config,
            read_only,
            sequence,
            state: RwLock::new(PartitionState {
                active: Arc::new(MemTable::new()),
                immutable: Vec::new(),
                segments,
            }),
            manifest: Mutex::new(manifest),
            flush_lock: Mutex::new(()),
            counters: WriteCounters::default(),
        })
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn put(&self, key: Bytes, value: Bytes) -> Result<u64> {
        let seq = self.write(key, Some(value))?;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    pub fn delete(&self, key: Bytes) -> Result<u64> {
        let seq = self.write(key, None)?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    /// Tombstone every live key inside `range`. Returns the number of keys deleted.
    pub fn delete_range(&self, range: &KeyRange) -> Result<u64> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let keys: Vec<Bytes> = self
            .view()
            .visible(u64::MAX)
            .into_iter()
            .filter(|v| v.value.is_some() && range.contains(&v.key))
            .map(|v| v.key)
            .collect();

        let count = keys.len() as u64;
        for key in keys {
            self.write(key, None)?;
        }
        self.counters.range_deletes.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    fn write(&self, key: Bytes, value: Option<Bytes>) -> Result<u64> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let (seq, rotate) = {
            let state = self.state.read();
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            state.active.insert(key, seq, value)?;
            (seq, state.active.should_rotate(&self.config))
        };

        if rotate && self.rotate(false) && self.immutable_count() > self.config.max_immutable_memtables {
            // Background flushing fell behind
            self.flush_immutable()?;
        }
        Ok(seq)
    }

    pub fn get(&self, key: &[u8], max_seq: u64) -> Option<Bytes> {
        let state = self.state.read();
        if let Some(found) = state.active.get(key, max_seq) {
            return found;
        }
        for table in state.immutable.iter().rev() {
            if let Some(found) = table.get(key, max_seq) {
                return found;
            }
        }
        for segment in state.segments.iter().rev() {
            if let Some(found) = segment.get(key, max_seq) {
                return found;
            }
        }
        None
    }

    /// Current sources, pinned
    pub fn view(&self) -> PartitionView {
        self.state.read().view(self.partition)
    }

    /// Exclusive state lock; holding it on every partition freezes the engine for pinning
    pub(crate) fn lock_exclusive(&self) -> RwLockWriteGuard<'_, PartitionState> {
        self.state.write()
    }

    /// Move the active memtable to the immutable list. Without `force` this only
    /// happens when the active table is over its limits. Returns whether it rotated.
    fn rotate(&self, force: bool) -> bool {
        let mut state = self.state.write();
        if state.active.is_empty() {
            return false;
        }
        if !force && !state.active.should_rotate(&self.config) {
            return false;
        }

        state.active.set_read_only();
        let old = std::mem::replace(&mut state.active, Arc::new(MemTable::new()));
        let stats = old.stats();
        state.immutable.push(old);
        debug!(
            partition = %self.partition,
            entries = stats.num_entries,
            immutable = state.immutable.len(),
            "Rotated memtable"
        );
        true
    }

    fn immutable_count(&self) -> usize {
        self.state.read().immutable.len()
    }

    /// Flush every immutable memtable into its own segment, oldest first.
    pub fn flush_immutable(&self) -> Result<usize> {
        let _flushing = self.flush_lock.lock();
        let mut flushed = 0;

        loop {
            let table = self.state.read().immutable.first().cloned();
            let Some(table) = table else { break };

            let entries = table.visible(u64::MAX);
            let segment = if entries.is_empty() {
                None
            } else {
                let mut next = self.manifest.lock().clone();
                let id = next.allocate_segment_id();
                let segment = Arc::new(Segment::write(
                    self.dir.join(segment_file_name(id)),
                    id,
                    entries,
                )?);
                next.add_segment(&segment);
                next.save(&self.dir)?;
                *self.manifest.lock() = next;
                Some(segment)
            };

            {
                let mut state = self.state.write();
                state.immutable.retain(|t| !Arc::ptr_eq(t, &table));
                if let Some(segment) = &segment {
                    state.segments.push(segment.clone());
                }
            }

            self.counters.flushes.fetch_add(1, Ordering::Relaxed);
            flushed += 1;
        }

        if flushed > 0 {
            debug!(partition = %self.partition, flushed, "Flushed memtables");
        }
        Ok(flushed)
    }

    /// Rotate the active memtable regardless of size and flush everything.
    pub fn flush(&self) -> Result<usize> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.rotate(true);
        self.flush_immutable()
    }

    /// Flush the active memtable if it has been accepting writes for at least `max_age`.
    pub fn flush_if_older(&self, max_age: Duration) -> Result<usize> {
        let stale = {
            let state = self.state.read();
            !state.active.is_empty() && state.active.age() >= max_age
        };
        if !stale {
            return Ok(0);
        }
        info!(partition = %self.partition, max_age_secs = max_age.as_secs(), "Periodic flush");
        self.flush()
    }

    /// Persist all buffered data and record the engine sequence in the manifest.
    pub fn close(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.flush()?;

        let mut manifest = self.manifest.lock();
        manifest.last_sequence = manifest.last_sequence.max(self.sequence.load(Ordering::SeqCst));
        manifest.save(&self.dir)
    }

    pub fn segment_files_size(&self) -> u64 {
        self.state.read().segments.iter().map(|s| s.file_size()).sum()
    }

    pub fn property_int(&self, name: &str) -> Option<u64> {
        let state = self.state.read();
        let active = state.active.stats();
        let imm = state
            .immutable
            .iter()
            .map(|t| t.stats())
            .fold((0u64, 0u64, 0usize), |acc, s| {
                (acc.0 + s.num_entries, acc.1 + s.num_deletes, acc.2 + s.size_bytes)
            });

        let value = match name {
            "num-entries-active-mem-table" => active.num_entries,
            "num-deletes-active-mem-table" => active.num_deletes,
            "num-entries-imm-mem-tables" => imm.0,
            "num-deletes-imm-mem-tables" => imm.1,
            "num-immutable-mem-table" => state.immutable.len() as u64,
            "cur-size-active-mem-table" => active.size_bytes as u64,
            "size-all-mem-tables" => (active.size_bytes + imm.2) as u64,
            "total-segment-files-size" => state.segments.iter().map(|s| s.file_size()).sum(),
            "num-segment-files" => state.segments.len() as u64,
            "estimate-num-keys" => {
                let view = state.view(self.partition);
                drop(state);
                return Some(
                    view.visible(u64::MAX)
                        .iter()
                        .filter(|v| v.value.is_some())
                        .count() as u64,
                );
            }
            "last-sequence" => self.sequence.load(Ordering::SeqCst),
            _ => return None,
        };
        Some(value)
    }

    /// Free-text statistics report
    pub fn stats_text(&self) -> String {
        let (active, imm, imm_count, seg_count, seg_entries, seg_deletes, seg_size) = {
            let state = self.state.read();
            let imm = state.immutable.iter().map(|t| t.stats()).fold((0, 0), |acc, s| {
                (acc.0 + s.num_entries, acc.1 + s.num_deletes)
            });
            (
                state.active.stats(),
                imm,
                state.immutable.len() as u64,
                state.segments.len() as u64,
                state.segments.iter().map(|s| s.entry_count()).sum::<u64>(),
                state.segments.iter().map(|s| s.num_deletes()).sum::<u64>(),
                state.segments.iter().map(|s| s.file_size()).sum::<u64>(),
            )
        };

        let c = &self.counters;
        let mut out = String::new();
        out.push_str(&format!("** Partition [{}] **\n", self.partition));
        out.push_str(&format!(
            "Memtable: active-entries: {}, active-deletes: {}, imm-entries: {}, imm-deletes: {}, imm-count: {}, size-bytes: {}\n",
            format_count(active.num_entries),
            format_count(active.num_deletes),
            format_count(imm.0),
            format_count(imm.1),
            imm_count,
            format_count(active.size_bytes as u64),
        ));
        out.push_str(&format!(
            "Segments: count: {}, entries: {}, deletes: {}, size-bytes: {}\n",
            seg_count,
            format_count(seg_entries),
            format_count(seg_deletes),
            format_count(seg_size),
        ));
        out.push_str(&format!(
            "Writes: puts: {}, deletes: {}, range-deletes: {}, flushes: {}\n",
            format_count(c.puts.load(Ordering::Relaxed)),
            format_count(c.deletes.load(Ordering::Relaxed)),
            format_count(c.range_deletes.load(Ordering::Relaxed)),
            format_count(c.flushes.load(Ordering::Relaxed)),
        ));
        out.push_str(&format!(
            "Sequence: last: {}, mode: {}\n",
            self.sequence.load(Ordering::SeqCst),
            if self.read_only { "read-only" } else { "read-write" },
        ));
        out
    }
}
