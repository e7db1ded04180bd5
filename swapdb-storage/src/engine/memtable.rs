//! # MemTable
//!
//! Sorted in-memory buffer of recent writes. Every write is kept as its own
//! version keyed by `(user_key, Reverse(sequence))`, so a lookup at a pinned
//! sequence finds the newest version at or below it with one seek.
//!
//! ```text
//!   ("a", 9) ("a", 4) ("b", 7) ("c", 8) ("c", 2)
//!      ▲                                   ▲
//!   get("a", max=10) → 9           get("c", max=5) → 2
//! ```

use std::cmp::Reverse;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use swapdb_core::config::PartitionConfig;
use swapdb_core::error::{Error, Result};

/// Per-entry bookkeeping overhead counted towards the memtable size
const ENTRY_OVERHEAD: usize = 16;

/// Versioned key: user key ascending, then newest sequence first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub seq: Reverse<u64>,
}

impl InternalKey {
    pub fn new(user_key: Bytes, seq: u64) -> Self {
        Self {
            user_key,
            seq: Reverse(seq),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.seq.0
    }
}

/// One key's newest version as seen at some sequence. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub key: Bytes,
    pub seq: u64,
    pub value: Option<Bytes>,
}

/// MemTable statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemTableStats {
    pub num_entries: u64,
    pub num_deletes: u64,
    pub size_bytes: usize,
}

pub struct MemTable {
    data: SkipMap<InternalKey, Option<Bytes>>,
    size_bytes: AtomicUsize,
    /// Puts and deletes
    num_entries: AtomicU64,
    num_deletes: AtomicU64,
    max_sequence: AtomicU64,
    created_at: Instant,
    /// Set when the table is rotated out; writers must never see it again
    read_only: AtomicBool,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            num_entries: AtomicU64::new(0),
            num_deletes: AtomicU64::new(0),
            max_sequence: AtomicU64::new(0),
            created_at: Instant::now(),
            read_only: AtomicBool::new(false),
        }
    }

    /// Insert a version. `None` records a tombstone.
    pub fn insert(&self, key: Bytes, seq: u64, value: Option<Bytes>) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::Internal {
                message: "write to a rotated memtable".to_string(),
            });
        }

        let size = key.len() + value.as_ref().map_or(0, |v| v.len()) + ENTRY_OVERHEAD;
        if value.is_none() {
            self.num_deletes.fetch_add(1, Ordering::Relaxed);
        }
        self.data.insert(InternalKey::new(key, seq), value);
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
        self.num_entries.fetch_add(1, Ordering::Relaxed);
        self.max_sequence.fetch_max(seq, Ordering::AcqRel);
        Ok(())
    }

    /// Newest version of `key` with sequence `<= max_seq`.
    ///
    /// `Some(None)` means the key was deleted at that point; `None` means this
    /// table has nothing to say about the key.
    pub fn get(&self, key: &[u8], max_seq: u64) -> Option<Option<Bytes>> {
        let probe = InternalKey::new(Bytes::copy_from_slice(key), max_seq);
        let entry = self.data.lower_bound(Bound::Included(&probe))?;
        if entry.key().user_key.as_ref() != key {
            return None;
        }
        Some(entry.value().clone())
    }

    /// Newest version of every key with sequence `<= max_seq`, sorted by key.
    /// Tombstones are included.
    pub fn visible(&self, max_seq: u64) -> Vec<VersionedValue> {
        let mut out: Vec<VersionedValue> = Vec::new();
        for entry in self.data.iter() {
            let ikey = entry.key();
            if ikey.sequence() > max_seq {
                continue;
            }
            // Newest-first within a key: the first visible version wins
            if out
                .last()
                .is_some_and(|last| last.key == ikey.user_key)
            {
                continue;
            }
            out.push(VersionedValue {
                key: ikey.user_key.clone(),
                seq: ikey.sequence(),
                value: entry.value().clone(),
            });
        }
        out
    }

    pub fn should_rotate(&self, config: &PartitionConfig) -> bool {
        self.size_bytes.load(Ordering::Relaxed) >= config.memtable_size
            || self.num_entries.load(Ordering::Relaxed) as usize >= config.max_memtable_entries
    }

    pub fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn max_sequence(&self) -> u64 {
        self.max_sequence.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MemTableStats {
        MemTableStats {
            num_entries: self.num_entries.load(Ordering::Relaxed),
            num_deletes: self.num_deletes.load(Ordering::Relaxed),
            size_bytes: self.size_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_get_respects_sequence() {
        let table = MemTable::new();
        table.insert(b("a"), 4, Some(b("old"))).unwrap();
        table.insert(b("a"), 9, Some(b("new"))).unwrap();
        table.insert(b("ab"), 5, Some(b("other"))).unwrap();

        assert_eq!(table.get(b"a", 10), Some(Some(b("new"))));
        assert_eq!(table.get(b"a", 8), Some(Some(b("old"))));
        assert_eq!(table.get(b"a", 3), None);
        assert_eq!(table.get(b"b", 10), None);
    }

    #[test]
    fn test_tombstones_are_counted() {
        let table = MemTable::new();
        table.insert(b("k"), 1, Some(b("v"))).unwrap();
        table.insert(b("k"), 2, None).unwrap();

        assert_eq!(table.get(b"k", 2), Some(None));
        let stats = table.stats();
        assert_eq!(stats.num_entries, 2);
        assert_eq!(stats.num_deletes, 1);
        assert_eq!(table.max_sequence(), 2);
    }

    #[test]
    fn test_visible_keeps_newest_per_key() {
        let table = MemTable::new();
        table.insert(b("a"), 1, Some(b("1"))).unwrap();
        table.insert(b("a"), 3, Some(b("3"))).unwrap();
        table.insert(b("b"), 2, None).unwrap();
        table.insert(b("c"), 7, Some(b("7"))).unwrap();

        let visible = table.visible(5);
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].value, Some(b("3")));
        assert_eq!(visible[1].key, b("b"));
        assert_eq!(visible[1].value, None);
    }

    #[test]
    fn test_rotated_table_rejects_writes() {
        let table = MemTable::new();
        table.set_read_only();
        assert!(table.insert(b("a"), 1, Some(b("1"))).is_err());
    }

    #[test]
    fn test_should_rotate_on_entry_limit() {
        let config = PartitionConfig {
            max_memtable_entries: 2,
            ..PartitionConfig::default()
        };
        let table = MemTable::new();
        table.insert(b("a"), 1, Some(b("1"))).unwrap();
        assert!(!table.should_rotate(&config));
        table.insert(b("b"), 2, Some(b("2"))).unwrap();
        assert!(table.should_rotate(&config));
    }
}
