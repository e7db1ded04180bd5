//! # Snapshots and checkpoints
//!
//! A [`Snapshot`] pins a sequence number together with the memtables and
//! segments that were live at that instant. Holding it costs no I/O; it only
//! keeps those sources alive.
//!
//! [`Snapshot::materialize`] turns the pinned view into an independent engine
//! directory that another process can open:
//!
//! ```text
//! <dest>/<partition>/000001.seg   hard link to the live segment (copy if linking fails)
//! <dest>/<partition>/000007.seg   pinned memtable contents at or below the sequence
//! <dest>/<partition>/MANIFEST
//! ```

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info, warn};

use swapdb_core::error::{Error, IoResultExt, Result};
use swapdb_core::metrics::Timer;
use swapdb_core::utils::now_micros;
use swapdb_core::Partition;

use super::manifest::{Manifest, SegmentManifestEntry};
use super::partition::PartitionView;
use super::segment::{segment_file_name, Segment};

/// Consistent read view across every partition
pub struct Snapshot {
    sequence: u64,
    views: Vec<PartitionView>,
}

/// An on-disk checkpoint produced from a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub dir: PathBuf,
    pub sequence: u64,
    pub created_at_micros: u64,
}

impl Snapshot {
    pub(crate) fn new(sequence: u64, views: Vec<PartitionView>) -> Self {
        Self { sequence, views }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn view(&self, partition: Partition) -> Option<&PartitionView> {
        self.views.iter().find(|v| v.partition == partition)
    }

    pub fn get(&self, partition: Partition, key: &[u8]) -> Option<Bytes> {
        self.view(partition)?.get(key, self.sequence)
    }

    /// Write an independent engine directory at `dest`, which must not exist yet.
    ///
    /// On failure the partially written directory is left for the caller to remove.
    pub fn materialize(&self, dest: impl AsRef<Path>) -> Result<Checkpoint> {
        let dest = dest.as_ref();
        let timer = Timer::new("checkpoint");

        if dest.exists() {
            return Err(Error::Checkpoint {
                message: format!("destination {} already exists", dest.display()),
            });
        }
        std::fs::create_dir(dest).with_path("create checkpoint dir", dest)?;

        for view in &self.views {
            self.materialize_partition(view, &dest.join(view.partition.name()))?;
        }
        sync_dir(dest)?;

        let elapsed = timer.stop();
        info!(
            dir = %dest.display(),
            sequence = self.sequence,
            elapsed_ms = elapsed.as_millis() as u64,
            "Checkpoint created"
        );

        Ok(Checkpoint {
            dir: dest.to_path_buf(),
            sequence: self.sequence,
            created_at_micros: now_micros(),
        })
    }

    fn materialize_partition(&self, view: &PartitionView, dir: &Path) -> Result<()> {
        std::fs::create_dir(dir).with_path("create checkpoint partition dir", dir)?;

        let mut manifest = Manifest::new(view.partition);
        for segment in &view.segments {
            let target = dir.join(segment.file_name());
            link_or_copy(segment.path(), &target)?;
            manifest.segments.push(SegmentManifestEntry::for_segment(segment));
            manifest.next_segment_id = manifest.next_segment_id.max(segment.id() + 1);
        }

        // Memtable contents land in a segment newer than every linked one
        let buffered = view.memtable_visible(self.sequence);
        if !buffered.is_empty() {
            let id = manifest.allocate_segment_id();
            let segment = Segment::write(dir.join(segment_file_name(id)), id, buffered)?;
            manifest.add_segment(&segment);
        }

        manifest.last_sequence = self.sequence;
        manifest.save(dir)?;
        debug!(
            partition = %view.partition,
            segments = manifest.segments.len(),
            "Materialized partition"
        );
        Ok(())
    }
}

fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    match std::fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                src = %src.display(),
                error = %e,
                "Hard link failed, copying segment"
            );
            std::fs::copy(src, dst).with_path("copy segment", src)?;
            Ok(())
        }
    }
}

fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)
        .and_then(|f| f.sync_all())
        .with_path("sync dir", dir)
}
