//! # Manifest - Segment Metadata Management
//!
//! One JSON manifest per partition directory tracks its live segments and the
//! highest sequence number it has persisted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use swapdb_core::error::{Error, IoResultExt, Result};
use swapdb_core::Partition;

use super::segment::Segment;

pub const MANIFEST_FILE: &str = "MANIFEST";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub partition: Partition,
    pub last_sequence: u64,
    pub next_segment_id: u64,
    pub segments: Vec<SegmentManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentManifestEntry {
    pub id: u64,
    pub file_name: String,
    pub size: u64,
    pub entry_count: u64,
    pub num_deletes: u64,
    pub max_sequence: u64,
    pub created_at: u64,
}

impl SegmentManifestEntry {
    pub fn for_segment(segment: &Segment) -> Self {
        Self {
            id: segment.id(),
            file_name: segment.file_name(),
            size: segment.file_size(),
            entry_count: segment.entry_count(),
            num_deletes: segment.num_deletes(),
            max_sequence: segment.max_sequence(),
            created_at: swapdb_core::utils::now_millis(),
        }
    }
}

impl Manifest {
    pub fn new(partition: Partition) -> Self {
        Self {
            version: MANIFEST_VERSION,
            partition,
            last_sequence: 0,
            next_segment_id: 1,
            segments: Vec::new(),
        }
    }

    /// Load the manifest in `dir`, or `None` if the directory has none yet.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_path("read manifest", &path),
        };

        let manifest: Manifest = serde_json::from_slice(&raw).map_err(|e| Error::Corruption {
            what: format!("manifest {}", path.display()),
            message: e.to_string(),
        })?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::Corruption {
                what: format!("manifest {}", path.display()),
                message: format!("unsupported version {}", manifest.version),
            });
        }
        Ok(Some(manifest))
    }

    /// Atomically replace the manifest in `dir` (write temp file, fsync, rename).
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));

        let raw = serde_json::to_vec_pretty(self).map_err(|e| Error::Internal {
            message: format!("encode manifest: {}", e),
        })?;
        std::fs::write(&tmp, &raw).with_path("write manifest", &tmp)?;
        std::fs::File::open(&tmp)
            .and_then(|f| f.sync_all())
            .with_path("sync manifest", &tmp)?;
        std::fs::rename(&tmp, &path).with_path("install manifest", &path)?;
        Ok(())
    }

    pub fn add_segment(&mut self, segment: &Segment) {
        self.segments.push(SegmentManifestEntry::for_segment(segment));
        self.next_segment_id = self.next_segment_id.max(segment.id() + 1);
        self.last_sequence = self.last_sequence.max(segment.max_sequence());
    }

    pub fn allocate_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }
}
