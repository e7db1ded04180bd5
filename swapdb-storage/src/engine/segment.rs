//! # Segment files
//!
//! Immutable sorted runs produced by flushing memtables. A segment holds at
//! most one version per key; tombstones are kept so they keep shadowing older
//! segments.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ magic "SWAPSEG1" | version   │  header (12 bytes)
//! ├──────────────────────────────┤
//! │ key_len u32 | key | seq u64  │
//! │ kind u8 | [val_len u32 | val]│  × count, sorted by key
//! ├──────────────────────────────┤
//! │ count u64 | crc32 u32 | magic│  footer (20 bytes)
//! └──────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The checksum covers the entry region.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use tracing::debug;

use swapdb_core::error::{Error, IoResultExt, Result};

use super::memtable::VersionedValue;

pub const SEGMENT_MAGIC: &[u8; 8] = b"SWAPSEG1";
pub const SEGMENT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 12;
const FOOTER_SIZE: usize = 20;
/// key_len + seq + kind of an entry with an empty key
const MIN_ENTRY_SIZE: usize = 13;

const KIND_VALUE: u8 = 1;
const KIND_TOMBSTONE: u8 = 0;

/// File name for a segment id
pub fn segment_file_name(id: u64) -> String {
    format!("{:06}.seg", id)
}

/// An open segment. Entries are loaded eagerly and sorted by key.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    path: PathBuf,
    entries: Vec<VersionedValue>,
    file_size: u64,
    num_deletes: u64,
    max_sequence: u64,
}

impl Segment {
    /// Write `entries` (sorted, unique keys) to `path` and return the open segment.
    pub fn write(path: impl AsRef<Path>, id: u64, entries: Vec<VersionedValue>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug_assert!(entries.windows(2).all(|w| w[0].key < w[1].key));

        let mut body = Vec::new();
        for entry in &entries {
            encode_entry(&mut body, entry)?;
        }

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_path("create segment", &path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(SEGMENT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        writer.write_all(&body)?;
        writer.write_u64::<LittleEndian>(entries.len() as u64)?;
        writer.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        writer.write_all(SEGMENT_MAGIC)?;
        writer.flush()?;
        writer
            .get_ref()
            .sync_all()
            .with_path("sync segment", &path)?;

        let file_size = (HEADER_SIZE + body.len() + FOOTER_SIZE) as u64;
        debug!(path = %path.display(), entries = entries.len(), file_size, "Wrote segment");

        Ok(Self::from_entries(id, path, entries, file_size))
    }

    /// Open and decode a segment file.
    pub fn open(path: impl AsRef<Path>, id: u64, verify_checksum: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut raw = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .with_path("read segment", &path)?;

        let corrupt = |message: String| Error::Corruption {
            what: format!("segment {}", path.display()),
            message,
        };

        if raw.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt(format!("file too short: {} bytes", raw.len())));
        }
        if &raw[..8] != SEGMENT_MAGIC || &raw[raw.len() - 8..] != SEGMENT_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }

        let version = (&raw[8..12]).read_u32::<LittleEndian>()?;
        if version != SEGMENT_VERSION {
            return Err(corrupt(format!("unsupported version {}", version)));
        }

        let footer_start = raw.len() - FOOTER_SIZE;
        let mut footer = &raw[footer_start..];
        let count = footer.read_u64::<LittleEndian>()?;
        let crc = footer.read_u32::<LittleEndian>()?;

        let body = &raw[HEADER_SIZE..footer_start];
        if verify_checksum && crc32fast::hash(body) != crc {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        // The count sits outside the checksummed region
        let max_entries = (body.len() / MIN_ENTRY_SIZE) as u64;
        if count > max_entries {
            return Err(corrupt(format!(
                "entry count {} does not fit in {} body bytes",
                count,
                body.len()
            )));
        }

        let mut cursor = Cursor::new(body);
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entry = decode_entry(&mut cursor)
                .map_err(|e| corrupt(format!("truncated entry: {}", e)))?;
            entries.push(entry);
        }
        if (cursor.position() as usize) != body.len() {
            return Err(corrupt("trailing bytes after entries".to_string()));
        }

        Ok(Self::from_entries(id, path, entries, raw.len() as u64))
    }

    fn from_entries(id: u64, path: PathBuf, entries: Vec<VersionedValue>, file_size: u64) -> Self {
        let num_deletes = entries.iter().filter(|e| e.value.is_none()).count() as u64;
        let max_sequence = entries.iter().map(|e| e.seq).max().unwrap_or(0);
        Self {
            id,
            path,
            entries,
            file_size,
            num_deletes,
            max_sequence,
        }
    }

    /// Version of `key` if this segment holds one at or below `max_seq`.
    pub fn get(&self, key: &[u8], max_seq: u64) -> Option<Option<Bytes>> {
        let idx = self
            .entries
            .binary_search_by(|e| e.key.as_ref().cmp(key))
            .ok()?;
        let entry = &self.entries[idx];
        (entry.seq <= max_seq).then(|| entry.value.clone())
    }

    pub fn entries(&self) -> &[VersionedValue] {
        &self.entries
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        segment_file_name(self.id)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn num_deletes(&self) -> u64 {
        self.num_deletes
    }

    pub fn max_sequence(&self) -> u64 {
        self.max_sequence
    }
}

fn encode_entry(buf: &mut Vec<u8>, entry: &VersionedValue) -> Result<()> {
    buf.write_u32::<LittleEndian>(entry.key.len() as u32)?;
    buf.write_all(&entry.key)?;
    buf.write_u64::<LittleEndian>(entry.seq)?;
    match &entry.value {
        Some(value) => {
            buf.write_u8(KIND_VALUE)?;
            buf.write_u32::<LittleEndian>(value.len() as u32)?;
            buf.write_all(value)?;
        }
        None => buf.write_u8(KIND_TOMBSTONE)?,
    }
    Ok(())
}

fn decode_entry(cursor: &mut Cursor<&[u8]>) -> std::io::Result<VersionedValue> {
    let key = read_bytes(cursor)?;
    let seq = cursor.read_u64::<LittleEndian>()?;
    let value = match cursor.read_u8()? {
        KIND_VALUE => Some(read_bytes(cursor)?),
        KIND_TOMBSTONE => None,
        kind => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown entry kind {}", kind),
            ))
        }
    };
    Ok(VersionedValue { key, seq, value })
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Bytes> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
    }
    let mut data = vec![0u8; len];
    cursor.read_exact(&mut data)?;
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(key: &str, seq: u64, value: Option<&str>) -> VersionedValue {
        VersionedValue {
            key: Bytes::copy_from_slice(key.as_bytes()),
            seq,
            value: value.map(|v| Bytes::copy_from_slice(v.as_bytes())),
        }
    }

    #[test]
    fn test_write_then_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(1));
        let written = Segment::write(
            &path,
            1,
            vec![entry("a", 3, Some("x")), entry("b", 5, None), entry("c", 1, Some(""))],
        )
        .unwrap();
        assert_eq!(written.file_size(), std::fs::metadata(&path).unwrap().len());

        let segment = Segment::open(&path, 1, true).unwrap();
        assert_eq!(segment.entry_count(), 3);
        assert_eq!(segment.num_deletes(), 1);
        assert_eq!(segment.max_sequence(), 5);
        assert_eq!(segment.get(b"a", 10), Some(Some(Bytes::from_static(b"x"))));
        assert_eq!(segment.get(b"b", 10), Some(None));
        assert_eq!(segment.get(b"b", 4), None);
        assert_eq!(segment.get(b"d", 10), None);
    }

    #[test]
    fn test_oversized_entry_count_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(3));
        Segment::write(&path, 3, vec![entry("key", 1, Some("value"))]).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let count_at = raw.len() - FOOTER_SIZE;
        raw[count_at..count_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&path, &raw).unwrap();

        let err = Segment::open(&path, 3, true).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
        let err = Segment::open(&path, 3, false).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }

    #[test]
    fn test_corrupt_body_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(2));
        Segment::write(&path, 2, vec![entry("key", 1, Some("value"))]).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[HEADER_SIZE + 5] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        let err = Segment::open(&path, 2, true).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }

    #[test]
    fn test_truncated_file_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.seg");
        std::fs::write(&path, b"SWAPSEG1").unwrap();
        assert!(matches!(
            Segment::open(&path, 3, false),
            Err(Error::Corruption { .. })
        ));
    }
}
