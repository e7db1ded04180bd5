//! Key bounds for logical databases.
//!
//! Every stored key starts with its logical database number as a big-endian
//! `u32`, so one database is one contiguous key range.

use bytes::{BufMut, Bytes, BytesMut};

/// Half-open key range `[start, end)`; `end == None` is unbounded above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bytes,
    pub end: Option<Bytes>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            start: Bytes::new(),
            end: None,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_ref() && self.end.as_ref().map_or(true, |end| key < end.as_ref())
    }
}

/// Range covering logical database `db`, or every key for `None`.
pub fn db_range(db: Option<u32>) -> KeyRange {
    match db {
        None => KeyRange::all(),
        Some(db) => KeyRange {
            start: Bytes::copy_from_slice(&db.to_be_bytes()),
            end: db
                .checked_add(1)
                .map(|next| Bytes::copy_from_slice(&next.to_be_bytes())),
        },
    }
}

/// Prefix `user_key` with its logical database number.
pub fn encode_key(db: u32, user_key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + user_key.len());
    buf.put_u32(db);
    buf.put_slice(user_key);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_range_bounds() {
        let range = db_range(Some(1));
        assert_eq!(range.start.as_ref(), &[0, 0, 0, 1]);
        assert_eq!(range.end.as_deref(), Some(&[0u8, 0, 0, 2][..]));

        assert!(range.contains(&encode_key(1, b"")));
        assert!(range.contains(&encode_key(1, b"\xff\xff")));
        assert!(!range.contains(&encode_key(0, b"zzz")));
        assert!(!range.contains(&encode_key(2, b"")));
    }

    #[test]
    fn test_last_db_is_unbounded() {
        let range = db_range(Some(u32::MAX));
        assert!(range.end.is_none());
        assert!(range.contains(&encode_key(u32::MAX, b"k")));
        assert!(!range.contains(&encode_key(u32::MAX - 1, b"k")));
    }

    #[test]
    fn test_all_range() {
        let range = db_range(None);
        assert!(range.contains(b""));
        assert!(range.contains(&encode_key(7, b"x")));
    }
}
