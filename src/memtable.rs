//! In-memory sorted buffer of recent writes (§4.2).
//!
//! Two instances exist inside the engine: `active` (receives writes) and at
//! most one `frozen` (sealed, awaiting flush). Backed by a `BTreeMap` for
//! O(log n) point lookup and in-order range scan, the same structure the
//! teacher repo's `MemTable` uses.

use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemValue {
    Put(Vec<u8>),
    Tombstone,
}

pub struct MemTable {
    data: BTreeMap<Vec<u8>, MemValue>,
    size_bytes: usize,
    max_size_bytes: usize,
}

impl MemTable {
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            data: BTreeMap::new(),
            size_bytes: 0,
            max_size_bytes,
        }
    }

    pub fn insert(&mut self, key: Vec<u8>, value: MemValue) {
        let entry_size = Self::entry_size(&key, &value);
        if let Some(old) = self.data.insert(key.clone(), value) {
            self.size_bytes = self.size_bytes.saturating_sub(Self::entry_size(&key, &old));
        }
        self.size_bytes += entry_size;
    }

    pub fn should_seal(&self) -> bool {
        self.size_bytes >= self.max_size_bytes
    }

    pub fn get(&self, key: &[u8]) -> Option<&MemValue> {
        self.data.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Iterates entries in key order, newest reflects the current state
    /// (there is only one version per key in a MemTable).
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &MemValue)> {
        self.data.iter()
    }

    /// Entries in `[start, end)` key order, mirroring `BTreeMap::range`.
    pub fn range<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a MemValue)> {
        use std::ops::Bound;
        let lower = match start {
            Some(k) => Bound::Included(k.to_vec()),
            None => Bound::Unbounded,
        };
        let upper = match end {
            Some(k) => Bound::Excluded(k.to_vec()),
            None => Bound::Unbounded,
        };
        self.data.range((lower, upper))
    }

    fn entry_size(key: &[u8], value: &MemValue) -> usize {
        let value_len = match value {
            MemValue::Put(v) => v.len(),
            MemValue::Tombstone => 0,
        };
        key.len() + value_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut mt = MemTable::new(1024);
        mt.insert(b"b".to_vec(), MemValue::Put(b"2".to_vec()));
        mt.insert(b"a".to_vec(), MemValue::Put(b"1".to_vec()));

        assert_eq!(mt.get(b"a"), Some(&MemValue::Put(b"1".to_vec())));
        let keys: Vec<_> = mt.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn should_seal_once_over_threshold() {
        let mut mt = MemTable::new(4);
        assert!(!mt.should_seal());
        mt.insert(b"ab".to_vec(), MemValue::Put(b"cd".to_vec()));
        assert!(mt.should_seal());
    }

    #[test]
    fn overwrite_tracks_size_correctly() {
        let mut mt = MemTable::new(1024);
        mt.insert(b"k".to_vec(), MemValue::Put(b"long-value".to_vec()));
        let after_first = mt.size_bytes();
        mt.insert(b"k".to_vec(), MemValue::Put(b"x".to_vec()));
        assert!(mt.size_bytes() < after_first);
    }

    #[test]
    fn tombstone_suppresses_get() {
        let mut mt = MemTable::new(1024);
        mt.insert(b"k".to_vec(), MemValue::Put(b"v".to_vec()));
        mt.insert(b"k".to_vec(), MemValue::Tombstone);
        assert_eq!(mt.get(b"k"), Some(&MemValue::Tombstone));
    }
}
