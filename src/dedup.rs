//! Content-addressed deduplication of byte blobs.
//!
//! Both encoders need to notice when the same bytes come around twice: the
//! native format shares xattr blocks in its variable-data section, and the
//! EROFS format shares xattr table entries used by more than one inode.

use std::collections::HashMap;

use xxhash_rust::xxh32::xxh32;

const BUCKET_SEED: u32 = 0;

/// An index of distinct byte blobs, each with an associated value.
///
/// Blobs are bucketed by xxh32 and verified by full comparison, so a hash
/// collision can never alias two distinct blobs.  Iteration follows
/// first-insert order, which keeps image output independent of hash map
/// iteration order.
pub struct DedupIndex<T> {
    buckets: HashMap<u32, Vec<usize>>,
    entries: Vec<(Box<[u8]>, T)>,
}

impl<T> DedupIndex<T> {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, blob: &[u8], hash: u32) -> Option<usize> {
        let bucket = self.buckets.get(&hash)?;
        bucket
            .iter()
            .copied()
            .find(|&idx| &*self.entries[idx].0 == blob)
    }

    pub fn get(&self, blob: &[u8]) -> Option<&T> {
        let idx = self.position(blob, xxh32(blob, BUCKET_SEED))?;
        Some(&self.entries[idx].1)
    }

    pub fn get_mut(&mut self, blob: &[u8]) -> Option<&mut T> {
        let idx = self.position(blob, xxh32(blob, BUCKET_SEED))?;
        Some(&mut self.entries[idx].1)
    }

    /// Inserts a blob, unless an equal blob is already present.  Returns
    /// true if the blob was newly inserted.
    pub fn insert(&mut self, blob: &[u8], value: T) -> bool {
        let hash = xxh32(blob, BUCKET_SEED);
        if self.position(blob, hash).is_some() {
            return false;
        }
        let idx = self.entries.len();
        self.entries.push((Box::from(blob), value));
        self.buckets.entry(hash).or_default().push(idx);
        true
    }

    /// Iterates entries in first-insert order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &T)> {
        self.entries.iter().map(|(blob, value)| (&**blob, value))
    }
}

impl<T> Default for DedupIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut index = DedupIndex::new();
        assert!(index.is_empty());

        assert!(index.insert(b"abc", 1));
        assert!(index.insert(b"def", 2));
        assert!(!index.insert(b"abc", 3)); // duplicate: value ignored

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(b"abc"), Some(&1));
        assert_eq!(index.get(b"def"), Some(&2));
        assert_eq!(index.get(b"ghi"), None);
        assert_eq!(index.get(b""), None);
    }

    #[test]
    fn test_counting_via_get_mut() {
        let mut index = DedupIndex::new();
        for blob in [b"x" as &[u8], b"y", b"x", b"x", b"y", b"z"] {
            match index.get_mut(blob) {
                Some(count) => *count += 1,
                None => {
                    index.insert(blob, 1usize);
                }
            }
        }
        assert_eq!(index.get(b"x"), Some(&3));
        assert_eq!(index.get(b"y"), Some(&2));
        assert_eq!(index.get(b"z"), Some(&1));
    }

    #[test]
    fn test_first_insert_order() {
        let mut index = DedupIndex::new();
        let blobs = [b"zeta" as &[u8], b"alpha", b"mid", b"alpha", b"zeta"];
        for (n, blob) in blobs.iter().enumerate() {
            index.insert(blob, n);
        }

        let order: Vec<&[u8]> = index.iter().map(|(blob, _)| blob).collect();
        assert_eq!(order, vec![b"zeta" as &[u8], b"alpha", b"mid"]);
    }

    #[test]
    fn test_empty_blob_is_a_blob() {
        let mut index = DedupIndex::new();
        assert!(index.insert(b"", 7));
        assert!(!index.insert(b"", 8));
        assert_eq!(index.get(b""), Some(&7));
    }
}
