use super::{Error, VirtualKey};
use crate::datafile::PAGE_SIZE;
use bytes::{Buf, BufMut};
use std::fmt;

/// Size of the header of a bucket (index, entry count, and next bucket location).
pub(super) const HEADER_SIZE: usize = 4 + 4 + 8;

const ENTRY_COUNT_OFFSET: usize = 4;
const NEXT_BUCKET_OFFSET: usize = 8;

/// Position of each field of an entry within a bucket page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Layout {
    pub key_size: usize,
    /// Size of an entry (key hash, key version, key, and value).
    pub entry_size: usize,
    /// Offset of the value within an entry.
    pub value_offset: usize,
    pub entries_per_bucket: usize,
}

impl Layout {
    pub fn new(key_size: usize) -> Result<Self, Error> {
        let value_offset = 4 + 4 + key_size;
        let entry_size = value_offset + 8;
        let entries_per_bucket = (PAGE_SIZE - HEADER_SIZE) / entry_size;
        if entries_per_bucket == 0 {
            return Err(Error::KeyTooLarge(key_size));
        }
        Ok(Self {
            key_size,
            entry_size,
            value_offset,
            entries_per_bucket,
        })
    }

    fn entry_offset(&self, entry: usize) -> usize {
        HEADER_SIZE + entry * self.entry_size
    }
}

/// A view over a bucket page.
///
/// ```text
/// +--------------+-------------+----------------------+---------+---------+-----+
/// | Index (i32)  | Count (i32) | Next Location (i64)  | Entry 0 | Entry 1 | ... |
/// +--------------+-------------+----------------------+---------+---------+-----+
///
/// Entry = Key Hash (i32) | Key Version (i32) | Key (key_size) | Value (i64)
/// ```
pub(super) struct Bucket<'a> {
    layout: Layout,
    page: &'a mut [u8],
}

impl<'a> Bucket<'a> {
    pub fn new(layout: Layout, page: &'a mut [u8]) -> Self {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        Self { layout, page }
    }

    /// Clear the page and assign it to `index`.
    pub fn reset(&mut self, index: i32) {
        self.page.fill(0);
        (&mut self.page[..4]).put_i32(index);
    }

    pub fn index(&self) -> i32 {
        (&self.page[..4]).get_i32()
    }

    fn stored_entry_count(&self) -> i32 {
        (&self.page[ENTRY_COUNT_OFFSET..]).get_i32()
    }

    /// Pages read from disk must pass [Bucket::validate] before their count is trusted.
    pub fn entry_count(&self) -> usize {
        usize::try_from(self.stored_entry_count())
            .unwrap_or(0)
            .min(self.layout.entries_per_bucket)
    }

    /// Check that the page holds bucket `index` with an entry count that fits the layout.
    pub fn validate(&self, index: u32) -> Result<(), Error> {
        let found = self.index();
        if found != index as i32 {
            return Err(Error::BucketMismatch(index, found));
        }
        let count = self.stored_entry_count();
        if usize::try_from(count).map_or(true, |count| count > self.layout.entries_per_bucket) {
            return Err(Error::BucketCorrupt(index, count));
        }
        Ok(())
    }

    fn set_entry_count(&mut self, count: usize) {
        (&mut self.page[ENTRY_COUNT_OFFSET..]).put_i32(count as i32);
    }

    pub fn next_bucket_location(&self) -> i64 {
        (&self.page[NEXT_BUCKET_OFFSET..]).get_i64()
    }

    fn hash(&self, entry: usize) -> i32 {
        (&self.page[self.layout.entry_offset(entry)..]).get_i32()
    }

    fn version(&self, entry: usize) -> i32 {
        (&self.page[self.layout.entry_offset(entry) + 4..]).get_i32()
    }

    fn key(&self, entry: usize) -> &[u8] {
        let start = self.layout.entry_offset(entry) + 8;
        &self.page[start..start + self.layout.key_size]
    }

    fn value(&self, entry: usize) -> i64 {
        (&self.page[self.layout.entry_offset(entry) + self.layout.value_offset..]).get_i64()
    }

    /// Returns the entry holding `key` (stored with `hash`), if any.
    fn find<K: VirtualKey>(&self, hash: i32, key: &K) -> Option<usize> {
        (0..self.entry_count()).find(|&entry| {
            self.hash(entry) == hash && key.equals(self.key(entry), self.version(entry))
        })
    }

    /// Returns the value stored for `key`.
    pub fn find_value<K: VirtualKey>(&self, hash: i32, key: &K) -> Option<i64> {
        self.find(hash, key).map(|entry| self.value(entry))
    }

    /// Store `value` for `key`, updating the existing entry if there is one.
    ///
    /// Returns [Error::BucketFull] (leaving the bucket unchanged) if a new entry is required and
    /// the bucket has no room for it.
    pub fn put_value<K: VirtualKey>(&mut self, hash: i32, key: &K, value: i64) -> Result<(), Error> {
        let entry = match self.find(hash, key) {
            Some(entry) => entry,
            None => {
                let count = self.entry_count();
                if count >= self.layout.entries_per_bucket {
                    return Err(Error::BucketFull(self.index()));
                }
                let offset = self.layout.entry_offset(count);
                let mut entry = &mut self.page[offset..offset + self.layout.value_offset];
                entry.put_i32(hash);
                entry.put_i32(K::VERSION);
                key.write(&mut entry);
                self.set_entry_count(count + 1);
                count
            }
        };
        let offset = self.layout.entry_offset(entry) + self.layout.value_offset;
        (&mut self.page[offset..offset + 8]).put_i64(value);
        Ok(())
    }
}

/// Decoded entry of a bucket.
struct Entry {
    hash: i32,
    version: i32,
    key: String,
    value: i64,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{hash={}, version={}, key={}, value={}}}",
            self.hash, self.version, self.key, self.value
        )
    }
}

impl fmt::Debug for Bucket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<_> = (0..self.entry_count())
            .map(|entry| Entry {
                hash: self.hash(entry),
                version: self.version(entry),
                key: self.key(entry).iter().map(|b| format!("{b:02x}")).collect(),
                value: self.value(entry),
            })
            .collect();
        f.debug_struct("Bucket")
            .field("index", &self.index())
            .field("entry_count", &self.entry_count())
            .field("next_bucket_location", &self.next_bucket_location())
            .field("entries", &entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new(u64::SIZE).unwrap()
    }

    #[test]
    fn test_layout() {
        let layout = layout();
        assert_eq!(layout.entry_size, 24);
        assert_eq!(layout.value_offset, 16);
        assert_eq!(layout.entries_per_bucket, 170);

        assert!(matches!(Layout::new(4072), Err(Error::KeyTooLarge(4072))));
        assert_eq!(Layout::new(4064).unwrap().entries_per_bucket, 1);
    }

    #[test]
    fn test_page_format() {
        let mut page = vec![0xffu8; PAGE_SIZE];
        let mut bucket = Bucket::new(layout(), &mut page);
        bucket.reset(7);
        bucket.put_value(-2, &5u64, 9).unwrap();
        assert_eq!(bucket.entry_count(), 1);
        assert_eq!(bucket.next_bucket_location(), 0);

        let mut expected = vec![0u8; PAGE_SIZE];
        expected[..4].copy_from_slice(&7i32.to_be_bytes());
        expected[4..8].copy_from_slice(&1i32.to_be_bytes());
        expected[16..20].copy_from_slice(&(-2i32).to_be_bytes());
        expected[20..24].copy_from_slice(&1i32.to_be_bytes());
        expected[24..32].copy_from_slice(&5u64.to_be_bytes());
        expected[32..40].copy_from_slice(&9i64.to_be_bytes());
        assert_eq!(page, expected);
    }

    #[test]
    fn test_put_and_find() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut bucket = Bucket::new(layout(), &mut page);
        bucket.reset(0);
        for key in 0..10u64 {
            bucket.put_value(key as i32, &key, key as i64 * 2).unwrap();
        }
        assert_eq!(bucket.entry_count(), 10);
        for key in 0..10u64 {
            assert_eq!(bucket.find_value(key as i32, &key), Some(key as i64 * 2));
        }

        // A matching hash is not enough
        assert_eq!(bucket.find_value(3, &100u64), None);
        // Nor is a matching key
        assert_eq!(bucket.find_value(4, &3u64), None);

        // Updates don't add entries
        bucket.put_value(3, &3u64, -1).unwrap();
        assert_eq!(bucket.entry_count(), 10);
        assert_eq!(bucket.find_value(3, &3u64), Some(-1));
    }

    #[test]
    fn test_bucket_full() {
        let layout = Layout::new(2000).unwrap();
        assert_eq!(layout.entries_per_bucket, 2);
        let mut page = vec![0u8; PAGE_SIZE];
        let mut bucket = Bucket::new(layout, &mut page);
        bucket.reset(3);
        bucket.put_value(1, &[1u8; 2000], 1).unwrap();
        bucket.put_value(2, &[2u8; 2000], 2).unwrap();
        assert!(matches!(
            bucket.put_value(3, &[3u8; 2000], 3),
            Err(Error::BucketFull(3))
        ));

        // Existing keys can still be updated
        bucket.put_value(2, &[2u8; 2000], 20).unwrap();
        assert_eq!(bucket.find_value(2, &[2u8; 2000]), Some(20));
        assert_eq!(bucket.entry_count(), 2);
    }

    #[test]
    fn test_validate() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut bucket = Bucket::new(layout(), &mut page);
        bucket.reset(5);
        bucket.put_value(1, &1u64, 1).unwrap();
        bucket.validate(5).unwrap();
        assert!(matches!(bucket.validate(6), Err(Error::BucketMismatch(6, 5))));

        bucket.set_entry_count(170);
        bucket.validate(5).unwrap();
        for count in [-1i32, 171, i32::MAX] {
            page[4..8].copy_from_slice(&count.to_be_bytes());
            let bucket = Bucket::new(layout(), &mut page);
            assert!(matches!(
                bucket.validate(5),
                Err(Error::BucketCorrupt(5, found)) if found == count
            ));
        }
    }

    #[test]
    fn test_debug() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut bucket = Bucket::new(layout(), &mut page);
        bucket.reset(1);
        bucket.put_value(10, &0xabu64, 42).unwrap();
        let debug = format!("{bucket:?}");
        assert!(debug.contains("index: 1"));
        assert!(debug.contains("entry_count: 1"));
        assert!(debug.contains("key=00000000000000ab"));
        assert!(debug.contains("value=42"));
    }
}
