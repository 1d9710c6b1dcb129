//! Bucket pages: fixed-size sorted key/value dictionaries.
//!
//! Page layout (little-endian):
//!
//! ```text
//! +--------------------------------+ 0
//! | depth: u8                      |
//! +--------------------------------+ 1
//! | entry count: u32               |
//! +--------------------------------+ 5
//! | free pointer: u32              |
//! +--------------------------------+ 9
//! | next removed bucket pair: i64  |
//! +--------------------------------+ 17
//! | split history: [i64; 64]       |
//! +--------------------------------+ 529 (ENTRIES_OFFSET)
//! | slot array: u32 * count        |  <- grows forward, sorted by key
//! +--------------------------------+
//! |          free space            |
//! +--------------------------------+ free pointer
//! | packed entries: key ++ value   |  <- grows backward from page end
//! +--------------------------------+ page size
//! ```
//!
//! The layout is deterministic: identical operation sequences produce
//! byte-identical pages. Endianness of the fields is fixed; entry bytes
//! are whatever the codecs emit.

use super::constants::MAX_FILE_LEVELS;
use super::types::Entry;
use corvus_common::BinaryCodec;

const DEPTH_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 1;
const FREE_POINTER_OFFSET: usize = 5;
const NEXT_REMOVED_OFFSET: usize = 9;
const HISTORY_OFFSET: usize = 17;

/// Offset of the slot array, past the fixed header.
pub const ENTRIES_OFFSET: usize = HISTORY_OFFSET + MAX_FILE_LEVELS * 8;

/// Size of one slot array element.
pub const SLOT_SIZE: usize = 4;

/// Largest entry (encoded key + value) an empty bucket page can hold.
pub fn max_entry_size(page_size: usize) -> usize {
    page_size - ENTRIES_OFFSET - SLOT_SIZE
}

#[inline]
fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn read_i64(data: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ])
}

#[inline]
fn write_i64(data: &mut [u8], offset: usize, value: i64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read-only view of a bucket page.
pub struct Bucket<'a, KC, VC> {
    data: &'a [u8],
    key_codec: &'a KC,
    value_codec: &'a VC,
}

impl<'a, KC, VC> Bucket<'a, KC, VC>
where
    KC: BinaryCodec,
    VC: BinaryCodec,
    KC::Value: Ord,
{
    /// Wraps a page image.
    pub fn new(data: &'a [u8], key_codec: &'a KC, value_codec: &'a VC) -> Self {
        Self {
            data,
            key_codec,
            value_codec,
        }
    }

    /// Hash prefix length of every entry routed to this bucket.
    pub fn depth(&self) -> u32 {
        self.data[DEPTH_OFFSET] as u32
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        read_u32(self.data, SIZE_OFFSET) as usize
    }

    fn free_pointer(&self) -> usize {
        read_u32(self.data, FREE_POINTER_OFFSET) as usize
    }

    /// Head link of the removed-bucket-pair chain stored on this page.
    pub fn next_removed_bucket_pair(&self) -> i64 {
        read_i64(self.data, NEXT_REMOVED_OFFSET)
    }

    /// Page index this bucket descended from at the given file level.
    pub fn split_history(&self, file_level: usize) -> i64 {
        read_i64(self.data, HISTORY_OFFSET + file_level * 8)
    }

    /// Snapshot of the whole split history.
    pub fn split_history_snapshot(&self) -> [i64; MAX_FILE_LEVELS] {
        let mut history = [0i64; MAX_FILE_LEVELS];
        for (level, slot) in history.iter_mut().enumerate() {
            *slot = self.split_history(level);
        }
        history
    }

    /// Bytes in use: header, slot array and packed entry data.
    pub fn content_size(&self) -> usize {
        ENTRIES_OFFSET + self.size() * SLOT_SIZE + (self.data.len() - self.free_pointer())
    }

    /// Predicted content size after merging `other` into this bucket.
    pub fn merged_size(&self, other: &Bucket<'_, KC, VC>) -> usize {
        self.content_size()
            + other.size() * SLOT_SIZE
            + (other.data.len() - other.free_pointer())
    }

    fn entry_position(&self, index: usize) -> usize {
        read_u32(self.data, ENTRIES_OFFSET + index * SLOT_SIZE) as usize
    }

    /// Decodes the key of the entry at `index`.
    pub fn key_at(&self, index: usize) -> KC::Value {
        self.key_codec.decode(self.data, self.entry_position(index))
    }

    /// Decodes the entry at `index`.
    pub fn entry_at(&self, index: usize) -> Entry<KC::Value, VC::Value> {
        let position = self.entry_position(index);
        let key = self.key_codec.decode(self.data, position);
        let key_size = self.key_codec.encoded_size(self.data, position);
        let value = self.value_codec.decode(self.data, position + key_size);
        Entry { key, value }
    }

    /// Binary search by key. `Ok(index)` on a hit, `Err(insertion_point)`
    /// on a miss.
    pub fn index_of(&self, key: &KC::Value) -> Result<usize, usize> {
        let mut low = 0usize;
        let mut high = self.size();

        while low < high {
            let mid = low + (high - low) / 2;
            match self.key_at(mid).cmp(key) {
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
            }
        }
        Err(low)
    }

    /// Returns the entry with the given key, if present.
    pub fn find(&self, key: &KC::Value) -> Option<Entry<KC::Value, VC::Value>> {
        self.index_of(key).ok().map(|index| self.entry_at(index))
    }

    /// Iterates entries from `start` in key order.
    pub fn iter_from(
        &self,
        start: usize,
    ) -> impl Iterator<Item = Entry<KC::Value, VC::Value>> + '_ {
        (start..self.size()).map(move |index| self.entry_at(index))
    }

    /// Iterates all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = Entry<KC::Value, VC::Value>> + '_ {
        self.iter_from(0)
    }
}

/// Mutable view of a bucket page.
pub struct BucketMut<'a, KC, VC> {
    data: &'a mut [u8],
    key_codec: &'a KC,
    value_codec: &'a VC,
}

impl<'a, KC, VC> BucketMut<'a, KC, VC>
where
    KC: BinaryCodec,
    VC: BinaryCodec,
    KC::Value: Ord,
{
    /// Wraps a page image for mutation.
    pub fn new(data: &'a mut [u8], key_codec: &'a KC, value_codec: &'a VC) -> Self {
        Self {
            data,
            key_codec,
            value_codec,
        }
    }

    /// Read-only view of the same page.
    pub fn as_bucket(&self) -> Bucket<'_, KC, VC> {
        Bucket::new(self.data, self.key_codec, self.value_codec)
    }

    /// Reinitializes the page as an empty bucket of the given depth.
    ///
    /// The split history area is preserved: a page resurrected by a merge
    /// keeps the lineage its earlier splits recorded.
    pub fn init(&mut self, depth: u32) {
        let page_size = self.data.len();
        self.data[DEPTH_OFFSET] = depth as u8;
        write_u32(self.data, SIZE_OFFSET, 0);
        write_u32(self.data, FREE_POINTER_OFFSET, page_size as u32);
        write_i64(self.data, NEXT_REMOVED_OFFSET, -1);
    }

    /// Initializes a page produced by a split: empty at `depth`, carrying
    /// the source bucket's split history with the source level's page
    /// recorded.
    pub fn init_from_split(
        &mut self,
        depth: u32,
        source_history: &[i64; MAX_FILE_LEVELS],
        source_level: usize,
        source_page_index: u64,
    ) {
        self.init(depth);
        for (level, &page) in source_history.iter().enumerate() {
            write_i64(self.data, HISTORY_OFFSET + level * 8, page);
        }
        self.set_split_history(source_level, source_page_index as i64);
    }

    /// Sets the bucket depth.
    pub fn set_depth(&mut self, depth: u32) {
        self.data[DEPTH_OFFSET] = depth as u8;
    }

    /// Records the source page of a split at `file_level`.
    pub fn set_split_history(&mut self, file_level: usize, page_index: i64) {
        write_i64(self.data, HISTORY_OFFSET + file_level * 8, page_index);
    }

    /// Links this (dead) page into the removed-bucket-pair chain.
    pub fn set_next_removed_bucket_pair(&mut self, next: i64) {
        write_i64(self.data, NEXT_REMOVED_OFFSET, next);
    }

    fn set_size(&mut self, size: usize) {
        write_u32(self.data, SIZE_OFFSET, size as u32);
    }

    fn set_free_pointer(&mut self, free_pointer: usize) {
        write_u32(self.data, FREE_POINTER_OFFSET, free_pointer as u32);
    }

    /// Writes the entry bytes and returns the new entry position, or
    /// `None` when free space is short.
    fn push_entry_data(&mut self, key: &KC::Value, value: &VC::Value) -> Option<usize> {
        let view = self.as_bucket();
        let size = view.size();
        let free_pointer = view.free_pointer();
        let entry_size = self.key_codec.size_of(key) + self.value_codec.size_of(value);

        let slots_end = ENTRIES_OFFSET + size * SLOT_SIZE;
        if free_pointer - slots_end < entry_size + SLOT_SIZE {
            return None;
        }

        let position = free_pointer - entry_size;
        self.key_codec.encode(key, self.data, position);
        let key_size = self.key_codec.size_of(key);
        self.value_codec.encode(value, self.data, position + key_size);
        self.set_free_pointer(position);

        Some(position)
    }

    /// Inserts an entry at its sorted position. Returns false when the
    /// page has no room. The key must not already be present.
    pub fn add_entry(&mut self, key: &KC::Value, value: &VC::Value) -> bool {
        let index = match self.as_bucket().index_of(key) {
            Ok(_) => {
                debug_assert!(false, "add_entry called with a present key");
                return false;
            }
            Err(index) => index,
        };

        let size = self.as_bucket().size();
        let Some(position) = self.push_entry_data(key, value) else {
            return false;
        };

        // Shift slots after the insertion point one to the right.
        let slot_offset = ENTRIES_OFFSET + index * SLOT_SIZE;
        let slots_end = ENTRIES_OFFSET + size * SLOT_SIZE;
        self.data.copy_within(slot_offset..slots_end, slot_offset + SLOT_SIZE);
        write_u32(self.data, slot_offset, position as u32);
        self.set_size(size + 1);

        true
    }

    /// Appends an entry without an order check. Used while repartitioning
    /// entries that are already visited in key order.
    pub fn append_entry(&mut self, key: &KC::Value, value: &VC::Value) -> bool {
        let size = self.as_bucket().size();
        let Some(position) = self.push_entry_data(key, value) else {
            return false;
        };

        write_u32(self.data, ENTRIES_OFFSET + size * SLOT_SIZE, position as u32);
        self.set_size(size + 1);

        true
    }

    /// Overwrites the value of the entry at `index` when the encoded size
    /// matches the old one; returns false otherwise.
    pub fn update_entry_in_place(&mut self, index: usize, value: &VC::Value) -> bool {
        let view = self.as_bucket();
        let position = view.entry_position(index);
        let key_size = self.key_codec.encoded_size(self.data, position);
        let value_offset = position + key_size;

        let old_size = self.value_codec.encoded_size(self.data, value_offset);
        if old_size != self.value_codec.size_of(value) {
            return false;
        }

        self.value_codec.encode(value, self.data, value_offset);
        true
    }

    /// Removes the entry at `index`, compacting the packed data area.
    pub fn delete_entry(&mut self, index: usize) {
        let view = self.as_bucket();
        let size = view.size();
        let free_pointer = view.free_pointer();
        let position = view.entry_position(index);

        let key_size = self.key_codec.encoded_size(self.data, position);
        let value_size = self.value_codec.encoded_size(self.data, position + key_size);
        let entry_size = key_size + value_size;

        // Close the slot gap.
        let slot_offset = ENTRIES_OFFSET + index * SLOT_SIZE;
        let slots_end = ENTRIES_OFFSET + size * SLOT_SIZE;
        self.data.copy_within(slot_offset + SLOT_SIZE..slots_end, slot_offset);

        // Compact the data area and rebase slots below the removed entry.
        self.data.copy_within(free_pointer..position, free_pointer + entry_size);
        for i in 0..size - 1 {
            let offset = ENTRIES_OFFSET + i * SLOT_SIZE;
            let entry_offset = read_u32(self.data, offset) as usize;
            if entry_offset < position {
                write_u32(self.data, offset, (entry_offset + entry_size) as u32);
            }
        }

        self.set_size(size - 1);
        self.set_free_pointer(free_pointer + entry_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvus_common::{StringCodec, U64Codec};

    const PAGE: usize = 2048;

    fn new_bucket_page() -> Vec<u8> {
        let mut data = vec![0u8; PAGE];
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);
        bucket.init(8);
        data
    }

    #[test]
    fn test_init_state() {
        let data = new_bucket_page();
        let bucket = Bucket::new(&data, &U64Codec, &U64Codec);

        assert_eq!(bucket.depth(), 8);
        assert_eq!(bucket.size(), 0);
        assert_eq!(bucket.next_removed_bucket_pair(), -1);
        assert_eq!(bucket.content_size(), ENTRIES_OFFSET);
    }

    #[test]
    fn test_add_and_find() {
        let mut data = new_bucket_page();
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);

        assert!(bucket.add_entry(&30, &300));
        assert!(bucket.add_entry(&10, &100));
        assert!(bucket.add_entry(&20, &200));

        let view = bucket.as_bucket();
        assert_eq!(view.size(), 3);
        assert_eq!(view.find(&10).map(|e| e.value), Some(100));
        assert_eq!(view.find(&20).map(|e| e.value), Some(200));
        assert_eq!(view.find(&30).map(|e| e.value), Some(300));
        assert!(view.find(&40).is_none());
    }

    #[test]
    fn test_entries_stay_sorted() {
        let mut data = new_bucket_page();
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);

        for key in [9u64, 1, 7, 3, 5, 8, 2] {
            assert!(bucket.add_entry(&key, &(key * 10)));
        }

        let keys: Vec<u64> = bucket.as_bucket().iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![1, 2, 3, 5, 7, 8, 9]);
    }

    #[test]
    fn test_index_of_conventions() {
        let mut data = new_bucket_page();
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);
        for key in [10u64, 20, 30] {
            bucket.add_entry(&key, &0);
        }

        let view = bucket.as_bucket();
        assert_eq!(view.index_of(&20), Ok(1));
        assert_eq!(view.index_of(&5), Err(0));
        assert_eq!(view.index_of(&25), Err(2));
        assert_eq!(view.index_of(&35), Err(3));
    }

    #[test]
    fn test_add_entry_reports_full() {
        let mut data = new_bucket_page();
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);

        let mut key = 0u64;
        while bucket.add_entry(&key, &key) {
            key += 1;
        }
        // (8 + 8) entry bytes + 4 slot bytes each.
        assert_eq!(key as usize, (PAGE - ENTRIES_OFFSET) / 20);

        // Full bucket keeps its contents intact.
        let view = bucket.as_bucket();
        assert_eq!(view.size(), key as usize);
        assert_eq!(view.find(&0).map(|e| e.value), Some(0));
    }

    #[test]
    fn test_delete_entry_compacts() {
        let mut data = new_bucket_page();
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);
        for key in [1u64, 2, 3, 4] {
            bucket.add_entry(&key, &(key + 100));
        }

        let index = bucket.as_bucket().index_of(&2).unwrap();
        bucket.delete_entry(index);

        let view = bucket.as_bucket();
        assert_eq!(view.size(), 3);
        assert!(view.find(&2).is_none());
        assert_eq!(view.find(&1).map(|e| e.value), Some(101));
        assert_eq!(view.find(&3).map(|e| e.value), Some(103));
        assert_eq!(view.find(&4).map(|e| e.value), Some(104));

        // Freed bytes are reusable.
        let before = view.content_size();
        assert!(bucket.add_entry(&2, &102));
        assert_eq!(bucket.as_bucket().content_size(), before + 20);
    }

    #[test]
    fn test_delete_with_variable_length_values() {
        let mut data = vec![0u8; PAGE];
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &StringCodec);
        bucket.init(8);

        bucket.add_entry(&1, &"short".to_string());
        bucket.add_entry(&2, &"a much longer value".to_string());
        bucket.add_entry(&3, &"x".to_string());

        bucket.delete_entry(1);

        let view = bucket.as_bucket();
        assert_eq!(view.find(&1).map(|e| e.value), Some("short".to_string()));
        assert!(view.find(&2).is_none());
        assert_eq!(view.find(&3).map(|e| e.value), Some("x".to_string()));
    }

    #[test]
    fn test_update_entry_in_place() {
        let mut data = new_bucket_page();
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);
        bucket.add_entry(&1, &10);

        assert!(bucket.update_entry_in_place(0, &99));
        assert_eq!(bucket.as_bucket().find(&1).map(|e| e.value), Some(99));
    }

    #[test]
    fn test_update_rejects_size_change() {
        let mut data = vec![0u8; PAGE];
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &StringCodec);
        bucket.init(8);
        bucket.add_entry(&1, &"abc".to_string());

        assert!(bucket.update_entry_in_place(0, &"xyz".to_string()));
        assert!(!bucket.update_entry_in_place(0, &"longer".to_string()));
        assert_eq!(
            bucket.as_bucket().find(&1).map(|e| e.value),
            Some("xyz".to_string())
        );
    }

    #[test]
    fn test_split_history() {
        let mut data = new_bucket_page();
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);
        bucket.set_split_history(0, 17);
        bucket.set_split_history(5, 40);

        let view = bucket.as_bucket();
        assert_eq!(view.split_history(0), 17);
        assert_eq!(view.split_history(5), 40);
        assert_eq!(view.split_history(1), 0);
    }

    #[test]
    fn test_init_from_split_inherits_history() {
        let mut source = new_bucket_page();
        let mut source_bucket = BucketMut::new(&mut source, &U64Codec, &U64Codec);
        source_bucket.set_split_history(0, 3);
        let history = source_bucket.as_bucket().split_history_snapshot();

        let mut data = vec![0u8; PAGE];
        let mut child = BucketMut::new(&mut data, &U64Codec, &U64Codec);
        child.init_from_split(10, &history, 1, 44);

        let view = child.as_bucket();
        assert_eq!(view.depth(), 10);
        assert_eq!(view.split_history(0), 3);
        assert_eq!(view.split_history(1), 44);
    }

    #[test]
    fn test_init_preserves_history() {
        let mut data = new_bucket_page();
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);
        bucket.set_split_history(2, 9);
        bucket.add_entry(&1, &1);

        bucket.init(9);

        let view = bucket.as_bucket();
        assert_eq!(view.size(), 0);
        assert_eq!(view.depth(), 9);
        assert_eq!(view.split_history(2), 9);
    }

    #[test]
    fn test_merged_size() {
        let mut left = new_bucket_page();
        let mut right = new_bucket_page();
        {
            let mut bucket = BucketMut::new(&mut left, &U64Codec, &U64Codec);
            bucket.add_entry(&1, &1);
        }
        {
            let mut bucket = BucketMut::new(&mut right, &U64Codec, &U64Codec);
            bucket.add_entry(&2, &2);
            bucket.add_entry(&3, &3);
        }

        let left_view = Bucket::new(&left, &U64Codec, &U64Codec);
        let right_view = Bucket::new(&right, &U64Codec, &U64Codec);

        // Header + three entries of 20 bytes each.
        assert_eq!(
            left_view.merged_size(&right_view),
            ENTRIES_OFFSET + 3 * 20
        );
    }

    #[test]
    fn test_append_entry_keeps_given_order() {
        let mut data = new_bucket_page();
        let mut bucket = BucketMut::new(&mut data, &U64Codec, &U64Codec);

        assert!(bucket.append_entry(&1, &10));
        assert!(bucket.append_entry(&5, &50));
        assert!(bucket.append_entry(&9, &90));

        let keys: Vec<u64> = bucket.as_bucket().iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![1, 5, 9]);
        assert_eq!(bucket.as_bucket().index_of(&5), Ok(1));
    }

    #[test]
    fn test_max_entry_size() {
        assert_eq!(max_entry_size(PAGE), PAGE - ENTRIES_OFFSET - SLOT_SIZE);
    }
}
