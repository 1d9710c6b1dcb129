//! Common types for the extendible hash index.

use super::constants::MAX_LEVEL_SIZE;

/// A packed 64-bit directory slot.
///
/// Three states share the representation:
/// - `0`: empty slot (observable only transiently during initialization);
/// - positive: bucket pointer, `((page_index + 1) << 8) | file_level`;
/// - negative (high bit set): child-node reference,
///   `(child_node_index << 8) | child_item_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectorySlot(pub i64);

impl DirectorySlot {
    /// The empty slot.
    pub const EMPTY: DirectorySlot = DirectorySlot(0);

    /// Packs a bucket pointer.
    pub fn bucket(page_index: u64, file_level: usize) -> Self {
        Self((((page_index + 1) << 8) | file_level as u64) as i64)
    }

    /// Packs a child-node reference.
    pub fn child(node_index: usize, item_offset: usize) -> Self {
        debug_assert!(item_offset < MAX_LEVEL_SIZE);
        Self(((node_index as i64) << 8) | (item_offset as i64) | i64::MIN)
    }

    /// The raw packed value.
    pub fn raw(self) -> i64 {
        self.0
    }

    /// True for the empty slot.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when the slot holds a bucket pointer.
    pub fn is_bucket(self) -> bool {
        self.0 > 0
    }

    /// True when the slot holds a child-node reference.
    pub fn is_child(self) -> bool {
        self.0 < 0
    }

    /// Page index of a bucket pointer.
    pub fn page_index(self) -> u64 {
        debug_assert!(self.is_bucket());
        ((self.0 as u64) >> 8) - 1
    }

    /// File level of a bucket pointer.
    pub fn file_level(self) -> usize {
        debug_assert!(self.is_bucket());
        (self.0 & 0xFF) as usize
    }

    /// Node index of a child reference.
    pub fn child_node_index(self) -> usize {
        debug_assert!(self.is_child());
        ((self.0 & i64::MAX) >> 8) as usize
    }

    /// Item offset of a child reference.
    pub fn child_item_offset(self) -> usize {
        debug_assert!(self.is_child());
        (self.0 & 0xFF) as usize
    }
}

/// The resolution path from the directory root to a bucket slot.
///
/// Carries enough context to perform the inverse directory update after a
/// bucket split, and to walk sideways during range scans.
#[derive(Debug, Clone)]
pub struct BucketPath {
    /// Path step in the parent node, if any.
    pub parent: Option<Box<BucketPath>>,
    /// Base of the hash-map window this step resolved through.
    pub hash_map_offset: usize,
    /// Index within the window.
    pub item_index: usize,
    /// Directory node of this step.
    pub node_index: usize,
    /// Bits consumed by this node.
    pub node_local_depth: u32,
    /// Bits consumed from the root through this node.
    pub node_global_depth: u32,
}

impl BucketPath {
    /// Creates a path step.
    pub fn new(
        parent: Option<Box<BucketPath>>,
        hash_map_offset: usize,
        item_index: usize,
        node_index: usize,
        node_local_depth: u32,
        node_global_depth: u32,
    ) -> Self {
        Self {
            parent,
            hash_map_offset,
            item_index,
            node_index,
            node_local_depth,
            node_global_depth,
        }
    }
}

/// A decoded key/value entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<K, V> {
    /// The key.
    pub key: K,
    /// The value.
    pub value: V,
}

/// Outcome of a bucket split.
#[derive(Debug, Clone, Copy)]
pub struct BucketSplitResult {
    /// Pointer to the bucket that kept the zero branch of the new bit.
    pub updated_bucket_pointer: DirectorySlot,
    /// Pointer to the bucket that took the one branch.
    pub new_bucket_pointer: DirectorySlot,
    /// Depth of both result buckets.
    pub new_depth: u32,
}

/// Outcome of a directory node split.
pub struct NodeSplitResult {
    /// The right half-node produced by the split.
    pub new_node: Box<[i64; MAX_LEVEL_SIZE]>,
    /// Every hash-map window of the left half holds one identical value.
    pub all_left_hash_maps_equal: bool,
    /// Every hash-map window of the right half holds one identical value.
    pub all_right_hash_maps_equal: bool,
}

/// Per-level bucket file metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelMetadata {
    /// Number of live buckets in this level.
    pub buckets_count: i64,
    /// Head of the removed-bucket-pair chain, -1 when empty.
    pub tombstone_index: i64,
}

impl LevelMetadata {
    /// Metadata for a freshly created level.
    pub fn new() -> Self {
        Self {
            buckets_count: 0,
            tombstone_index: -1,
        }
    }
}

impl Default for LevelMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_pointer_roundtrip() {
        for (page_index, level) in [(0u64, 0usize), (1, 0), (41, 3), (1 << 40, 55)] {
            let slot = DirectorySlot::bucket(page_index, level);
            assert!(slot.is_bucket());
            assert!(!slot.is_child());
            assert!(!slot.is_empty());
            assert_eq!(slot.page_index(), page_index);
            assert_eq!(slot.file_level(), level);
        }
    }

    #[test]
    fn test_bucket_pointer_zero_page_is_not_empty() {
        // Page 0 at level 0 packs to a non-zero slot: the +1 bias reserves
        // the all-zero pattern for the empty slot.
        let slot = DirectorySlot::bucket(0, 0);
        assert_eq!(slot.raw(), 1 << 8);
        assert!(!slot.is_empty());
    }

    #[test]
    fn test_child_reference_roundtrip() {
        for (node, offset) in [(0usize, 0usize), (1, 16), (77, 255), (1 << 20, 128)] {
            let slot = DirectorySlot::child(node, offset);
            assert!(slot.is_child());
            assert!(!slot.is_bucket());
            assert_eq!(slot.child_node_index(), node);
            assert_eq!(slot.child_item_offset(), offset);
        }
    }

    #[test]
    fn test_empty_slot() {
        assert!(DirectorySlot::EMPTY.is_empty());
        assert!(!DirectorySlot::EMPTY.is_bucket());
        assert!(!DirectorySlot::EMPTY.is_child());
    }

    #[test]
    fn test_bucket_path_parent_chain() {
        let root = BucketPath::new(None, 0, 5, 0, 8, 8);
        let child = BucketPath::new(Some(Box::new(root)), 16, 2, 3, 4, 12);

        assert_eq!(child.node_global_depth, 12);
        let parent = child.parent.as_deref().unwrap();
        assert_eq!(parent.node_index, 0);
        assert_eq!(parent.item_index, 5);
    }

    #[test]
    fn test_level_metadata_defaults() {
        let metadata = LevelMetadata::new();
        assert_eq!(metadata.buckets_count, 0);
        assert_eq!(metadata.tombstone_index, -1);
    }
}
