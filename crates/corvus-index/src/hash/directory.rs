//! The directory tree: nested 256-slot pointer nodes.
//!
//! Resolution consumes the hash from the top: each node routes on its
//! `local_depth` high bits of the remaining prefix. A slot either holds a
//! bucket pointer or references a child node at some window offset; the
//! sum of local depths along a path is the global depth at that node.
//!
//! Within a node, slots are grouped into hash-map windows of
//! `1 << local_depth` entries. Node splits double the fanout by pairwise
//! duplication into two half-nodes; a half whose windows are all uniform
//! collapses back into the parent as direct bucket pointers. Deleted nodes
//! form an explicit free list reused by later allocations.

use super::constants::{LEVEL_MASK, MAX_LEVEL_DEPTH, MAX_LEVEL_SIZE};
use super::types::{BucketPath, DirectorySlot, NodeSplitResult};
use corvus_common::{CorvusError, Result};

/// A live directory node: 256 slots plus routing metadata.
pub struct DirectoryNode {
    /// Packed slots; see [`DirectorySlot`].
    pub slots: Box<[i64; MAX_LEVEL_SIZE]>,
    /// Hash bits this node consumes.
    pub local_depth: u32,
    /// Deepest child local depth under the left half.
    pub max_left_child_depth: u32,
    /// Deepest child local depth under the right half.
    pub max_right_child_depth: u32,
}

/// A node array position: live, or a link in the free list.
pub enum TreeNode {
    /// Live node.
    Live(DirectoryNode),
    /// Freed node; holds the next free index, -1 at the end of the chain.
    Tombstone(i32),
}

/// The directory tree. Node 0 is the root.
pub struct Directory {
    nodes: Vec<TreeNode>,
    tombstone: i32,
}

/// True when every hash-map window of `node` holds one repeated value.
pub fn all_maps_same_bucket(node: &[i64; MAX_LEVEL_SIZE], hash_map_size: usize) -> bool {
    let mut base = 0;
    while base < MAX_LEVEL_SIZE {
        for i in 0..hash_map_size - 1 {
            if node[base + i] != node[base + i + 1] {
                return false;
            }
        }
        base += hash_map_size;
    }
    true
}

impl Directory {
    /// Creates a directory whose root routes all 256 prefixes through the
    /// given slots.
    pub fn with_root(slots: Box<[i64; MAX_LEVEL_SIZE]>) -> Self {
        Self {
            nodes: vec![TreeNode::Live(DirectoryNode {
                slots,
                local_depth: MAX_LEVEL_DEPTH,
                max_left_child_depth: 0,
                max_right_child_depth: 0,
            })],
            tombstone: -1,
        }
    }

    /// Rebuilds a directory from persisted parts.
    pub fn from_parts(nodes: Vec<TreeNode>, tombstone: i32) -> Self {
        Self { nodes, tombstone }
    }

    /// Number of node array positions, live and tombstoned.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the directory has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Head of the free list, -1 when empty.
    pub fn tombstone(&self) -> i32 {
        self.tombstone
    }

    /// The node array, for persistence.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    fn live(&self, index: usize) -> &DirectoryNode {
        match &self.nodes[index] {
            TreeNode::Live(node) => node,
            TreeNode::Tombstone(_) => panic!("directory node {index} is tombstoned"),
        }
    }

    fn live_mut(&mut self, index: usize) -> &mut DirectoryNode {
        match &mut self.nodes[index] {
            TreeNode::Live(node) => node,
            TreeNode::Tombstone(_) => panic!("directory node {index} is tombstoned"),
        }
    }

    /// Local depth of a node.
    pub fn node_local_depth(&self, index: usize) -> u32 {
        self.live(index).local_depth
    }

    /// Reads one slot.
    pub fn slot(&self, node_index: usize, slot_index: usize) -> DirectorySlot {
        DirectorySlot(self.live(node_index).slots[slot_index])
    }

    /// Writes one slot.
    pub fn set_slot(&mut self, node_index: usize, slot_index: usize, slot: DirectorySlot) {
        self.live_mut(node_index).slots[slot_index] = slot.raw();
    }

    /// Resolves a hash to the path of its bucket slot.
    ///
    /// A walk that consumes more than 64 bits means the tree references
    /// itself; that is fatal corruption.
    pub fn bucket_path(&self, hash: u64) -> Result<BucketPath> {
        let mut local_depth = self.live(0).local_depth;
        let mut node_depth = local_depth;
        let mut node_index = 0usize;
        let mut offset = 0usize;

        let mut index = ((hash >> (64 - node_depth)) as usize)
            & (LEVEL_MASK >> (MAX_LEVEL_DEPTH - local_depth));
        let mut current = BucketPath::new(None, 0, index, 0, local_depth, node_depth);

        loop {
            let position = self.live(node_index).slots[index + offset];
            if position >= 0 {
                return Ok(current);
            }

            let slot = DirectorySlot(position);
            node_index = slot.child_node_index();
            offset = slot.child_item_offset();

            local_depth = self.live(node_index).local_depth;
            node_depth += local_depth;
            if node_depth > 64 {
                return Err(CorvusError::Corrupted(
                    "directory resolution consumed more than 64 hash bits".to_string(),
                ));
            }

            index = ((hash >> (64 - node_depth)) as usize)
                & (LEVEL_MASK >> (MAX_LEVEL_DEPTH - local_depth));
            current = BucketPath::new(
                Some(Box::new(current)),
                offset,
                index,
                node_index,
                local_depth,
                node_depth,
            );
        }
    }

    /// Follows child references from a slot down to a bucket pointer,
    /// taking the first item of each referenced window.
    pub fn resolve_slot(&self, slot: DirectorySlot) -> DirectorySlot {
        let mut position = slot;
        while position.is_child() {
            position = DirectorySlot(
                self.live(position.child_node_index()).slots[position.child_item_offset()],
            );
        }
        position
    }

    /// Allocates a node, reusing the free list head when available.
    pub fn add_node(&mut self, slots: Box<[i64; MAX_LEVEL_SIZE]>, local_depth: u32) -> usize {
        let node = TreeNode::Live(DirectoryNode {
            slots,
            local_depth,
            max_left_child_depth: 0,
            max_right_child_depth: 0,
        });

        if self.tombstone >= 0 {
            let index = self.tombstone as usize;
            let next = match &self.nodes[index] {
                TreeNode::Tombstone(next) => *next,
                TreeNode::Live(_) => panic!("free list head {index} is live"),
            };
            self.nodes[index] = node;
            self.tombstone = next;
            return index;
        }

        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Deletes a node, pushing it onto the free list (or popping it when
    /// it is the last array position).
    pub fn delete_node(&mut self, index: usize) {
        if index == self.nodes.len() - 1 {
            self.nodes.pop();
            return;
        }

        self.nodes[index] = TreeNode::Tombstone(self.tombstone);
        self.tombstone = index as i32;
    }

    /// Splits the node on `path`: its slots are doubled pairwise into a
    /// left half (stored in place) and a right half (returned), and the
    /// local depth increments. Uniformity of the two halves is detected
    /// window by window so equal halves can collapse into the parent.
    pub fn split_node(&mut self, path: &BucketPath) -> NodeSplitResult {
        let hash_map_size = 1usize << (path.node_local_depth + 1);
        let node = self.live(path.node_index);

        let mut new_node = Box::new([0i64; MAX_LEVEL_SIZE]);
        let mut map_items_equal = true;
        let mut map_counter = 0usize;
        let mut first_position = -1i64;

        for i in MAX_LEVEL_SIZE / 2..MAX_LEVEL_SIZE {
            let position = node.slots[i];
            if map_items_equal && map_counter == 0 {
                first_position = position;
            }

            new_node[2 * (i - MAX_LEVEL_SIZE / 2)] = position;
            new_node[2 * (i - MAX_LEVEL_SIZE / 2) + 1] = position;

            if map_items_equal {
                map_items_equal = first_position == position;
                map_counter += 2;
                if map_counter >= hash_map_size {
                    map_counter = 0;
                }
            }
        }
        let all_right_hash_maps_equal = map_items_equal;

        let mut updated_node = Box::new([0i64; MAX_LEVEL_SIZE]);
        map_items_equal = true;
        map_counter = 0;

        for i in 0..MAX_LEVEL_SIZE / 2 {
            let position = node.slots[i];
            if map_items_equal && map_counter == 0 {
                first_position = position;
            }

            updated_node[2 * i] = position;
            updated_node[2 * i + 1] = position;

            if map_items_equal {
                map_items_equal = first_position == position;
                map_counter += 2;
                if map_counter >= hash_map_size {
                    map_counter = 0;
                }
            }
        }
        let all_left_hash_maps_equal = map_items_equal;

        let node = self.live_mut(path.node_index);
        node.local_depth += 1;
        node.slots = updated_node;

        NodeSplitResult {
            new_node,
            all_left_hash_maps_equal,
            all_right_hash_maps_equal,
        }
    }

    /// True when all windows of the node hold one repeated bucket pointer.
    pub fn node_maps_same_bucket(&self, node_index: usize, hash_map_size: usize) -> bool {
        let same = all_maps_same_bucket(&self.live(node_index).slots, hash_map_size);
        debug_assert!(
            !same || self.live(node_index).slots.iter().all(|&slot| slot >= 0),
            "uniform windows must hold bucket pointers"
        );
        same
    }

    /// Start index of the parent slots covering the node on `path`.
    fn find_parent_node_start_index(&self, path: &BucketPath) -> usize {
        let parent = path
            .parent
            .as_deref()
            .expect("parent start index requested for the root");
        let pointers_size = 1usize << (MAX_LEVEL_DEPTH - path.node_local_depth);

        if parent.item_index < MAX_LEVEL_SIZE / 2 {
            return (parent.item_index / pointers_size) * pointers_size;
        }
        ((parent.item_index - MAX_LEVEL_SIZE / 2) / pointers_size) * pointers_size
            + MAX_LEVEL_SIZE / 2
    }

    /// Deepest local depth among children referenced in `[start, end)` of
    /// a node.
    pub fn max_subtree_depth(&self, node_index: usize, start: usize, end: usize) -> u32 {
        let node = self.live(node_index);
        let mut current_child = usize::MAX;
        let mut max_depth = 0;

        for i in start..end {
            let position = DirectorySlot(node.slots[i]);
            if !position.is_child() {
                continue;
            }

            let child_index = position.child_node_index();
            if child_index == current_child {
                continue;
            }
            current_child = child_index;

            let child_depth = self.live(child_index).local_depth;
            if child_depth > max_depth {
                max_depth = child_depth;
            }
        }

        max_depth
    }

    /// Raises the parent's max child depth records after a child reached
    /// `child_depth`.
    fn update_max_child_depth(&mut self, parent: Option<&BucketPath>, child_depth: u32) {
        let Some(parent) = parent else {
            return;
        };

        let node = self.live_mut(parent.node_index);
        if parent.item_index < MAX_LEVEL_SIZE / 2 {
            if child_depth > node.max_left_child_depth {
                node.max_left_child_depth = child_depth;
            }
        } else if child_depth > node.max_right_child_depth {
            node.max_right_child_depth = child_depth;
        }
    }

    /// Rewrites the parent's slots after a node split: each half either
    /// collapses to direct bucket pointers (when uniform) or is linked as
    /// child references into the kept/new node.
    pub fn update_nodes_after_split(
        &mut self,
        path: &BucketPath,
        new_node: &[i64; MAX_LEVEL_SIZE],
        node_local_depth: u32,
        hash_map_size: usize,
        all_left_equal: bool,
        all_right_equal: bool,
        new_node_index: Option<usize>,
    ) {
        let start_index = self.find_parent_node_start_index(path);
        let parent_index = path
            .parent
            .as_deref()
            .expect("node split reached the root")
            .node_index;

        let pointers_size = 1usize << (MAX_LEVEL_DEPTH - node_local_depth);

        if all_left_equal {
            let updated: [i64; MAX_LEVEL_SIZE] = *self.live(path.node_index).slots;
            let parent = self.live_mut(parent_index);
            for i in 0..pointers_size {
                parent.slots[start_index + i] = updated[i * hash_map_size];
            }
        } else {
            let parent = self.live_mut(parent_index);
            for i in 0..pointers_size {
                parent.slots[start_index + i] =
                    DirectorySlot::child(path.node_index, i * hash_map_size).raw();
            }
        }

        if all_right_equal {
            let parent = self.live_mut(parent_index);
            for i in 0..pointers_size {
                parent.slots[start_index + pointers_size + i] = new_node[i * hash_map_size];
            }
        } else {
            let child = new_node_index.expect("right half kept without a node");
            let parent = self.live_mut(parent_index);
            for i in 0..pointers_size {
                parent.slots[start_index + pointers_size + i] =
                    DirectorySlot::child(child, i * hash_map_size).raw();
            }
        }

        self.update_max_child_depth(path.parent.as_deref(), path.node_local_depth + 1);
    }

    /// Grows the tree below a node that cannot split further: the slots
    /// around the split bucket move into a fresh child node, and the
    /// covered interval of the full node is rewritten as child references.
    pub fn add_new_level_node(
        &mut self,
        path: &BucketPath,
        new_bucket_pointer: DirectorySlot,
        updated_bucket_pointer: DirectorySlot,
    ) {
        let node_len = MAX_LEVEL_SIZE;

        let (new_node_depth, new_node_start_index, map_interval) =
            if path.item_index < node_len / 2 {
                let max_depth = self.live(path.node_index).max_left_child_depth;
                debug_assert_eq!(
                    self.max_subtree_depth(path.node_index, 0, node_len / 2),
                    max_depth
                );
                let depth = if max_depth > 0 { max_depth } else { 1 };
                let interval = 1usize << (MAX_LEVEL_DEPTH - depth);
                (depth, (path.item_index / interval) * interval, interval)
            } else {
                let max_depth = self.live(path.node_index).max_right_child_depth;
                debug_assert_eq!(
                    self.max_subtree_depth(path.node_index, node_len / 2, node_len),
                    max_depth
                );
                let depth = if max_depth > 0 { max_depth } else { 1 };
                let interval = 1usize << (MAX_LEVEL_DEPTH - depth);
                (
                    depth,
                    ((path.item_index - node_len / 2) / interval) * interval + node_len / 2,
                    interval,
                )
            };

        let map_size = 1usize << new_node_depth;

        // Replicate the covered slots into the child, the split slot
        // becoming the two result pointers.
        let covered: Vec<i64> = (0..map_interval)
            .map(|i| self.live(path.node_index).slots[new_node_start_index + i])
            .collect();

        let mut new_node = Box::new([0i64; MAX_LEVEL_SIZE]);
        for (i, &bucket_pointer) in covered.iter().enumerate() {
            let node_offset = i + new_node_start_index;
            if node_offset != path.item_index {
                for n in (i << new_node_depth)..((i + 1) << new_node_depth) {
                    new_node[n] = bucket_pointer;
                }
            } else {
                for n in (i << new_node_depth)..((2 * i + 1) << (new_node_depth - 1)) {
                    new_node[n] = updated_bucket_pointer.raw();
                }
                for n in ((2 * i + 1) << (new_node_depth - 1))..((i + 1) << new_node_depth) {
                    new_node[n] = new_bucket_pointer.raw();
                }
            }
        }

        let new_node_index = self.add_node(new_node, new_node_depth);

        let node = self.live_mut(path.node_index);
        for i in 0..map_interval {
            node.slots[new_node_start_index + i] =
                DirectorySlot::child(new_node_index, i * map_size).raw();
        }

        self.update_max_child_depth(Some(path), new_node_depth);
    }

    /// Collapses a node whose slots all hold the same pointer back into
    /// its parent, then recomputes the parent's max child depth if the
    /// collapsed node carried it.
    pub fn merge_node_to_parent(&mut self, path: &BucketPath) {
        let start_index = self.find_parent_node_start_index(path);
        let local_depth = path.node_local_depth;
        let hash_map_size = 1usize << local_depth;

        let parent = path
            .parent
            .as_deref()
            .expect("node merge reached the root");
        let parent_index = parent.node_index;

        let node_slots: [i64; MAX_LEVEL_SIZE] = *self.live(path.node_index).slots;
        {
            let parent_node = self.live_mut(parent_index);
            let mut k = start_index;
            let mut i = 0;
            while i < MAX_LEVEL_SIZE {
                parent_node.slots[k] = node_slots[i];
                i += hash_map_size;
                k += 1;
            }
        }

        self.delete_node(path.node_index);

        if parent.item_index < MAX_LEVEL_SIZE / 2 {
            if self.live(parent_index).max_left_child_depth == local_depth {
                let depth = self.max_subtree_depth(parent_index, 0, MAX_LEVEL_SIZE / 2);
                self.live_mut(parent_index).max_left_child_depth = depth;
            }
        } else if self.live(parent_index).max_right_child_depth == local_depth {
            let depth = self.max_subtree_depth(parent_index, MAX_LEVEL_SIZE / 2, MAX_LEVEL_SIZE);
            self.live_mut(parent_index).max_right_child_depth = depth;
        }
    }

    /// Rewrites every slot of the subtree under `(node, item + offset)`
    /// that routes to the changed bucket.
    pub fn update_bucket(
        &mut self,
        node_index: usize,
        item_index: usize,
        offset: usize,
        new_pointer: DirectorySlot,
    ) {
        let mut stack = vec![(node_index, item_index, offset)];

        while let Some((node, item, off)) = stack.pop() {
            let position = self.live(node).slots[item + off];
            if position >= 0 {
                self.live_mut(node).slots[item + off] = new_pointer.raw();
            } else {
                let slot = DirectorySlot(position);
                let child = slot.child_node_index();
                let child_offset = slot.child_item_offset();
                let interval = 1usize << self.live(child).local_depth;
                for i in 0..interval {
                    stack.push((child, i, child_offset));
                }
            }
        }
    }

    /// Rewrites the directory interval that routed to a bucket which just
    /// split, half to the updated pointer and half to the new one.
    pub fn update_node_after_bucket_split(
        &mut self,
        path: &BucketPath,
        bucket_depth: u32,
        new_bucket_pointer: DirectorySlot,
        updated_bucket_pointer: DirectorySlot,
    ) {
        let mut offset = path.node_global_depth as i64 - (bucket_depth as i64 - 1);
        let mut current = path;
        let mut node_local_depth = path.node_local_depth;
        while offset > 0 {
            offset -= node_local_depth as i64;
            if offset > 0 {
                current = current
                    .parent
                    .as_deref()
                    .expect("bucket split interval walk passed the root");
                node_local_depth = current.node_local_depth;
            }
        }

        let diff =
            (bucket_depth as i64 - 1 - (current.node_global_depth as i64 - node_local_depth as i64))
                as u32;

        let interval = 1usize << (node_local_depth - diff - 1);
        let first_start_index =
            current.item_index & ((LEVEL_MASK << (node_local_depth - diff)) & LEVEL_MASK);
        let first_end_index = first_start_index + interval;

        let second_start_index = first_end_index;
        let second_end_index = second_start_index + interval;

        for i in first_start_index..first_end_index {
            self.update_bucket(
                current.node_index,
                i,
                current.hash_map_offset,
                updated_bucket_pointer,
            );
        }
        for i in second_start_index..second_end_index {
            self.update_bucket(
                current.node_index,
                i,
                current.hash_map_offset,
                new_bucket_pointer,
            );
        }
    }

    // ------------------------------------------------------------------
    // Range scan navigation
    // ------------------------------------------------------------------

    /// Path of the next routing interval after the bucket on `path`, or
    /// `None` past the end of the directory.
    pub fn next_bucket_to_find(&self, path: &BucketPath, bucket_depth: u32) -> Option<BucketPath> {
        let mut offset = path.node_global_depth as i64 - bucket_depth as i64;
        let mut current = path;
        let mut node_local_depth = path.node_local_depth;
        debug_assert_eq!(self.node_local_depth(path.node_index), path.node_local_depth);

        while offset > 0 {
            offset -= node_local_depth as i64;
            if offset > 0 {
                current = current.parent.as_deref()?;
                node_local_depth = current.node_local_depth;
                debug_assert_eq!(self.node_local_depth(current.node_index), node_local_depth);
            }
        }

        let diff = (bucket_depth as i64
            - (current.node_global_depth as i64 - node_local_depth as i64))
            as u32;
        let interval = 1usize << (node_local_depth - diff);
        let first_start_index =
            current.item_index & ((LEVEL_MASK << (node_local_depth - diff)) & LEVEL_MASK);

        let global_index = first_start_index + interval + current.hash_map_offset;
        let to_find = if global_index >= MAX_LEVEL_SIZE {
            self.next_level_up(current)?
        } else {
            let hash_map_size = 1usize << current.node_local_depth;
            let hash_map_offset = global_index / hash_map_size * hash_map_size;
            let start_index = global_index - hash_map_offset;

            BucketPath::new(
                current.parent.clone(),
                hash_map_offset,
                start_index,
                current.node_index,
                current.node_local_depth,
                current.node_global_depth,
            )
        };

        self.next_non_empty_node(to_find)
    }

    /// Scans forward from `path` for the first slot holding a bucket
    /// pointer, descending into child nodes and climbing levels when a
    /// node is exhausted.
    fn next_non_empty_node(&self, path: BucketPath) -> Option<BucketPath> {
        let mut current = Some(path);

        'walk: while let Some(path) = current.take() {
            let node = self.live(path.node_index);
            let start_index = path.item_index + path.hash_map_offset;

            for i in start_index..MAX_LEVEL_SIZE {
                let position = node.slots[i];

                if position > 0 {
                    let hash_map_size = 1usize << path.node_local_depth;
                    let hash_map_offset = (i / hash_map_size) * hash_map_size;
                    let item_index = i - hash_map_offset;

                    return Some(BucketPath::new(
                        path.parent.clone(),
                        hash_map_offset,
                        item_index,
                        path.node_index,
                        path.node_local_depth,
                        path.node_global_depth,
                    ));
                }

                if position < 0 {
                    let slot = DirectorySlot(position);
                    let child_index = slot.child_node_index();
                    let child_offset = slot.child_item_offset();
                    let child_depth = self.live(child_index).local_depth;

                    let parent = BucketPath::new(
                        path.parent.clone(),
                        0,
                        i,
                        path.node_index,
                        path.node_local_depth,
                        path.node_global_depth,
                    );
                    let global_depth = path.node_global_depth + child_depth;
                    current = Some(BucketPath::new(
                        Some(Box::new(parent)),
                        child_offset,
                        0,
                        child_index,
                        child_depth,
                        global_depth,
                    ));
                    continue 'walk;
                }
            }

            current = self.next_level_up(&path);
        }

        None
    }

    /// Climbs to the parent interval following the current node.
    fn next_level_up(&self, path: &BucketPath) -> Option<BucketPath> {
        let parent = path.parent.as_deref()?;

        let pointers_size = 1usize << (MAX_LEVEL_DEPTH - path.node_local_depth);
        debug_assert_eq!(self.node_local_depth(path.node_index), path.node_local_depth);

        if parent.item_index < MAX_LEVEL_SIZE / 2 {
            let next_index = (parent.item_index / pointers_size + 1) * pointers_size;
            return Some(BucketPath::new(
                parent.parent.clone(),
                0,
                next_index,
                parent.node_index,
                parent.node_local_depth,
                parent.node_global_depth,
            ));
        }

        let next_index = ((parent.item_index - MAX_LEVEL_SIZE / 2) / pointers_size + 1)
            * pointers_size
            + MAX_LEVEL_SIZE / 2;
        if next_index < MAX_LEVEL_SIZE {
            return Some(BucketPath::new(
                parent.parent.clone(),
                0,
                next_index,
                parent.node_index,
                parent.node_local_depth,
                parent.node_global_depth,
            ));
        }

        self.next_level_up(&BucketPath::new(
            parent.parent.clone(),
            0,
            MAX_LEVEL_SIZE - 1,
            parent.node_index,
            parent.node_local_depth,
            parent.node_global_depth,
        ))
    }

    /// Path of the previous routing interval before the bucket on `path`,
    /// or `None` before the start of the directory.
    pub fn prev_bucket_to_find(&self, path: &BucketPath, bucket_depth: u32) -> Option<BucketPath> {
        let mut offset = path.node_global_depth as i64 - bucket_depth as i64;
        let mut current = path;
        let mut node_local_depth = path.node_local_depth;

        while offset > 0 {
            offset -= node_local_depth as i64;
            if offset > 0 {
                current = current.parent.as_deref()?;
                node_local_depth = current.node_local_depth;
            }
        }

        let diff = (bucket_depth as i64
            - (current.node_global_depth as i64 - node_local_depth as i64))
            as u32;
        let first_start_index =
            current.item_index & ((LEVEL_MASK << (node_local_depth - diff)) & LEVEL_MASK);
        let global_index = first_start_index as i64 + current.hash_map_offset as i64 - 1;

        let to_find = if global_index < 0 {
            self.prev_level_up(path)?
        } else {
            let global_index = global_index as usize;
            let hash_map_size = 1usize << current.node_local_depth;
            let hash_map_offset = global_index / hash_map_size * hash_map_size;
            let start_index = global_index - hash_map_offset;

            BucketPath::new(
                current.parent.clone(),
                hash_map_offset,
                start_index,
                current.node_index,
                current.node_local_depth,
                current.node_global_depth,
            )
        };

        self.prev_non_empty_node(to_find)
    }

    /// Scans backward from `path` for the last slot holding a bucket
    /// pointer, descending into child nodes at their final window.
    fn prev_non_empty_node(&self, path: BucketPath) -> Option<BucketPath> {
        let mut current = Some(path);

        'walk: while let Some(path) = current.take() {
            let node = self.live(path.node_index);
            let end_index = path.item_index + path.hash_map_offset;

            for i in (0..=end_index).rev() {
                let position = node.slots[i];

                if position > 0 {
                    let hash_map_size = 1usize << path.node_local_depth;
                    let hash_map_offset = (i / hash_map_size) * hash_map_size;
                    let item_index = i - hash_map_offset;

                    return Some(BucketPath::new(
                        path.parent.clone(),
                        hash_map_offset,
                        item_index,
                        path.node_index,
                        path.node_local_depth,
                        path.node_global_depth,
                    ));
                }

                if position < 0 {
                    let slot = DirectorySlot(position);
                    let child_index = slot.child_node_index();
                    let child_offset = slot.child_item_offset();
                    let child_depth = self.live(child_index).local_depth;
                    let end_child_index = (1usize << child_depth) - 1;

                    let parent = BucketPath::new(
                        path.parent.clone(),
                        0,
                        i,
                        path.node_index,
                        path.node_local_depth,
                        path.node_global_depth,
                    );
                    let global_depth = parent.node_global_depth + child_depth;
                    current = Some(BucketPath::new(
                        Some(Box::new(parent)),
                        child_offset,
                        end_child_index,
                        child_index,
                        child_depth,
                        global_depth,
                    ));
                    continue 'walk;
                }
            }

            current = self.prev_level_up(&path);
        }

        None
    }

    /// Climbs to the parent interval preceding the current node.
    fn prev_level_up(&self, path: &BucketPath) -> Option<BucketPath> {
        let parent = path.parent.as_deref()?;

        let pointers_size = 1usize << (MAX_LEVEL_DEPTH - path.node_local_depth);

        if parent.item_index > MAX_LEVEL_SIZE / 2 {
            let prev_index = ((parent.item_index - MAX_LEVEL_SIZE / 2) / pointers_size)
                * pointers_size
                + MAX_LEVEL_SIZE / 2
                - 1;
            return Some(BucketPath::new(
                parent.parent.clone(),
                0,
                prev_index,
                parent.node_index,
                parent.node_local_depth,
                parent.node_global_depth,
            ));
        }

        let prev_index = (parent.item_index / pointers_size) as i64 * pointers_size as i64 - 1;
        if prev_index >= 0 {
            return Some(BucketPath::new(
                parent.parent.clone(),
                0,
                prev_index as usize,
                parent.node_index,
                parent.node_local_depth,
                parent.node_global_depth,
            ));
        }

        self.prev_level_up(&BucketPath::new(
            parent.parent.clone(),
            0,
            0,
            parent.node_index,
            parent.node_local_depth,
            parent.node_global_depth,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_slots() -> Box<[i64; MAX_LEVEL_SIZE]> {
        let mut slots = Box::new([0i64; MAX_LEVEL_SIZE]);
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = DirectorySlot::bucket(i as u64, 0).raw();
        }
        slots
    }

    #[test]
    fn test_resolution_routes_on_high_bits() {
        let directory = Directory::with_root(root_slots());

        for prefix in [0u64, 1, 0x7F, 0x80, 0xFF] {
            let hash = prefix << 56;
            let path = directory.bucket_path(hash).unwrap();
            assert_eq!(path.node_index, 0);
            assert_eq!(path.item_index, prefix as usize);
            assert_eq!(path.node_global_depth, 8);
            let slot = directory.slot(path.node_index, path.item_index + path.hash_map_offset);
            assert_eq!(slot.page_index(), prefix);
        }
    }

    #[test]
    fn test_resolution_descends_into_child() {
        let mut directory = Directory::with_root(root_slots());

        // Hang a single-bit child under prefix 0x00.
        let mut child = Box::new([0i64; MAX_LEVEL_SIZE]);
        for (i, slot) in child.iter_mut().enumerate() {
            *slot = DirectorySlot::bucket(1000 + i as u64, 1).raw();
        }
        let child_index = directory.add_node(child, 8);
        directory.set_slot(0, 0, DirectorySlot::child(child_index, 0));

        let path = directory.bucket_path(0x0042 << 48).unwrap();
        assert_eq!(path.node_index, child_index);
        assert_eq!(path.node_global_depth, 16);
        assert_eq!(path.item_index, 0x42);
        assert_eq!(path.parent.as_deref().unwrap().node_index, 0);

        // Untouched prefixes still resolve through the root.
        let path = directory.bucket_path(0x01u64 << 56).unwrap();
        assert_eq!(path.node_index, 0);
        assert_eq!(path.node_global_depth, 8);
    }

    #[test]
    fn test_resolution_detects_cycle() {
        let mut directory = Directory::with_root(root_slots());

        // Route prefix 0 back into the root: the walk can never finish.
        directory.set_slot(0, 0, DirectorySlot::child(0, 0));

        assert!(matches!(
            directory.bucket_path(0),
            Err(CorvusError::Corrupted(_))
        ));
    }

    #[test]
    fn test_add_node_reuses_free_list() {
        let mut directory = Directory::with_root(root_slots());

        let a = directory.add_node(Box::new([0i64; MAX_LEVEL_SIZE]), 1);
        let b = directory.add_node(Box::new([0i64; MAX_LEVEL_SIZE]), 1);
        assert_eq!((a, b), (1, 2));

        directory.delete_node(a);
        assert_eq!(directory.tombstone(), a as i32);

        let c = directory.add_node(Box::new([0i64; MAX_LEVEL_SIZE]), 2);
        assert_eq!(c, a);
        assert_eq!(directory.tombstone(), -1);
    }

    #[test]
    fn test_delete_last_node_pops() {
        let mut directory = Directory::with_root(root_slots());
        let index = directory.add_node(Box::new([0i64; MAX_LEVEL_SIZE]), 1);

        directory.delete_node(index);
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.tombstone(), -1);
    }

    #[test]
    fn test_update_bucket_rewrites_subtree() {
        let mut directory = Directory::with_root(root_slots());

        let old = DirectorySlot::bucket(7, 0);
        let mut child = Box::new([0i64; MAX_LEVEL_SIZE]);
        for slot in child.iter_mut() {
            *slot = old.raw();
        }
        let child_index = directory.add_node(child, 8);
        directory.set_slot(0, 3, DirectorySlot::child(child_index, 0));

        let replacement = DirectorySlot::bucket(99, 1);
        directory.update_bucket(0, 3, 0, replacement);

        for i in 0..MAX_LEVEL_SIZE {
            assert_eq!(directory.slot(child_index, i), replacement);
        }
    }

    #[test]
    fn test_all_maps_same_bucket() {
        let mut node = [5i64; MAX_LEVEL_SIZE];
        assert!(all_maps_same_bucket(&node, 2));
        assert!(all_maps_same_bucket(&node, MAX_LEVEL_SIZE));

        node[3] = 6;
        assert!(!all_maps_same_bucket(&node, 2));
        // Window size 1 is trivially uniform.
        assert!(all_maps_same_bucket(&node, 1));
    }

    #[test]
    fn test_resolve_slot_follows_children() {
        let mut directory = Directory::with_root(root_slots());

        let target = DirectorySlot::bucket(11, 2);
        let mut child = Box::new([0i64; MAX_LEVEL_SIZE]);
        child[16] = target.raw();
        let child_index = directory.add_node(child, 4);

        let slot = DirectorySlot::child(child_index, 16);
        assert_eq!(directory.resolve_slot(slot), target);
        assert_eq!(directory.resolve_slot(target), target);
    }

    #[test]
    fn test_split_node_duplicates_pairwise() {
        let mut slots = Box::new([0i64; MAX_LEVEL_SIZE]);
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = DirectorySlot::bucket(i as u64, 0).raw();
        }
        let mut directory = Directory::with_root(root_slots());
        let node_index = directory.add_node(slots, 7);
        let path = BucketPath::new(
            Some(Box::new(BucketPath::new(None, 0, 0, 0, 8, 8))),
            0,
            0,
            node_index,
            7,
            15,
        );

        let result = directory.split_node(&path);

        assert_eq!(directory.node_local_depth(node_index), 8);
        // Left half in place: slot i duplicated at 2i and 2i+1.
        assert_eq!(
            directory.slot(node_index, 0),
            DirectorySlot::bucket(0, 0)
        );
        assert_eq!(
            directory.slot(node_index, 1),
            DirectorySlot::bucket(0, 0)
        );
        assert_eq!(
            directory.slot(node_index, 254),
            DirectorySlot::bucket(127, 0)
        );
        // Right half returned.
        assert_eq!(result.new_node[0], DirectorySlot::bucket(128, 0).raw());
        assert_eq!(result.new_node[1], DirectorySlot::bucket(128, 0).raw());
        assert_eq!(result.new_node[255], DirectorySlot::bucket(255, 0).raw());
        // Distinct source pointers: windows of the doubled halves are
        // uniform pairs, and with the doubled window size (4) they differ.
        assert!(!result.all_left_hash_maps_equal);
        assert!(!result.all_right_hash_maps_equal);
    }

    #[test]
    fn test_split_node_detects_uniform_half() {
        let mut slots = Box::new([0i64; MAX_LEVEL_SIZE]);
        let same = DirectorySlot::bucket(1, 0).raw();
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = if i < MAX_LEVEL_SIZE / 2 {
                same
            } else {
                DirectorySlot::bucket(100 + i as u64, 0).raw()
            };
        }
        let mut directory = Directory::with_root(root_slots());
        let node_index = directory.add_node(slots, 7);
        let path = BucketPath::new(
            Some(Box::new(BucketPath::new(None, 0, 0, 0, 8, 8))),
            0,
            0,
            node_index,
            7,
            15,
        );

        let result = directory.split_node(&path);
        assert!(result.all_left_hash_maps_equal);
        assert!(!result.all_right_hash_maps_equal);
    }

    #[test]
    fn test_merge_node_to_parent() {
        let mut directory = Directory::with_root(root_slots());

        let same = DirectorySlot::bucket(42, 1);
        let child = Box::new([same.raw(); MAX_LEVEL_SIZE]);
        let child_index = directory.add_node(child, 8);
        directory.set_slot(0, 5, DirectorySlot::child(child_index, 0));

        let parent_path = BucketPath::new(None, 0, 5, 0, 8, 8);
        let path = BucketPath::new(Some(Box::new(parent_path)), 0, 0, child_index, 8, 16);

        assert!(directory.node_maps_same_bucket(child_index, 1 << 8));
        directory.merge_node_to_parent(&path);

        assert_eq!(directory.slot(0, 5), same);
        // The child was the last node, so the array shrank.
        assert_eq!(directory.len(), 1);
    }
}
