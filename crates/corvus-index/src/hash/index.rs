//! The extendible hash index engine.
//!
//! [`HashIndex`] orchestrates the directory tree, the bucket store, the
//! split staging buffer and the state stores. Every public operation is
//! gated by the instance readers-writer spin lock: lookups and range
//! scans run shared, mutations run exclusive.
//!
//! A split is published in a fixed order: the two result pages are
//! written and staged, the dead source page is marked clean, and only
//! then does the directory flip its slots. A reader resolving a pointer
//! therefore always observes a bucket whose depth matches the pointer.

use super::bucket::{self, Bucket, BucketMut};
use super::constants::{LEVEL_MASK, MAX_LEVEL_DEPTH, MAX_LEVEL_SIZE, MERGE_THRESHOLD};
use super::directory::Directory;
use super::metrics::{MetricsSink, NoopMetrics};
use super::state::{MetadataStore, TreeStateStore};
use super::store::{BucketStore, PageWriteLock};
use super::types::{BucketPath, BucketSplitResult, DirectorySlot, Entry, LevelMetadata};
use corvus_cache::PageCache;
use corvus_common::{
    BinaryCodec, CorvusError, IndexOptions, KeyHasher, ReadersWriterSpinLock, Result,
};
use std::cell::UnsafeCell;
use std::sync::Arc;

/// On-disk extendible hash index from codec-typed keys to values.
///
/// Supports many concurrent readers and one writer; the instance lock
/// enforces the discipline, so all operations take `&self`.
pub struct HashIndex<KC, VC, H>
where
    KC: BinaryCodec,
    VC: BinaryCodec,
    H: KeyHasher<KC::Value>,
    KC::Value: Ord,
{
    lock: ReadersWriterSpinLock,
    core: UnsafeCell<Core<KC, VC, H>>,
}

// The core is only reached under the instance lock: shared acquisitions
// take `&Core`, exclusive acquisitions take `&mut Core`.
unsafe impl<KC, VC, H> Send for HashIndex<KC, VC, H>
where
    KC: BinaryCodec + Send,
    VC: BinaryCodec + Send,
    H: KeyHasher<KC::Value> + Send,
    KC::Value: Ord,
{
}

unsafe impl<KC, VC, H> Sync for HashIndex<KC, VC, H>
where
    KC: BinaryCodec + Send + Sync,
    VC: BinaryCodec + Send + Sync,
    H: KeyHasher<KC::Value> + Send + Sync,
    KC::Value: Ord,
{
}

struct Core<KC, VC, H>
where
    KC: BinaryCodec,
    VC: BinaryCodec,
    H: KeyHasher<KC::Value>,
    KC::Value: Ord,
{
    name: String,
    options: IndexOptions,
    key_codec: KC,
    value_codec: VC,
    hasher: H,
    directory: Directory,
    store: BucketStore,
    metadata_store: MetadataStore,
    tree_state_store: TreeStateStore,
    size: u64,
    bucket_tombstone_pointer: i64,
    metrics: Arc<dyn MetricsSink>,
}

impl<KC, VC, H> HashIndex<KC, VC, H>
where
    KC: BinaryCodec,
    VC: BinaryCodec,
    H: KeyHasher<KC::Value>,
    KC::Value: Ord,
{
    /// Creates a fresh index: one root directory node routing 256 hash
    /// prefixes to 256 empty level-0 buckets.
    pub fn create(
        cache: Arc<PageCache>,
        name: &str,
        options: IndexOptions,
        key_codec: KC,
        value_codec: VC,
        hasher: H,
    ) -> Result<Self> {
        Self::create_with_metrics(
            cache,
            name,
            options,
            key_codec,
            value_codec,
            hasher,
            Arc::new(NoopMetrics),
        )
    }

    /// [`HashIndex::create`] with an injected metrics sink.
    pub fn create_with_metrics(
        cache: Arc<PageCache>,
        name: &str,
        options: IndexOptions,
        key_codec: KC,
        value_codec: VC,
        hasher: H,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let mut core = Core::new(cache, name, options, key_codec, value_codec, hasher, metrics)?;
        core.store.ensure_level(0)?;
        core.init_hash_tree_state()?;
        core.store.flush_files()?;
        core.persist_state()?;

        Ok(Self {
            lock: ReadersWriterSpinLock::new(),
            core: UnsafeCell::new(core),
        })
    }

    /// Opens an existing index from its persisted state.
    pub fn open(
        cache: Arc<PageCache>,
        name: &str,
        options: IndexOptions,
        key_codec: KC,
        value_codec: VC,
        hasher: H,
    ) -> Result<Self> {
        Self::open_with_metrics(
            cache,
            name,
            options,
            key_codec,
            value_codec,
            hasher,
            Arc::new(NoopMetrics),
        )
    }

    /// [`HashIndex::open`] with an injected metrics sink.
    pub fn open_with_metrics(
        cache: Arc<PageCache>,
        name: &str,
        options: IndexOptions,
        key_codec: KC,
        value_codec: VC,
        hasher: H,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let mut core = Core::new(cache, name, options, key_codec, value_codec, hasher, metrics)?;

        let (records_count, page_size, levels) = core.metadata_store.load()?;
        core.store.check_page_size(page_size)?;
        core.store.restore_levels(levels)?;

        let (directory, bucket_tombstone_pointer) = core.tree_state_store.load()?;
        core.directory = directory;
        core.bucket_tombstone_pointer = bucket_tombstone_pointer;
        core.size = records_count;

        Ok(Self {
            lock: ReadersWriterSpinLock::new(),
            core: UnsafeCell::new(core),
        })
    }

    fn shared(&self) -> &Core<KC, VC, H> {
        // Safety: the caller holds a shared acquisition of the instance
        // lock, so no exclusive reference exists.
        unsafe { &*self.core.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn exclusive(&self) -> &mut Core<KC, VC, H> {
        // Safety: the caller holds the exclusive acquisition of the
        // instance lock, so this is the only reference.
        unsafe { &mut *self.core.get() }
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &KC::Value) -> Result<Option<VC::Value>> {
        let _guard = self.lock.shared();
        self.shared().get(key)
    }

    /// True when `key` is present.
    pub fn contains_key(&self, key: &KC::Value) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts or updates an entry.
    pub fn put(&self, key: &KC::Value, value: &VC::Value) -> Result<()> {
        let _guard = self.lock.exclusive();
        self.exclusive().put(key, value)
    }

    /// Removes an entry; returns true when the key was present.
    pub fn remove(&self, key: &KC::Value) -> Result<bool> {
        let _guard = self.lock.exclusive();
        self.exclusive().remove(key)
    }

    /// Number of live entries.
    pub fn size(&self) -> u64 {
        let _guard = self.lock.shared();
        self.shared().size
    }

    /// Bucket count and tombstone head of a file level, when it exists.
    pub fn file_level_stats(&self, file_level: usize) -> Option<LevelMetadata> {
        let _guard = self.lock.shared();
        self.shared().store.levels()[file_level]
    }

    /// Number of directory node positions, live and tombstoned.
    pub fn directory_size(&self) -> usize {
        let _guard = self.lock.shared();
        self.shared().directory.len()
    }

    /// Entries strictly greater than `key`, in hash-prefix bucket order.
    pub fn higher_entries(&self, key: &KC::Value) -> Result<Vec<Entry<KC::Value, VC::Value>>> {
        let _guard = self.lock.shared();
        self.shared().forward_entries(key, false)
    }

    /// Entries greater than or equal to `key`, in hash-prefix bucket order.
    pub fn ceiling_entries(&self, key: &KC::Value) -> Result<Vec<Entry<KC::Value, VC::Value>>> {
        let _guard = self.lock.shared();
        self.shared().forward_entries(key, true)
    }

    /// Entries strictly less than `key`, in hash-prefix bucket order.
    pub fn lower_entries(&self, key: &KC::Value) -> Result<Vec<Entry<KC::Value, VC::Value>>> {
        let _guard = self.lock.shared();
        self.shared().backward_entries(key, false)
    }

    /// Entries less than or equal to `key`, in hash-prefix bucket order.
    pub fn floor_entries(&self, key: &KC::Value) -> Result<Vec<Entry<KC::Value, VC::Value>>> {
        let _guard = self.lock.shared();
        self.shared().backward_entries(key, true)
    }

    /// Empties the index, reinitializing the directory and level files.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.exclusive();
        self.exclusive().clear()
    }

    /// Drains staged pages, flushes level files and checkpoints state.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.lock.exclusive();
        self.exclusive().flush()
    }

    /// Flushes everything and closes the level files.
    pub fn close(&self) -> Result<()> {
        let _guard = self.lock.exclusive();
        self.exclusive().close()
    }

    /// Deletes every file belonging to the index.
    pub fn delete(&self) -> Result<()> {
        let _guard = self.lock.exclusive();
        self.exclusive().delete()
    }
}

impl<KC, VC, H> Core<KC, VC, H>
where
    KC: BinaryCodec,
    VC: BinaryCodec,
    H: KeyHasher<KC::Value>,
    KC::Value: Ord,
{
    #[allow(clippy::too_many_arguments)]
    fn new(
        cache: Arc<PageCache>,
        name: &str,
        options: IndexOptions,
        key_codec: KC,
        value_codec: VC,
        hasher: H,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        options.validate()?;

        let data_dir = cache.store().data_dir().to_path_buf();
        let metadata_path = data_dir.join(format!("{name}{}", options.metadata_file_extension));
        let tree_state_path = data_dir.join(format!("{name}{}", options.tree_state_file_extension));

        Ok(Self {
            name: name.to_string(),
            store: BucketStore::new(cache, name, &options),
            metadata_store: MetadataStore::new(metadata_path),
            tree_state_store: TreeStateStore::new(tree_state_path),
            options,
            key_codec,
            value_codec,
            hasher,
            directory: Directory::with_root(Box::new([0i64; MAX_LEVEL_SIZE])),
            size: 0,
            bucket_tombstone_pointer: -1,
            metrics,
        })
    }

    /// Writes 256 empty depth-8 buckets into level 0 and points every
    /// root slot at one of them.
    fn init_hash_tree_state(&mut self) -> Result<()> {
        for page_index in 0..MAX_LEVEL_SIZE as u64 {
            let mut lock = self.store.write_page(0, page_index)?;
            let mut empty = BucketMut::new(&mut lock.guard, &self.key_codec, &self.value_codec);
            empty.init(MAX_LEVEL_DEPTH);
        }

        let mut root = Box::new([0i64; MAX_LEVEL_SIZE]);
        for (i, slot) in root.iter_mut().enumerate() {
            *slot = DirectorySlot::bucket(i as u64, 0).raw();
        }
        self.directory = Directory::with_root(root);

        self.store.level_mut(0).buckets_count = MAX_LEVEL_SIZE as i64;
        self.size = 0;
        Ok(())
    }

    fn persist_state(&self) -> Result<()> {
        self.metadata_store.store(
            self.size,
            self.options.bucket_page_size,
            self.store.levels(),
        )?;
        self.tree_state_store
            .store(&self.directory, self.bucket_tombstone_pointer)?;
        Ok(())
    }

    /// Resolves the slot a key routes to.
    fn resolve(&self, hash: u64) -> Result<(BucketPath, DirectorySlot)> {
        let path = self.directory.bucket_path(hash)?;
        let pointer = self
            .directory
            .slot(path.node_index, path.item_index + path.hash_map_offset);
        Ok((path, pointer))
    }

    fn get(&self, key: &KC::Value) -> Result<Option<VC::Value>> {
        let hash = self.hasher.hash(key);
        let (_, pointer) = self.resolve(hash)?;
        if pointer.is_empty() {
            return Ok(None);
        }

        let lock = self
            .store
            .read_page(pointer.file_level(), pointer.page_index())?;
        let bucket = Bucket::new(&lock.guard, &self.key_codec, &self.value_codec);
        Ok(bucket.find(key).map(|entry| entry.value))
    }

    fn put(&mut self, key: &KC::Value, value: &VC::Value) -> Result<()> {
        match self.put_inner(key, value) {
            Err(CorvusError::KeyTooLarge { size, max }) if !self.options.error_on_oversize_key => {
                tracing::warn!(
                    index = %self.name,
                    size,
                    max,
                    "entry is too large to fit an empty bucket and was skipped"
                );
                Ok(())
            }
            result => result,
        }
    }

    fn put_inner(&mut self, key: &KC::Value, value: &VC::Value) -> Result<()> {
        let entry_size = self.key_codec.size_of(key) + self.value_codec.size_of(value);
        let max = bucket::max_entry_size(self.options.bucket_page_size);
        if entry_size > max {
            return Err(CorvusError::KeyTooLarge {
                size: entry_size,
                max,
            });
        }

        enum Outcome {
            Updated,
            Replaced,
            Inserted,
            Full,
        }

        let hash = self.hasher.hash(key);
        loop {
            let (path, pointer) = self.resolve(hash)?;
            if pointer.is_empty() {
                return Err(CorvusError::Index(
                    "bucket slots are created through splits only".to_string(),
                ));
            }
            let file_level = pointer.file_level();
            let page_index = pointer.page_index();

            let mut lock = self.store.write_page(file_level, page_index)?;

            let outcome = {
                let mut target =
                    BucketMut::new(&mut lock.guard, &self.key_codec, &self.value_codec);
                match target.as_bucket().index_of(key) {
                    Ok(index) => {
                        if target.update_entry_in_place(index, value) {
                            Outcome::Updated
                        } else {
                            // The encoded size changed: reinsert below.
                            target.delete_entry(index);
                            Outcome::Replaced
                        }
                    }
                    Err(_) => {
                        if target.add_entry(key, value) {
                            Outcome::Inserted
                        } else {
                            Outcome::Full
                        }
                    }
                }
            };

            match outcome {
                Outcome::Updated => return Ok(()),
                Outcome::Inserted => {
                    self.size += 1;
                    return Ok(());
                }
                Outcome::Replaced => {
                    self.size -= 1;
                    drop(lock);
                }
                Outcome::Full => {
                    let split = self.split_bucket(&mut lock, file_level, page_index)?;
                    self.apply_split_to_directory(&path, split);
                    drop(lock);

                    let drained = self.store.drain_split_buffer(false)?;
                    if drained > 0 {
                        self.metrics.on_split_buffer_drain(drained);
                    }
                }
            }
        }
    }

    /// Splits a full bucket: entries partition on the next hash bit into
    /// two fresh pages at the next file level, allocated from the level's
    /// tombstone chain when one exists. Both pages are staged; the source
    /// page is marked clean. The directory is not touched here.
    fn split_bucket(
        &mut self,
        source: &mut PageWriteLock,
        file_level: usize,
        page_index: u64,
    ) -> Result<BucketSplitResult> {
        let (bucket_depth, history, entries) = {
            let source_bucket = Bucket::new(&source.guard, &self.key_codec, &self.value_codec);
            debug_assert!(self.check_bucket_depth(&source_bucket));
            (
                source_bucket.depth(),
                source_bucket.split_history_snapshot(),
                source_bucket.iter().collect::<Vec<_>>(),
            )
        };

        let new_bucket_depth = bucket_depth + 1;
        let new_file_level = (new_bucket_depth - MAX_LEVEL_DEPTH) as usize;
        self.store.ensure_level(new_file_level)?;

        let tombstone_index = self.store.level(new_file_level).tombstone_index;
        let updated_bucket_index = if tombstone_index >= 0 {
            let next = {
                let tombstone_lock = self.store.read_page(new_file_level, tombstone_index as u64)?;
                let tombstone =
                    Bucket::new(&tombstone_lock.guard, &self.key_codec, &self.value_codec);
                tombstone.next_removed_bucket_pair()
            };
            self.store.level_mut(new_file_level).tombstone_index = next;
            tombstone_index as u64
        } else {
            self.store.filled_up_to(new_file_level)?
        };
        let new_bucket_index = updated_bucket_index + 1;

        let (updated_pointer, mut updated_guard) =
            self.store.allocate_page(new_file_level, updated_bucket_index)?;
        let (new_pointer, mut new_guard) =
            self.store.allocate_page(new_file_level, new_bucket_index)?;

        {
            let mut updated_bucket =
                BucketMut::new(&mut updated_guard, &self.key_codec, &self.value_codec);
            let mut new_bucket = BucketMut::new(&mut new_guard, &self.key_codec, &self.value_codec);

            updated_bucket.init_from_split(new_bucket_depth, &history, file_level, page_index);
            new_bucket.init_from_split(new_bucket_depth, &history, file_level, page_index);

            for entry in &entries {
                let appended = if (self.hasher.hash(&entry.key) >> (64 - new_bucket_depth)) & 1 == 0
                {
                    updated_bucket.append_entry(&entry.key, &entry.value)
                } else {
                    new_bucket.append_entry(&entry.key, &entry.value)
                };
                debug_assert!(appended, "split halves must fit their partitions");
            }

            debug_assert!(self.check_bucket_depth(&updated_bucket.as_bucket()));
            debug_assert!(self.check_bucket_depth(&new_bucket.as_bucket()));
        }
        drop(updated_guard);
        drop(new_guard);

        self.store.level_mut(file_level).buckets_count -= 1;
        debug_assert!(self.store.level(file_level).buckets_count >= 0);
        self.store.level_mut(new_file_level).buckets_count += 2;

        self.store
            .stage(new_file_level, updated_bucket_index, updated_pointer);
        self.store.stage(new_file_level, new_bucket_index, new_pointer);

        // The source page is dead once the directory flips.
        self.store.clear_dirty(file_level, page_index, source.from_cache);

        self.metrics.on_bucket_split(new_file_level);

        Ok(BucketSplitResult {
            updated_bucket_pointer: DirectorySlot::bucket(updated_bucket_index, new_file_level),
            new_bucket_pointer: DirectorySlot::bucket(new_bucket_index, new_file_level),
            new_depth: new_bucket_depth,
        })
    }

    /// Publishes a split through the directory: an in-node interval
    /// rewrite when the node is deep enough, a node split while it can
    /// still grow, or a fresh child level otherwise.
    fn apply_split_to_directory(&mut self, path: &BucketPath, split: BucketSplitResult) {
        let bucket_depth = split.new_depth;

        if bucket_depth <= path.node_global_depth {
            self.directory.update_node_after_bucket_split(
                path,
                bucket_depth,
                split.new_bucket_pointer,
                split.updated_bucket_pointer,
            );
            return;
        }

        if path.node_local_depth < MAX_LEVEL_DEPTH {
            let node_split = self.directory.split_node(path);
            self.metrics.on_node_split();

            debug_assert!(
                !(node_split.all_left_hash_maps_equal && node_split.all_right_hash_maps_equal)
            );

            let new_node = node_split.new_node;
            let node_local_depth = path.node_local_depth + 1;
            let hash_map_size = 1usize << node_local_depth;

            let updated_item_index = path.item_index << 1;
            let updated_offset = path.hash_map_offset << 1;
            let updated_global_depth = path.node_global_depth + 1;

            let mut all_left_equal = node_split.all_left_hash_maps_equal;
            let mut all_right_equal = node_split.all_right_hash_maps_equal;

            let mut new_node_index = None;
            if !all_right_equal || updated_offset >= MAX_LEVEL_SIZE {
                new_node_index = Some(
                    self.directory
                        .add_node(Box::new(*new_node), node_local_depth),
                );
            }

            if updated_offset < MAX_LEVEL_SIZE {
                all_left_equal = false;
                let updated_path = BucketPath::new(
                    path.parent.clone(),
                    updated_offset,
                    updated_item_index,
                    path.node_index,
                    node_local_depth,
                    updated_global_depth,
                );
                self.directory.update_node_after_bucket_split(
                    &updated_path,
                    bucket_depth,
                    split.new_bucket_pointer,
                    split.updated_bucket_pointer,
                );
            } else {
                all_right_equal = false;
                let new_path = BucketPath::new(
                    path.parent.clone(),
                    updated_offset - MAX_LEVEL_SIZE,
                    updated_item_index,
                    new_node_index.expect("right-half target without a node"),
                    node_local_depth,
                    updated_global_depth,
                );
                self.directory.update_node_after_bucket_split(
                    &new_path,
                    bucket_depth,
                    split.new_bucket_pointer,
                    split.updated_bucket_pointer,
                );
            }

            self.directory.update_nodes_after_split(
                path,
                &new_node,
                node_local_depth,
                hash_map_size,
                all_left_equal,
                all_right_equal,
                new_node_index,
            );

            if all_left_equal {
                self.directory.delete_node(path.node_index);
            }
            return;
        }

        self.directory
            .add_new_level_node(path, split.new_bucket_pointer, split.updated_bucket_pointer);
    }

    fn remove(&mut self, key: &KC::Value) -> Result<bool> {
        let hash = self.hasher.hash(key);
        let (path, pointer) = self.resolve(hash)?;
        if pointer.is_empty() {
            return Ok(false);
        }
        let file_level = pointer.file_level();
        let page_index = pointer.page_index();

        let mut lock = self.store.write_page(file_level, page_index)?;

        let removed = {
            let mut target = BucketMut::new(&mut lock.guard, &self.key_codec, &self.value_codec);
            match target.as_bucket().index_of(key) {
                Ok(index) => {
                    target.delete_entry(index);
                    true
                }
                Err(_) => false,
            }
        };
        if !removed {
            return Ok(false);
        }
        self.size -= 1;

        self.merge_buckets_after_deletion(&path, &mut lock, file_level, page_index)?;
        drop(lock);

        if path.parent.is_some() {
            let hash_map_size = 1usize << path.node_local_depth;
            if self
                .directory
                .node_maps_same_bucket(path.node_index, hash_map_size)
            {
                self.directory.merge_node_to_parent(&path);
                self.metrics.on_node_merge();
            }
        }

        Ok(true)
    }

    /// Merges an underfull bucket with its split buddy back into their
    /// parent page one level down. Returns true when the merge happened.
    fn merge_buckets_after_deletion(
        &mut self,
        path: &BucketPath,
        source: &mut PageWriteLock,
        file_level: usize,
        page_index: u64,
    ) -> Result<bool> {
        let (bucket_depth, content_size) = {
            let source_bucket = Bucket::new(&source.guard, &self.key_codec, &self.value_codec);
            (source_bucket.depth(), source_bucket.content_size())
        };

        if content_size as f64 > self.options.bucket_page_size as f64 * MERGE_THRESHOLD {
            return Ok(false);
        }
        if bucket_depth < MAX_LEVEL_DEPTH + 1 {
            // Level-0 buckets have no buddy to merge with.
            return Ok(false);
        }

        // Walk up to the node whose bits cover depth - 1 and locate the
        // buddy interval produced by the last split.
        let mut offset = path.node_global_depth as i64 - (bucket_depth as i64 - 1);
        let mut current = path;
        let mut node_local_depth = path.node_local_depth;
        while offset > 0 {
            offset -= node_local_depth as i64;
            if offset > 0 {
                current = match current.parent.as_deref() {
                    Some(parent) => parent,
                    None => return Ok(false),
                };
                node_local_depth = current.node_local_depth;
            }
        }

        let diff = (bucket_depth as i64
            - 1
            - (current.node_global_depth as i64 - node_local_depth as i64))
            as u32;
        let interval = 1usize << (node_local_depth - diff - 1);

        let first_start_index =
            current.item_index & ((LEVEL_MASK << (node_local_depth - diff)) & LEVEL_MASK);
        let first_end_index = first_start_index + interval;
        let second_start_index = first_end_index;
        let second_end_index = second_start_index + interval;

        let buddy_slot_index = if (current.item_index >> (node_local_depth - diff - 1)) & 1 == 1 {
            first_start_index
        } else {
            second_start_index
        };
        let buddy_pointer = self.directory.resolve_slot(self.directory.slot(
            current.node_index,
            buddy_slot_index + current.hash_map_offset,
        ));
        debug_assert!(buddy_pointer.is_bucket());

        let buddy_level = buddy_pointer.file_level();
        let buddy_index = buddy_pointer.page_index();

        let buddy_lock = self.store.write_page(buddy_level, buddy_index)?;

        let (buddy_depth, merged_size) = {
            let source_bucket = Bucket::new(&source.guard, &self.key_codec, &self.value_codec);
            let buddy_bucket = Bucket::new(&buddy_lock.guard, &self.key_codec, &self.value_codec);
            (
                buddy_bucket.depth(),
                source_bucket.merged_size(&buddy_bucket),
            )
        };

        if buddy_depth != bucket_depth {
            // The buddy has split further; nothing to merge with.
            self.store
                .clear_dirty(buddy_level, buddy_index, buddy_lock.from_cache);
            return Ok(false);
        }
        if merged_size >= self.options.bucket_page_size {
            self.store
                .clear_dirty(buddy_level, buddy_index, buddy_lock.from_cache);
            return Ok(false);
        }

        let parent_page_index = {
            let buddy_bucket = Bucket::new(&buddy_lock.guard, &self.key_codec, &self.value_codec);
            buddy_bucket.split_history(buddy_level - 1)
        };

        let new_buddy_level = buddy_level - 1;
        let new_buddy_index = parent_page_index as u64;

        self.store.level_mut(buddy_level).buckets_count -= 2;
        self.store.level_mut(new_buddy_level).buckets_count += 1;

        {
            let mut parent_lock = self.store.write_page(new_buddy_level, new_buddy_index)?;
            let mut merged =
                BucketMut::new(&mut parent_lock.guard, &self.key_codec, &self.value_codec);
            merged.init(bucket_depth - 1);

            let buddy_bucket = Bucket::new(&buddy_lock.guard, &self.key_codec, &self.value_codec);
            for entry in buddy_bucket.iter() {
                let appended = merged.append_entry(&entry.key, &entry.value);
                debug_assert!(appended);
            }
            let source_bucket = Bucket::new(&source.guard, &self.key_codec, &self.value_codec);
            for entry in source_bucket.iter() {
                let added = merged.add_entry(&entry.key, &entry.value);
                debug_assert!(added);
            }
        }

        let merged_pointer = DirectorySlot::bucket(new_buddy_index, new_buddy_level);
        for i in first_start_index..second_end_index {
            self.directory.update_bucket(
                current.node_index,
                i,
                current.hash_map_offset,
                merged_pointer,
            );
        }

        // Free the dead pair: the lower index heads the tombstone chain,
        // carrying the old head in its page. The page that hosts the
        // chain link keeps its dirty flag so the link reaches disk; the
        // other page's writeback is dropped.
        if self.store.level(buddy_level).buckets_count > 0 {
            let old_head = self.store.level(buddy_level).tombstone_index;
            let mut buddy_lock = buddy_lock;
            if page_index < buddy_index {
                let mut source_bucket =
                    BucketMut::new(&mut source.guard, &self.key_codec, &self.value_codec);
                source_bucket.set_next_removed_bucket_pair(old_head);
                self.store.level_mut(buddy_level).tombstone_index = page_index as i64;
                self.store
                    .clear_dirty(buddy_level, buddy_index, buddy_lock.from_cache);
            } else {
                let mut buddy_bucket =
                    BucketMut::new(&mut buddy_lock.guard, &self.key_codec, &self.value_codec);
                buddy_bucket.set_next_removed_bucket_pair(old_head);
                self.store.level_mut(buddy_level).tombstone_index = buddy_index as i64;
                self.store.clear_dirty(buddy_level, page_index, source.from_cache);
            }
        } else {
            self.store.level_mut(buddy_level).tombstone_index = -1;
            self.store
                .clear_dirty(buddy_level, buddy_index, buddy_lock.from_cache);
            self.store.clear_dirty(buddy_level, page_index, source.from_cache);
        }

        self.metrics.on_bucket_merge(buddy_level);
        Ok(true)
    }

    /// Forward range scan: `ceiling` keeps an exact match, otherwise the
    /// scan starts strictly after it.
    fn forward_entries(
        &self,
        key: &KC::Value,
        ceiling: bool,
    ) -> Result<Vec<Entry<KC::Value, VC::Value>>> {
        let hash = self.hasher.hash(key);
        let (mut path, mut pointer) = self.resolve(hash)?;
        if pointer.is_empty() {
            return Ok(Vec::new());
        }

        let mut lock = self
            .store
            .read_page(pointer.file_level(), pointer.page_index())?;

        loop {
            let (exhausted, depth) = {
                let target = Bucket::new(&lock.guard, &self.key_codec, &self.value_codec);
                let exhausted = if target.size() == 0 {
                    true
                } else if ceiling {
                    false
                } else {
                    target.key_at(target.size() - 1) <= *key
                };
                (exhausted, target.depth())
            };
            if !exhausted {
                break;
            }

            let Some(next) = self.directory.next_bucket_to_find(&path, depth) else {
                return Ok(Vec::new());
            };
            drop(lock);

            path = next;
            pointer = self
                .directory
                .slot(path.node_index, path.item_index + path.hash_map_offset);
            lock = self
                .store
                .read_page(pointer.file_level(), pointer.page_index())?;
        }

        let target = Bucket::new(&lock.guard, &self.key_codec, &self.value_codec);
        let start_index = match target.index_of(key) {
            Ok(index) => {
                if ceiling {
                    index
                } else {
                    index + 1
                }
            }
            Err(insertion) => insertion,
        };
        Ok(target.iter_from(start_index).collect())
    }

    /// Backward range scan: `floor` keeps an exact match, otherwise the
    /// scan ends strictly before it.
    fn backward_entries(
        &self,
        key: &KC::Value,
        floor: bool,
    ) -> Result<Vec<Entry<KC::Value, VC::Value>>> {
        let hash = self.hasher.hash(key);
        let (mut path, mut pointer) = self.resolve(hash)?;
        if pointer.is_empty() {
            return Ok(Vec::new());
        }

        let mut lock = self
            .store
            .read_page(pointer.file_level(), pointer.page_index())?;

        loop {
            let (exhausted, depth) = {
                let target = Bucket::new(&lock.guard, &self.key_codec, &self.value_codec);
                let exhausted = if target.size() == 0 {
                    true
                } else if floor {
                    false
                } else {
                    target.key_at(0) >= *key
                };
                (exhausted, target.depth())
            };
            if !exhausted {
                break;
            }

            let Some(prev) = self.directory.prev_bucket_to_find(&path, depth) else {
                return Ok(Vec::new());
            };
            drop(lock);

            path = prev;
            pointer = self
                .directory
                .slot(path.node_index, path.item_index + path.hash_map_offset);
            lock = self
                .store
                .read_page(pointer.file_level(), pointer.page_index())?;
        }

        let target = Bucket::new(&lock.guard, &self.key_codec, &self.value_codec);
        let end_index = match target.index_of(key) {
            Ok(index) => {
                if floor {
                    index + 1
                } else {
                    index
                }
            }
            Err(insertion) => insertion,
        };
        let mut entries: Vec<_> = target.iter_from(0).collect();
        entries.truncate(end_index);
        Ok(entries)
    }

    fn clear(&mut self) -> Result<()> {
        self.store.truncate_all()?;
        self.bucket_tombstone_pointer = -1;
        self.init_hash_tree_state()?;
        self.persist_state()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let drained = self.store.drain_split_buffer(true)?;
        if drained > 0 {
            self.metrics.on_split_buffer_drain(drained);
        }
        self.store.flush_files()?;
        self.persist_state()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let drained = self.store.drain_split_buffer(true)?;
        if drained > 0 {
            self.metrics.on_split_buffer_drain(drained);
        }
        self.persist_state()?;
        self.store.close_all()?;
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        self.store.delete_all()?;
        self.metadata_store.delete()?;
        self.tree_state_store.delete()?;
        Ok(())
    }

    /// Every entry routed to a bucket shares its top `depth` hash bits.
    fn check_bucket_depth(&self, target: &Bucket<'_, KC, VC>) -> bool {
        let depth = target.depth();
        if target.size() == 0 {
            return true;
        }

        let first = self.hasher.hash(&target.key_at(0)) >> (64 - depth);
        (1..target.size()).all(|i| self.hasher.hash(&target.key_at(i)) >> (64 - depth) == first)
    }
}
