//! The bucket store: per-level page files, tombstone chains, and the
//! split-buffer-first page lock discipline.
//!
//! Buckets of hash depth `d` live in file level `d - MAX_LEVEL_DEPTH`;
//! each level is its own page file, opened lazily when the first split
//! reaches it. Page acquisition consults the split staging buffer before
//! the cache, so freshly-split pages are observed before the directory
//! flip publishes them.

use super::constants::MAX_FILE_LEVELS;
use super::split_buffer::SplitBuffer;
use super::types::LevelMetadata;
use corvus_cache::{PageCache, PagePointer, PageReadGuard, PageWriteGuard};
use corvus_common::{CorvusError, IndexOptions, Result};
use std::sync::Arc;

/// A page held under a read latch, with its acquisition source.
pub struct PageReadLock {
    /// The latched page bytes.
    pub guard: PageReadGuard,
    /// True when the page came through the cache rather than the split
    /// staging buffer.
    pub from_cache: bool,
}

/// A page held under a write latch, with its acquisition source.
pub struct PageWriteLock {
    /// The latched page bytes.
    pub guard: PageWriteGuard,
    /// True when the page came through the cache rather than the split
    /// staging buffer.
    pub from_cache: bool,
}

/// Per-level bucket page storage for one index.
pub struct BucketStore {
    cache: Arc<PageCache>,
    name: String,
    extension: String,
    page_size: usize,
    split_buffer_capacity: usize,
    levels: Vec<Option<LevelMetadata>>,
    split_buffer: SplitBuffer,
}

impl BucketStore {
    /// Creates a store for the named index. No files are touched until a
    /// level is ensured.
    pub fn new(cache: Arc<PageCache>, name: &str, options: &IndexOptions) -> Self {
        Self {
            cache,
            name: name.to_string(),
            extension: options.bucket_file_extension.clone(),
            page_size: options.bucket_page_size,
            split_buffer_capacity: options.split_buffer_capacity,
            levels: vec![None; MAX_FILE_LEVELS],
            split_buffer: SplitBuffer::new(),
        }
    }

    /// File name of one level.
    pub fn file_name(&self, file_level: usize) -> String {
        format!("{}{}{}", self.name, file_level, self.extension)
    }

    /// Creates the level's metadata and opens its file if needed.
    pub fn ensure_level(&mut self, file_level: usize) -> Result<()> {
        if self.levels[file_level].is_none() {
            self.cache
                .open_file(&self.file_name(file_level), self.page_size)?;
            self.levels[file_level] = Some(LevelMetadata::new());
        }
        Ok(())
    }

    /// Metadata of a level that must exist.
    pub fn level(&self, file_level: usize) -> &LevelMetadata {
        self.levels[file_level]
            .as_ref()
            .expect("file level has no metadata")
    }

    /// Mutable metadata of a level that must exist.
    pub fn level_mut(&mut self, file_level: usize) -> &mut LevelMetadata {
        self.levels[file_level]
            .as_mut()
            .expect("file level has no metadata")
    }

    /// Per-level metadata for persistence.
    pub fn levels(&self) -> &[Option<LevelMetadata>] {
        &self.levels
    }

    /// Restores per-level metadata on open, reopening the level files.
    pub fn restore_levels(&mut self, levels: Vec<Option<LevelMetadata>>) -> Result<()> {
        debug_assert_eq!(levels.len(), MAX_FILE_LEVELS);
        for (file_level, metadata) in levels.iter().enumerate() {
            if metadata.is_some() {
                self.cache
                    .open_file(&self.file_name(file_level), self.page_size)?;
            }
        }
        self.levels = levels;
        Ok(())
    }

    /// Acquires a page read latch, split buffer first.
    pub fn read_page(&self, file_level: usize, page_index: u64) -> Result<PageReadLock> {
        if let Some(pointer) = self.split_buffer.get(file_level, page_index) {
            self.cache
                .cache_hit(&self.file_name(file_level), page_index, pointer);
            return Ok(PageReadLock {
                guard: pointer.read_arc(),
                from_cache: false,
            });
        }

        Ok(PageReadLock {
            guard: self
                .cache
                .load_and_lock_for_read(&self.file_name(file_level), page_index)?,
            from_cache: true,
        })
    }

    /// Acquires a page write latch, split buffer first.
    pub fn write_page(&self, file_level: usize, page_index: u64) -> Result<PageWriteLock> {
        if let Some(pointer) = self.split_buffer.get(file_level, page_index) {
            self.cache
                .cache_hit(&self.file_name(file_level), page_index, pointer);
            return Ok(PageWriteLock {
                guard: pointer.write_arc(),
                from_cache: false,
            });
        }

        Ok(PageWriteLock {
            guard: self
                .cache
                .load_and_lock_for_write(&self.file_name(file_level), page_index)?,
            from_cache: true,
        })
    }

    /// Allocates a page as externally managed and write-latches it.
    pub fn allocate_page(
        &self,
        file_level: usize,
        page_index: u64,
    ) -> Result<(PagePointer, PageWriteGuard)> {
        self.cache
            .allocate_and_lock_for_write(&self.file_name(file_level), page_index)
    }

    /// Number of pages allocated in a level file.
    pub fn filled_up_to(&self, file_level: usize) -> Result<u64> {
        self.cache.filled_up_to(&self.file_name(file_level))
    }

    /// Stages a freshly-split page.
    pub fn stage(&mut self, file_level: usize, page_index: u64, pointer: PagePointer) {
        self.split_buffer.insert(file_level, page_index, pointer);
    }

    /// Number of staged pages.
    pub fn staged_pages(&self) -> usize {
        self.split_buffer.len()
    }

    /// Marks a page logically dead: its pending writeback is dropped, and
    /// a staged page is unstaged and handed back to the cache.
    pub fn clear_dirty(&mut self, file_level: usize, page_index: u64, from_cache: bool) {
        let file = self.file_name(file_level);
        if from_cache {
            self.cache.clear_dirty_flag(&file, page_index);
            return;
        }

        // The page was staged: drop it from the buffer; the cache copy
        // (if registered) becomes a plain clean frame.
        self.split_buffer.remove(file_level, page_index);
        self.cache.clear_dirty_flag(&file, page_index);
        self.cache.clear_external_management_flag(&file, page_index);
    }

    /// Drains the split buffer when it exceeds its capacity, or always
    /// when forced. Pages flush in deterministic order: levels ascending,
    /// page index ascending. Returns the number of pages drained.
    ///
    /// Must not be called while a staged page is latched by this thread.
    pub fn drain_split_buffer(&mut self, force: bool) -> Result<usize> {
        if !force && self.split_buffer.len() <= self.split_buffer_capacity {
            return Ok(0);
        }

        let staged = self.split_buffer.take_all();
        let drained = staged.len();

        for (file_level, page_index, pointer) in staged {
            let file = self.file_name(file_level);
            let resident = self.cache.contains(&file, page_index);
            {
                let guard = pointer.write_arc();
                self.cache.flush_data(&file, page_index, &guard)?;
            }
            if resident {
                self.cache.clear_external_management_flag(&file, page_index);
            }
            // A non-resident page is freed when `pointer` drops here.
        }

        if drained > 0 {
            tracing::debug!(index = %self.name, pages = drained, "drained split buffer");
        }
        Ok(drained)
    }

    /// Flushes every open level file.
    pub fn flush_files(&self) -> Result<()> {
        for file_level in 0..MAX_FILE_LEVELS {
            if self.levels[file_level].is_some() {
                self.cache.flush_file(&self.file_name(file_level))?;
            }
        }
        Ok(())
    }

    /// Truncates every open level file, dropping staged pages and
    /// resetting level metadata.
    pub fn truncate_all(&mut self) -> Result<()> {
        for file_level in 0..MAX_FILE_LEVELS {
            if self.levels[file_level].is_some() {
                self.cache.truncate_file(&self.file_name(file_level))?;
                self.split_buffer.clear_level(file_level);
                self.levels[file_level] = Some(LevelMetadata::new());
            }
        }
        Ok(())
    }

    /// Closes every open level file.
    pub fn close_all(&mut self) -> Result<()> {
        debug_assert!(self.split_buffer.is_empty(), "split buffer not drained");
        for file_level in 0..MAX_FILE_LEVELS {
            if self.levels[file_level].is_some() {
                self.cache.close_file(&self.file_name(file_level))?;
            }
        }
        Ok(())
    }

    /// Deletes every level file.
    pub fn delete_all(&mut self) -> Result<()> {
        for file_level in 0..MAX_FILE_LEVELS {
            if self.levels[file_level].take().is_some() {
                self.split_buffer.clear_level(file_level);
                self.cache.delete_file(&self.file_name(file_level))?;
            }
        }
        Ok(())
    }

    /// The index must observe a consistent page size across reopens.
    pub fn check_page_size(&self, persisted: i32) -> Result<()> {
        if persisted as usize != self.page_size {
            return Err(CorvusError::Configuration(format!(
                "index {} was created with {}-byte bucket pages, options say {}",
                self.name, persisted, self.page_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvus_common::CacheConfig;
    use tempfile::tempdir;

    fn options() -> IndexOptions {
        IndexOptions {
            bucket_page_size: 1024,
            split_buffer_capacity: 2,
            ..Default::default()
        }
    }

    fn create_store() -> (BucketStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(
            PageCache::new(CacheConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        (BucketStore::new(cache, "idx", &options()), dir)
    }

    #[test]
    fn test_level_file_naming() {
        let (store, _dir) = create_store();
        assert_eq!(store.file_name(0), "idx0.hib");
        assert_eq!(store.file_name(12), "idx12.hib");
    }

    #[test]
    fn test_ensure_level_creates_metadata_once() {
        let (mut store, dir) = create_store();

        store.ensure_level(0).unwrap();
        store.level_mut(0).buckets_count = 5;
        store.ensure_level(0).unwrap();

        assert_eq!(store.level(0).buckets_count, 5);
        assert!(dir.path().join("idx0.hib").exists());
    }

    #[test]
    fn test_staged_page_read_prefers_split_buffer() {
        let (mut store, _dir) = create_store();
        store.ensure_level(0).unwrap();

        let (pointer, mut guard) = store.allocate_page(0, 0).unwrap();
        guard[100] = 0x5C;
        drop(guard);
        store.stage(0, 0, pointer);

        let lock = store.read_page(0, 0).unwrap();
        assert!(!lock.from_cache);
        assert_eq!(lock.guard[100], 0x5C);
    }

    #[test]
    fn test_unstaged_page_reads_through_cache() {
        let (mut store, _dir) = create_store();
        store.ensure_level(0).unwrap();

        let lock = store.read_page(0, 3).unwrap();
        assert!(lock.from_cache);
        assert_eq!(store.filled_up_to(0).unwrap(), 4);
    }

    #[test]
    fn test_drain_respects_threshold() {
        let (mut store, _dir) = create_store();
        store.ensure_level(0).unwrap();

        for page_index in 0..2u64 {
            let (pointer, guard) = store.allocate_page(0, page_index).unwrap();
            drop(guard);
            store.stage(0, page_index, pointer);
        }

        // At capacity, not over it: nothing drains.
        assert_eq!(store.drain_split_buffer(false).unwrap(), 0);
        assert_eq!(store.staged_pages(), 2);

        let (pointer, guard) = store.allocate_page(0, 2).unwrap();
        drop(guard);
        store.stage(0, 2, pointer);
        assert_eq!(store.drain_split_buffer(false).unwrap(), 3);
        assert_eq!(store.staged_pages(), 0);
    }

    #[test]
    fn test_forced_drain_flushes_to_disk() {
        let (mut store, _dir) = create_store();
        store.ensure_level(1).unwrap();

        let (pointer, mut guard) = store.allocate_page(1, 0).unwrap();
        guard[0] = 0x77;
        drop(guard);
        store.stage(1, 0, pointer);

        assert_eq!(store.drain_split_buffer(true).unwrap(), 1);

        let raw = store.cache.store().read_page("idx1.hib", 0).unwrap();
        assert_eq!(raw[0], 0x77);
    }

    #[test]
    fn test_clear_dirty_unstages() {
        let (mut store, _dir) = create_store();
        store.ensure_level(0).unwrap();

        let (pointer, guard) = store.allocate_page(0, 0).unwrap();
        drop(guard);
        store.stage(0, 0, pointer);

        store.clear_dirty(0, 0, false);
        assert_eq!(store.staged_pages(), 0);
        // A later read falls through to the cache.
        assert!(store.read_page(0, 0).unwrap().from_cache);
    }

    #[test]
    fn test_check_page_size() {
        let (store, _dir) = create_store();
        assert!(store.check_page_size(1024).is_ok());
        assert!(matches!(
            store.check_page_size(4096),
            Err(CorvusError::Configuration(_))
        ));
    }
}
