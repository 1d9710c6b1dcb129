//! Write-through page cache.
//!
//! Pages loaded through the cache stay resident until their file is
//! closed, truncated or deleted; replacement policy is the concern of a
//! higher layer. What the cache does provide is the contract index
//! structures rely on:
//!
//! - per-page latches, handed out as owned guards so release happens on
//!   every exit path;
//! - dirty tracking: acquiring a page for write marks its frame dirty,
//!   `flush_file` writes dirty frames back, `clear_dirty_flag` discards
//!   a logically dead page's writeback;
//! - externally-managed frames: pages allocated for split staging are
//!   flushed by their owner, not by the cache, until the external flag is
//!   cleared;
//! - `cache_hit` registration for pages the owner touched outside the
//!   cache.

use crate::file_store::FileStore;
use crate::frame::{new_page, page_from, Frame, PagePointer, PageReadGuard, PageWriteGuard};
use corvus_common::{CacheConfig, CorvusError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Frames of one open file.
struct FileFrames {
    page_size: usize,
    frames: HashMap<u64, Frame>,
}

/// Write-through page cache over a [`FileStore`].
pub struct PageCache {
    store: FileStore,
    files: Mutex<HashMap<String, FileFrames>>,
}

impl PageCache {
    /// Creates a page cache rooted at the configured data directory.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Ok(Self {
            store: FileStore::new(config)?,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the backing file store.
    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Opens or creates a page file and registers its frame table.
    pub fn open_file(&self, name: &str, page_size: usize) -> Result<()> {
        tracing::debug!(file = name, page_size, "opening page file");
        self.store.open(name, page_size)?;

        let mut files = self.files.lock();
        files.entry(name.to_string()).or_insert_with(|| FileFrames {
            page_size,
            frames: HashMap::new(),
        });
        Ok(())
    }

    /// Returns true if the page is resident in the cache.
    pub fn contains(&self, name: &str, page_index: u64) -> bool {
        self.files
            .lock()
            .get(name)
            .is_some_and(|file| file.frames.contains_key(&page_index))
    }

    /// Loads a page (from the cache, or from disk on a miss) and returns
    /// its pointer. Pages past the end of the file come into existence
    /// zeroed, extending the file.
    fn load(&self, name: &str, page_index: u64, for_write: bool) -> Result<PagePointer> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(name)
            .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;

        if let Some(frame) = file.frames.get_mut(&page_index) {
            if for_write && !frame.external {
                frame.dirty = true;
            }
            return Ok(frame.page.clone());
        }

        let page = if page_index < self.store.page_count(name)? {
            page_from(self.store.read_page(name, page_index)?)
        } else {
            self.store.ensure_page(name, page_index)?;
            new_page(file.page_size)
        };

        let mut frame = Frame::resident(page.clone());
        frame.dirty = for_write;
        file.frames.insert(page_index, frame);

        Ok(page)
    }

    /// Loads a page and acquires its read latch.
    pub fn load_and_lock_for_read(&self, name: &str, page_index: u64) -> Result<PageReadGuard> {
        Ok(self.load(name, page_index, false)?.read_arc())
    }

    /// Loads a page, marks it dirty, and acquires its write latch.
    pub fn load_and_lock_for_write(&self, name: &str, page_index: u64) -> Result<PageWriteGuard> {
        Ok(self.load(name, page_index, true)?.write_arc())
    }

    /// Allocates (or reclaims) a page as externally managed and acquires
    /// its write latch. The file is extended if needed; the cache will not
    /// write the page back until the external flag is cleared.
    pub fn allocate_and_lock_for_write(
        &self,
        name: &str,
        page_index: u64,
    ) -> Result<(PagePointer, PageWriteGuard)> {
        let page = {
            let mut files = self.files.lock();
            let file = files
                .get_mut(name)
                .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;

            self.store.ensure_page(name, page_index)?;

            match file.frames.get_mut(&page_index) {
                Some(frame) => {
                    frame.dirty = false;
                    frame.external = true;
                    frame.page.clone()
                }
                None => {
                    let page = new_page(file.page_size);
                    file.frames.insert(page_index, Frame::external(page.clone()));
                    page
                }
            }
        };

        let guard = page.write_arc();
        Ok((page, guard))
    }

    /// Acquires the write latch of a resident page; `None` on a miss.
    pub fn get_and_lock_for_write(&self, name: &str, page_index: u64) -> Option<PageWriteGuard> {
        let page = {
            let files = self.files.lock();
            files.get(name)?.frames.get(&page_index)?.page.clone()
        };
        Some(page.write_arc())
    }

    /// Registers an externally-held page so the cache tracks it.
    pub fn cache_hit(&self, name: &str, page_index: u64, pointer: &PagePointer) {
        let mut files = self.files.lock();
        if let Some(file) = files.get_mut(name) {
            file.frames
                .entry(page_index)
                .or_insert_with(|| Frame::external(pointer.clone()));
        }
    }

    /// Drops a page's pending writeback.
    pub fn clear_dirty_flag(&self, name: &str, page_index: u64) {
        let mut files = self.files.lock();
        if let Some(frame) = files.get_mut(name).and_then(|f| f.frames.get_mut(&page_index)) {
            frame.dirty = false;
        }
    }

    /// Returns a page to cache-managed writeback.
    pub fn clear_external_management_flag(&self, name: &str, page_index: u64) {
        let mut files = self.files.lock();
        if let Some(frame) = files.get_mut(name).and_then(|f| f.frames.get_mut(&page_index)) {
            frame.external = false;
        }
    }

    /// Writes the given page image straight through to disk and clears the
    /// frame's dirty flag.
    pub fn flush_data(&self, name: &str, page_index: u64, data: &[u8]) -> Result<()> {
        self.store.write_page(name, page_index, data)?;
        self.clear_dirty_flag(name, page_index);
        Ok(())
    }

    /// Writes back every dirty, cache-managed frame of a file and syncs it.
    pub fn flush_file(&self, name: &str) -> Result<()> {
        let dirty: Vec<(u64, PagePointer)> = {
            let files = self.files.lock();
            let file = files
                .get(name)
                .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;
            file.frames
                .iter()
                .filter(|(_, frame)| frame.dirty && !frame.external)
                .map(|(&index, frame)| (index, frame.page.clone()))
                .collect()
        };

        for (page_index, page) in dirty {
            let guard = page.read_arc();
            self.store.write_page(name, page_index, &guard)?;
            self.clear_dirty_flag(name, page_index);
        }

        self.store.flush(name)?;
        Ok(())
    }

    /// Drops all frames of a file and truncates it to zero pages.
    pub fn truncate_file(&self, name: &str) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(file) = files.get_mut(name) {
            file.frames.clear();
        }
        self.store.truncate(name)
    }

    /// Flushes and closes a file, dropping its frames.
    pub fn close_file(&self, name: &str) -> Result<()> {
        self.flush_file(name)?;
        self.files.lock().remove(name);
        self.store.close(name)
    }

    /// Deletes a file, dropping its frames.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        tracing::debug!(file = name, "deleting page file");
        self.files.lock().remove(name);
        self.store.delete(name)
    }

    /// Number of pages currently allocated in the file.
    pub fn filled_up_to(&self, name: &str) -> Result<u64> {
        self.store.page_count(name)
    }
}
