//! Staging area for freshly-split bucket pages.
//!
//! A split writes its two result pages here before the directory flip
//! publishes them; page lookups consult this buffer before the cache so
//! an operation observes the pages as already written. Ordered maps give
//! the drain a deterministic order: levels ascending, then page index
//! ascending.

use super::constants::MAX_FILE_LEVELS;
use corvus_cache::PagePointer;
use std::collections::BTreeMap;

/// Per-level map of staged pages.
pub struct SplitBuffer {
    levels: Vec<BTreeMap<u64, PagePointer>>,
    len: usize,
}

impl SplitBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            levels: (0..MAX_FILE_LEVELS).map(|_| BTreeMap::new()).collect(),
            len: 0,
        }
    }

    /// Number of staged pages across all levels.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Looks up a staged page.
    pub fn get(&self, file_level: usize, page_index: u64) -> Option<&PagePointer> {
        self.levels[file_level].get(&page_index)
    }

    /// Stages a page.
    pub fn insert(&mut self, file_level: usize, page_index: u64, pointer: PagePointer) {
        if self.levels[file_level].insert(page_index, pointer).is_none() {
            self.len += 1;
        }
    }

    /// Removes a staged page.
    pub fn remove(&mut self, file_level: usize, page_index: u64) -> Option<PagePointer> {
        let removed = self.levels[file_level].remove(&page_index);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Takes every staged page in drain order.
    pub fn take_all(&mut self) -> Vec<(usize, u64, PagePointer)> {
        let mut drained = Vec::with_capacity(self.len);
        for (level, pages) in self.levels.iter_mut().enumerate() {
            for (page_index, pointer) in std::mem::take(pages) {
                drained.push((level, page_index, pointer));
            }
        }
        self.len = 0;
        drained
    }

    /// Drops everything staged for one level.
    pub fn clear_level(&mut self, file_level: usize) {
        self.len -= self.levels[file_level].len();
        self.levels[file_level].clear();
    }
}

impl Default for SplitBuffer {
    fn default() -> Self {
        Self::new()
    }
}
