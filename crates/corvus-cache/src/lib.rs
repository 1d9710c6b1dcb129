//! CorvusDB page files and write-through page cache.
//!
//! Storage structures obtain page images through [`PageCache`] under
//! per-page latches. The cache is write-through with resident frames;
//! replacement policy lives above this crate.

pub mod cache;
pub mod file_store;
pub mod frame;

pub use cache::PageCache;
pub use file_store::FileStore;
pub use frame::{new_page, page_from, PagePointer, PageReadGuard, PageWriteGuard};
