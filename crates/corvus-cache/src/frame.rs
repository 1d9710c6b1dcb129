//! Page frames and shared page pointers.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::sync::Arc;

/// Shared handle to an in-memory page image.
///
/// The page bytes live behind a per-page latch; a pointer may be held by
/// the cache, by the index's split staging, or by both. The last owner to
/// drop the pointer frees the page.
pub type PagePointer = Arc<RwLock<Box<[u8]>>>;

/// Owned read latch on a page.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;

/// Owned write latch on a page.
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Allocates a zeroed page of the given size.
pub fn new_page(page_size: usize) -> PagePointer {
    Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice()))
}

/// Wraps an existing page image in a pointer.
pub fn page_from(data: Box<[u8]>) -> PagePointer {
    Arc::new(RwLock::new(data))
}

/// A cached page and its bookkeeping flags.
///
/// Flags are guarded by the cache's frame-table lock; the page bytes are
/// guarded by the pointer's own latch.
pub struct Frame {
    /// The page image.
    pub page: PagePointer,
    /// The page was modified and must be written back on flush.
    pub dirty: bool,
    /// The page is owned outside the cache (split staging); writeback is
    /// suppressed until the flag is cleared.
    pub external: bool,
}

impl Frame {
    /// Creates a resident frame for a page loaded from disk.
    pub fn resident(page: PagePointer) -> Self {
        Self {
            page,
            dirty: false,
            external: false,
        }
    }

    /// Creates an externally-managed frame.
    pub fn external(page: PagePointer) -> Self {
        Self {
            page,
            dirty: false,
            external: true,
        }
    }
}
