//! On-disk extendible hash index.
//!
//! A directory of nested 256-slot nodes routes the high bits of a 64-bit
//! key hash to bucket pages:
//!
//! ```text
//!                 hash = 0bxxxxxxxx yyyyyyyy ...
//!                          |------| routed by the root node
//! root node ──slot──> bucket pointer            (common case)
//!            ──slot──> child node ── routes the next 8 bits ──> ...
//! ```
//!
//! Buckets of hash depth `d` live in file level `d - 8`, one page file
//! per level. A full bucket splits: its entries partition on the next
//! hash bit into two pages one level up, and the directory interval that
//! routed to it is rewritten to the two new pointers, doubling a node or
//! growing a child level when the prefix runs out of slots. An underfull
//! bucket merges back with its split buddy into the page recorded in its
//! split history, and freed page pairs chain through level tombstones for
//! reuse.
//!
//! Freshly-split pages are staged in a split buffer that page lookups
//! consult before the cache, and are flushed in bulk once the staging
//! threshold is crossed. Directory and per-level metadata checkpoint to
//! two small state files on flush and close.

pub mod bucket;
pub mod constants;
pub mod directory;
pub mod index;
pub mod metrics;
pub mod split_buffer;
pub mod state;
pub mod store;
pub mod types;

pub use bucket::{Bucket, BucketMut};
pub use constants::{MAX_FILE_LEVELS, MAX_LEVEL_DEPTH, MAX_LEVEL_SIZE, MERGE_THRESHOLD};
pub use directory::Directory;
pub use index::HashIndex;
pub use metrics::{MetricsSink, NoopMetrics};
pub use types::{BucketPath, DirectorySlot, Entry, LevelMetadata};
