//! CorvusDB on-disk extendible hash index.
//!
//! Maps codec-typed keys to values through a persistent, directory-based
//! extendible hashing structure backed by the page cache. Unique,
//! non-unique and full-text index variants layer on top of this core.

pub mod hash;

pub use hash::{Entry, HashIndex, MetricsSink, NoopMetrics};
