//! CorvusDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all CorvusDB storage
//! components: the workspace error type, configuration structures, binary
//! codecs for typed keys and values, key hashing, and the readers-writer
//! spin lock that gates index operations.

pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod rwlock;

pub use codec::{BinaryCodec, I64Codec, StringCodec, U64Codec};
pub use config::{CacheConfig, IndexOptions};
pub use error::{CorvusError, Result};
pub use hash::{KeyHasher, Murmur3KeyHasher};
pub use rwlock::ReadersWriterSpinLock;
