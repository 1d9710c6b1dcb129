//! Configuration structures for CorvusDB storage components.

use crate::error::{CorvusError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default bucket page size in bytes (64 KiB).
pub const DEFAULT_BUCKET_PAGE_SIZE: usize = 64 * 1024;

/// Default number of staged split pages before the split buffer is drained.
pub const DEFAULT_SPLIT_BUFFER_CAPACITY: usize = 1500;

/// Smallest bucket page the index accepts. The fixed bucket header plus one
/// slot must leave room for at least one small entry.
pub const MIN_BUCKET_PAGE_SIZE: usize = 1024;

/// Options for a single hash index instance.
///
/// Replaces global configuration: every tunable the index consults is
/// carried here and fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Size of one bucket page in bytes.
    pub bucket_page_size: usize,
    /// Number of staged split pages that triggers a split-buffer drain.
    pub split_buffer_capacity: usize,
    /// When true, an entry that cannot fit into an empty bucket surfaces
    /// an error; when false it is dropped with a warning.
    pub error_on_oversize_key: bool,
    /// Extension of the per-level bucket files.
    pub bucket_file_extension: String,
    /// Extension of the metadata file.
    pub metadata_file_extension: String,
    /// Extension of the directory tree state file.
    pub tree_state_file_extension: String,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            bucket_page_size: DEFAULT_BUCKET_PAGE_SIZE,
            split_buffer_capacity: DEFAULT_SPLIT_BUFFER_CAPACITY,
            error_on_oversize_key: false,
            bucket_file_extension: ".hib".to_string(),
            metadata_file_extension: ".him".to_string(),
            tree_state_file_extension: ".hit".to_string(),
        }
    }
}

impl IndexOptions {
    /// Validates the options, returning a configuration error for values
    /// the index cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_page_size < MIN_BUCKET_PAGE_SIZE {
            return Err(CorvusError::Configuration(format!(
                "bucket page size {} is below the minimum of {}",
                self.bucket_page_size, MIN_BUCKET_PAGE_SIZE
            )));
        }
        if self.split_buffer_capacity == 0 {
            return Err(CorvusError::Configuration(
                "split buffer capacity must be at least 1".to_string(),
            ));
        }
        for (name, ext) in [
            ("bucket", &self.bucket_file_extension),
            ("metadata", &self.metadata_file_extension),
            ("tree state", &self.tree_state_file_extension),
        ] {
            if ext.is_empty() {
                return Err(CorvusError::Configuration(format!(
                    "{name} file extension must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for the page cache and its backing files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory for page files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}
