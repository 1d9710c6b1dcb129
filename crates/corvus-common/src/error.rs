//! Error types for CorvusDB.

use thiserror::Error;

/// Result type alias using CorvusError.
pub type Result<T> = std::result::Result<T, CorvusError>;

/// Errors that can occur in CorvusDB index and cache operations.
#[derive(Debug, Error)]
pub enum CorvusError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Index errors
    #[error("Index operation failed: {0}")]
    Index(String),

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Index corrupted: {0}")]
    Corrupted(String),

    // Cache errors
    #[error("File not open: {0}")]
    FileNotOpen(String),

    #[error("Page {page_index} out of range in file {file} ({pages} pages)")]
    PageOutOfRange {
        file: String,
        page_index: u64,
        pages: u64,
    },
}
