//! Named page files on disk.

use corvus_common::{CacheConfig, CorvusError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Manages reading and writing fixed-size pages in named files.
///
/// Each file carries its own page size, fixed when the file is opened.
/// Files are opened lazily and kept open until closed or deleted.
pub struct FileStore {
    config: CacheConfig,
    files: Mutex<HashMap<String, FileHandle>>,
}

/// Handle for an open page file.
struct FileHandle {
    file: File,
    page_size: usize,
    num_pages: u64,
}

impl FileStore {
    /// Creates a file store rooted at the configured data directory.
    pub fn new(config: CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(name)
    }

    /// Opens or creates a page file with the given page size.
    pub fn open(&self, name: &str, page_size: usize) -> Result<()> {
        let mut files = self.files.lock();

        if files.contains_key(name) {
            return Ok(());
        }

        let path = self.file_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = file_size / page_size as u64;

        files.insert(
            name.to_string(),
            FileHandle {
                file,
                page_size,
                num_pages,
            },
        );

        Ok(())
    }

    /// Returns true if the file is currently open.
    pub fn is_open(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    /// Returns true if the file exists on disk.
    pub fn exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    /// Reads a page into a fresh buffer.
    pub fn read_page(&self, name: &str, page_index: u64) -> Result<Box<[u8]>> {
        let mut files = self.files.lock();
        let handle = files
            .get_mut(name)
            .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;

        if page_index >= handle.num_pages {
            return Err(CorvusError::PageOutOfRange {
                file: name.to_string(),
                page_index,
                pages: handle.num_pages,
            });
        }

        let offset = page_index * handle.page_size as u64;
        handle.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; handle.page_size].into_boxed_slice();
        handle.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page, extending the file if the index is past the end.
    pub fn write_page(&self, name: &str, page_index: u64, data: &[u8]) -> Result<()> {
        let mut files = self.files.lock();
        let handle = files
            .get_mut(name)
            .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;

        debug_assert_eq!(data.len(), handle.page_size);

        let offset = page_index * handle.page_size as u64;
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(data)?;

        if self.config.fsync_enabled {
            handle.file.sync_all()?;
        }

        if page_index >= handle.num_pages {
            handle.num_pages = page_index + 1;
        }

        Ok(())
    }

    /// Extends the file with zeroed pages so `page_index` exists.
    pub fn ensure_page(&self, name: &str, page_index: u64) -> Result<()> {
        let mut files = self.files.lock();
        let handle = files
            .get_mut(name)
            .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;

        if page_index < handle.num_pages {
            return Ok(());
        }

        let zero = vec![0u8; handle.page_size];
        handle
            .file
            .seek(SeekFrom::Start(handle.num_pages * handle.page_size as u64))?;
        for _ in handle.num_pages..=page_index {
            handle.file.write_all(&zero)?;
        }

        if self.config.fsync_enabled {
            handle.file.sync_all()?;
        }

        handle.num_pages = page_index + 1;

        Ok(())
    }

    /// Returns the number of pages in the file.
    pub fn page_count(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let handle = files
            .get(name)
            .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;

        Ok(handle.num_pages)
    }

    /// Returns the page size the file was opened with.
    pub fn page_size(&self, name: &str) -> Result<usize> {
        let files = self.files.lock();
        let handle = files
            .get(name)
            .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;

        Ok(handle.page_size)
    }

    /// Truncates the file to zero pages.
    pub fn truncate(&self, name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let handle = files
            .get_mut(name)
            .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;

        handle.file.set_len(0)?;
        handle.num_pages = 0;

        if self.config.fsync_enabled {
            handle.file.sync_all()?;
        }

        Ok(())
    }

    /// Flushes pending writes for one file.
    pub fn flush(&self, name: &str) -> Result<()> {
        let files = self.files.lock();
        let handle = files
            .get(name)
            .ok_or_else(|| CorvusError::FileNotOpen(name.to_string()))?;

        handle.file.sync_all()?;
        Ok(())
    }

    /// Closes one file, flushing it first.
    pub fn close(&self, name: &str) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(handle) = files.remove(name) {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut files = self.files.lock();
        for (_, handle) in files.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a file, closing it first.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.close(name)?;
        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}
