//! Persistence of index metadata and directory tree state.
//!
//! Two small files sit beside the bucket files:
//!
//! **Metadata file**: `records_count: u64`, `page_size: i32`, then one
//! fixed record per possible file level:
//! `present: u8`, `buckets_count: i64`, `tombstone_index: i64`.
//!
//! **Tree state file**: `hash_tree_size: u32`, `hash_tree_tombstone: i32`,
//! `bucket_tombstone_pointer: i64`, `buckets_offset: u64`, then per node
//! `local_depth: u8`, `max_left_child_depth: u8`, `max_right_child_depth: u8`
//! followed by 256 x i64 slots. A tombstoned node is stored with
//! `local_depth == 0` (live depths start at 1) and the next free index in
//! slot 0.
//!
//! All integers are little-endian. Both files are rewritten whole on every
//! checkpoint; they are small (the tree file is ~2 KiB per node).

use super::constants::{MAX_FILE_LEVELS, MAX_LEVEL_SIZE};
use super::directory::{Directory, DirectoryNode, TreeNode};
use super::types::LevelMetadata;
use corvus_common::{CorvusError, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Offset of the first node record in the tree state file.
const NODE_RECORDS_OFFSET: u64 = 4 + 4 + 8 + 8;

/// Bytes of one node record: three depth bytes plus the slot array.
const NODE_RECORD_SIZE: usize = 3 + MAX_LEVEL_SIZE * 8;

fn read_exact_at<'a>(buf: &'a [u8], offset: usize, len: usize, file: &Path) -> Result<&'a [u8]> {
    buf.get(offset..offset + len).ok_or_else(|| {
        CorvusError::Corrupted(format!("state file {} is truncated", file.display()))
    })
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
        buf[offset + 4],
        buf[offset + 5],
        buf[offset + 6],
        buf[offset + 7],
    ])
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    read_u64(buf, offset) as i64
}

/// The metadata file: record count, page size, per-level bucket counts
/// and tombstone heads.
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    /// Binds the store to a path; nothing is opened until use.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// True when the file exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Rewrites the file with the given state.
    pub fn store(
        &self,
        records_count: u64,
        page_size: usize,
        levels: &[Option<LevelMetadata>],
    ) -> Result<()> {
        debug_assert_eq!(levels.len(), MAX_FILE_LEVELS);

        let mut buf = Vec::with_capacity(12 + MAX_FILE_LEVELS * 17);
        buf.extend_from_slice(&records_count.to_le_bytes());
        buf.extend_from_slice(&(page_size as i32).to_le_bytes());
        for level in levels {
            match level {
                Some(metadata) => {
                    buf.push(1);
                    buf.extend_from_slice(&metadata.buckets_count.to_le_bytes());
                    buf.extend_from_slice(&metadata.tombstone_index.to_le_bytes());
                }
                None => {
                    buf.push(0);
                    buf.extend_from_slice(&0i64.to_le_bytes());
                    buf.extend_from_slice(&(-1i64).to_le_bytes());
                }
            }
        }

        let mut file = File::create(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads the file back.
    pub fn load(&self) -> Result<(u64, i32, Vec<Option<LevelMetadata>>)> {
        let mut buf = Vec::new();
        File::open(&self.path)?.read_to_end(&mut buf)?;

        read_exact_at(&buf, 0, 12 + MAX_FILE_LEVELS * 17, &self.path)?;

        let records_count = read_u64(&buf, 0);
        let page_size = read_i32(&buf, 8);

        let mut levels = Vec::with_capacity(MAX_FILE_LEVELS);
        for level in 0..MAX_FILE_LEVELS {
            let offset = 12 + level * 17;
            if buf[offset] == 1 {
                levels.push(Some(LevelMetadata {
                    buckets_count: read_i64(&buf, offset + 1),
                    tombstone_index: read_i64(&buf, offset + 9),
                }));
            } else {
                levels.push(None);
            }
        }

        Ok((records_count, page_size, levels))
    }

    /// Removes the file.
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// The tree state file: the directory node array and its free list.
pub struct TreeStateStore {
    path: PathBuf,
}

impl TreeStateStore {
    /// Binds the store to a path; nothing is opened until use.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// True when the file exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Rewrites the file with the directory's current state.
    pub fn store(&self, directory: &Directory, bucket_tombstone_pointer: i64) -> Result<()> {
        let nodes = directory.nodes();
        let mut buf =
            Vec::with_capacity(NODE_RECORDS_OFFSET as usize + nodes.len() * NODE_RECORD_SIZE);

        buf.extend_from_slice(&(nodes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&directory.tombstone().to_le_bytes());
        buf.extend_from_slice(&bucket_tombstone_pointer.to_le_bytes());
        buf.extend_from_slice(&NODE_RECORDS_OFFSET.to_le_bytes());

        for node in nodes {
            match node {
                TreeNode::Live(node) => {
                    buf.push(node.local_depth as u8);
                    buf.push(node.max_left_child_depth as u8);
                    buf.push(node.max_right_child_depth as u8);
                    for slot in node.slots.iter() {
                        buf.extend_from_slice(&slot.to_le_bytes());
                    }
                }
                TreeNode::Tombstone(next) => {
                    buf.extend_from_slice(&[0, 0, 0]);
                    buf.extend_from_slice(&(*next as i64).to_le_bytes());
                    buf.extend_from_slice(&[0u8; (MAX_LEVEL_SIZE - 1) * 8]);
                }
            }
        }

        let mut file = File::create(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads the directory back.
    pub fn load(&self) -> Result<(Directory, i64)> {
        let mut buf = Vec::new();
        File::open(&self.path)?.read_to_end(&mut buf)?;

        read_exact_at(&buf, 0, NODE_RECORDS_OFFSET as usize, &self.path)?;

        let hash_tree_size = read_u32(&buf, 0) as usize;
        let hash_tree_tombstone = read_i32(&buf, 4);
        let bucket_tombstone_pointer = read_i64(&buf, 8);
        let buckets_offset = read_u64(&buf, 16);

        let mut nodes = Vec::with_capacity(hash_tree_size);
        for i in 0..hash_tree_size {
            let offset = buckets_offset as usize + i * NODE_RECORD_SIZE;
            let record = read_exact_at(&buf, offset, NODE_RECORD_SIZE, &self.path)?;

            let local_depth = record[0] as u32;
            if local_depth == 0 {
                nodes.push(TreeNode::Tombstone(read_i64(record, 3) as i32));
                continue;
            }

            let mut slots = Box::new([0i64; MAX_LEVEL_SIZE]);
            for (s, slot) in slots.iter_mut().enumerate() {
                *slot = read_i64(record, 3 + s * 8);
            }
            nodes.push(TreeNode::Live(DirectoryNode {
                slots,
                local_depth,
                max_left_child_depth: record[1] as u32,
                max_right_child_depth: record[2] as u32,
            }));
        }

        Ok((
            Directory::from_parts(nodes, hash_tree_tombstone),
            bucket_tombstone_pointer,
        ))
    }

    /// Removes the file.
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
