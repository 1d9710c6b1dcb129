//! Extendible hash index constants.

/// Number of hash bits one directory node consumes at most.
pub const MAX_LEVEL_DEPTH: u32 = 8;

/// Number of slots in one directory node.
pub const MAX_LEVEL_SIZE: usize = 1 << MAX_LEVEL_DEPTH;

/// Mask selecting an index within one directory node.
pub const LEVEL_MASK: usize = MAX_LEVEL_SIZE - 1;

/// Number of bucket file levels the index can address. A bucket at hash
/// depth `d` lives in file level `d - MAX_LEVEL_DEPTH`.
pub const MAX_FILE_LEVELS: usize = 64;

/// Occupancy fraction below which a bucket becomes a merge candidate.
pub const MERGE_THRESHOLD: f64 = 0.2;
