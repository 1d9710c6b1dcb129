//! Extendible hash index integration tests.
//!
//! Covers the index lifecycle end to end: lookup/insert/remove round
//! trips, bucket splits with directory growth, merges with tombstone
//! reuse, range scans, persistence across reopen, and concurrent readers
//! against a single writer.
//!
//! Two hashers are used: the production Murmur3 hasher for realistic
//! distributions, and a raw hasher (hash == key) so tests can steer keys
//! into chosen buckets through explicit bit patterns.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::tempdir;

use corvus_cache::PageCache;
use corvus_common::{
    CacheConfig, CorvusError, IndexOptions, KeyHasher, Murmur3KeyHasher, StringCodec, U64Codec,
};
use corvus_index::HashIndex;

/// Hashes a u64 key to itself, so tests route keys by bit pattern.
#[derive(Clone, Copy)]
struct RawHasher;

impl KeyHasher<u64> for RawHasher {
    fn hash(&self, key: &u64) -> u64 {
        *key
    }
}

fn new_cache(dir: &std::path::Path) -> Arc<PageCache> {
    Arc::new(
        PageCache::new(CacheConfig {
            data_dir: dir.to_path_buf(),
            fsync_enabled: false,
        })
        .unwrap(),
    )
}

fn options(bucket_page_size: usize) -> IndexOptions {
    IndexOptions {
        bucket_page_size,
        // Small staging threshold so drains run inside the tests.
        split_buffer_capacity: 4,
        ..Default::default()
    }
}

type RawIndex = HashIndex<U64Codec, U64Codec, RawHasher>;
type MurmurIndex = HashIndex<U64Codec, U64Codec, Murmur3KeyHasher<U64Codec>>;

fn create_raw(cache: Arc<PageCache>, name: &str, page: usize) -> RawIndex {
    HashIndex::create(cache, name, options(page), U64Codec, U64Codec, RawHasher).unwrap()
}

fn create_murmur(cache: Arc<PageCache>, name: &str, page: usize) -> MurmurIndex {
    HashIndex::create(
        cache,
        name,
        options(page),
        U64Codec,
        U64Codec,
        Murmur3KeyHasher::new(U64Codec),
    )
    .unwrap()
}

// Entry bytes for a u64/u64 pair: 16 data + 4 slot.
const ENTRY_COST: usize = 20;
/// Fixed bucket header: depth + count + free pointer + tombstone link +
/// 64-level split history.
const BUCKET_HEADER: usize = 529;

fn bucket_capacity(page: usize) -> usize {
    (page - BUCKET_HEADER) / ENTRY_COST
}

// ============================================================================
// Round trips and size coherence
// ============================================================================

#[test]
fn test_put_get_roundtrip() {
    let dir = tempdir().unwrap();
    let index = create_murmur(new_cache(dir.path()), "roundtrip", 2048);

    for key in 0u64..2000 {
        index.put(&key, &(key * 7)).unwrap();
    }
    assert_eq!(index.size(), 2000);

    for key in 0u64..2000 {
        assert_eq!(index.get(&key).unwrap(), Some(key * 7));
    }
    assert_eq!(index.get(&2000).unwrap(), None);
    assert!(!index.contains_key(&999_999).unwrap());
}

#[test]
fn test_put_overwrites_value() {
    let dir = tempdir().unwrap();
    let index = create_murmur(new_cache(dir.path()), "overwrite", 2048);

    index.put(&1, &10).unwrap();
    index.put(&1, &20).unwrap();

    assert_eq!(index.get(&1).unwrap(), Some(20));
    assert_eq!(index.size(), 1);
}

#[test]
fn test_remove() {
    let dir = tempdir().unwrap();
    let index = create_murmur(new_cache(dir.path()), "remove", 2048);

    for key in 0u64..100 {
        index.put(&key, &key).unwrap();
    }

    assert!(index.remove(&50).unwrap());
    assert!(!index.remove(&50).unwrap());
    assert!(!index.remove(&12345).unwrap());

    assert_eq!(index.get(&50).unwrap(), None);
    assert_eq!(index.size(), 99);
}

#[test]
fn test_size_coherence_with_iteration() {
    let dir = tempdir().unwrap();
    // Raw hasher with monotone keys: key order equals hash-prefix order,
    // so successive forward scans enumerate everything exactly once.
    let index = create_raw(new_cache(dir.path()), "iter", 2048);

    // Eight keys per root prefix across all 256 buckets.
    let keys: Vec<u64> = (0u64..2048).map(|i| i << 53).collect();
    for &key in &keys {
        index.put(&key, &!key).unwrap();
    }
    for &key in keys.iter().take(512) {
        assert!(index.remove(&key).unwrap());
    }
    assert_eq!(index.size(), 2048 - 512);

    let mut collected = Vec::new();
    let mut batch = index.ceiling_entries(&0).unwrap();
    while !batch.is_empty() {
        let last = batch.last().map(|entry| entry.key).unwrap();
        collected.extend(batch);
        batch = index.higher_entries(&last).unwrap();
    }

    assert_eq!(collected.len(), 2048 - 512);
    let expected: Vec<u64> = keys[512..].to_vec();
    let scanned: Vec<u64> = collected.iter().map(|entry| entry.key).collect();
    assert_eq!(scanned, expected);
    for entry in &collected {
        assert_eq!(entry.value, !entry.key);
    }
}

// ============================================================================
// Splits and directory growth
// ============================================================================

#[test]
fn test_bucket_split_creates_level_and_child_node() {
    let dir = tempdir().unwrap();
    let index = create_raw(new_cache(dir.path()), "split", 2048);

    let capacity = bucket_capacity(2048) as u64;
    assert_eq!(capacity, 75);

    // All keys share the top 8 bits (prefix 0) and differ from bit 9 on.
    let keys: Vec<u64> = (0..=capacity).map(|i| i << 49).collect();
    for &key in &keys {
        index.put(&key, &key).unwrap();
    }

    // One split: a level-1 file with the bucket pair, one bucket gone
    // from level 0, and a child directory node under the root.
    let level1 = index.file_level_stats(1).expect("level 1 must exist");
    assert_eq!(level1.buckets_count, 2);
    assert_eq!(level1.tombstone_index, -1);
    assert_eq!(index.file_level_stats(0).unwrap().buckets_count, 255);
    assert_eq!(index.directory_size(), 2);

    for &key in &keys {
        assert_eq!(index.get(&key).unwrap(), Some(key));
    }
    assert_eq!(index.size(), capacity + 1);
}

#[test]
fn test_directory_deepens_under_shared_prefix() {
    let dir = tempdir().unwrap();
    let index = create_raw(new_cache(dir.path()), "deepen", 2048);

    let capacity = bucket_capacity(2048) as u64;

    // First family shares 8 bits; the second shares 9 (the low bit keeps
    // the families disjoint), forcing the child node created by the first
    // split to keep splitting.
    let mut keys: Vec<u64> = (0..=capacity).map(|i| i << 49).collect();
    keys.extend((1..=capacity).map(|i| (i << 48) | 1));
    for &key in &keys {
        index.put(&key, &(key ^ 0xABCD)).unwrap();
    }

    assert!(index.file_level_stats(2).is_some(), "deeper level expected");
    assert_eq!(index.directory_size(), 2);

    for &key in &keys {
        assert_eq!(index.get(&key).unwrap(), Some(key ^ 0xABCD));
    }
    assert_eq!(index.size(), keys.len() as u64);
}

// ============================================================================
// Merges and tombstones
// ============================================================================

#[test]
fn test_merge_restores_level_zero_bucket() {
    let dir = tempdir().unwrap();
    let index = create_raw(new_cache(dir.path()), "merge", 8192);

    let capacity = bucket_capacity(8192) as u64;
    assert_eq!(capacity, 383);

    // Fill prefix 0x00 past capacity: splits into a level-1 pair.
    let keys: Vec<u64> = (0..=capacity).map(|i| i << 47).collect();
    for &key in &keys {
        index.put(&key, &key).unwrap();
    }
    assert_eq!(index.file_level_stats(1).unwrap().buckets_count, 2);

    // Drain the odd-bit bucket below the merge threshold.
    for i in 256..=capacity {
        assert!(index.remove(&(i << 47)).unwrap());
    }

    // The pair merged back into its level-0 parent, the level emptied,
    // and its tombstone chain reset.
    let level1 = index.file_level_stats(1).unwrap();
    assert_eq!(level1.buckets_count, 0);
    assert_eq!(level1.tombstone_index, -1);
    assert_eq!(index.file_level_stats(0).unwrap().buckets_count, 256);

    for i in 0..256 {
        assert_eq!(index.get(&(i << 47)).unwrap(), Some(i << 47));
    }
    assert_eq!(index.size(), 256);
}

#[test]
fn test_merge_links_freed_pair_and_split_reuses_it() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path());
    let index = create_raw(cache.clone(), "reuse", 8192);

    let capacity = bucket_capacity(8192) as u64;

    // Two prefixes split: level 1 holds pages 0..4.
    for i in 0..=capacity {
        index.put(&(i << 47), &1).unwrap();
    }
    for i in 0..=capacity {
        index.put(&((1 << 56) | (i << 47)), &2).unwrap();
    }
    assert_eq!(index.file_level_stats(1).unwrap().buckets_count, 4);
    assert_eq!(cache.filled_up_to("reuse1.hib").unwrap(), 4);

    // Merge the first prefix's pair; the level keeps the second pair, so
    // the freed pages (0, 1) go onto the tombstone chain headed by the
    // lower index.
    for i in 256..=capacity {
        assert!(index.remove(&(i << 47)).unwrap());
    }
    let level1 = index.file_level_stats(1).unwrap();
    assert_eq!(level1.buckets_count, 2);
    assert_eq!(level1.tombstone_index, 0);

    // A third prefix splits: it must consume the tombstone pair instead
    // of extending the file.
    for i in 0..=capacity {
        index.put(&((2 << 56) | (i << 47)), &3).unwrap();
    }
    let level1 = index.file_level_stats(1).unwrap();
    assert_eq!(level1.buckets_count, 4);
    assert_eq!(level1.tombstone_index, -1);
    assert_eq!(cache.filled_up_to("reuse1.hib").unwrap(), 4);

    // Nothing was lost along the way.
    for i in 0..256 {
        assert_eq!(index.get(&(i << 47)).unwrap(), Some(1));
    }
    for i in 0..=capacity {
        assert_eq!(index.get(&((1 << 56) | (i << 47))).unwrap(), Some(2));
        assert_eq!(index.get(&((2 << 56) | (i << 47))).unwrap(), Some(3));
    }
}

#[test]
fn test_directory_node_collapses_after_merges() {
    let dir = tempdir().unwrap();
    let index = create_raw(new_cache(dir.path()), "collapse", 8192);

    let capacity = bucket_capacity(8192) as u64;

    let keys: Vec<u64> = (0..=capacity).map(|i| i << 47).collect();
    for &key in &keys {
        index.put(&key, &key).unwrap();
    }
    assert_eq!(index.directory_size(), 2);

    for &key in &keys {
        assert!(index.remove(&key).unwrap());
    }

    // Every window of the child routes to level-0 buckets again, so the
    // node collapsed into the root.
    assert_eq!(index.directory_size(), 1);
    assert_eq!(index.file_level_stats(0).unwrap().buckets_count, 256);
    assert_eq!(index.size(), 0);
}

// ============================================================================
// Range scans
// ============================================================================

#[test]
fn test_range_scan_bounds() {
    let dir = tempdir().unwrap();
    // Identity hashing parks all small keys in one bucket, so the scans
    // see pure key order.
    let index = create_raw(new_cache(dir.path()), "range", 4096);

    for key in 0u64..100 {
        index.put(&key, &(key + 1000)).unwrap();
    }

    let higher = index.higher_entries(&50).unwrap();
    assert_eq!(higher.first().map(|e| e.key), Some(51));
    assert_eq!(higher.len(), 49);

    let ceiling = index.ceiling_entries(&50).unwrap();
    assert_eq!(ceiling.first().map(|e| e.key), Some(50));
    assert_eq!(ceiling.len(), 50);

    let lower = index.lower_entries(&50).unwrap();
    assert_eq!(lower.last().map(|e| e.key), Some(49));
    assert_eq!(lower.len(), 50);

    let floor = index.floor_entries(&50).unwrap();
    assert_eq!(floor.last().map(|e| e.key), Some(50));
    assert_eq!(floor.len(), 51);

    assert_eq!(floor.first().map(|e| e.value), Some(1000));
}

#[test]
fn test_range_scan_with_absent_probe() {
    let dir = tempdir().unwrap();
    let index = create_raw(new_cache(dir.path()), "range-absent", 4096);

    for key in (0u64..100).map(|i| i * 2) {
        index.put(&key, &key).unwrap();
    }

    let higher = index.higher_entries(&49).unwrap();
    assert_eq!(higher.first().map(|e| e.key), Some(50));
    let ceiling = index.ceiling_entries(&49).unwrap();
    assert_eq!(ceiling.first().map(|e| e.key), Some(50));
    let lower = index.lower_entries(&49).unwrap();
    assert_eq!(lower.last().map(|e| e.key), Some(48));
    let floor = index.floor_entries(&49).unwrap();
    assert_eq!(floor.last().map(|e| e.key), Some(48));
}

#[test]
fn test_range_scan_hops_over_empty_buckets() {
    let dir = tempdir().unwrap();
    let index = create_raw(new_cache(dir.path()), "range-hop", 2048);

    // Two occupied buckets far apart; everything between is empty.
    index.put(&(5u64 << 56), &5).unwrap();
    index.put(&(200u64 << 56), &200).unwrap();

    let higher = index.higher_entries(&(5u64 << 56)).unwrap();
    assert_eq!(higher.len(), 1);
    assert_eq!(higher[0].key, 200u64 << 56);

    let lower = index.lower_entries(&(200u64 << 56)).unwrap();
    assert_eq!(lower.len(), 1);
    assert_eq!(lower[0].key, 5u64 << 56);

    assert!(index.higher_entries(&(200u64 << 56)).unwrap().is_empty());
    assert!(index.lower_entries(&(5u64 << 56)).unwrap().is_empty());
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_flush_and_reopen_restores_everything() {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    let mut keys = HashSet::new();
    while keys.len() < 10_000 {
        keys.insert(rng.gen::<u64>());
    }

    {
        let index = create_murmur(new_cache(dir.path()), "persist", 2048);
        for &key in &keys {
            index.put(&key, &key.wrapping_mul(3)).unwrap();
        }
        index.flush().unwrap();
        index.close().unwrap();
    }

    // A fresh cache forces everything back through the files.
    let index: MurmurIndex = HashIndex::open(
        new_cache(dir.path()),
        "persist",
        options(2048),
        U64Codec,
        U64Codec,
        Murmur3KeyHasher::new(U64Codec),
    )
    .unwrap();

    assert_eq!(index.size(), 10_000);
    for &key in &keys {
        assert_eq!(index.get(&key).unwrap(), Some(key.wrapping_mul(3)));
    }
}

#[test]
fn test_reopen_preserves_structure_after_splits() {
    let dir = tempdir().unwrap();
    let capacity = bucket_capacity(2048) as u64;
    let keys: Vec<u64> = (0..=capacity).map(|i| i << 49).collect();

    {
        let index = create_raw(new_cache(dir.path()), "structure", 2048);
        for &key in &keys {
            index.put(&key, &key).unwrap();
        }
        index.close().unwrap();
    }

    let index: RawIndex = HashIndex::open(
        new_cache(dir.path()),
        "structure",
        options(2048),
        U64Codec,
        U64Codec,
        RawHasher,
    )
    .unwrap();

    assert_eq!(index.directory_size(), 2);
    assert_eq!(index.file_level_stats(1).unwrap().buckets_count, 2);
    for &key in &keys {
        assert_eq!(index.get(&key).unwrap(), Some(key));
    }

    // The reopened index keeps working as a writer.
    index.put(&u64::MAX, &42).unwrap();
    assert_eq!(index.get(&u64::MAX).unwrap(), Some(42));
}

#[test]
fn test_open_rejects_page_size_mismatch() {
    let dir = tempdir().unwrap();

    {
        let index = create_murmur(new_cache(dir.path()), "mismatch", 2048);
        index.close().unwrap();
    }

    let result: Result<MurmurIndex, _> = HashIndex::open(
        new_cache(dir.path()),
        "mismatch",
        options(4096),
        U64Codec,
        U64Codec,
        Murmur3KeyHasher::new(U64Codec),
    );
    assert!(matches!(result, Err(CorvusError::Configuration(_))));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_clear_resets_index() {
    let dir = tempdir().unwrap();
    let index = create_murmur(new_cache(dir.path()), "clear", 2048);

    for key in 0u64..500 {
        index.put(&key, &key).unwrap();
    }
    index.clear().unwrap();

    assert_eq!(index.size(), 0);
    assert_eq!(index.get(&100).unwrap(), None);
    assert_eq!(index.directory_size(), 1);

    index.put(&7, &70).unwrap();
    assert_eq!(index.get(&7).unwrap(), Some(70));
    assert_eq!(index.size(), 1);
}

#[test]
fn test_delete_removes_files() {
    let dir = tempdir().unwrap();
    let index = create_murmur(new_cache(dir.path()), "drop", 2048);
    index.put(&1, &1).unwrap();

    assert!(dir.path().join("drop0.hib").exists());
    assert!(dir.path().join("drop.him").exists());
    assert!(dir.path().join("drop.hit").exists());

    index.delete().unwrap();

    assert!(!dir.path().join("drop0.hib").exists());
    assert!(!dir.path().join("drop.him").exists());
    assert!(!dir.path().join("drop.hit").exists());
}

#[test]
fn test_oversize_entry_is_skipped_by_default() {
    let dir = tempdir().unwrap();
    let index: HashIndex<U64Codec, StringCodec, Murmur3KeyHasher<U64Codec>> = HashIndex::create(
        new_cache(dir.path()),
        "oversize",
        options(2048),
        U64Codec,
        StringCodec,
        Murmur3KeyHasher::new(U64Codec),
    )
    .unwrap();

    let huge = "x".repeat(4096);
    index.put(&1, &huge).unwrap();

    assert_eq!(index.get(&1).unwrap(), None);
    assert_eq!(index.size(), 0);

    // Normal entries still work.
    index.put(&2, &"ok".to_string()).unwrap();
    assert_eq!(index.get(&2).unwrap(), Some("ok".to_string()));
}

#[test]
fn test_oversize_entry_errors_when_configured() {
    let dir = tempdir().unwrap();
    let index: HashIndex<U64Codec, StringCodec, Murmur3KeyHasher<U64Codec>> = HashIndex::create(
        new_cache(dir.path()),
        "oversize-strict",
        IndexOptions {
            error_on_oversize_key: true,
            ..options(2048)
        },
        U64Codec,
        StringCodec,
        Murmur3KeyHasher::new(U64Codec),
    )
    .unwrap();

    let huge = "x".repeat(4096);
    assert!(matches!(
        index.put(&1, &huge),
        Err(CorvusError::KeyTooLarge { .. })
    ));
}

#[test]
fn test_variable_size_value_update() {
    let dir = tempdir().unwrap();
    let index: HashIndex<U64Codec, StringCodec, Murmur3KeyHasher<U64Codec>> = HashIndex::create(
        new_cache(dir.path()),
        "varsize",
        options(2048),
        U64Codec,
        StringCodec,
        Murmur3KeyHasher::new(U64Codec),
    )
    .unwrap();

    index.put(&1, &"short".to_string()).unwrap();
    index.put(&1, &"a considerably longer value".to_string()).unwrap();
    index.put(&1, &"tiny".to_string()).unwrap();

    assert_eq!(index.get(&1).unwrap(), Some("tiny".to_string()));
    assert_eq!(index.size(), 1);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_readers_with_single_writer() {
    let dir = tempdir().unwrap();
    let index = Arc::new(create_murmur(new_cache(dir.path()), "concurrent", 2048));

    const KEYS: u64 = 2000;
    const VALUE_MASK: u64 = 0xDEAD_BEEF_CAFE_F00D;

    let writer = {
        let index = index.clone();
        std::thread::spawn(move || {
            for key in 0..KEYS {
                index.put(&key, &(key ^ VALUE_MASK)).unwrap();
            }
            for key in (0..KEYS).step_by(2) {
                assert!(index.remove(&key).unwrap());
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let index = index.clone();
            std::thread::spawn(move || {
                for round in 0..20 {
                    for key in (round % 7..KEYS).step_by(7) {
                        // Present or absent depending on timing, but a
                        // present value is never torn.
                        if let Some(value) = index.get(&key).unwrap() {
                            assert_eq!(value, key ^ VALUE_MASK);
                        }
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(index.size(), KEYS / 2);
    for key in 0..KEYS {
        let expected = (key % 2 == 1).then_some(key ^ VALUE_MASK);
        assert_eq!(index.get(&key).unwrap(), expected);
    }
}
