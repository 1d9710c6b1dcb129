//! Key hashing for the extendible hash index.
//!
//! The index routes on the high bits of the hash first, so the hash
//! function must distribute uniformly across the top of the 64-bit space.
//! MurmurHash3 (x64/128 variant, first word) satisfies this.

use crate::codec::BinaryCodec;

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

/// Maps a key to a 64-bit hash, uniformly distributed over the high bits.
pub trait KeyHasher<K>: Send + Sync {
    /// Hashes a key.
    fn hash(&self, key: &K) -> u64;
}

/// MurmurHash3-based key hasher operating on the codec-encoded key bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3KeyHasher<C> {
    codec: C,
}

impl<C> Murmur3KeyHasher<C> {
    /// Creates a hasher that encodes keys with `codec` before hashing.
    pub fn new(codec: C) -> Self {
        Self { codec }
    }
}

impl<C: BinaryCodec> KeyHasher<C::Value> for Murmur3KeyHasher<C> {
    fn hash(&self, key: &C::Value) -> u64 {
        let mut buf = vec![0u8; self.codec.size_of(key)];
        self.codec.encode(key, &mut buf, 0);
        murmur3_x64_128(&buf, 0).0
    }
}

#[inline]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ])
}

#[inline]
fn mix_k1(mut k1: u64) -> u64 {
    k1 = k1.wrapping_mul(C1);
    k1 = k1.rotate_left(31);
    k1.wrapping_mul(C2)
}

#[inline]
fn mix_k2(mut k2: u64) -> u64 {
    k2 = k2.wrapping_mul(C2);
    k2 = k2.rotate_left(33);
    k2.wrapping_mul(C1)
}

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^ (k >> 33)
}

/// MurmurHash3 x64/128 of `data` with the given seed.
pub fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    let len = data.len();
    let n_blocks = len / 16;

    let mut h1 = seed;
    let mut h2 = seed;

    for i in 0..n_blocks {
        let k1 = read_u64_le(data, i * 16);
        let k2 = read_u64_le(data, i * 16 + 8);

        h1 ^= mix_k1(k1);
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        h2 ^= mix_k2(k2);
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &data[n_blocks * 16..];
    let mut k1 = 0u64;
    let mut k2 = 0u64;

    for (i, &byte) in tail.iter().enumerate().skip(8) {
        k2 |= (byte as u64) << ((i - 8) * 8);
    }
    if tail.len() > 8 {
        h2 ^= mix_k2(k2);
    }
    for (i, &byte) in tail.iter().enumerate().take(8) {
        k1 |= (byte as u64) << (i * 8);
    }
    if !tail.is_empty() {
        h1 ^= mix_k1(k1);
    }

    h1 ^= len as u64;
    h2 ^= len as u64;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix64(h1);
    h2 = fmix64(h2);

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}
