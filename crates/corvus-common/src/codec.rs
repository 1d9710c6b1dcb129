//! Binary codecs for typed keys and values.
//!
//! A codec maps a value to a deterministic byte encoding inside a page and
//! back. The encoded form is self-delimiting: `encoded_size` recovers the
//! length of an encoded value from the bytes alone, so variable-length
//! entries can be packed back to back.

/// Binary codec for a single value type.
pub trait BinaryCodec: Send + Sync {
    /// The value type this codec encodes.
    type Value;

    /// Returns true if every value encodes to the same number of bytes.
    fn is_fixed_length(&self) -> bool;

    /// Returns the encoded size of a value in bytes.
    fn size_of(&self, value: &Self::Value) -> usize;

    /// Returns the size of the encoded value starting at `offset`.
    fn encoded_size(&self, buf: &[u8], offset: usize) -> usize;

    /// Encodes a value into `buf` at `offset`. The caller guarantees
    /// `buf[offset..offset + size_of(value)]` is in bounds.
    fn encode(&self, value: &Self::Value, buf: &mut [u8], offset: usize);

    /// Decodes a value from `buf` at `offset`.
    fn decode(&self, buf: &[u8], offset: usize) -> Self::Value;
}

/// Codec for `u64` values (8 bytes, little-endian).
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Codec;

impl BinaryCodec for U64Codec {
    type Value = u64;

    fn is_fixed_length(&self) -> bool {
        true
    }

    fn size_of(&self, _value: &u64) -> usize {
        8
    }

    fn encoded_size(&self, _buf: &[u8], _offset: usize) -> usize {
        8
    }

    fn encode(&self, value: &u64, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn decode(&self, buf: &[u8], offset: usize) -> u64 {
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
}

/// Codec for `i64` values (8 bytes, little-endian).
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Codec;

impl BinaryCodec for I64Codec {
    type Value = i64;

    fn is_fixed_length(&self) -> bool {
        true
    }

    fn size_of(&self, _value: &i64) -> usize {
        8
    }

    fn encoded_size(&self, _buf: &[u8], _offset: usize) -> usize {
        8
    }

    fn encode(&self, value: &i64, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn decode(&self, buf: &[u8], offset: usize) -> i64 {
        i64::from_le_bytes([
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
}

/// Codec for `String` values (u32 length prefix + UTF-8 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl BinaryCodec for StringCodec {
    type Value = String;

    fn is_fixed_length(&self) -> bool {
        false
    }

    fn size_of(&self, value: &String) -> usize {
        4 + value.len()
    }

    fn encoded_size(&self, buf: &[u8], offset: usize) -> usize {
        let len = u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]) as usize;
        4 + len
    }

    fn encode(&self, value: &String, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
        buf[offset + 4..offset + 4 + value.len()].copy_from_slice(value.as_bytes());
    }

    fn decode(&self, buf: &[u8], offset: usize) -> String {
        let len = u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]) as usize;
        String::from_utf8_lossy(&buf[offset + 4..offset + 4 + len]).into_owned()
    }
}
