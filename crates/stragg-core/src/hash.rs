//! 64-bit hashing of key and value bytes.
//!
//! Both sides use seeded xxh3, on the device (slot selection, HLL register
//! updates) and on the host (result index, reference aggregation), so they
//! always agree.

use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Seed for hash table slot selection.
pub const KEY_SEED: u64 = 0xe17a_1465;

/// Seed for HyperLogLog value hashing. Distinct from [`KEY_SEED`] so slot
/// placement and register selection are uncorrelated.
pub const HLL_SEED: u64 = 0xadc8_3b19;

/// Hash used to place `key` in the device table and the result index.
#[inline]
#[must_use]
pub fn key_hash(key: &[u8]) -> u64 {
    xxh3_64_with_seed(key, KEY_SEED)
}

/// Hash of a value folded into a HyperLogLog sketch.
#[inline]
#[must_use]
pub fn value_hash(value: &[u8]) -> u64 {
    xxh3_64_with_seed(value, HLL_SEED)
}
