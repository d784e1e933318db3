//! Deterministic hashing used to derive per-stream seeds.

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Hashes a string with `FxHasher`. Unlike `std`'s `DefaultHasher`, the result is stable
/// across processes, so seeds derived from stream names are reproducible.
pub fn hash_str(data: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(data.as_bytes());
    hasher.finish()
}

/// Mixes an index into a seed (SplitMix64 finalizer), so that neighbouring indices get
/// unrelated seeds.
pub fn mix_index(seed: u64, index: u64) -> u64 {
    let mut z = seed.wrapping_add(index.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
