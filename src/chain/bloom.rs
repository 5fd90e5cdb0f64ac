//! Bloom filter for fast negative lookups.
//!
//! Each in-memory block carries one of these so that a chain walk can skip
//! blocks that definitely never wrote the key. False positives only cost a
//! map scan; false negatives cannot happen.

use std::hash::Hasher;

use rustc_hash::FxHasher;

/// Default number of bits per block (1 KiB of filter).
const DEFAULT_BITS: usize = 8192;

/// Number of derived hash functions.
const NUM_HASHES: usize = 3;

/// A Bloom filter for approximate membership testing.
#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    count: usize,
}

impl BloomFilter {
    /// Creates a filter with the default size.
    pub fn new() -> Self {
        Self::with_size(DEFAULT_BITS)
    }

    /// Creates a filter with the specified number of bits.
    pub fn with_size(num_bits: usize) -> Self {
        let words = (num_bits + 63) / 64;
        Self {
            bits: vec![0u64; words],
            num_bits,
            count: 0,
        }
    }

    /// Inserts a key into the filter.
    pub fn insert(&mut self, key: &[u8]) {
        for hash in self.compute_hashes(key) {
            let index = hash % self.num_bits;
            self.bits[index / 64] |= 1u64 << (index % 64);
        }
        self.count += 1;
    }

    /// Returns false iff the key was definitely never inserted.
    #[inline]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        for hash in self.compute_hashes(key) {
            let index = hash % self.num_bits;
            if self.bits[index / 64] & (1u64 << (index % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Returns the number of insertions.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Clears the filter.
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.count = 0;
    }

    /// Derives the hash sequence via double hashing over a single FxHash:
    /// `h_i(x) = h1(x) + i * h2(x)` with an odd stride.
    fn compute_hashes(&self, key: &[u8]) -> [usize; NUM_HASHES] {
        let mut hasher = FxHasher::default();
        hasher.write(key);
        let hash = hasher.finish();

        let h1 = hash as usize;
        let h2 = ((hash >> 32) | 1) as usize;
        let mut hashes = [0usize; NUM_HASHES];
        for (i, slot) in hashes.iter_mut().enumerate() {
            *slot = h1.wrapping_add(i.wrapping_mul(h2));
        }
        hashes
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}
