//! Fixed-shape bloom filter over precomputed key hashes.
//!
//! Each sealed segment carries one of these on its manifest entry so upper
//! layers can reject absent keys without touching the segment's hash table.
//! The filter is built once from the writer's accumulated 32-bit key hashes
//! and is immutable afterwards.
//!
//! # Shape
//!
//! The lane count is fixed by the number of keys at build time:
//!
//! | keys      | lanes × `u64` | size  |
//! |-----------|---------------|-------|
//! | 0         | —             | 0 B   |
//! | 1..=16    | 2             | 16 B  |
//! | 17..=32   | 4             | 32 B  |
//! | 33+       | 16            | 128 B |
//!
//! # Bit derivation
//!
//! For hash `H`: `S = H & 31`, `H0 = (H>>5) & 31`, `H1 = (H>>10) & 31`,
//! `H2 = (H>>15) & 31`, `Switch = S >> 4`, lane = `S & (lanes-1)`. The mask
//! sets bits `H0`, `H1`, `H2` in the high half of the selected word when
//! `Switch == 0`, in the low half otherwise. Insertion ORs the mask in;
//! lookup requires every mask bit to be set.
//!
//! # Accuracy
//!
//! Lookup never reports `false` for an inserted hash. The false-positive
//! rate scales with load: under 1% while the largest shape holds ≤48 keys,
//! climbing to ≈5% at the full 128-key load. Callers treat `true` as
//! "probably".

#[cfg(test)]
mod tests;

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// SegmentBloom
// ------------------------------------------------------------------------------------------------

/// Immutable bloom filter summarizing one segment's key hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentBloom {
    /// Lane words; length is 0, 2, 4, or 16.
    words: Vec<u64>,
}

impl SegmentBloom {
    /// An empty filter — reports `false` for every hash.
    pub fn empty() -> Self {
        Self { words: Vec::new() }
    }

    /// Build a filter from precomputed key hashes.
    pub fn from_hashes(hashes: &[u32]) -> Self {
        let lanes = lane_count_for(hashes.len());
        if lanes == 0 {
            return Self::empty();
        }
        let mut words = vec![0u64; lanes];
        for &hash in hashes {
            let (lane, mask) = split_hash(hash, lanes);
            words[lane] |= mask;
        }
        Self { words }
    }

    /// Check a precomputed hash. `false` is definitive; `true` means
    /// "probably present".
    pub fn check_hash(&self, hash: u32) -> bool {
        if self.words.is_empty() {
            return false;
        }
        let (lane, mask) = split_hash(hash, self.words.len());
        self.words[lane] & mask == mask
    }

    /// Serialized size in bytes (excluding the length prefix).
    pub fn size_bytes(&self) -> usize {
        self.words.len() * 8
    }
}

/// Lane count for a given key count.
fn lane_count_for(keys: usize) -> usize {
    match keys {
        0 => 0,
        1..=16 => 2,
        17..=32 => 4,
        _ => 16,
    }
}

/// Derive `(lane, mask)` for a hash given the filter's lane count.
///
/// `lanes` must be a power of two (2, 4, or 16).
fn split_hash(hash: u32, lanes: usize) -> (usize, u64) {
    let selector = (hash & 31) as usize;
    let h0 = (hash >> 5) & 31;
    let h1 = (hash >> 10) & 31;
    let h2 = (hash >> 15) & 31;

    let lane = selector & (lanes - 1);
    let bits = (1u64 << h0) | (1u64 << h1) | (1u64 << h2);
    // Selector bit 4 picks the word half: 0 → high, 1 → low.
    let mask = if selector >> 4 == 0 { bits << 32 } else { bits };
    (lane, mask)
}

// ------------------------------------------------------------------------------------------------
// Wire format
// ------------------------------------------------------------------------------------------------

impl Encode for SegmentBloom {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.words, buf)
    }
}

impl Decode for SegmentBloom {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (words, consumed) = encoding::decode_vec::<u64>(buf)?;
        match words.len() {
            0 | 2 | 4 | 16 => Ok((Self { words }, consumed)),
            other => Err(EncodingError::LengthOverflow {
                len: other as u64,
                limit: 16,
                type_name: "SegmentBloom",
            }),
        }
    }
}
