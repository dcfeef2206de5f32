//! Two-level hash index math for sealed segment files.
//!
//! A sealed segment ends with 256 hash subtables (the **hash region**) and
//! begins with a 2048-byte **top index** of 256 `(position, slot_count)`
//! pairs, one per subtable. Subtable `i` serves hashes whose low 8 bits are
//! `i` and holds `2 × record_count` eight-byte `(hash, position)` slots —
//! a 0.5 load factor. Placement and lookup both start at
//! `(hash >> 8) % slot_count` and walk forward with wrap-around; an
//! all-zero slot terminates a probe chain.
//!
//! The functions here are pure byte-level transforms shared by the sealing
//! path (build) and the reader (parse/probe); neither side touches a file
//! through this module.

use std::collections::BTreeMap;

/// Number of hash subtables, and of top-index entries.
pub const SUBTABLE_COUNT: usize = 256;

/// Size of the top index: 256 pairs of two little-endian `u32`s.
pub const TOP_INDEX_BYTES: usize = SUBTABLE_COUNT * 8;

/// First byte of the record region (immediately after the top index).
pub const RECORD_REGION_START: u32 = TOP_INDEX_BYTES as u32;

/// Bytes per hash slot: little-endian `(hash, position)`.
pub const SLOT_BYTES: usize = 8;

/// The writer's in-memory index: per subtable, an ordered map from full
/// 32-bit hash to the record positions carrying that hash, in insertion
/// order. Ordering matters — slot placement walks the expanded list
/// deterministically, and wrap-around makes the layout order-sensitive.
pub type HashPositionMaps = Vec<BTreeMap<u32, Vec<u32>>>;

/// Fresh, empty position maps (one per subtable).
pub fn new_position_maps() -> HashPositionMaps {
    (0..SUBTABLE_COUNT).map(|_| BTreeMap::new()).collect()
}

/// One parsed top-index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopIndexEntry {
    /// Absolute file position of the subtable.
    pub position: u32,

    /// Number of slots in the subtable (twice the record count).
    pub slot_count: u32,
}

/// Starting slot for a hash in a subtable of `slot_count` slots.
///
/// The low 8 bits already selected the subtable, so placement uses the
/// next bits up.
#[inline]
pub fn start_slot(hash: u32, slot_count: u32) -> u32 {
    (hash >> 8) % slot_count
}

// ------------------------------------------------------------------------------------------------
// Construction (seal path)
// ------------------------------------------------------------------------------------------------

/// Build the serialized hash region and top index for a segment whose
/// record region ends at `region_base`.
///
/// Returns `(top_index_bytes, hash_region_bytes)`; the caller writes the
/// region at `region_base` and the top index at byte 0. Empty subtables
/// get a `(running_base, 0)` placeholder so every entry still points into
/// the file.
pub fn build_hash_index(maps: &HashPositionMaps, region_base: u32) -> (Vec<u8>, Vec<u8>) {
    let mut top = Vec::with_capacity(TOP_INDEX_BYTES);
    let mut region = Vec::new();
    let mut base = region_base;

    for map in maps.iter() {
        let entry_count: usize = map.values().map(Vec::len).sum();
        if entry_count == 0 {
            top.extend_from_slice(&base.to_le_bytes());
            top.extend_from_slice(&0u32.to_le_bytes());
            continue;
        }

        let slot_count = (entry_count * 2) as u32;
        let mut slots = vec![0u64; slot_count as usize];

        // Expand (hash, positions…) so each record occupies one logical
        // entry, then open-address with forward linear probing.
        for (&hash, positions) in map.iter() {
            for &position in positions {
                let mut slot = start_slot(hash, slot_count);
                while slots[slot as usize] != 0 {
                    slot = (slot + 1) % slot_count;
                }
                slots[slot as usize] =
                    u64::from(hash) | (u64::from(position) << 32);
            }
        }

        for packed in slots {
            let hash = packed as u32;
            let position = (packed >> 32) as u32;
            region.extend_from_slice(&hash.to_le_bytes());
            region.extend_from_slice(&position.to_le_bytes());
        }

        top.extend_from_slice(&base.to_le_bytes());
        top.extend_from_slice(&slot_count.to_le_bytes());
        base += slot_count * SLOT_BYTES as u32;
    }

    debug_assert_eq!(top.len(), TOP_INDEX_BYTES);
    debug_assert_eq!(region.len(), (base - region_base) as usize);
    (top, region)
}

// ------------------------------------------------------------------------------------------------
// Parsing (read path)
// ------------------------------------------------------------------------------------------------

/// Parse the 2048-byte top index into its 256 entries.
///
/// Returns `None` if the slice is not exactly [`TOP_INDEX_BYTES`] long.
pub fn parse_top_index(bytes: &[u8]) -> Option<Vec<TopIndexEntry>> {
    if bytes.len() != TOP_INDEX_BYTES {
        return None;
    }
    let mut entries = Vec::with_capacity(SUBTABLE_COUNT);
    for pair in bytes.chunks_exact(8) {
        let position = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let slot_count = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        entries.push(TopIndexEntry {
            position,
            slot_count,
        });
    }
    Some(entries)
}

/// Read slot `index` of a subtable that starts at `table.position`,
/// given the whole file as `data`. Returns `(hash, position)`.
#[inline]
pub fn read_slot(data: &[u8], table: TopIndexEntry, index: u32) -> Option<(u32, u32)> {
    let offset = table.position as usize + index as usize * SLOT_BYTES;
    let slot = data.get(offset..offset + SLOT_BYTES)?;
    let hash = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
    let position = u32::from_le_bytes([slot[4], slot[5], slot[6], slot[7]]);
    Some((hash, position))
}

/// Iterate the probe chain for `hash` within `table`: slot indices in probe
/// order, covering every slot exactly once.
pub fn probe_order(hash: u32, table: TopIndexEntry) -> impl Iterator<Item = u32> {
    let count = table.slot_count;
    let first = if count == 0 { 0 } else { start_slot(hash, count) };
    (0..count).map(move |step| (first + step) % count)
}
