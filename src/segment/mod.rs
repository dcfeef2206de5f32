//! CDB-style journal segment files.
//!
//! A segment is one append-only run of `{journal key → value}` records,
//! terminated at seal time by a two-level hash index that makes every record
//! addressable by the DJB2 hash of its key bytes. Files are named
//! `<prefix>_<sqn>.pnd` while writable and renamed to `.cdb` when sealed;
//! after sealing, the record region and top index are immutable and only
//! deletion is permitted.
//!
//! # On-disk layout
//!
//! ```text
//! [top index: 256 × (u32 position LE, u32 slot_count LE)]      bytes 0..2048
//! [record][record]…                                            bytes 2048..H
//! [hash region: 256 subtables of (u32 hash LE, u32 pos LE)]    bytes H..EOF
//! ```
//!
//! Each record is framed as:
//!
//! ```text
//! [u32 key_len LE][u32 val_len LE][key bytes][u32 crc BE][value bytes]
//! ```
//!
//! where `val_len = value.len() + 4` (it counts the CRC) and the CRC32 is
//! computed over the value bytes alone. The mixed endianness is part of the
//! format: lengths and slots are little-endian, the record CRC is big-endian.
//!
//! # Write path and recovery
//!
//! [`SegmentWriter`] appends records at a cursor that starts at byte 2048
//! (the top-index region is reserved up front) and mirrors every persisted
//! position into 256 in-memory ordered maps. Re-opening a `.pnd` file scans
//! forward from byte 2048 rebuilding those maps and **truncates at the first
//! record that cannot be read or fails its CRC** — a torn tail from a crash
//! is silently cut and the cursor resumes after the last good record.
//!
//! # Read path
//!
//! [`SegmentReader`] memory-maps the sealed file, keeps the parsed top index,
//! and resolves lookups by linear-probing the subtable for `hash & 0xFF`
//! starting at `(hash >> 8) % slot_count`. A corrupt record behind a probed
//! slot is skipped and probing continues; an all-zero slot ends the chain.
//!
//! # Concurrency
//!
//! Neither type is internally synchronized; the [`actor`] submodule wraps a
//! segment in a single-consumer mailbox thread and owns the
//! writer → rolling → reader → delete-pending lifecycle, including the
//! delegated hash-region computation (`roll`) and the deferred-deletion
//! handshake with the inker.

#[cfg(test)]
mod tests;

pub mod actor;
pub mod hashindex;

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::bloom::SegmentBloom;
use crate::encoding::EncodingError;
use crate::record::{hash_journal_key, subtable_index, JournalKey, Sqn};
use hashindex::{
    build_hash_index, new_position_maps, parse_top_index, probe_order, read_slot,
    HashPositionMaps, TopIndexEntry, RECORD_REGION_START, TOP_INDEX_BYTES,
};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Extension of a writable (unsealed) segment.
pub const WRITABLE_EXT: &str = "pnd";

/// Extension of a sealed, hash-indexed segment.
pub const SEALED_EXT: &str = "cdb";

/// Fixed record header size: two little-endian `u32` length fields.
const RECORD_HEADER_BYTES: u32 = 8;

/// Upper bound on serialized key length; larger headers are corruption.
const MAX_KEY_LEN: u32 = 1024 * 1024;

/// Upper bound on the `val_len` field; larger headers are corruption.
const MAX_VAL_LEN: u32 = crate::encoding::MAX_BYTE_LEN + 4;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key serialization failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The file does not carry the extension the operation requires.
    #[error("unexpected extension on {path} (expected .{expected})")]
    WrongExtension {
        /// Offending path.
        path: String,
        /// Extension the operation requires.
        expected: &'static str,
    },

    /// A record pointed to by the hash index could not be decoded.
    #[error("corrupt record at position {position}: {reason}")]
    CorruptRecord {
        /// File position of the bad record.
        position: u32,
        /// What failed.
        reason: &'static str,
    },

    /// The sealed top index region could not be parsed.
    #[error("corrupt top index in {path}")]
    CorruptTopIndex {
        /// Offending path.
        path: String,
    },

    /// Sealing would push the hash region past the 32-bit position space.
    #[error("segment too large to seal: {bytes} bytes")]
    TooLargeToSeal {
        /// Total sealed size that was attempted.
        bytes: u64,
    },

    /// The operation is not served in the segment's current state.
    #[error("operation {operation} not available in state {state}")]
    WrongState {
        /// Requested operation.
        operation: &'static str,
        /// State the segment was in.
        state: &'static str,
    },

    /// The segment's actor thread has terminated.
    #[error("segment actor is gone")]
    ActorGone,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Operation results
// ------------------------------------------------------------------------------------------------

/// Outcome of an append.
#[derive(Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The record was written; the cursor now sits at the contained offset.
    Written {
        /// New append cursor.
        cursor: u32,
    },

    /// The record would exceed `max_file_size`. Nothing was written; the
    /// caller must seal this segment and open a fresh one.
    Roll,
}

/// Loose presence answer from a key check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPresence {
    /// A slot with a matching hash exists; the key bytes were not compared.
    Probably,

    /// No slot can hold this key.
    Missing,
}

/// How much of each record [`SegmentReader::direct_fetch`] should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Key only.
    Key,

    /// Key plus the stored `val_len` field (value bytes + 4-byte CRC).
    KeySize,

    /// Key, value bytes, and the result of the CRC check.
    KeyValueCheck,
}

/// One record returned by [`SegmentReader::direct_fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedRecord {
    /// Key only.
    Key(JournalKey),

    /// Key plus the stored `val_len` field.
    KeySize {
        /// Decoded journal key.
        key: JournalKey,
        /// The on-disk `val_len` field (value length + 4).
        val_len: u32,
    },

    /// Key, value, and CRC verdict.
    KeyValueCheck {
        /// Decoded journal key.
        key: JournalKey,
        /// Raw value bytes.
        value: Vec<u8>,
        /// Whether the stored CRC matched the value bytes.
        crc_ok: bool,
    },
}

impl FetchedRecord {
    /// The journal key, whichever mode produced this record.
    pub fn key(&self) -> &JournalKey {
        match self {
            FetchedRecord::Key(key) => key,
            FetchedRecord::KeySize { key, .. } => key,
            FetchedRecord::KeyValueCheck { key, .. } => key,
        }
    }
}

/// Control flow decision returned by a [`SegmentReader::scan`] filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    /// Keep scanning.
    Continue,

    /// Stop; `scan` returns the position after the current record.
    Stop,
}

/// Position selection for [`SegmentReader::get_positions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSample {
    /// Every populated slot, sorted ascending (record insertion order).
    All,

    /// Up to `n` positions, gathered from subtables visited in a uniformly
    /// shuffled order.
    Sample(usize),
}

// ------------------------------------------------------------------------------------------------
// Record framing
// ------------------------------------------------------------------------------------------------

/// A record parsed off disk.
#[derive(Debug)]
struct RawRecord {
    /// Serialized key bytes as stored.
    key_bytes: Vec<u8>,
    /// Value bytes (CRC stripped).
    value: Vec<u8>,
    /// Whether the stored CRC matched.
    crc_ok: bool,
    /// Position immediately after this record.
    next: u32,
}

/// Frame a record for appending: lengths, key, big-endian CRC, value.
fn frame_record(key_bytes: &[u8], value: &[u8]) -> Vec<u8> {
    let mut frame =
        Vec::with_capacity(RECORD_HEADER_BYTES as usize + key_bytes.len() + 4 + value.len());
    frame.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&((value.len() + 4) as u32).to_le_bytes());
    frame.extend_from_slice(key_bytes);
    frame.extend_from_slice(&crc32fast::hash(value).to_be_bytes());
    frame.extend_from_slice(value);
    frame
}

/// Anything we can read record bytes out of at absolute positions.
trait ByteSource {
    /// Fill `buf` from `offset`, or report that the range is unavailable.
    fn read_at_exact(&self, buf: &mut [u8], offset: u64) -> io::Result<bool>;
}

impl ByteSource for File {
    fn read_at_exact(&self, buf: &mut [u8], offset: u64) -> io::Result<bool> {
        match FileExt::read_exact_at(self, buf, offset) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl ByteSource for Mmap {
    fn read_at_exact(&self, buf: &mut [u8], offset: u64) -> io::Result<bool> {
        let start = offset as usize;
        match self.get(start..start + buf.len()) {
            Some(bytes) => {
                buf.copy_from_slice(bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Parse the record at `pos`, refusing to read past `limit`.
///
/// Returns `Ok(None)` when the record is unreadable — short header, absurd
/// lengths, or a frame crossing `limit`. CRC failures still return a record
/// (with `crc_ok = false`); the caller decides whether that is a truncation
/// signal or a skippable slot.
fn parse_record<S: ByteSource>(
    source: &S,
    pos: u32,
    limit: u32,
) -> Result<Option<RawRecord>, SegmentError> {
    if pos >= limit || limit - pos < RECORD_HEADER_BYTES {
        return Ok(None);
    }

    let mut header = [0u8; RECORD_HEADER_BYTES as usize];
    if !source.read_at_exact(&mut header, u64::from(pos))? {
        return Ok(None);
    }
    let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let val_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if key_len == 0 || key_len > MAX_KEY_LEN || val_len < 4 || val_len > MAX_VAL_LEN {
        return Ok(None);
    }
    let body_len = u64::from(key_len) + u64::from(val_len);
    if u64::from(pos) + u64::from(RECORD_HEADER_BYTES) + body_len > u64::from(limit) {
        return Ok(None);
    }

    let mut body = vec![0u8; body_len as usize];
    if !source.read_at_exact(&mut body, u64::from(pos + RECORD_HEADER_BYTES))? {
        return Ok(None);
    }

    let key_bytes = body[..key_len as usize].to_vec();
    let stored_crc = u32::from_be_bytes([
        body[key_len as usize],
        body[key_len as usize + 1],
        body[key_len as usize + 2],
        body[key_len as usize + 3],
    ]);
    let value = body[key_len as usize + 4..].to_vec();
    let crc_ok = crc32fast::hash(&value) == stored_crc;

    Ok(Some(RawRecord {
        key_bytes,
        value,
        crc_ok,
        next: pos + RECORD_HEADER_BYTES + key_len + val_len,
    }))
}

// ------------------------------------------------------------------------------------------------
// Path helpers
// ------------------------------------------------------------------------------------------------

fn require_extension(path: &Path, expected: &'static str) -> Result<(), SegmentError> {
    if path.extension().and_then(|e| e.to_str()) == Some(expected) {
        Ok(())
    } else {
        Err(SegmentError::WrongExtension {
            path: path.display().to_string(),
            expected,
        })
    }
}

/// `.pnd` path → `.cdb` path.
fn sealed_path_for(path: &Path) -> PathBuf {
    path.with_extension(SEALED_EXT)
}

// ------------------------------------------------------------------------------------------------
// Shared lookup plumbing
// ------------------------------------------------------------------------------------------------

/// Look a key up through the writer-side position maps, reading candidate
/// records back from the file to resolve hash collisions.
fn maps_get(
    maps: &HashPositionMaps,
    file: &File,
    cursor: u32,
    key: &JournalKey,
) -> Result<Option<Vec<u8>>, SegmentError> {
    let key_bytes = key.to_bytes()?;
    let hash = crate::record::magic_hash(&key_bytes);
    let Some(positions) = maps[subtable_index(hash)].get(&hash) else {
        return Ok(None);
    };
    for &position in positions {
        if let Some(record) = parse_record(file, position, cursor)? {
            if record.key_bytes == key_bytes && record.crc_ok {
                return Ok(Some(record.value));
            }
        }
    }
    Ok(None)
}

/// Loose presence through the writer-side maps: hash match only.
fn maps_key_check(maps: &HashPositionMaps, key: &JournalKey) -> Result<KeyPresence, SegmentError> {
    let hash = hash_journal_key(key)?;
    if maps[subtable_index(hash)].contains_key(&hash) {
        Ok(KeyPresence::Probably)
    } else {
        Ok(KeyPresence::Missing)
    }
}

/// Write the hash region and top index, fsync, and rename `.pnd` → `.cdb`.
///
/// Shared tail of the two seal paths (`complete` computes the index inline;
/// `roll` receives it from a helper thread).
fn seal_with_index(
    file: &File,
    path: &Path,
    cursor: u32,
    top_index: &[u8],
    hash_region: &[u8],
) -> Result<PathBuf, SegmentError> {
    let total = u64::from(cursor) + hash_region.len() as u64;
    if total > u64::from(u32::MAX) {
        return Err(SegmentError::TooLargeToSeal { bytes: total });
    }

    file.write_all_at(hash_region, u64::from(cursor))?;
    file.write_all_at(top_index, 0)?;
    file.set_len(total)?;
    file.sync_all()?;

    let sealed = sealed_path_for(path);
    fs::rename(path, &sealed)?;
    info!(
        path = %sealed.display(),
        record_bytes = cursor - RECORD_REGION_START,
        index_bytes = hash_region.len(),
        "sealed segment"
    );
    Ok(sealed)
}

// ------------------------------------------------------------------------------------------------
// SegmentWriter
// ------------------------------------------------------------------------------------------------

/// Append-side handle on a `.pnd` segment file.
///
/// Holds the file, the append cursor, and the in-memory hash maps that
/// mirror exactly the set of positions persisted to disk.
#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,
    file: File,
    cursor: u32,
    max_file_size: u64,
    maps: HashPositionMaps,
    last_key: Option<JournalKey>,
    low_sqn: Option<Sqn>,
}

impl SegmentWriter {
    /// Create a fresh `.pnd` segment, reserving the top-index region.
    pub fn create(path: impl AsRef<Path>, max_file_size: u64) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        require_extension(&path, WRITABLE_EXT)?;

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(u64::from(RECORD_REGION_START))?;
        info!(path = %path.display(), "created segment for writing");

        Ok(Self {
            path,
            file,
            cursor: RECORD_REGION_START,
            max_file_size,
            maps: new_position_maps(),
            last_key: None,
            low_sqn: None,
        })
    }

    /// Open an existing `.pnd` segment for further appends, recovering the
    /// in-memory maps by a forward scan.
    ///
    /// The scan stops at the first record whose header cannot be read or
    /// whose CRC fails; the file is truncated there and that position
    /// becomes the append cursor.
    pub fn open(path: impl AsRef<Path>, max_file_size: u64) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        require_extension(&path, WRITABLE_EXT)?;

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < u64::from(RECORD_REGION_START) {
            file.set_len(u64::from(RECORD_REGION_START))?;
        }
        let scan_limit = u32::try_from(file_len.min(u64::from(u32::MAX))).unwrap_or(u32::MAX);

        let mut writer = Self {
            path,
            file,
            cursor: RECORD_REGION_START,
            max_file_size,
            maps: new_position_maps(),
            last_key: None,
            low_sqn: None,
        };

        loop {
            match parse_record(&writer.file, writer.cursor, scan_limit)? {
                Some(record) if record.crc_ok => {
                    let key = match JournalKey::from_bytes(&record.key_bytes) {
                        Ok(key) => key,
                        // An undecodable key is corruption like any other:
                        // the tail is cut here.
                        Err(_) => break,
                    };
                    let hash = crate::record::magic_hash(&record.key_bytes);
                    writer.maps[subtable_index(hash)]
                        .entry(hash)
                        .or_default()
                        .push(writer.cursor);
                    writer.low_sqn.get_or_insert(key.sqn);
                    writer.last_key = Some(key);
                    writer.cursor = record.next;
                }
                _ => break,
            }
        }

        if u64::from(writer.cursor) < file_len {
            warn!(
                path = %writer.path.display(),
                cursor = writer.cursor,
                file_len,
                "truncating torn segment tail"
            );
            writer.file.set_len(u64::from(writer.cursor))?;
            writer.file.sync_all()?;
        }
        info!(
            path = %writer.path.display(),
            cursor = writer.cursor,
            records = writer.record_count(),
            "opened segment for writing"
        );
        Ok(writer)
    }

    /// Append one record.
    ///
    /// Returns [`PutOutcome::Roll`] — without writing — when the framed
    /// record would push the cursor past `max_file_size`.
    pub fn put(&mut self, key: &JournalKey, value: &[u8]) -> Result<PutOutcome, SegmentError> {
        let key_bytes = key.to_bytes()?;
        let frame = frame_record(&key_bytes, value);
        if u64::from(self.cursor) + frame.len() as u64 > self.max_file_size {
            debug!(path = %self.path.display(), cursor = self.cursor, "segment full, roll requested");
            return Ok(PutOutcome::Roll);
        }

        self.file.write_all_at(&frame, u64::from(self.cursor))?;
        let hash = crate::record::magic_hash(&key_bytes);
        self.maps[subtable_index(hash)]
            .entry(hash)
            .or_default()
            .push(self.cursor);
        self.low_sqn.get_or_insert(key.sqn);
        self.last_key = Some(key.clone());
        self.cursor += frame.len() as u32;
        trace!(sqn = key.sqn, cursor = self.cursor, "appended record");
        Ok(PutOutcome::Written {
            cursor: self.cursor,
        })
    }

    /// Append a batch in one physical write.
    ///
    /// Same semantics as [`put`](Self::put) applied to the whole batch: if
    /// the combined frame would overflow the file, nothing is written and
    /// `Roll` is returned.
    pub fn mput(&mut self, batch: &[(JournalKey, Vec<u8>)]) -> Result<PutOutcome, SegmentError> {
        let mut frames = Vec::new();
        let mut offsets = Vec::with_capacity(batch.len());
        for (key, value) in batch {
            offsets.push(frames.len() as u32);
            frames.extend_from_slice(&frame_record(&key.to_bytes()?, value));
        }
        if u64::from(self.cursor) + frames.len() as u64 > self.max_file_size {
            return Ok(PutOutcome::Roll);
        }

        self.file.write_all_at(&frames, u64::from(self.cursor))?;
        for ((key, _), offset) in batch.iter().zip(offsets) {
            let key_bytes = key.to_bytes()?;
            let hash = crate::record::magic_hash(&key_bytes);
            let position = self.cursor + offset;
            self.maps[subtable_index(hash)]
                .entry(hash)
                .or_default()
                .push(position);
            self.low_sqn.get_or_insert(key.sqn);
            self.last_key = Some(key.clone());
        }
        self.cursor += frames.len() as u32;
        trace!(records = batch.len(), cursor = self.cursor, "appended batch");
        Ok(PutOutcome::Written {
            cursor: self.cursor,
        })
    }

    /// Exact lookup through the in-memory maps.
    pub fn get(&self, key: &JournalKey) -> Result<Option<Vec<u8>>, SegmentError> {
        maps_get(&self.maps, &self.file, self.cursor, key)
    }

    /// Loose presence check: hash match without key comparison.
    pub fn key_check(&self, key: &JournalKey) -> Result<KeyPresence, SegmentError> {
        maps_key_check(&self.maps, key)
    }

    /// All key hashes persisted so far, one per record.
    pub fn key_hashes(&self) -> Vec<u32> {
        self.maps
            .iter()
            .flat_map(|map| {
                map.iter()
                    .flat_map(|(&hash, positions)| positions.iter().map(move |_| hash))
            })
            .collect()
    }

    /// Bloom filter over the persisted key hashes.
    pub fn bloom(&self) -> SegmentBloom {
        SegmentBloom::from_hashes(&self.key_hashes())
    }

    /// Number of records persisted.
    pub fn record_count(&self) -> usize {
        self.maps.iter().map(|m| m.values().map(Vec::len).sum::<usize>()).sum()
    }

    /// Current append cursor.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// SQN of the first record, if any.
    pub fn low_sqn(&self) -> Option<Sqn> {
        self.low_sqn
    }

    /// Key of the most recently appended (or recovered) record.
    pub fn last_key(&self) -> Option<&JournalKey> {
        self.last_key.as_ref()
    }

    /// Path of the underlying `.pnd` file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seal inline: compute the hash region here, write it and the top
    /// index, rename to `.cdb`, and reopen as a reader.
    ///
    /// This is the synchronous seal path; the actor's `roll` delegates the
    /// index computation to a helper thread instead and keeps serving reads
    /// in the meantime.
    pub fn complete(self) -> Result<SegmentReader, SegmentError> {
        let (top, region) = build_hash_index(&self.maps, self.cursor);
        let sealed = seal_with_index(&self.file, &self.path, self.cursor, &top, &region)?;
        drop(self.file);
        SegmentReader::open(sealed)
    }

    /// Decompose into the parts the actor needs while a delegated roll is
    /// in flight.
    pub(crate) fn into_rolling(self) -> RollingSegment {
        RollingSegment {
            path: self.path,
            file: self.file,
            cursor: self.cursor,
            maps: self.maps,
            last_key: self.last_key,
            low_sqn: self.low_sqn,
        }
    }
}

/// A writer frozen for sealing: appends are refused, reads are still served
/// from the in-memory maps while a helper computes the hash index.
#[derive(Debug)]
pub(crate) struct RollingSegment {
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    pub(crate) cursor: u32,
    pub(crate) maps: HashPositionMaps,
    pub(crate) last_key: Option<JournalKey>,
    pub(crate) low_sqn: Option<Sqn>,
}

impl RollingSegment {
    pub(crate) fn get(&self, key: &JournalKey) -> Result<Option<Vec<u8>>, SegmentError> {
        maps_get(&self.maps, &self.file, self.cursor, key)
    }

    pub(crate) fn key_check(&self, key: &JournalKey) -> Result<KeyPresence, SegmentError> {
        maps_key_check(&self.maps, key)
    }

    /// Finish the roll with an index computed elsewhere.
    pub(crate) fn finish(
        self,
        top_index: Vec<u8>,
        hash_region: Vec<u8>,
    ) -> Result<SegmentReader, SegmentError> {
        let sealed = seal_with_index(&self.file, &self.path, self.cursor, &top_index, &hash_region)?;
        drop(self.file);
        SegmentReader::open(sealed)
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentReader
// ------------------------------------------------------------------------------------------------

/// Read-side handle on a sealed `.cdb` segment.
///
/// The file is memory-mapped; lookups probe the on-disk hash region through
/// the parsed top index. Readers are cheap to share behind the actor and
/// never mutate the file.
#[derive(Debug)]
pub struct SegmentReader {
    path: PathBuf,
    /// Kept open for the lifetime of the map.
    _file: File,
    data: Mmap,
    top_index: Vec<TopIndexEntry>,
    hash_region_start: u32,
    last_key: Option<JournalKey>,
    low_sqn: Option<Sqn>,
}

impl SegmentReader {
    /// Open a sealed segment: load the top index, locate the record-region
    /// boundary, and derive `low_sqn` / `last_key` from the file itself.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        require_extension(&path, SEALED_EXT)?;

        let file = File::open(&path)?;
        // SAFETY: the segment is sealed and immutable from here on; no
        // writer exists for a `.cdb` file.
        let data = unsafe { Mmap::map(&file)? };

        let top_bytes = data
            .get(..TOP_INDEX_BYTES)
            .ok_or_else(|| SegmentError::CorruptTopIndex {
                path: path.display().to_string(),
            })?;
        let top_index = parse_top_index(top_bytes).ok_or_else(|| SegmentError::CorruptTopIndex {
            path: path.display().to_string(),
        })?;

        // Subtables are laid out in index order, so entry 0 starts the
        // hash region whether or not it is populated.
        let hash_region_start = top_index[0].position;
        if u64::from(hash_region_start) > data.len() as u64
            || hash_region_start < RECORD_REGION_START
        {
            return Err(SegmentError::CorruptTopIndex {
                path: path.display().to_string(),
            });
        }

        let mut reader = Self {
            path,
            _file: file,
            data,
            top_index,
            hash_region_start,
            last_key: None,
            low_sqn: None,
        };

        reader.low_sqn = match reader.record_at(RECORD_REGION_START)? {
            Some(record) => Some(JournalKey::from_bytes(&record.key_bytes)?.sqn),
            None => None,
        };
        reader.last_key = reader.find_last_key()?;
        debug!(
            path = %reader.path.display(),
            low_sqn = ?reader.low_sqn,
            hash_region_start,
            "opened sealed segment"
        );
        Ok(reader)
    }

    /// The last physical record is the one at the highest position named by
    /// any hash slot.
    fn find_last_key(&self) -> Result<Option<JournalKey>, SegmentError> {
        let mut max_position: Option<u32> = None;
        for table in &self.top_index {
            for index in 0..table.slot_count {
                if let Some((hash, position)) = read_slot(&self.data, *table, index) {
                    if hash == 0 && position == 0 {
                        continue;
                    }
                    if max_position.is_none_or(|current| position > current) {
                        max_position = Some(position);
                    }
                }
            }
        }
        match max_position {
            None => Ok(None),
            Some(position) => {
                let record =
                    self.record_at(position)?
                        .ok_or(SegmentError::CorruptRecord {
                            position,
                            reason: "last record unreadable",
                        })?;
                Ok(Some(JournalKey::from_bytes(&record.key_bytes)?))
            }
        }
    }

    fn record_at(&self, position: u32) -> Result<Option<RawRecord>, SegmentError> {
        parse_record(&self.data, position, self.hash_region_start)
    }

    /// Exact lookup: probe the subtable, compare key bytes, verify the CRC.
    ///
    /// Corrupt records behind probed slots are skipped; a zero slot or an
    /// exhausted chain yields `None`.
    pub fn get(&self, key: &JournalKey) -> Result<Option<Vec<u8>>, SegmentError> {
        let key_bytes = key.to_bytes()?;
        let hash = crate::record::magic_hash(&key_bytes);
        let table = self.top_index[subtable_index(hash)];
        if table.slot_count == 0 {
            return Ok(None);
        }

        for index in probe_order(hash, table) {
            let Some((slot_hash, position)) = read_slot(&self.data, table, index) else {
                break;
            };
            if slot_hash == 0 && position == 0 {
                break;
            }
            if slot_hash != hash {
                continue;
            }
            match self.record_at(position)? {
                Some(record) if record.key_bytes == key_bytes => {
                    if record.crc_ok {
                        return Ok(Some(record.value));
                    }
                    warn!(
                        path = %self.path.display(),
                        position,
                        "CRC failure behind hash slot, continuing probe"
                    );
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Loose presence: stop at the first matching hash without touching the
    /// record bytes.
    pub fn key_check(&self, key: &JournalKey) -> Result<KeyPresence, SegmentError> {
        let hash = hash_journal_key(key)?;
        let table = self.top_index[subtable_index(hash)];
        for index in probe_order(hash, table) {
            let Some((slot_hash, position)) = read_slot(&self.data, table, index) else {
                break;
            };
            if slot_hash == 0 && position == 0 {
                break;
            }
            if slot_hash == hash {
                return Ok(KeyPresence::Probably);
            }
        }
        Ok(KeyPresence::Missing)
    }

    /// Collect record positions per [`PositionSample`].
    ///
    /// `All` walks every subtable in order and returns positions sorted
    /// ascending — which is record insertion order, so rewrites that feed
    /// from this list preserve SQN order. `Sample(n)` visits subtables in a
    /// uniformly shuffled order and stops once `n` positions are gathered.
    pub fn get_positions(&self, sample: PositionSample, seed: Option<u64>) -> Vec<u32> {
        let mut order: Vec<usize> = (0..self.top_index.len()).collect();
        let cap = match sample {
            PositionSample::All => usize::MAX,
            PositionSample::Sample(n) => {
                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_os_rng(),
                };
                order.shuffle(&mut rng);
                n
            }
        };

        let mut positions = Vec::new();
        for table_index in order {
            if positions.len() >= cap {
                break;
            }
            let table = self.top_index[table_index];
            for index in 0..table.slot_count {
                if let Some((hash, position)) = read_slot(&self.data, table, index) {
                    if hash == 0 && position == 0 {
                        continue;
                    }
                    positions.push(position);
                    if positions.len() >= cap {
                        break;
                    }
                }
            }
        }
        if matches!(sample, PositionSample::All) {
            positions.sort_unstable();
        }
        positions
    }

    /// Read the records at the given positions.
    ///
    /// Positions are expected to come from [`get_positions`](Self::get_positions);
    /// a position that does not frame a record, or whose key does not
    /// decode, is a [`SegmentError::CorruptRecord`].
    pub fn direct_fetch(
        &self,
        positions: &[u32],
        mode: FetchMode,
    ) -> Result<Vec<FetchedRecord>, SegmentError> {
        let mut records = Vec::with_capacity(positions.len());
        for &position in positions {
            let record = self
                .record_at(position)?
                .ok_or(SegmentError::CorruptRecord {
                    position,
                    reason: "unreadable record frame",
                })?;
            let key = JournalKey::from_bytes(&record.key_bytes)?;
            records.push(match mode {
                FetchMode::Key => FetchedRecord::Key(key),
                FetchMode::KeySize => FetchedRecord::KeySize {
                    key,
                    val_len: record.value.len() as u32 + 4,
                },
                FetchMode::KeyValueCheck => FetchedRecord::KeyValueCheck {
                    key,
                    value: record.value,
                    crc_ok: record.crc_ok,
                },
            });
        }
        Ok(records)
    }

    /// Linear scan of the record region.
    ///
    /// Starting at `start` (default: start of the record region), decode
    /// records and feed `(key, value bytes, position)` to `filter` together
    /// with the accumulator. Scanning ends on [`ScanControl::Stop`], at the
    /// hash-region boundary, or at the first record that fails to decode.
    /// Returns the resume position and the accumulator.
    pub fn scan<A>(
        &self,
        start: Option<u32>,
        mut acc: A,
        mut filter: impl FnMut(&JournalKey, &[u8], u32, &mut A) -> ScanControl,
    ) -> Result<(u32, A), SegmentError> {
        let mut position = start.unwrap_or(RECORD_REGION_START);
        while position < self.hash_region_start {
            let Some(record) = self.record_at(position)? else {
                break;
            };
            if !record.crc_ok {
                break;
            }
            let Ok(key) = JournalKey::from_bytes(&record.key_bytes) else {
                break;
            };
            let control = filter(&key, &record.value, position, &mut acc);
            position = record.next;
            if control == ScanControl::Stop {
                break;
            }
        }
        Ok((position, acc))
    }

    /// First byte of the hash region — one past the last record byte.
    pub fn hash_region_start(&self) -> u32 {
        self.hash_region_start
    }

    /// SQN of the first record, if the segment holds any records.
    pub fn low_sqn(&self) -> Option<Sqn> {
        self.low_sqn
    }

    /// Key of the last physical record.
    pub fn last_key(&self) -> Option<&JournalKey> {
        self.last_key.as_ref()
    }

    /// Path of the underlying `.cdb` file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the segment file: into the waste directory when one is
    /// configured (keeping the file name), otherwise delete outright.
    pub fn remove(self, waste_dir: Option<&Path>) -> Result<(), SegmentError> {
        let path = self.path.clone();
        drop(self);
        match waste_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let target = dir.join(path.file_name().ok_or_else(|| {
                    SegmentError::Internal(format!("segment path has no file name: {path:?}"))
                })?);
                fs::rename(&path, &target)?;
                info!(from = %path.display(), to = %target.display(), "segment moved to waste");
            }
            None => {
                fs::remove_file(&path)?;
                info!(path = %path.display(), "segment deleted");
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Position sampling seed helper
// ------------------------------------------------------------------------------------------------

/// Derive a fresh sampling seed from an optional configured base seed.
///
/// With a configured seed, sampling is fully reproducible across runs; the
/// per-call counter still decorrelates successive samples.
pub(crate) fn derive_seed(base: Option<u64>, counter: u64) -> Option<u64> {
    base.map(|seed| seed.wrapping_add(counter.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
}
