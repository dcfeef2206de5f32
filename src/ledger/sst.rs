//! Sorted-run (SST) files for the ledger side.
//!
//! An SST holds `(key, sqn, value)` cells sorted by key ascending, SQN
//! descending within a key; a cell with no value is a tombstone. Files are
//! immutable once written and read through a memory map.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER (8 B bincode) ][HEADER_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! ...
//! [BLOOM_LEN_LE][BLOOM_BYTES][BLOOM_CRC32_LE]
//! [PROPS_LEN_LE][PROPS_BYTES][PROPS_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER (fixed size, with CRC32)]
//! ```
//!
//! Every block is serialized with `bincode` fixed-int little-endian and
//! framed `[u32 len][bytes][u32 crc32]`. The footer carries handles to the
//! bloom, properties, and index blocks; the index maps each data block's
//! first key to its handle. Files are written to a `.tmp` path and renamed
//! into place, so a crash cannot leave a partial SST behind.

use std::fs::{rename, File, OpenOptions};
use std::io::{self, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use bincode::config::standard;
use bincode::{decode_from_slice, encode_to_vec};
use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

const SST_MAGIC: [u8; 4] = *b"QSST";
const SST_VERSION: u32 = 1;
const SST_HEADER_SIZE: usize = 12;
const SST_BLOOM_FP_RATE: f64 = 0.01;
const SST_BLOCK_MAX_SIZE: usize = 4096;
/// Fixint encoding of [`SstFooter`]: three 16-byte handles + u64 + u32.
const SST_FOOTER_SIZE: usize = 60;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by SST operations.
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error.
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// A block or the footer failed its CRC32 check.
    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),

    /// Structural damage: bad magic, truncated file, handle out of range.
    #[error("corrupt SST {path}: {reason}")]
    Corrupt {
        /// Offending path.
        path: String,
        /// What failed.
        reason: &'static str,
    },

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Cells and file structures
// ------------------------------------------------------------------------------------------------

/// One sorted-run entry.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SstCell {
    /// Ledger key bytes.
    pub key: Vec<u8>,

    /// Journal SQN that produced this version.
    pub sqn: u64,

    /// Value bytes; `None` is a tombstone.
    pub value: Option<Vec<u8>>,
}

impl SstCell {
    /// Is this cell a deletion marker?
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, bincode::Encode, bincode::Decode)]
struct SstHeader {
    magic: [u8; 4],
    version: u32,
}

/// Offset/size pair locating a framed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub(crate) struct BlockHandle {
    offset: u64,
    size: u64,
}

/// Table-level statistics, used for overlap tests and merge bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SstProperties {
    /// Total cells (tombstones included).
    pub cell_count: u64,

    /// Tombstone cells.
    pub tombstone_count: u64,

    /// Lowest SQN present.
    pub min_sqn: u64,

    /// Highest SQN present.
    pub max_sqn: u64,

    /// Smallest key.
    pub min_key: Vec<u8>,

    /// Largest key.
    pub max_key: Vec<u8>,
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
struct SstIndexEntry {
    /// First key of the block.
    first_key: Vec<u8>,
    handle: BlockHandle,
}

#[derive(Debug, bincode::Encode, bincode::Decode)]
struct SstFooter {
    bloom: BlockHandle,
    properties: BlockHandle,
    index: BlockHandle,
    total_file_size: u64,
    footer_crc32: u32,
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

/// Write a framed block `[len_le][data][crc32_le]`, returning its handle.
fn write_framed_block(
    writer: &mut (impl Write + Seek),
    data: &[u8],
) -> Result<BlockHandle, SstError> {
    let offset = writer.stream_position()?;
    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&crc32fast::hash(data).to_le_bytes())?;
    Ok(BlockHandle {
        offset,
        size: (4 + data.len() + 4) as u64,
    })
}

/// Read back a framed block, verifying length and CRC.
fn read_framed_block<'a>(
    data: &'a [u8],
    handle: BlockHandle,
    what: &'static str,
) -> Result<&'a [u8], SstError> {
    let start = handle.offset as usize;
    let end = start + handle.size as usize;
    let frame = data
        .get(start..end)
        .ok_or(SstError::ChecksumMismatch(what))?;
    if frame.len() < 8 {
        return Err(SstError::ChecksumMismatch(what));
    }
    let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if frame.len() != 8 + len {
        return Err(SstError::ChecksumMismatch(what));
    }
    let payload = &frame[4..4 + len];
    let stored = u32::from_le_bytes([
        frame[4 + len],
        frame[5 + len],
        frame[6 + len],
        frame[7 + len],
    ]);
    if crc32fast::hash(payload) != stored {
        return Err(SstError::ChecksumMismatch(what));
    }
    Ok(payload)
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Builds a complete SST from a sorted cell stream.
pub struct SstWriter<P: AsRef<Path>> {
    path: P,
}

impl<P: AsRef<Path>> SstWriter<P> {
    /// Target the given output path.
    pub fn new(path: P) -> Self {
        Self { path }
    }

    /// Consume cells — sorted by key ascending, SQN descending within a
    /// key — and write a complete SST atomically.
    ///
    /// `expected_count` sizes the bloom filter; it need not be exact.
    /// Building from an empty stream is an error.
    pub fn build(
        self,
        cells: impl Iterator<Item = SstCell>,
        expected_count: usize,
    ) -> Result<SstProperties, SstError> {
        let config = standard().with_fixed_int_encoding();
        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(&mut file);

        // Header.
        let header_bytes = encode_to_vec(
            &SstHeader {
                magic: SST_MAGIC,
                version: SST_VERSION,
            },
            config,
        )?;
        writer.write_all(&header_bytes)?;
        writer.write_all(&crc32fast::hash(&header_bytes).to_le_bytes())?;

        // Data blocks + stats + bloom.
        let mut bloom = Bloom::new_for_fp_rate(expected_count.max(1), SST_BLOOM_FP_RATE)
            .map_err(|e| SstError::Internal(e.to_string()))?;
        let mut properties = SstProperties {
            cell_count: 0,
            tombstone_count: 0,
            min_sqn: u64::MAX,
            max_sqn: 0,
            min_key: Vec::new(),
            max_key: Vec::new(),
        };
        let mut index: Vec<SstIndexEntry> = Vec::new();
        let mut block: Vec<SstCell> = Vec::new();
        let mut block_bytes = 0usize;

        for cell in cells {
            if properties.cell_count == 0 {
                properties.min_key = cell.key.clone();
            }
            properties.cell_count += 1;
            if cell.is_tombstone() {
                properties.tombstone_count += 1;
            }
            properties.min_sqn = properties.min_sqn.min(cell.sqn);
            properties.max_sqn = properties.max_sqn.max(cell.sqn);
            properties.max_key = cell.key.clone();
            bloom.set(&cell.key);

            block_bytes += cell.key.len() + cell.value.as_ref().map_or(0, Vec::len) + 16;
            block.push(cell);

            if block_bytes >= SST_BLOCK_MAX_SIZE {
                flush_block(&mut writer, &mut block, &mut index, config)?;
                block_bytes = 0;
            }
        }
        if !block.is_empty() {
            flush_block(&mut writer, &mut block, &mut index, config)?;
        }
        if properties.cell_count == 0 {
            return Err(SstError::Internal(
                "refusing to build an empty SST".into(),
            ));
        }
        if properties.min_sqn == u64::MAX {
            properties.min_sqn = 0;
        }

        // Trailing blocks: bloom, properties, index.
        let bloom_handle = write_framed_block(&mut writer, &bloom.as_slice().to_vec())?;
        let props_handle = write_framed_block(&mut writer, &encode_to_vec(&properties, config)?)?;
        let index_handle = write_framed_block(&mut writer, &encode_to_vec(&index, config)?)?;

        // Footer: encode once with a zero CRC, then embed the digest.
        let position = writer.stream_position()?;
        let footer = SstFooter {
            bloom: bloom_handle,
            properties: props_handle,
            index: index_handle,
            total_file_size: position + SST_FOOTER_SIZE as u64,
            footer_crc32: 0,
        };
        let zeroed = encode_to_vec(&footer, config)?;
        let footer = SstFooter {
            footer_crc32: crc32fast::hash(&zeroed),
            ..footer
        };
        writer.write_all(&encode_to_vec(&footer, config)?)?;
        writer.flush()?;
        drop(writer);
        file.sync_all()?;
        drop(file);

        rename(&tmp_path, final_path)?;
        debug!(path = %final_path.display(), cells = properties.cell_count, "SST written");
        Ok(properties)
    }
}

fn flush_block(
    writer: &mut (impl Write + Seek),
    block: &mut Vec<SstCell>,
    index: &mut Vec<SstIndexEntry>,
    config: bincode::config::Configuration<
        bincode::config::LittleEndian,
        bincode::config::Fixint,
    >,
) -> Result<(), SstError> {
    let first_key = match block.first() {
        Some(cell) => cell.key.clone(),
        None => return Ok(()),
    };
    let bytes = encode_to_vec(&*block, config)?;
    let handle = write_framed_block(writer, &bytes)?;
    index.push(SstIndexEntry { first_key, handle });
    block.clear();
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Memory-mapped read handle on one SST.
pub struct SstReader {
    path: PathBuf,
    _file: File,
    data: Mmap,
    /// Table statistics loaded from the properties block.
    pub properties: SstProperties,
    bloom: Bloom<Vec<u8>>,
    index: Vec<SstIndexEntry>,
}

impl SstReader {
    /// Open and validate an SST: header magic and CRC, footer CRC, and the
    /// three trailing blocks.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let config = standard().with_fixed_int_encoding();
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: SSTs are written once and renamed into place; no writer
        // exists for a published file.
        let data = unsafe { Mmap::map(&file)? };

        let corrupt = |reason: &'static str| SstError::Corrupt {
            path: path.display().to_string(),
            reason,
        };

        if data.len() < SST_HEADER_SIZE + SST_FOOTER_SIZE {
            return Err(corrupt("file shorter than header + footer"));
        }
        let header_bytes = &data[..SST_HEADER_SIZE - 4];
        let stored = u32::from_le_bytes([
            data[SST_HEADER_SIZE - 4],
            data[SST_HEADER_SIZE - 3],
            data[SST_HEADER_SIZE - 2],
            data[SST_HEADER_SIZE - 1],
        ]);
        if crc32fast::hash(header_bytes) != stored {
            return Err(SstError::ChecksumMismatch("header"));
        }
        let (header, _) = decode_from_slice::<SstHeader, _>(header_bytes, config)?;
        if header.magic != SST_MAGIC {
            return Err(corrupt("bad magic"));
        }
        if header.version != SST_VERSION {
            return Err(corrupt("unsupported version"));
        }

        let footer_start = data.len() - SST_FOOTER_SIZE;
        let (footer, _) = decode_from_slice::<SstFooter, _>(&data[footer_start..], config)?;
        let reencoded = encode_to_vec(
            &SstFooter {
                footer_crc32: 0,
                ..footer
            },
            config,
        )?;
        if crc32fast::hash(&reencoded) != footer.footer_crc32 {
            return Err(SstError::ChecksumMismatch("footer"));
        }
        if footer.total_file_size != data.len() as u64 {
            return Err(corrupt("file size does not match footer"));
        }

        let bloom_bytes = read_framed_block(&data, footer.bloom, "bloom block")?;
        let bloom =
            Bloom::from_slice(bloom_bytes).map_err(|e| SstError::Internal(e.to_string()))?;
        let props_bytes = read_framed_block(&data, footer.properties, "properties block")?;
        let (properties, _) = decode_from_slice::<SstProperties, _>(props_bytes, config)?;
        let index_bytes = read_framed_block(&data, footer.index, "index block")?;
        let (index, _) = decode_from_slice::<Vec<SstIndexEntry>, _>(index_bytes, config)?;

        Ok(Self {
            path,
            _file: file,
            data,
            properties,
            bloom,
            index,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Does this table's key range intersect `[start, end]` (inclusive)?
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.properties.min_key.as_slice() <= end && self.properties.max_key.as_slice() >= start
    }

    fn decode_block(&self, handle: BlockHandle) -> Result<Vec<SstCell>, SstError> {
        let config = standard().with_fixed_int_encoding();
        let bytes = read_framed_block(&self.data, handle, "data block")?;
        let (cells, _) = decode_from_slice::<Vec<SstCell>, _>(bytes, config)?;
        Ok(cells)
    }

    /// Point lookup: the highest-SQN cell for `key`, if any.
    ///
    /// Consults the bloom first, then decodes only the blocks that can hold
    /// the key. Cells are sorted key-ascending with SQN descending within a
    /// key, so the first match is the newest version.
    pub fn get(&self, key: &[u8]) -> Result<Option<SstCell>, SstError> {
        if !self.bloom.check(&key.to_vec()) {
            return Ok(None);
        }
        // Last block whose first key is ≤ the target; a key group may spill
        // into following blocks, so keep scanning while blocks still start
        // at or below the target.
        let mut block_at = self
            .index
            .partition_point(|entry| entry.first_key.as_slice() <= key)
            .saturating_sub(1);
        while block_at < self.index.len() {
            if self.index[block_at].first_key.as_slice() > key {
                break;
            }
            for cell in self.decode_block(self.index[block_at].handle)? {
                if cell.key.as_slice() == key {
                    return Ok(Some(cell));
                }
                if cell.key.as_slice() > key {
                    return Ok(None);
                }
            }
            block_at += 1;
        }
        Ok(None)
    }

    /// Iterate every cell in file order (key ascending, SQN descending
    /// within a key). Blocks are decoded lazily, one at a time.
    pub fn iter(&self) -> SstIter<'_> {
        SstIter {
            reader: self,
            next_block: 0,
            pending: Vec::new(),
        }
    }
}

/// Streaming cell iterator over one SST.
pub struct SstIter<'a> {
    reader: &'a SstReader,
    next_block: usize,
    /// Current block's cells, reversed so `pop` yields file order.
    pending: Vec<SstCell>,
}

impl Iterator for SstIter<'_> {
    type Item = SstCell;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cell) = self.pending.pop() {
                return Some(cell);
            }
            let entry = self.reader.index.get(self.next_block)?;
            self.next_block += 1;
            // Corrupt mid-file blocks end the iteration, mirroring the
            // journal scanner's stop-at-first-failure behavior.
            let mut cells = self.reader.decode_block(entry.handle).ok()?;
            cells.reverse();
            self.pending = cells;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// K-way merge
// ------------------------------------------------------------------------------------------------

/// Merges sorted cell streams into one sorted stream.
///
/// Inputs must each be sorted by key ascending, SQN descending within a
/// key. Across streams the merged order is the same; cells for the same key
/// are emitted newest-first regardless of which input holds them.
/// No deduplication happens here — that is the consumer's policy.
pub struct MergeIterator<'a> {
    inputs: Vec<std::iter::Peekable<Box<dyn Iterator<Item = SstCell> + 'a>>>,
}

impl<'a> MergeIterator<'a> {
    /// Build a merge over the given sorted streams.
    pub fn new(inputs: Vec<Box<dyn Iterator<Item = SstCell> + 'a>>) -> Self {
        Self {
            inputs: inputs.into_iter().map(Iterator::peekable).collect(),
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = SstCell;

    fn next(&mut self) -> Option<Self::Item> {
        let mut best: Option<(usize, Vec<u8>, u64)> = None;
        for at in 0..self.inputs.len() {
            let Some(cell) = self.inputs[at].peek() else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((_, best_key, best_sqn)) => {
                    cell.key < *best_key || (cell.key == *best_key && cell.sqn > *best_sqn)
                }
            };
            if better {
                best = Some((at, cell.key.clone(), cell.sqn));
            }
        }
        best.and_then(|(at, _, _)| self.inputs[at].next())
    }
}
