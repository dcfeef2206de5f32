//! Journal manifest: the ordered set of live segments.
//!
//! The manifest is owned by the inker; this module provides the data model
//! and persistence it uses, plus [`InkerClient`] — the narrow surface the
//! compactor and the per-segment delete handshake consume.
//!
//! A runtime entry couples a segment's metadata with its actor handle and
//! its key-hash bloom; the persisted form keeps only what survives a
//! restart (`low_sqn`, filename, bloom). Entries are totally ordered by
//! `low_sqn`; the entry with the highest `low_sqn` is the active (writable)
//! head and is never offered to the compactor.
//!
//! # Persistence
//!
//! The whole manifest is serialized through [`crate::encoding`] with a
//! trailing CRC32 and written to a temporary file that is atomically
//! renamed over the snapshot. Loading tolerates a missing file (fresh
//! store) but fails loudly on a checksum mismatch.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::bloom::SegmentBloom;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::record::Sqn;
use crate::segment::actor::SegmentHandle;

const SNAPSHOT_MAGIC: [u8; 4] = *b"QMAN";
const SNAPSHOT_TMP_SUFFIX: &str = "tmp";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Snapshot payload failed its CRC32 check.
    #[error("manifest snapshot checksum mismatch")]
    ChecksumMismatch,

    /// Snapshot does not start with the manifest magic.
    #[error("not a manifest snapshot: {path}")]
    BadMagic {
        /// Offending path.
        path: String,
    },
}

/// The inker stopped responding; the caller must discard its work.
#[derive(Debug, Error)]
#[error("inker is gone")]
pub struct InkerGone;

// ------------------------------------------------------------------------------------------------
// Entries
// ------------------------------------------------------------------------------------------------

/// Runtime manifest entry: one live segment.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    /// SQN of the segment's first record.
    pub low_sqn: Sqn,

    /// Segment file name (no directory).
    pub filename: String,

    /// Bloom over the segment's key hashes, built at seal time.
    pub bloom: SegmentBloom,

    /// Handle to the segment's actor.
    pub handle: SegmentHandle,
}

/// What a manifest entry looks like on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEntry {
    /// SQN of the segment's first record.
    pub low_sqn: Sqn,

    /// Segment file name (no directory).
    pub filename: String,

    /// Bloom over the segment's key hashes.
    pub bloom: SegmentBloom,
}

impl From<&ManifestEntry> for PersistedEntry {
    fn from(entry: &ManifestEntry) -> Self {
        Self {
            low_sqn: entry.low_sqn,
            filename: entry.filename.clone(),
            bloom: entry.bloom.clone(),
        }
    }
}

impl Encode for PersistedEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.low_sqn.encode_to(buf)?;
        self.filename.encode_to(buf)?;
        self.bloom.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for PersistedEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (low_sqn, n) = Sqn::decode_from(&buf[offset..])?;
        offset += n;
        let (filename, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (bloom, n) = SegmentBloom::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                low_sqn,
                filename,
                bloom,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// InkerClient — the surface the compactor and segments consume
// ------------------------------------------------------------------------------------------------

/// The slice of the inker that journal components talk to.
///
/// Implementations wrap whatever channel reaches the real inker process;
/// tests substitute scripted doubles.
pub trait InkerClient: Send + Sync {
    /// Compaction candidates: every sealed manifest entry, in `low_sqn`
    /// order. The active head is never included — the compactor must not
    /// rewrite the segment the inker is appending to.
    fn get_manifest(&self) -> Vec<ManifestEntry>;

    /// Atomically add the rewritten segments and remove the consumed ones.
    /// Returns the manifest SQN of the new manifest version.
    fn update_manifest(
        &self,
        adds: Vec<ManifestEntry>,
        removes: Vec<ManifestEntry>,
    ) -> Result<u64, InkerGone>;

    /// Signal that this compaction invocation is finished (whether or not
    /// it rewrote anything).
    fn compaction_complete(&self);

    /// Is it safe to delete files displaced by manifest version `man_sqn`?
    /// `None` means the inker is gone and the caller should stop quietly.
    fn confirm_delete(&self, man_sqn: u64) -> Option<bool>;
}

// ------------------------------------------------------------------------------------------------
// JournalManifest
// ------------------------------------------------------------------------------------------------

/// The inker-side manifest structure: live entries ordered by `low_sqn`
/// plus a monotonically increasing manifest SQN bumped on every change.
#[derive(Debug, Default)]
pub struct JournalManifest {
    entries: Vec<ManifestEntry>,
    man_sqn: u64,
}

impl JournalManifest {
    /// Empty manifest at manifest SQN 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current manifest SQN.
    pub fn man_sqn(&self) -> u64 {
        self.man_sqn
    }

    /// All live entries in `low_sqn` order.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// The active head — the entry with the highest `low_sqn`.
    pub fn head(&self) -> Option<&ManifestEntry> {
        self.entries.last()
    }

    /// Every entry except the head: what the compactor may rewrite.
    pub fn compactable(&self) -> Vec<ManifestEntry> {
        match self.entries.split_last() {
            Some((_, rest)) => rest.to_vec(),
            None => Vec::new(),
        }
    }

    /// Insert one entry, keeping `low_sqn` order, and bump the manifest SQN.
    pub fn insert(&mut self, entry: ManifestEntry) -> u64 {
        let at = self
            .entries
            .partition_point(|existing| existing.low_sqn < entry.low_sqn);
        self.entries.insert(at, entry);
        self.man_sqn += 1;
        self.man_sqn
    }

    /// Apply a compaction patch: add the rewritten segments, drop the
    /// consumed ones (by filename), bump the manifest SQN once.
    pub fn apply_patch(&mut self, adds: Vec<ManifestEntry>, removes: &[String]) -> u64 {
        self.entries
            .retain(|entry| !removes.contains(&entry.filename));
        for entry in adds {
            let at = self
                .entries
                .partition_point(|existing| existing.low_sqn < entry.low_sqn);
            self.entries.insert(at, entry);
        }
        self.man_sqn += 1;
        debug!(man_sqn = self.man_sqn, live = self.entries.len(), "manifest patched");
        self.man_sqn
    }

    /// Persisted form of the current entries.
    pub fn persisted(&self) -> Vec<PersistedEntry> {
        self.entries.iter().map(PersistedEntry::from).collect()
    }

    /// Write the manifest snapshot atomically (temp file + rename), with a
    /// trailing CRC32 over the encoded payload.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        let path = path.as_ref();

        let mut payload = Vec::new();
        SNAPSHOT_MAGIC.encode_to(&mut payload)?;
        self.man_sqn.encode_to(&mut payload)?;
        encoding::encode_vec(&self.persisted(), &mut payload)?;
        let checksum = crc32fast::hash(&payload);

        let tmp = path.with_extension(SNAPSHOT_TMP_SUFFIX);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&payload)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), man_sqn = self.man_sqn, entries = self.entries.len(), "manifest snapshot written");
        Ok(())
    }

    /// Load a snapshot written by [`save`](Self::save).
    ///
    /// A missing file is a fresh store: `(0, [])`. A present-but-corrupt
    /// snapshot is an error — silently starting empty would orphan live
    /// segments.
    pub fn load(path: impl AsRef<Path>) -> Result<(u64, Vec<PersistedEntry>), ManifestError> {
        let path = path.as_ref();
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, Vec::new())),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < 4 {
            return Err(ManifestError::ChecksumMismatch);
        }

        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(payload) != stored {
            return Err(ManifestError::ChecksumMismatch);
        }

        let mut offset = 0;
        let (magic, n) = <[u8; 4]>::decode_from(payload)?;
        offset += n;
        if magic != SNAPSHOT_MAGIC {
            return Err(ManifestError::BadMagic {
                path: path.display().to_string(),
            });
        }
        let (man_sqn, n) = u64::decode_from(&payload[offset..])?;
        offset += n;
        let (entries, _) = encoding::decode_vec::<PersistedEntry>(&payload[offset..])?;
        Ok((man_sqn, entries))
    }
}
