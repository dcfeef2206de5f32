//! # QuillDB journal core
//!
//! The journal ("inker") layer of a log-structured key/value engine: an
//! append-only value log of immutable, hash-indexed segment files, the
//! per-segment lifecycle actors that write, seal, serve and retire them, and
//! the background compactor that reclaims space by rewriting runs of
//! segments. The ordered index ("ledger") lives elsewhere; this crate also
//! carries the ledger-side merge coordinator and the minimal sorted-file
//! surface it needs.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         Inker (external)                   │
//! │     owns the manifest, appends to the active segment       │
//! │                                                            │
//! │   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐   │
//! │   │ segment  │  │ segment  │  │ segment  │  │ segment  │   │
//! │   │  actor   │  │  actor   │  │  actor   │  │  actor   │   │
//! │   │ (writer) │  │ (reader) │  │ (reader) │  │ (reader) │   │
//! │   └──────────┘  └────┬─────┘  └────┬─────┘  └────┬─────┘   │
//! │        active        │   scored, rewritten, retired        │
//! │        (never        └───────────┬─────────────────────    │
//! │        compacted)                ▼                          │
//! │                          ┌──────────────┐                  │
//! │                          │  compactor   │                  │
//! │                          └──────────────┘                  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`encoding`] | Hand-written, byte-stable binary codec for hashed and persisted bytes |
//! | [`record`] | Journal keys, values, reload strategies, and the DJB2 key hash |
//! | [`bloom`] | Fixed-shape bloom filter over a segment's key hashes |
//! | [`segment`] | CDB-style segment files: writer, sealed reader, and the per-file actor |
//! | [`manifest`] | Journal manifest entries, snapshot persistence, and the inker surface |
//! | [`compactor`] | Scoring, run selection, and rewriting of journal segments |
//! | [`ledger`] | Ledger-side merge coordinator and its sorted-file (SST) format |
//!
//! ## Lifecycle of a segment
//!
//! A segment is born writable (`.pnd`), accumulates records until an append
//! would overflow `max_file_size` (the writer answers `Roll`), is sealed by
//! writing its hash index and renaming to `.cdb`, serves hash lookups until
//! compaction retires it, and is finally deleted — after the inker confirms
//! the manifest no longer references it — either outright or into a waste
//! directory that the next compaction sweep empties by age.

pub mod bloom;
pub mod compactor;
pub mod encoding;
pub mod ledger;
pub mod manifest;
pub mod record;
pub mod segment;

use std::time::Duration;

// ------------------------------------------------------------------------------------------------
// JournalConfig
// ------------------------------------------------------------------------------------------------

/// Tunables for the journal: segment sizing, compaction scoring, the
/// deletion handshake, and sampling reproducibility.
///
/// Passed (cloned) to segment actors and the compactor.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Segment size at which an append is answered with `Roll` (bytes).
    pub max_file_size: u64,

    /// Record positions sampled per file when scoring compaction candidates.
    pub sample_size: usize,

    /// Records fetched per batch during a compaction rewrite.
    pub batch_size: usize,

    /// Upper bound on the number of files rewritten in one run.
    pub max_compaction_run: usize,

    /// Score threshold for a run of one file.
    pub single_file_target: f64,

    /// Score threshold at the maximum run length.
    pub max_run_target: f64,

    /// How long retired segments are kept in the waste directory.
    /// `None` deletes retired segments immediately, skipping the waste copy.
    pub waste_retention: Option<Duration>,

    /// Poll interval for the delete-pending → inker confirmation handshake.
    pub delete_timeout: Duration,

    /// How many times `close` re-asks a segment that is mid-roll before
    /// escalating to a kill.
    pub roll_close_retries: u32,

    /// Pause between those close retries.
    pub roll_close_backoff: Duration,

    /// Base seed for position sampling and coordinator file choice.
    /// `None` seeds from OS entropy; tests set it for reproducibility.
    pub sample_seed: Option<u64>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_file_size: 3 * 1024 * 1024 * 1024,
            sample_size: 200,
            batch_size: 32,
            max_compaction_run: 4,
            single_file_target: 60.0,
            max_run_target: 80.0,
            waste_retention: Some(Duration::from_secs(86_400)),
            delete_timeout: Duration::from_millis(10_000),
            roll_close_retries: 30,
            roll_close_backoff: Duration::from_millis(1),
            sample_seed: None,
        }
    }
}
