//! Per-record disposition during a compaction rewrite.
//!
//! For every record pulled out of a candidate segment the compactor decides
//! between three outcomes:
//!
//! - **Keep** — the record is copied to the output verbatim.
//! - **Rewrite** — the record survives in reduced form: a `stnd` record
//!   whose object is obsolete is re-emitted as a `keyd` record carrying
//!   only its key deltas (the `Retain` strategy).
//! - **Reap** — a superseded `stnd` record is dropped (`Recalc` /
//!   `Recover` strategies). Only `stnd` records are ever reaped or
//!   reduced; `keyd` records are copied verbatim whatever the strategy.
//!
//! A record may only be reduced or reaped when *all* of the following hold:
//! the ledger snapshot no longer lists it as current, its CRC verified, and
//! its SQN is at or below the snapshot's `max_sqn` — records newer than the
//! snapshot may be live in a future ledger state and are always preserved.
//! Tombstones are never reaped by value compaction; clearing them is a
//! separate job with different safety conditions.

use tracing::trace;

use crate::record::{
    JournalKey, KeyKind, LedgerKey, ReloadPolicy, ReloadStrategy, Sqn, StandardValue,
};

// ------------------------------------------------------------------------------------------------
// Ledger snapshot
// ------------------------------------------------------------------------------------------------

/// The compactor's frozen view of the ledger, taken before a run starts.
///
/// `is_current` answers whether the ledger still points at exactly this
/// `(key, sqn)` pair; `max_sqn` is the snapshot horizon — journal records
/// above it post-date the snapshot and must be treated as live.
pub trait LedgerSnapshot: Send + Sync {
    /// Does the ledger list `sqn` as the current version of `key`?
    fn is_current(&self, key: &LedgerKey, sqn: Sqn) -> bool;

    /// The snapshot horizon.
    fn max_sqn(&self) -> Sqn;
}

// ------------------------------------------------------------------------------------------------
// Disposition
// ------------------------------------------------------------------------------------------------

/// What happens to one record during a rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordDisposition {
    /// Copy verbatim.
    Keep,

    /// Replace with the reduced record.
    Rewrite {
        /// Key of the replacement (`keyd` kind, same SQN and ledger key).
        key: JournalKey,
        /// Replacement value — the extracted key deltas.
        value: Vec<u8>,
    },

    /// Drop the record.
    Reap,
}

/// Decide one record's fate.
///
/// `crc_ok` is the verdict from the batched fetch; a record that failed its
/// CRC is never reaped on the basis of ledger state it may not represent.
pub fn assess_record(
    key: &JournalKey,
    value: &[u8],
    crc_ok: bool,
    snapshot: &dyn LedgerSnapshot,
    policy: &ReloadPolicy,
) -> RecordDisposition {
    if key.kind == KeyKind::Tombstone {
        return RecordDisposition::Keep;
    }

    let superseded = !snapshot.is_current(&key.ledger_key, key.sqn)
        && key.sqn <= snapshot.max_sqn()
        && crc_ok;
    if !superseded {
        return RecordDisposition::Keep;
    }

    match policy.strategy_for(key.ledger_key.tag) {
        ReloadStrategy::Retain => match key.kind {
            KeyKind::Standard => match StandardValue::from_bytes(value) {
                Ok(standard) => {
                    trace!(sqn = key.sqn, "reducing superseded record to key deltas");
                    RecordDisposition::Rewrite {
                        key: JournalKey::key_delta(key.sqn, key.ledger_key.clone()),
                        value: standard.deltas,
                    }
                }
                // A value that does not parse as (object, deltas) cannot be
                // reduced; keep it whole.
                Err(_) => RecordDisposition::Keep,
            },
            // Already delta-only; nothing left to strip.
            _ => RecordDisposition::Keep,
        },
        ReloadStrategy::Recalc | ReloadStrategy::Recover => match key.kind {
            KeyKind::Standard => {
                trace!(sqn = key.sqn, "reaping superseded record");
                RecordDisposition::Reap
            }
            // Delta-only records are kept verbatim whatever the strategy.
            _ => RecordDisposition::Keep,
        },
    }
}
