//! Journal compactor: scores segments, picks a run, rewrites the survivors.
//!
//! One call to [`run_compaction`] performs a complete invocation:
//!
//! 1. **Waste cleanup** — files in the waste directory older than the
//!    retention window are deleted.
//! 2. **Manifest snapshot** — candidates come from
//!    [`InkerClient::get_manifest`], which never includes the active head.
//! 3. **Scoring** — each candidate is sampled (`sample_size` positions);
//!    sampled payload bytes are partitioned into *active* (the ledger
//!    snapshot still points at the record, or it post-dates the snapshot)
//!    and *replaced*. A file's score is `100 · active ∕ (active+replaced)`
//!    — lower means more reclaimable.
//! 4. **Run selection** — a single left-to-right pass over the candidates
//!    in `low_sqn` order. At each step the current run either extends by
//!    the next candidate or restarts at it, whichever scores better (a
//!    full-length run always restarts); the best run seen anywhere is kept.
//!    A run's score is `target(len) − mean(file scores)` with the target
//!    interpolated from `single_file_target` to `max_run_target`; the empty
//!    run scores 0.0, so only positive-scoring runs are ever executed.
//! 5. **Rewrite** — positions are fetched in `batch_size` batches with CRC
//!    checks, pushed through the per-record policy
//!    ([`strategy::assess_record`]), and appended to fresh output segments;
//!    a `Roll` answer seals the current output and opens the next.
//! 6. **Manifest patch** — `update_manifest(adds, removes)` then
//!    `compaction_complete`, then each consumed segment is told
//!    `delete_pending(man_sqn)` and polls the inker until deletion is safe.
//!
//! The compactor never mutates existing segments, and discards its patch if
//! the inker has died mid-run. At most one invocation runs per inker —
//! serialization is the inker's scheduling concern, not enforced here.

#[cfg(test)]
mod tests;

pub mod strategy;

use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bloom::SegmentBloom;
use crate::manifest::{InkerClient, InkerGone, ManifestEntry};
use crate::record::{JournalKey, ReloadPolicy, Sqn};
use crate::segment::actor::SegmentHandle;
use crate::segment::{
    FetchMode, FetchedRecord, PositionSample, PutOutcome, SegmentError, SegmentWriter,
    WRITABLE_EXT,
};
use crate::JournalConfig;
use strategy::{assess_record, LedgerSnapshot, RecordDisposition};

/// Filename prefix of compaction output segments, distinct from the
/// inker's own journal prefix.
pub const COMPACT_FILE_PREFIX: &str = "compact";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by a compaction invocation.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// A segment read or write failed.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Waste-directory or output-directory I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The inker died mid-run; the manifest patch was discarded.
    #[error(transparent)]
    InkerGone(#[from] InkerGone),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Outcome
// ------------------------------------------------------------------------------------------------

/// What a compaction invocation did.
#[derive(Debug, Default)]
pub struct CompactionOutcome {
    /// Filenames of segments consumed by the rewrite.
    pub removed: Vec<String>,

    /// Filenames of segments produced by the rewrite.
    pub created: Vec<String>,

    /// Manifest SQN of the submitted patch, when one was submitted.
    pub man_sqn: Option<u64>,

    /// Files deleted from the waste directory during cleanup.
    pub waste_deleted: usize,
}

// ------------------------------------------------------------------------------------------------
// Entry point
// ------------------------------------------------------------------------------------------------

/// Run one full compaction invocation.
///
/// `output_dir` receives the rewritten segments; `waste_dir` is swept by
/// age on entry and is where retired segments are parked when retention is
/// configured.
pub fn run_compaction(
    inker: &Arc<dyn InkerClient>,
    snapshot: &dyn LedgerSnapshot,
    policy: &ReloadPolicy,
    output_dir: &Path,
    waste_dir: &Path,
    config: &JournalConfig,
) -> Result<CompactionOutcome, CompactionError> {
    let mut outcome = CompactionOutcome {
        waste_deleted: clean_waste(waste_dir, config.waste_retention)?,
        ..CompactionOutcome::default()
    };

    let candidates = inker.get_manifest();
    if candidates.is_empty() {
        debug!("no compaction candidates");
        inker.compaction_complete();
        return Ok(outcome);
    }

    let mut scores = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        let score = score_file(&candidate.handle, snapshot, config.sample_size)?;
        debug!(file = %candidate.filename, score, "scored candidate");
        scores.push(score);
    }

    let (run, run_score) = select_best_run(
        &scores,
        config.max_compaction_run,
        config.single_file_target,
        config.max_run_target,
    );
    if run.is_empty() || run_score <= 0.0 {
        info!(candidates = candidates.len(), "no run worth compacting");
        inker.compaction_complete();
        return Ok(outcome);
    }
    let run_files: Vec<&ManifestEntry> = candidates[run.clone()].iter().collect();
    info!(
        files = run_files.len(),
        run_score,
        first = %run_files[0].filename,
        "compacting run"
    );

    // Rewrite phase: stream every record of the run through the policy.
    let mut sink = RewriteSink::new(output_dir, config);
    for entry in &run_files {
        rewrite_file(entry, snapshot, policy, config, &mut sink)?;
    }
    let outputs = sink.finish()?;

    // Hand the rewritten segments over as reader actors.
    let waste_for_new = config.waste_retention.map(|_| waste_dir.to_path_buf());
    let mut adds = Vec::with_capacity(outputs.len());
    for output in outputs {
        let handle =
            SegmentHandle::open_reader(&output.path, config.clone(), waste_for_new.clone())?;
        let filename = filename_of(&output.path)?;
        outcome.created.push(filename.clone());
        adds.push(ManifestEntry {
            low_sqn: output.low_sqn,
            filename,
            bloom: output.bloom,
            handle,
        });
    }

    let removes: Vec<ManifestEntry> = run_files.iter().map(|e| (*e).clone()).collect();
    outcome.removed = removes.iter().map(|e| e.filename.clone()).collect();

    // Manifest patch, then the two-phase delete handshake.
    let man_sqn = inker.update_manifest(adds, removes.clone())?;
    outcome.man_sqn = Some(man_sqn);
    inker.compaction_complete();
    for old in removes {
        old.handle.delete_pending(man_sqn, Arc::clone(inker));
    }

    info!(
        removed = outcome.removed.len(),
        created = outcome.created.len(),
        man_sqn,
        "compaction complete"
    );
    Ok(outcome)
}

fn filename_of(path: &Path) -> Result<String, CompactionError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| CompactionError::Internal(format!("bad output path: {path:?}")))
}

// ------------------------------------------------------------------------------------------------
// Phase 1 — waste cleanup
// ------------------------------------------------------------------------------------------------

/// Delete waste files whose modification age exceeds the retention window.
///
/// Returns the number of files deleted. A missing waste directory, or
/// `retention = None`, is a no-op.
pub fn clean_waste(
    waste_dir: &Path,
    retention: Option<std::time::Duration>,
) -> Result<usize, CompactionError> {
    let Some(retention) = retention else {
        return Ok(0);
    };
    let entries = match fs::read_dir(waste_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut deleted = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let expired = now
            .duration_since(modified)
            .map(|age| age > retention)
            .unwrap_or(false);
        if expired {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(path = ?entry.path(), error = %e, "failed to delete waste file");
            } else {
                debug!(path = ?entry.path(), "deleted expired waste file");
                deleted += 1;
            }
        }
    }
    Ok(deleted)
}

// ------------------------------------------------------------------------------------------------
// Phase 3 — scoring
// ------------------------------------------------------------------------------------------------

/// Score one segment by sampling.
///
/// Samples up to `sample_size` record positions, fetches `(key, val_len)`
/// for each, and partitions payload bytes (`val_len − 4`, net of the CRC)
/// into active and replaced. An empty sample scores 100.0 — nothing
/// demonstrably reclaimable.
pub fn score_file(
    handle: &SegmentHandle,
    snapshot: &dyn LedgerSnapshot,
    sample_size: usize,
) -> Result<f64, CompactionError> {
    let positions = handle.get_positions(PositionSample::Sample(sample_size))?;
    let fetched = handle.direct_fetch(positions, FetchMode::KeySize)?;

    let mut active: u64 = 0;
    let mut replaced: u64 = 0;
    for record in fetched {
        let FetchedRecord::KeySize { key, val_len } = record else {
            return Err(CompactionError::Internal(
                "direct_fetch returned wrong mode".into(),
            ));
        };
        let payload = u64::from(val_len.saturating_sub(4));
        if snapshot.is_current(&key.ledger_key, key.sqn) || key.sqn > snapshot.max_sqn() {
            active += payload;
        } else {
            replaced += payload;
        }
    }

    if active + replaced == 0 {
        Ok(100.0)
    } else {
        Ok(100.0 * active as f64 / (active + replaced) as f64)
    }
}

// ------------------------------------------------------------------------------------------------
// Phase 4 — run selection
// ------------------------------------------------------------------------------------------------

/// Score a run of per-file scores against its length-adjusted target.
///
/// The target interpolates linearly from `single_target` at length 1 to
/// `max_target` at `max_run`; the score is `target − mean`. An empty run
/// scores 0.0, which is also the execution threshold — a run must beat the
/// empty run to be worth rewriting.
pub fn score_run(scores: &[f64], max_run: usize, single_target: f64, max_target: f64) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let target = if scores.len() == 1 {
        single_target
    } else {
        single_target
            + (max_target - single_target) * (scores.len() - 1) as f64 / (max_run - 1) as f64
    };
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    target - mean
}

/// Pick the best contiguous run of candidates.
///
/// One pass, left to right. The current run either extends by the next
/// candidate or restarts at it — whichever scores better, with a forced
/// restart once the run is at `max_run` — and the best-scoring run seen at
/// any step wins. The restart alternative is what lets a promising late
/// candidate shed a mediocre prefix mid-pass.
///
/// Returns the winning index range and its score; an empty range (score
/// 0.0) means no run beats doing nothing.
pub fn select_best_run(
    scores: &[f64],
    max_run: usize,
    single_target: f64,
    max_target: f64,
) -> (Range<usize>, f64) {
    let mut best: Range<usize> = 0..0;
    let mut best_score = 0.0;
    let mut current: Range<usize> = 0..0;

    for next in 0..scores.len() {
        let restarted = next..next + 1;
        current = if current.len() >= max_run {
            restarted
        } else {
            let extended = current.start..next + 1;
            let extended_score =
                score_run(&scores[extended.clone()], max_run, single_target, max_target);
            let restarted_score =
                score_run(&scores[restarted.clone()], max_run, single_target, max_target);
            if extended_score > restarted_score {
                extended
            } else {
                restarted
            }
        };

        let current_score = score_run(&scores[current.clone()], max_run, single_target, max_target);
        if current_score > best_score {
            best = current.clone();
            best_score = current_score;
        }
    }
    (best, best_score)
}

// ------------------------------------------------------------------------------------------------
// Phase 5 — rewrite
// ------------------------------------------------------------------------------------------------

/// Stream one candidate file through the policy into the sink.
fn rewrite_file(
    entry: &ManifestEntry,
    snapshot: &dyn LedgerSnapshot,
    policy: &ReloadPolicy,
    config: &JournalConfig,
    sink: &mut RewriteSink<'_>,
) -> Result<(), CompactionError> {
    let positions = entry.handle.get_positions(PositionSample::All)?;
    debug!(file = %entry.filename, records = positions.len(), "rewriting file");

    for batch in positions.chunks(config.batch_size.max(1)) {
        let fetched = entry
            .handle
            .direct_fetch(batch.to_vec(), FetchMode::KeyValueCheck)?;
        for record in fetched {
            let FetchedRecord::KeyValueCheck { key, value, crc_ok } = record else {
                return Err(CompactionError::Internal(
                    "direct_fetch returned wrong mode".into(),
                ));
            };
            match assess_record(&key, &value, crc_ok, snapshot, policy) {
                RecordDisposition::Keep => sink.push(&key, &value)?,
                RecordDisposition::Rewrite { key, value } => sink.push(&key, &value)?,
                RecordDisposition::Reap => {}
            }
        }
    }
    Ok(())
}

/// One sealed rewrite output.
struct SealedOutput {
    path: PathBuf,
    low_sqn: Sqn,
    bloom: SegmentBloom,
}

/// Accumulates survivors into output segments, rolling to a fresh file
/// whenever the current one fills up.
struct RewriteSink<'a> {
    dir: &'a Path,
    config: &'a JournalConfig,
    /// Distinguishes this invocation's files from earlier compactions that
    /// may have produced (since-retired but not yet deleted) files covering
    /// the same SQNs.
    nonce: u64,
    current: Option<SegmentWriter>,
    outputs: Vec<SealedOutput>,
}

impl<'a> RewriteSink<'a> {
    fn new(dir: &'a Path, config: &'a JournalConfig) -> Self {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|epoch| epoch.as_secs())
            .unwrap_or(0);
        Self {
            dir,
            config,
            nonce,
            current: None,
            outputs: Vec::new(),
        }
    }

    fn push(&mut self, key: &JournalKey, value: &[u8]) -> Result<(), CompactionError> {
        // Two attempts: the second runs against a fresh file after a roll.
        for _ in 0..2 {
            if self.current.is_none() {
                let path = self.dir.join(format!(
                    "{}_{}_{:012}.{}",
                    COMPACT_FILE_PREFIX, self.nonce, key.sqn, WRITABLE_EXT
                ));
                self.current = Some(SegmentWriter::create(path, self.config.max_file_size)?);
            }
            let outcome = match self.current.as_mut() {
                Some(writer) => writer.put(key, value)?,
                None => break,
            };
            match outcome {
                PutOutcome::Written { .. } => return Ok(()),
                PutOutcome::Roll => self.seal_current()?,
            }
        }
        Err(CompactionError::Internal(format!(
            "record at sqn {} larger than max_file_size",
            key.sqn
        )))
    }

    fn seal_current(&mut self) -> Result<(), CompactionError> {
        if let Some(writer) = self.current.take() {
            let Some(low_sqn) = writer.low_sqn() else {
                return Err(CompactionError::Internal(
                    "sealing an output segment with no records".into(),
                ));
            };
            let bloom = writer.bloom();
            let reader = writer.complete()?;
            self.outputs.push(SealedOutput {
                path: reader.path().to_path_buf(),
                low_sqn,
                bloom,
            });
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<SealedOutput>, CompactionError> {
        self.seal_current()?;
        Ok(self.outputs)
    }
}
