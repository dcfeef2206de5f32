//! Ledger merge coordinator.
//!
//! The coordinator is the ledger's long-lived compaction clerk. It idles
//! until the ledger has work, then executes one **merge**: a randomly
//! chosen file from the source level is combined with every overlapping
//! file one level down, producing fresh sorted files named
//! `<root>_<level>_<counter>.sst` until both input streams are exhausted.
//! When nothing overlaps, the source file is simply re-tagged into the
//! lower level — no bytes move.
//!
//! The manifest change is staged with a deferred-deletion handshake:
//!
//! 1. The coordinator writes the updated level manifest to disk, notifies
//!    the ledger ([`LedgerClient::change_staged`]), and waits in
//!    `change_pending`.
//! 2. The ledger calls back once it has adopted the new manifest; the
//!    coordinator replies immediately and only then marks each displaced
//!    file for deletion ([`LedgerClient::set_for_delete`]) — readers that
//!    were given the old manifest never lose a file out from under them.
//! 3. A closing-time variant performs the acknowledgment synchronously and
//!    stops.
//!
//! Source-file choice is random but the PRNG is explicit coordinator
//! state, seeded from configuration so tests replay exactly.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use super::sst::{MergeIterator, SstCell, SstError, SstReader, SstWriter};

/// Cells per merge output file before the coordinator starts the next one.
const MERGE_FILE_MAX_CELLS: usize = 16_384;

const MANIFEST_MAGIC: [u8; 4] = *b"QLVL";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// SST read or write failure.
    #[error("SST error: {0}")]
    Sst(#[from] SstError),

    /// Level-manifest encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Level-manifest snapshot failed its checksum.
    #[error("level manifest checksum mismatch")]
    ChecksumMismatch,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Level manifest
// ------------------------------------------------------------------------------------------------

/// Metadata for one ledger SST file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstFileMeta {
    /// File path.
    pub path: PathBuf,

    /// Smallest key in the file.
    pub min_key: Vec<u8>,

    /// Largest key in the file.
    pub max_key: Vec<u8>,
}

impl Encode for SstFileMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.path.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SstFileMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (path, n) = PathBuf::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                path,
                min_key,
                max_key,
            },
            offset,
        ))
    }
}

/// The ledger's leveled file layout: per level, files sorted by `min_key`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelManifest {
    levels: Vec<Vec<SstFileMeta>>,
}

impl LevelManifest {
    /// A manifest with `depth` empty levels.
    pub fn new(depth: usize) -> Self {
        Self {
            levels: vec![Vec::new(); depth],
        }
    }

    /// Number of levels.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Files at `level`, sorted by `min_key`. Empty when out of range.
    pub fn files_at(&self, level: usize) -> &[SstFileMeta] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Insert a file, keeping the level sorted and growing the manifest if
    /// the level does not exist yet.
    pub fn insert(&mut self, level: usize, meta: SstFileMeta) {
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        let files = &mut self.levels[level];
        let at = files.partition_point(|existing| existing.min_key < meta.min_key);
        files.insert(at, meta);
    }

    /// Remove a file from a level by path.
    pub fn remove(&mut self, level: usize, path: &Path) {
        if let Some(files) = self.levels.get_mut(level) {
            files.retain(|meta| meta.path != path);
        }
    }

    /// Files at `level` whose key range intersects `[start, end]`
    /// (inclusive both ends).
    pub fn overlapping(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<SstFileMeta> {
        self.files_at(level)
            .iter()
            .filter(|meta| meta.min_key.as_slice() <= end && meta.max_key.as_slice() >= start)
            .cloned()
            .collect()
    }

    /// Write the manifest atomically (temp file + rename) with a trailing
    /// CRC32 over the encoded payload.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CoordinatorError> {
        let path = path.as_ref();
        let mut payload = Vec::new();
        MANIFEST_MAGIC.encode_to(&mut payload)?;
        (self.levels.len() as u32).encode_to(&mut payload)?;
        for level in &self.levels {
            encoding::encode_vec(level, &mut payload)?;
        }

        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&payload)?;
        file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "level manifest written");
        Ok(())
    }

    /// Load a manifest written by [`save`](Self::save). A missing file is
    /// an empty manifest.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoordinatorError> {
        let mut file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < 4 {
            return Err(CoordinatorError::ChecksumMismatch);
        }
        let (payload, crc) = bytes.split_at(bytes.len() - 4);
        if crc32fast::hash(payload) != u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]) {
            return Err(CoordinatorError::ChecksumMismatch);
        }

        let mut offset = 0;
        let (magic, n) = <[u8; 4]>::decode_from(payload)?;
        offset += n;
        if magic != MANIFEST_MAGIC {
            return Err(CoordinatorError::Internal(
                "not a level manifest".into(),
            ));
        }
        let (depth, n) = u32::decode_from(&payload[offset..])?;
        offset += n;
        let mut levels = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
            let (files, n) = encoding::decode_vec::<SstFileMeta>(&payload[offset..])?;
            offset += n;
            levels.push(files);
        }
        Ok(Self { levels })
    }
}

// ------------------------------------------------------------------------------------------------
// Work items and the ledger surface
// ------------------------------------------------------------------------------------------------

/// One unit of merge work handed out by the ledger.
#[derive(Debug, Clone)]
pub struct MergeWork {
    /// Level the source file is drawn from.
    pub src_level: usize,

    /// The ledger's current level manifest.
    pub manifest: LevelManifest,

    /// Is `src_level + 1` the basement (lowest) level? Tombstones are
    /// dropped only when merging into the basement — below it there is
    /// nothing left for them to shadow.
    pub target_is_basement: bool,

    /// Path prefix for emitted files: `<root>_<level>_<counter>.sst`.
    pub root_path: PathBuf,

    /// First free file counter for emitted files.
    pub next_counter: u64,

    /// Where the updated manifest must be written.
    pub manifest_file: PathBuf,
}

/// A staged manifest change awaiting the ledger's acknowledgment.
#[derive(Debug, Clone)]
pub struct ManifestChange {
    /// The manifest after the merge.
    pub manifest: LevelManifest,

    /// Files no longer referenced — deletable once the ledger confirms.
    pub displaced: Vec<PathBuf>,

    /// Files created by the merge.
    pub created: Vec<SstFileMeta>,

    /// The file counter after the merge (next free value).
    pub next_counter: u64,
}

/// The slice of the ledger the coordinator talks to.
pub trait LedgerClient: Send {
    /// "Do you have work?" — answered on the coordinator's idle timeout.
    fn request_work(&mut self) -> Option<MergeWork>;

    /// The coordinator has staged `change` (manifest written to disk) and
    /// is waiting in `change_pending` for the ledger to adopt it.
    fn change_staged(&mut self, change: &ManifestChange);

    /// Mark one displaced file as deletable. Called only after the ledger
    /// has acknowledged the staged change.
    fn set_for_delete(&mut self, path: &Path);
}

// ------------------------------------------------------------------------------------------------
// Coordinator
// ------------------------------------------------------------------------------------------------

/// Coordinator lifecycle state.
#[derive(Debug)]
pub enum CoordinatorState {
    /// Nothing staged; polls for work on idle timeouts.
    Idle,

    /// A manifest change is staged; waiting for the ledger's callback.
    ChangePending(ManifestChange),
}

/// Result of one idle-timeout poll.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The ledger had nothing; back off to the long idle timeout.
    NoWork,

    /// A merge ran; `created` files were written and the change is staged.
    Merged {
        /// Number of files the merge emitted (0 for a re-tag).
        created: usize,
    },

    /// A change is already pending; polling is a no-op.
    Pending,
}

/// The merge coordinator. Drive it directly (tests) or through
/// [`CoordinatorHandle::spawn`] for the timeout-driven actor behavior.
pub struct Coordinator<C: LedgerClient> {
    ledger: C,
    state: CoordinatorState,
    rng: StdRng,
}

impl<C: LedgerClient> Coordinator<C> {
    /// New idle coordinator. `seed` fixes the source-file choice for
    /// reproducible runs; `None` seeds from OS entropy.
    pub fn new(ledger: C, seed: Option<u64>) -> Self {
        Self {
            ledger,
            state: CoordinatorState::Idle,
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            },
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    /// One idle-timeout turn: ask the ledger for work and, if given some,
    /// perform the merge, persist the manifest, and stage the change.
    pub fn poll(&mut self) -> Result<PollOutcome, CoordinatorError> {
        if matches!(self.state, CoordinatorState::ChangePending(_)) {
            return Ok(PollOutcome::Pending);
        }
        let Some(work) = self.ledger.request_work() else {
            return Ok(PollOutcome::NoWork);
        };

        let change = perform_merge(&work, &mut self.rng)?;
        change.manifest.save(&work.manifest_file)?;
        self.ledger.change_staged(&change);
        let created = change.created.len();
        info!(
            src_level = work.src_level,
            created,
            displaced = change.displaced.len(),
            "merge staged"
        );
        self.state = CoordinatorState::ChangePending(change);
        Ok(PollOutcome::Merged { created })
    }

    /// The ledger's acknowledgment callback: release the staged change and
    /// mark every displaced file for deletion.
    ///
    /// Acknowledging with nothing pending is a no-op (the callback can race
    /// a close).
    pub fn confirm(&mut self) {
        let state = std::mem::replace(&mut self.state, CoordinatorState::Idle);
        if let CoordinatorState::ChangePending(change) = state {
            for path in &change.displaced {
                self.ledger.set_for_delete(path);
            }
            debug!(displaced = change.displaced.len(), "change confirmed");
        }
    }

    /// Closing-time variant: acknowledge any pending change synchronously.
    pub fn close(&mut self) {
        self.confirm();
    }
}

/// Execute the merge for one work item. Pure with respect to the
/// coordinator: reads the input files, writes the output files, and
/// returns the resulting change without touching coordinator state.
fn perform_merge(work: &MergeWork, rng: &mut StdRng) -> Result<ManifestChange, CoordinatorError> {
    let src_files = work.manifest.files_at(work.src_level);
    if src_files.is_empty() {
        return Err(CoordinatorError::Internal(format!(
            "merge work for empty level {}",
            work.src_level
        )));
    }
    let src = src_files[rng.random_range(0..src_files.len())].clone();
    let target_level = work.src_level + 1;
    let overlap = work
        .manifest
        .overlapping(target_level, &src.min_key, &src.max_key);

    let mut manifest = work.manifest.clone();
    manifest.remove(work.src_level, &src.path);

    if overlap.is_empty() {
        // Nothing to merge with: move the file down a level untouched.
        debug!(path = %src.path.display(), target_level, "re-tagging file into lower level");
        manifest.insert(target_level, src);
        return Ok(ManifestChange {
            manifest,
            displaced: Vec::new(),
            created: Vec::new(),
            next_counter: work.next_counter,
        });
    }

    // Open every input and k-way merge them, newest version first per key.
    let src_reader = SstReader::open(&src.path)?;
    let mut overlap_readers = Vec::with_capacity(overlap.len());
    for meta in &overlap {
        overlap_readers.push(SstReader::open(&meta.path)?);
    }
    let mut inputs: Vec<Box<dyn Iterator<Item = SstCell> + '_>> =
        vec![Box::new(src_reader.iter())];
    for reader in &overlap_readers {
        inputs.push(Box::new(reader.iter()));
    }
    let merged = MergeIterator::new(inputs);

    let expected: usize = (src_reader.properties.cell_count
        + overlap_readers
            .iter()
            .map(|r| r.properties.cell_count)
            .sum::<u64>()) as usize;

    // Dedup to the newest version per key; in the basement, tombstones
    // (and everything they shadow) disappear entirely.
    let mut emitter = MergeEmitter::new(work, target_level, expected);
    let mut last_key: Option<Vec<u8>> = None;
    for cell in merged {
        if last_key.as_deref() == Some(cell.key.as_slice()) {
            continue;
        }
        last_key = Some(cell.key.clone());
        if work.target_is_basement && cell.is_tombstone() {
            continue;
        }
        emitter.push(cell)?;
    }
    let (created, next_counter) = emitter.finish()?;

    for meta in &overlap {
        manifest.remove(target_level, &meta.path);
    }
    for meta in &created {
        manifest.insert(target_level, meta.clone());
    }

    let mut displaced = vec![src.path.clone()];
    displaced.extend(overlap.iter().map(|meta| meta.path.clone()));

    Ok(ManifestChange {
        manifest,
        displaced,
        created,
        next_counter,
    })
}

/// Buffers merged cells and emits `<root>_<level>_<counter>.sst` files of
/// bounded size.
struct MergeEmitter<'a> {
    work: &'a MergeWork,
    target_level: usize,
    expected_per_file: usize,
    counter: u64,
    buffer: Vec<SstCell>,
    created: Vec<SstFileMeta>,
}

impl<'a> MergeEmitter<'a> {
    fn new(work: &'a MergeWork, target_level: usize, expected: usize) -> Self {
        Self {
            work,
            target_level,
            expected_per_file: expected.min(MERGE_FILE_MAX_CELLS),
            counter: work.next_counter,
            buffer: Vec::new(),
            created: Vec::new(),
        }
    }

    fn push(&mut self, cell: SstCell) -> Result<(), CoordinatorError> {
        self.buffer.push(cell);
        if self.buffer.len() >= MERGE_FILE_MAX_CELLS {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CoordinatorError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let path = PathBuf::from(format!(
            "{}_{}_{}.sst",
            self.work.root_path.display(),
            self.target_level,
            self.counter
        ));
        self.counter += 1;

        let cells = std::mem::take(&mut self.buffer);
        let count = cells.len();
        let properties =
            SstWriter::new(&path).build(cells.into_iter(), count.max(self.expected_per_file))?;
        self.created.push(SstFileMeta {
            path,
            min_key: properties.min_key,
            max_key: properties.max_key,
        });
        Ok(())
    }

    fn finish(mut self) -> Result<(Vec<SstFileMeta>, u64), CoordinatorError> {
        self.flush()?;
        Ok((self.created, self.counter))
    }
}

// ------------------------------------------------------------------------------------------------
// Actor wrapper
// ------------------------------------------------------------------------------------------------

/// Timing knobs for the spawned coordinator actor.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Idle timeout between work polls while the ledger has been busy.
    pub poll_interval: Duration,

    /// Long timeout after the ledger answered "no work".
    pub idle_backoff: Duration,

    /// PRNG seed for source-file choice.
    pub seed: Option<u64>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            idle_backoff: Duration::from_secs(30),
            seed: None,
        }
    }
}

enum CoordinatorMsg {
    /// The ledger's acknowledgment of a staged change.
    Ack { reply: Sender<()> },
    Close { reply: Sender<()> },
}

/// Handle on a spawned coordinator actor.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: Sender<CoordinatorMsg>,
}

impl CoordinatorHandle {
    /// Spawn the coordinator on its own thread, polling the ledger on idle
    /// timeouts.
    pub fn spawn<C: LedgerClient + 'static>(ledger: C, options: CoordinatorOptions) -> Self {
        let (tx, rx) = mpsc::channel();
        let coordinator = Coordinator::new(ledger, options.seed);
        thread::spawn(move || run_actor(coordinator, rx, options));
        Self { tx }
    }

    /// Deliver the ledger's acknowledgment; returns once the coordinator
    /// has replied (the file-deletion marking happens after the reply).
    pub fn ack(&self) -> bool {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(CoordinatorMsg::Ack { reply: reply_tx }).is_err() {
            return false;
        }
        reply_rx.recv().is_ok()
    }

    /// Stop the coordinator, acknowledging any pending change first.
    pub fn close(&self) {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self
            .tx
            .send(CoordinatorMsg::Close { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.recv();
        }
    }
}

fn run_actor<C: LedgerClient>(
    mut coordinator: Coordinator<C>,
    rx: Receiver<CoordinatorMsg>,
    options: CoordinatorOptions,
) {
    let mut timeout = options.poll_interval;
    loop {
        match rx.recv_timeout(timeout) {
            Ok(CoordinatorMsg::Ack { reply }) => {
                // Reply first, then mark files — the ledger must never wait
                // on deletions.
                let _ = reply.send(());
                coordinator.confirm();
                timeout = options.poll_interval;
            }
            Ok(CoordinatorMsg::Close { reply }) => {
                coordinator.close();
                let _ = reply.send(());
                return;
            }
            Err(RecvTimeoutError::Timeout) => match coordinator.poll() {
                Ok(PollOutcome::NoWork) => timeout = options.idle_backoff,
                Ok(PollOutcome::Merged { .. }) | Ok(PollOutcome::Pending) => {
                    timeout = options.poll_interval;
                }
                Err(e) => {
                    warn!(error = %e, "merge failed");
                    timeout = options.idle_backoff;
                }
            },
            Err(RecvTimeoutError::Disconnected) => {
                coordinator.close();
                return;
            }
        }
    }
}
