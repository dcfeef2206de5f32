//! Per-segment actor: a single-consumer mailbox thread owning one file.
//!
//! Every segment file is driven by exactly one OS thread; callers hold a
//! cloneable [`SegmentHandle`] and exchange request/reply messages over
//! channels. One in-flight operation at a time, one file handle per actor,
//! no shared mutable state — the serialization the on-disk format relies on
//! falls out of the mailbox.
//!
//! # State machine
//!
//! ```text
//!         open_writer              roll                 (index ready)
//! starting ─────────► writer ──────────► rolling ─────────────────────► reader
//!    │                   │                   │                              │
//!    │ open_reader       │ complete          │ delete_pending (deferred)    │ delete_pending
//!    └──────────────────►reader◄─────────────┴──────────────► delete_pending│
//!                                                   (timeout-polled) ───────┘
//! ```
//!
//! - `complete` seals inline: the actor computes the hash index itself and
//!   is briefly unavailable while it writes (megabytes for a large file).
//! - `roll` exists so that sealing does not block reads: the index is
//!   computed by a helper thread from a snapshot of the in-memory maps
//!   while the actor keeps serving `get`/`key_check` in `rolling`; appends
//!   are answered with `Roll`.
//! - `close` during `rolling` is refused; the handle retries
//!   (`roll_close_retries` × `roll_close_backoff`) and then escalates to
//!   `kill`, abandoning the seal (the `.pnd` file stays recoverable).
//! - `delete_pending` polls the inker every `delete_timeout`; on a `true`
//!   confirmation the file is removed (into the waste directory when
//!   configured) and the actor stops. If the inker is gone the actor stops
//!   silently without touching the file.
//!
//! Dropping every handle while the actor is in `delete_pending` does not
//! abandon the deletion — the actor keeps polling on its own clock.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, trace, warn};

use crate::manifest::InkerClient;
use crate::record::{JournalKey, Sqn};
use crate::JournalConfig;

use super::hashindex::build_hash_index;
use super::{
    derive_seed, FetchMode, FetchedRecord, KeyPresence, PositionSample, PutOutcome,
    RollingSegment, ScanControl, SegmentError, SegmentReader, SegmentWriter,
};

// ------------------------------------------------------------------------------------------------
// Messages
// ------------------------------------------------------------------------------------------------

type Reply<T> = Sender<Result<T, SegmentError>>;

enum Request {
    Put {
        key: JournalKey,
        value: Vec<u8>,
        reply: Reply<PutOutcome>,
    },
    MPut {
        batch: Vec<(JournalKey, Vec<u8>)>,
        reply: Reply<PutOutcome>,
    },
    Get {
        key: JournalKey,
        reply: Reply<Option<Vec<u8>>>,
    },
    KeyCheck {
        key: JournalKey,
        reply: Reply<KeyPresence>,
    },
    GetPositions {
        sample: PositionSample,
        reply: Reply<Vec<u32>>,
    },
    DirectFetch {
        positions: Vec<u32>,
        mode: FetchMode,
        reply: Reply<Vec<FetchedRecord>>,
    },
    Scan {
        start: Option<u32>,
        reply: Reply<(u32, Vec<(JournalKey, Vec<u8>, u32)>)>,
    },
    Complete {
        reply: Reply<()>,
    },
    Roll {
        reply: Reply<()>,
    },
    /// Helper thread handing back the computed index.
    IndexReady {
        top_index: Vec<u8>,
        hash_region: Vec<u8>,
    },
    DeletePending {
        man_sqn: u64,
        inker: Arc<dyn InkerClient>,
    },
    Close {
        reply: Reply<bool>,
    },
    Kill,
    Status {
        reply: Reply<SegmentStatus>,
    },
}

/// Snapshot of an actor's externally visible state.
#[derive(Debug, Clone)]
pub struct SegmentStatus {
    /// Lifecycle state name: `writer`, `rolling`, `reader`, `delete_pending`.
    pub state: &'static str,

    /// Current file path (`.pnd` or `.cdb`).
    pub path: PathBuf,

    /// SQN of the first record, if any.
    pub low_sqn: Option<Sqn>,

    /// Key of the last record, if any.
    pub last_key: Option<JournalKey>,
}

// ------------------------------------------------------------------------------------------------
// SegmentHandle
// ------------------------------------------------------------------------------------------------

/// Cloneable handle on a segment actor.
///
/// All methods are synchronous request/reply calls into the actor's
/// mailbox; they fail with [`SegmentError::ActorGone`] once the actor has
/// stopped.
#[derive(Debug, Clone)]
pub struct SegmentHandle {
    tx: Sender<Request>,
    config: JournalConfig,
}

impl SegmentHandle {
    /// Open a segment for writing and spawn its actor.
    ///
    /// If `path` exists it is scanned and recovered (torn tail truncated);
    /// otherwise it is created with the top-index region reserved.
    pub fn open_writer(
        path: impl AsRef<Path>,
        config: JournalConfig,
        waste_dir: Option<PathBuf>,
    ) -> Result<Self, SegmentError> {
        let path = path.as_ref();
        let writer = if path.exists() {
            SegmentWriter::open(path, config.max_file_size)?
        } else {
            SegmentWriter::create(path, config.max_file_size)?
        };
        Ok(Self::spawn(State::Writer(writer), config, waste_dir))
    }

    /// Open a sealed segment for reading and spawn its actor.
    pub fn open_reader(
        path: impl AsRef<Path>,
        config: JournalConfig,
        waste_dir: Option<PathBuf>,
    ) -> Result<Self, SegmentError> {
        let reader = SegmentReader::open(path)?;
        Ok(Self::spawn(State::Reader(reader), config, waste_dir))
    }

    fn spawn(state: State, config: JournalConfig, waste_dir: Option<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel();
        let actor = Actor {
            rx,
            self_tx: tx.clone(),
            config: config.clone(),
            waste_dir,
            sample_counter: 0,
            pending_delete: None,
        };
        thread::spawn(move || actor.run(state));
        Self { tx, config }
    }

    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, SegmentError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| SegmentError::ActorGone)?;
        reply_rx.recv().map_err(|_| SegmentError::ActorGone)?
    }

    /// Append one record. See [`SegmentWriter::put`].
    pub fn put(&self, key: JournalKey, value: Vec<u8>) -> Result<PutOutcome, SegmentError> {
        self.call(|reply| Request::Put { key, value, reply })
    }

    /// Append a batch in one physical write. See [`SegmentWriter::mput`].
    pub fn mput(&self, batch: Vec<(JournalKey, Vec<u8>)>) -> Result<PutOutcome, SegmentError> {
        self.call(|reply| Request::MPut { batch, reply })
    }

    /// Exact lookup, served in `writer`, `rolling`, `reader`, and
    /// `delete_pending`.
    pub fn get(&self, key: JournalKey) -> Result<Option<Vec<u8>>, SegmentError> {
        self.call(|reply| Request::Get { key, reply })
    }

    /// Loose presence check.
    pub fn key_check(&self, key: JournalKey) -> Result<KeyPresence, SegmentError> {
        self.call(|reply| Request::KeyCheck { key, reply })
    }

    /// Record positions from the sealed hash index.
    pub fn get_positions(&self, sample: PositionSample) -> Result<Vec<u32>, SegmentError> {
        self.call(|reply| Request::GetPositions { sample, reply })
    }

    /// Fetch records at known positions.
    pub fn direct_fetch(
        &self,
        positions: Vec<u32>,
        mode: FetchMode,
    ) -> Result<Vec<FetchedRecord>, SegmentError> {
        self.call(|reply| Request::DirectFetch {
            positions,
            mode,
            reply,
        })
    }

    /// Collect `(key, value, position)` for every record from `start`,
    /// returning the resume position as well.
    pub fn scan_from(
        &self,
        start: Option<u32>,
    ) -> Result<(u32, Vec<(JournalKey, Vec<u8>, u32)>), SegmentError> {
        self.call(|reply| Request::Scan { start, reply })
    }

    /// Seal inline (`writer` only): compute and write the hash index in the
    /// actor, rename, become a reader.
    pub fn complete(&self) -> Result<(), SegmentError> {
        self.call(|reply| Request::Complete { reply })
    }

    /// Start a delegated seal (`writer` only): a helper thread computes the
    /// index while this segment keeps serving reads in `rolling`.
    pub fn roll(&self) -> Result<(), SegmentError> {
        self.call(|reply| Request::Roll { reply })
    }

    /// Ask the segment to retire: record the manifest SQN and inker handle
    /// and start the deferred-deletion poll. Fire-and-forget; legal in
    /// `reader` and (deferred) in `rolling`.
    pub fn delete_pending(&self, man_sqn: u64, inker: Arc<dyn InkerClient>) {
        let _ = self.tx.send(Request::DeletePending { man_sqn, inker });
    }

    /// Close the segment, retrying while a roll is in flight.
    ///
    /// Returns `Ok(true)` on a clean stop. After `roll_close_retries`
    /// refusals the actor is killed and `Ok(false)` is returned — the only
    /// way a caller can force exit during a pending roll.
    pub fn close(&self) -> Result<bool, SegmentError> {
        for _ in 0..self.config.roll_close_retries {
            match self.call(|reply| Request::Close { reply }) {
                Ok(true) => return Ok(true),
                Ok(false) => thread::sleep(self.config.roll_close_backoff),
                Err(SegmentError::ActorGone) => return Ok(true),
                Err(e) => return Err(e),
            }
        }
        warn!("segment still rolling after close retries, killing");
        self.kill();
        Ok(false)
    }

    /// Stop the actor immediately, abandoning any in-flight seal.
    pub fn kill(&self) {
        let _ = self.tx.send(Request::Kill);
    }

    /// Lifecycle state and metadata snapshot.
    pub fn status(&self) -> Result<SegmentStatus, SegmentError> {
        self.call(|reply| Request::Status { reply })
    }
}

// ------------------------------------------------------------------------------------------------
// Actor
// ------------------------------------------------------------------------------------------------

enum State {
    Writer(SegmentWriter),
    Rolling(RollingSegment),
    Reader(SegmentReader),
    DeletePending {
        reader: SegmentReader,
        man_sqn: u64,
        inker: Arc<dyn InkerClient>,
    },
    /// Terminal; the run loop exits on the next turn.
    Stopped,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Writer(_) => "writer",
            State::Rolling(_) => "rolling",
            State::Reader(_) => "reader",
            State::DeletePending { .. } => "delete_pending",
            State::Stopped => "stopped",
        }
    }
}

struct Actor {
    rx: Receiver<Request>,
    /// The actor's own mailbox, handed to roll helper threads.
    self_tx: Sender<Request>,
    config: JournalConfig,
    waste_dir: Option<PathBuf>,
    sample_counter: u64,
    /// Deletion request that arrived while rolling.
    pending_delete: Option<(u64, Arc<dyn InkerClient>)>,
}

impl Actor {
    fn run(mut self, mut state: State) {
        let mut handles_gone = false;
        loop {
            state = match state {
                State::DeletePending {
                    reader,
                    man_sqn,
                    inker,
                } => {
                    let received = if handles_gone {
                        thread::sleep(self.config.delete_timeout);
                        None
                    } else {
                        match self.rx.recv_timeout(self.config.delete_timeout) {
                            Ok(message) => Some(message),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => {
                                handles_gone = true;
                                None
                            }
                        }
                    };
                    match received {
                        Some(message) => self.handle(
                            State::DeletePending {
                                reader,
                                man_sqn,
                                inker,
                            },
                            message,
                        ),
                        None => {
                            // Poll turn: ask the inker whether the
                            // displacing manifest version is durable.
                            match inker.confirm_delete(man_sqn) {
                                Some(true) => {
                                    debug!(path = %reader.path().display(), man_sqn, "delete confirmed");
                                    if let Err(e) = reader.remove(self.waste_dir.as_deref()) {
                                        warn!(error = %e, "failed to remove retired segment");
                                    }
                                    return;
                                }
                                Some(false) => State::DeletePending {
                                    reader,
                                    man_sqn,
                                    inker,
                                },
                                None => {
                                    // Inker died; stop without touching the file.
                                    info!("inker gone while delete pending, stopping");
                                    return;
                                }
                            }
                        }
                    }
                }
                other => {
                    let message = match self.rx.recv() {
                        Ok(message) => message,
                        // Every handle dropped: a writer keeps its `.pnd`
                        // for recovery, a reader just stops.
                        Err(_) => return,
                    };
                    self.handle(other, message)
                }
            };
            if matches!(state, State::Stopped) {
                return;
            }
        }
    }

    fn handle(&mut self, state: State, message: Request) -> State {
        match message {
            Request::Put { key, value, reply } => match state {
                State::Writer(mut writer) => {
                    let _ = reply.send(writer.put(&key, &value));
                    State::Writer(writer)
                }
                State::Rolling(rolling) => {
                    // Mid-seal: the caller must direct appends elsewhere.
                    let _ = reply.send(Ok(PutOutcome::Roll));
                    State::Rolling(rolling)
                }
                other => {
                    let _ = reply.send(Err(SegmentError::WrongState {
                        operation: "put",
                        state: other.name(),
                    }));
                    other
                }
            },

            Request::MPut { batch, reply } => match state {
                State::Writer(mut writer) => {
                    let _ = reply.send(writer.mput(&batch));
                    State::Writer(writer)
                }
                State::Rolling(rolling) => {
                    let _ = reply.send(Ok(PutOutcome::Roll));
                    State::Rolling(rolling)
                }
                other => {
                    let _ = reply.send(Err(SegmentError::WrongState {
                        operation: "mput",
                        state: other.name(),
                    }));
                    other
                }
            },

            Request::Get { key, reply } => {
                let result = match &state {
                    State::Writer(writer) => writer.get(&key),
                    State::Rolling(rolling) => rolling.get(&key),
                    State::Reader(reader) => reader.get(&key),
                    State::DeletePending { reader, .. } => reader.get(&key),
                    State::Stopped => Err(SegmentError::ActorGone),
                };
                let _ = reply.send(result);
                state
            }

            Request::KeyCheck { key, reply } => {
                let result = match &state {
                    State::Writer(writer) => writer.key_check(&key),
                    State::Rolling(rolling) => rolling.key_check(&key),
                    State::Reader(reader) => reader.key_check(&key),
                    State::DeletePending { reader, .. } => reader.key_check(&key),
                    State::Stopped => Err(SegmentError::ActorGone),
                };
                let _ = reply.send(result);
                state
            }

            Request::GetPositions { sample, reply } => {
                let result = match &state {
                    State::Reader(reader) | State::DeletePending { reader, .. } => {
                        self.sample_counter += 1;
                        let seed = derive_seed(self.config.sample_seed, self.sample_counter);
                        Ok(reader.get_positions(sample, seed))
                    }
                    other => Err(SegmentError::WrongState {
                        operation: "get_positions",
                        state: other.name(),
                    }),
                };
                let _ = reply.send(result);
                state
            }

            Request::DirectFetch {
                positions,
                mode,
                reply,
            } => {
                let result = match &state {
                    State::Reader(reader) | State::DeletePending { reader, .. } => {
                        reader.direct_fetch(&positions, mode)
                    }
                    other => Err(SegmentError::WrongState {
                        operation: "direct_fetch",
                        state: other.name(),
                    }),
                };
                let _ = reply.send(result);
                state
            }

            Request::Scan { start, reply } => {
                let result = match &state {
                    State::Reader(reader) | State::DeletePending { reader, .. } => reader
                        .scan(start, Vec::new(), |key, value, position, acc| {
                            acc.push((key.clone(), value.to_vec(), position));
                            ScanControl::Continue
                        }),
                    other => Err(SegmentError::WrongState {
                        operation: "scan",
                        state: other.name(),
                    }),
                };
                let _ = reply.send(result);
                state
            }

            Request::Complete { reply } => match state {
                State::Writer(writer) => match writer.complete() {
                    Ok(reader) => {
                        let _ = reply.send(Ok(()));
                        State::Reader(reader)
                    }
                    Err(e) => {
                        // Seal failure is fatal for the actor; the caller
                        // learns why, the supervisor decides what's next.
                        let _ = reply.send(Err(e));
                        State::Stopped
                    }
                },
                other => {
                    let _ = reply.send(Err(SegmentError::WrongState {
                        operation: "complete",
                        state: other.name(),
                    }));
                    other
                }
            },

            Request::Roll { reply } => match state {
                State::Writer(writer) => {
                    let rolling = writer.into_rolling();
                    let maps = rolling.maps.clone();
                    let cursor = rolling.cursor;
                    let mailbox = self.self_tx.clone();
                    thread::spawn(move || {
                        let (top_index, hash_region) = build_hash_index(&maps, cursor);
                        let _ = mailbox.send(Request::IndexReady {
                            top_index,
                            hash_region,
                        });
                    });
                    trace!(path = %rolling.path.display(), "roll started");
                    let _ = reply.send(Ok(()));
                    State::Rolling(rolling)
                }
                other => {
                    let _ = reply.send(Err(SegmentError::WrongState {
                        operation: "roll",
                        state: other.name(),
                    }));
                    other
                }
            },

            Request::IndexReady {
                top_index,
                hash_region,
            } => match state {
                State::Rolling(rolling) => match rolling.finish(top_index, hash_region) {
                    Ok(reader) => match self.pending_delete.take() {
                        Some((man_sqn, inker)) => State::DeletePending {
                            reader,
                            man_sqn,
                            inker,
                        },
                        None => State::Reader(reader),
                    },
                    Err(e) => {
                        warn!(error = %e, "failed to finish roll");
                        State::Stopped
                    }
                },
                // A kill or close raced the helper; drop the index.
                other => other,
            },

            Request::DeletePending { man_sqn, inker } => match state {
                State::Reader(reader) => {
                    debug!(path = %reader.path().display(), man_sqn, "delete pending");
                    State::DeletePending {
                        reader,
                        man_sqn,
                        inker,
                    }
                }
                State::Rolling(rolling) => {
                    // Deferred until the roll finishes.
                    self.pending_delete = Some((man_sqn, inker));
                    State::Rolling(rolling)
                }
                // Idempotent in delete_pending; ignored elsewhere.
                other => other,
            },

            Request::Close { reply } => match state {
                State::Rolling(rolling) => {
                    let _ = reply.send(Ok(false));
                    State::Rolling(rolling)
                }
                _ => {
                    let _ = reply.send(Ok(true));
                    State::Stopped
                }
            },

            Request::Kill => State::Stopped,

            Request::Status { reply } => {
                let status = match &state {
                    State::Writer(writer) => SegmentStatus {
                        state: "writer",
                        path: writer.path().to_path_buf(),
                        low_sqn: writer.low_sqn(),
                        last_key: writer.last_key().cloned(),
                    },
                    State::Rolling(rolling) => SegmentStatus {
                        state: "rolling",
                        path: rolling.path.clone(),
                        low_sqn: rolling.low_sqn,
                        last_key: rolling.last_key.clone(),
                    },
                    State::Reader(reader) => SegmentStatus {
                        state: "reader",
                        path: reader.path().to_path_buf(),
                        low_sqn: reader.low_sqn(),
                        last_key: reader.last_key().cloned(),
                    },
                    State::DeletePending { reader, .. } => SegmentStatus {
                        state: "delete_pending",
                        path: reader.path().to_path_buf(),
                        low_sqn: reader.low_sqn(),
                        last_key: reader.last_key().cloned(),
                    },
                    State::Stopped => SegmentStatus {
                        state: "stopped",
                        path: PathBuf::new(),
                        low_sqn: None,
                        last_key: None,
                    },
                };
                let _ = reply.send(Ok(status));
                state
            }
        }
    }
}
