//! Shared doubles and fixtures for compactor tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::compactor::strategy::LedgerSnapshot;
use crate::manifest::{InkerClient, InkerGone, ManifestEntry};
use crate::record::{JournalKey, LedgerKey, Sqn, StandardValue};
use crate::segment::actor::SegmentHandle;
use crate::segment::SegmentWriter;
use crate::JournalConfig;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with a pinned sampling seed and fast delete polling.
pub fn test_config() -> JournalConfig {
    init_tracing();
    JournalConfig {
        delete_timeout: Duration::from_millis(20),
        sample_seed: Some(0xC0FFEE),
        ..JournalConfig::default()
    }
}

/// Ledger snapshot double: an explicit `(ledger key → current SQN)` map.
pub struct MapSnapshot {
    current: HashMap<LedgerKey, Sqn>,
    max_sqn: Sqn,
}

impl MapSnapshot {
    pub fn new(max_sqn: Sqn, live: impl IntoIterator<Item = (Sqn, &'static str)>) -> Self {
        let current = live
            .into_iter()
            .map(|(sqn, name)| (LedgerKey::object(name.as_bytes().to_vec()), sqn))
            .collect();
        Self { current, max_sqn }
    }
}

impl LedgerSnapshot for MapSnapshot {
    fn is_current(&self, key: &LedgerKey, sqn: Sqn) -> bool {
        self.current.get(key) == Some(&sqn)
    }

    fn max_sqn(&self) -> Sqn {
        self.max_sqn
    }
}

/// Inker double backed by a plain entry list; records patches and serves a
/// scripted `confirm_delete` answer.
pub struct TestInker {
    entries: Mutex<Vec<ManifestEntry>>,
    man_sqn: AtomicU64,
    pub confirm_answer: Option<bool>,
    complete_calls: AtomicUsize,
    patches: Mutex<Vec<(Vec<ManifestEntry>, Vec<ManifestEntry>)>>,
    /// When true, `update_manifest` reports the inker dead.
    pub dead: bool,
}

impl TestInker {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            man_sqn: AtomicU64::new(1),
            confirm_answer: Some(true),
            complete_calls: AtomicUsize::new(0),
            patches: Mutex::new(Vec::new()),
            dead: false,
        }
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    /// Entries added by the last patch.
    pub fn last_adds(&self) -> Vec<ManifestEntry> {
        self.patches
            .lock()
            .unwrap()
            .last()
            .map(|(adds, _)| adds.clone())
            .unwrap_or_default()
    }

    pub fn patch_count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }
}

impl InkerClient for TestInker {
    fn get_manifest(&self) -> Vec<ManifestEntry> {
        self.entries.lock().unwrap().clone()
    }

    fn update_manifest(
        &self,
        adds: Vec<ManifestEntry>,
        removes: Vec<ManifestEntry>,
    ) -> Result<u64, InkerGone> {
        if self.dead {
            return Err(InkerGone);
        }
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| !removes.iter().any(|r| r.filename == entry.filename));
        entries.extend(adds.iter().cloned());
        entries.sort_by_key(|entry| entry.low_sqn);
        self.patches.lock().unwrap().push((adds, removes));
        Ok(self.man_sqn.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn compaction_complete(&self) {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn confirm_delete(&self, _man_sqn: u64) -> Option<bool> {
        self.confirm_answer
    }
}

/// Standard key for `name` at `sqn`.
pub fn std_key(sqn: Sqn, name: &str) -> JournalKey {
    JournalKey::standard(sqn, LedgerKey::object(name.as_bytes().to_vec()))
}

/// Fixed-size `(object, deltas)` value; equal length for every `n` so
/// byte-weighted scores reduce to record counts.
pub fn std_value(n: u64) -> Vec<u8> {
    StandardValue {
        object: format!("object_{n:04}").into_bytes(),
        deltas: format!("deltas_{n:04}").into_bytes(),
    }
    .to_bytes()
    .expect("encode standard value")
}

/// The S1 fixture: SQNs 1..=8 where 1,4,5,6,7,8 all write `Key1` and
/// 2,3 write `Key2`/`Key3`. Returns a sealed segment's manifest entry.
pub fn half_replaced_segment(dir: &Path, name: &str) -> ManifestEntry {
    let path = dir.join(format!("{name}.pnd"));
    let mut writer = SegmentWriter::create(&path, test_config().max_file_size).unwrap();
    for sqn in 1..=8u64 {
        let key_name = match sqn {
            2 => "Key2",
            3 => "Key3",
            _ => "Key1",
        };
        writer.put(&std_key(sqn, key_name), &std_value(sqn)).unwrap();
    }
    let bloom = writer.bloom();
    let low_sqn = writer.low_sqn().unwrap();
    let reader = writer.complete().unwrap();
    let handle = SegmentHandle::open_reader(reader.path(), test_config(), None).unwrap();
    ManifestEntry {
        low_sqn,
        filename: format!("{name}.cdb"),
        bloom,
        handle,
    }
}

/// The ledger state matching [`half_replaced_segment`]: live versions are
/// `Key1@8`, `Key2@2`, `Key3@3`; snapshot horizon 9.
pub fn half_replaced_snapshot() -> MapSnapshot {
    MapSnapshot::new(9, [(8, "Key1"), (2, "Key2"), (3, "Key3")])
}
