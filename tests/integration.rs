//! Integration tests for the journal surface.
//!
//! These exercise the full journal stack — segment actors, manifest,
//! blooms, compactor, and the two-phase deletion handshake — through the
//! public `quilldb` API only. No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: writer → roll/complete → reader → delete_pending
//! - **Compaction**: retain-strategy rewrite over a multi-segment manifest
//! - **Delete safety**: retired files survive until the inker confirms
//! - **Blooms**: manifest-entry blooms reject absent keys without I/O
//! - **Recovery**: a dropped writer re-opens with its records intact

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use quilldb::compactor::strategy::LedgerSnapshot;
use quilldb::compactor::run_compaction;
use quilldb::manifest::{InkerClient, InkerGone, JournalManifest, ManifestEntry};
use quilldb::record::{
    hash_journal_key, JournalKey, LedgerKey, ReloadPolicy, ReloadStrategy, Sqn, StandardValue,
};
use quilldb::segment::actor::SegmentHandle;
use quilldb::segment::{KeyPresence, PutOutcome};
use quilldb::JournalConfig;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn config() -> JournalConfig {
    JournalConfig {
        delete_timeout: Duration::from_millis(20),
        waste_retention: Some(Duration::from_secs(3600)),
        sample_seed: Some(1),
        ..JournalConfig::default()
    }
}

fn key(sqn: Sqn, name: &str) -> JournalKey {
    JournalKey::standard(sqn, LedgerKey::object(name.as_bytes().to_vec()))
}

fn value(n: u64) -> Vec<u8> {
    StandardValue {
        object: format!("object_{n:06}").into_bytes(),
        deltas: format!("deltas_{n:06}").into_bytes(),
    }
    .to_bytes()
    .expect("encode value")
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

/// Minimal in-process inker: a mutex-held manifest behind the
/// `InkerClient` surface, confirming deletes as soon as the displacing
/// patch has been applied.
struct LocalInker {
    manifest: Mutex<JournalManifest>,
    alive: AtomicBool,
}

impl LocalInker {
    fn new(manifest: JournalManifest) -> Arc<Self> {
        Arc::new(Self {
            manifest: Mutex::new(manifest),
            alive: AtomicBool::new(true),
        })
    }

    fn entries(&self) -> Vec<ManifestEntry> {
        self.manifest.lock().unwrap().entries().to_vec()
    }
}

impl InkerClient for LocalInker {
    fn get_manifest(&self) -> Vec<ManifestEntry> {
        self.manifest.lock().unwrap().compactable()
    }

    fn update_manifest(
        &self,
        adds: Vec<ManifestEntry>,
        removes: Vec<ManifestEntry>,
    ) -> Result<u64, InkerGone> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(InkerGone);
        }
        let names: Vec<String> = removes.into_iter().map(|e| e.filename).collect();
        Ok(self.manifest.lock().unwrap().apply_patch(adds, &names))
    }

    fn compaction_complete(&self) {}

    fn confirm_delete(&self, man_sqn: u64) -> Option<bool> {
        if !self.alive.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.manifest.lock().unwrap().man_sqn() >= man_sqn)
    }
}

/// Snapshot double: the newest SQN per ledger key wins.
struct NewestWins {
    current: std::collections::HashMap<LedgerKey, Sqn>,
    horizon: Sqn,
}

impl NewestWins {
    fn from_writes(writes: &[(Sqn, String)], horizon: Sqn) -> Self {
        let mut current = std::collections::HashMap::new();
        for (sqn, name) in writes {
            let entry = current
                .entry(LedgerKey::object(name.as_bytes().to_vec()))
                .or_insert(*sqn);
            if *sqn > *entry {
                *entry = *sqn;
            }
        }
        Self { current, horizon }
    }
}

impl LedgerSnapshot for NewestWins {
    fn is_current(&self, key: &LedgerKey, sqn: Sqn) -> bool {
        self.current.get(key) == Some(&sqn)
    }

    fn max_sqn(&self) -> Sqn {
        self.horizon
    }
}

/// Append `writes` into a fresh segment actor and seal it, returning the
/// manifest entry.
fn sealed_segment(
    dir: &Path,
    name: &str,
    writes: &[(Sqn, String)],
    cfg: &JournalConfig,
    waste: Option<PathBuf>,
) -> ManifestEntry {
    let path = dir.join(format!("{name}.pnd"));
    let handle = SegmentHandle::open_writer(&path, cfg.clone(), waste).unwrap();
    for (sqn, key_name) in writes {
        let outcome = handle.put(key(*sqn, key_name), value(*sqn)).unwrap();
        assert!(matches!(outcome, PutOutcome::Written { .. }));
    }
    handle.complete().unwrap();
    let status = handle.status().unwrap();
    // Rebuild the bloom from the sealed file's keys.
    let (_, records) = handle.scan_from(None).unwrap();
    let hashes: Vec<u32> = records
        .iter()
        .map(|(k, _, _)| hash_journal_key(k).unwrap())
        .collect();
    ManifestEntry {
        low_sqn: status.low_sqn.unwrap(),
        filename: format!("{name}.cdb"),
        bloom: quilldb::bloom::SegmentBloom::from_hashes(&hashes),
        handle,
    }
}

// ------------------------------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------------------------------

/// Full journey: three sealed segments plus an active head, a
/// retain-strategy compaction over the sealed run, and the deferred
/// deletion of the consumed files into the waste directory.
#[test]
fn compaction_journey_preserves_live_data() {
    let tmp = TempDir::new().unwrap();
    let cfg = config();
    let waste = tmp.path().join("waste");

    // Segment 1: SQNs 1..=8, churn on "user_a".
    let seg1: Vec<(Sqn, String)> = (1..=8)
        .map(|sqn| {
            let name = if sqn % 2 == 1 {
                "user_a".to_string()
            } else {
                format!("item_{sqn}")
            };
            (sqn, name)
        })
        .collect();
    // Segment 2: SQNs 9..=16, churn on "user_b".
    let seg2: Vec<(Sqn, String)> = (9..=16)
        .map(|sqn| {
            let name = if sqn % 2 == 0 {
                "user_b".to_string()
            } else {
                format!("item_{sqn}")
            };
            (sqn, name)
        })
        .collect();
    // Active head: SQNs 17..=20 (never compacted).
    let head: Vec<(Sqn, String)> = (17..=20).map(|sqn| (sqn, format!("head_{sqn}"))).collect();

    let mut manifest = JournalManifest::new();
    manifest.insert(sealed_segment(tmp.path(), "inker_1", &seg1, &cfg, Some(waste.clone())));
    manifest.insert(sealed_segment(tmp.path(), "inker_9", &seg2, &cfg, Some(waste.clone())));
    manifest.insert(sealed_segment(tmp.path(), "inker_17", &head, &cfg, Some(waste.clone())));

    let all_writes: Vec<(Sqn, String)> = seg1
        .iter()
        .chain(seg2.iter())
        .chain(head.iter())
        .cloned()
        .collect();
    let snapshot = NewestWins::from_writes(&all_writes, 21);

    let inker = LocalInker::new(manifest);
    let client: Arc<dyn InkerClient> = inker.clone();
    let outcome = run_compaction(
        &client,
        &snapshot,
        &ReloadPolicy::uniform(ReloadStrategy::Retain),
        tmp.path(),
        &waste,
        &cfg,
    )
    .unwrap();

    assert_eq!(outcome.removed.len(), 2, "both sealed segments rewritten");
    assert!(!outcome.created.is_empty());
    assert!(outcome.man_sqn.is_some());

    // Every write is still reachable through the patched manifest: live
    // versions in full, superseded ones at least as key deltas.
    let entries = inker.entries();
    for (sqn, name) in &all_writes {
        let standard = key(*sqn, name);
        let delta = JournalKey::key_delta(*sqn, LedgerKey::object(name.as_bytes().to_vec()));
        let found = entries.iter().any(|entry| {
            entry.handle.get(standard.clone()).unwrap().is_some()
                || entry.handle.get(delta.clone()).unwrap().is_some()
        });
        assert!(found, "write {sqn}:{name} lost by compaction");
    }

    // Live versions survive verbatim.
    let live_a = key(7, "user_a");
    let hit = entries
        .iter()
        .find_map(|entry| entry.handle.get(live_a.clone()).unwrap());
    assert_eq!(hit, Some(value(7)));

    // Consumed files land in the waste directory once the inker confirms.
    wait_until("retired segments to reach waste", || {
        waste.exists()
            && waste.read_dir().map(|d| d.count()).unwrap_or(0) >= 2
    });
    assert!(!tmp.path().join("inker_1.cdb").exists());
    assert!(!tmp.path().join("inker_9.cdb").exists());
    // The head was never touched.
    assert!(tmp.path().join("inker_17.cdb").exists());
}

/// Manifest-entry blooms answer negative membership without touching the
/// segment: absent keys report false, present keys report true.
#[test]
fn manifest_blooms_screen_absent_keys() {
    let tmp = TempDir::new().unwrap();
    let cfg = config();
    let writes: Vec<(Sqn, String)> = (1..=30).map(|sqn| (sqn, format!("key_{sqn}"))).collect();
    let entry = sealed_segment(tmp.path(), "bloomed", &writes, &cfg, None);

    for (sqn, name) in &writes {
        let hash = hash_journal_key(&key(*sqn, name)).unwrap();
        assert!(entry.bloom.check_hash(hash));
    }

    let mut rejected = 0;
    for sqn in 100..200u64 {
        let hash = hash_journal_key(&key(sqn, "absent")).unwrap();
        if !entry.bloom.check_hash(hash) {
            rejected += 1;
        }
    }
    assert!(rejected > 90, "bloom rejected only {rejected}/100 absences");

    // And the segment agrees with the bloom's negatives.
    assert_eq!(
        entry.handle.key_check(key(150, "absent")).unwrap(),
        KeyPresence::Missing
    );
}

/// A writer whose handles are dropped (crash stand-in) re-opens with all
/// acknowledged records and keeps accepting appends.
#[test]
fn dropped_writer_recovers_on_reopen() {
    let tmp = TempDir::new().unwrap();
    let cfg = config();
    let path = tmp.path().join("recover.pnd");

    {
        let handle = SegmentHandle::open_writer(&path, cfg.clone(), None).unwrap();
        for sqn in 1..=12u64 {
            handle.put(key(sqn, &format!("k{sqn}")), value(sqn)).unwrap();
        }
        // Handles drop here; the actor exits without sealing.
    }

    wait_until("pnd file to settle", || path.exists());
    let handle = SegmentHandle::open_writer(&path, cfg, None).unwrap();
    let status = handle.status().unwrap();
    assert_eq!(status.state, "writer");
    assert_eq!(status.low_sqn, Some(1));
    assert_eq!(status.last_key.unwrap().sqn, 12);

    assert_eq!(handle.get(key(5, "k5")).unwrap(), Some(value(5)));
    handle.put(key(13, "k13"), value(13)).unwrap();
    handle.complete().unwrap();
    assert_eq!(handle.get(key(13, "k13")).unwrap(), Some(value(13)));
}
