//! Shared fixtures for segment tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::record::{JournalKey, LedgerKey, Sqn, StandardValue};
use crate::segment::{PutOutcome, SegmentWriter};
use crate::JournalConfig;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call repeatedly —
/// only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with fast timeouts and a pinned sampling seed.
pub fn test_config() -> JournalConfig {
    init_tracing();
    JournalConfig {
        delete_timeout: Duration::from_millis(20),
        roll_close_backoff: Duration::from_millis(1),
        sample_seed: Some(0xDEC0DE),
        ..JournalConfig::default()
    }
}

/// Same, but with a tiny `max_file_size` so appends hit `Roll` quickly.
pub fn tiny_file_config(max_file_size: u64) -> JournalConfig {
    JournalConfig {
        max_file_size,
        ..test_config()
    }
}

/// `.pnd` path inside a test directory.
pub fn pnd_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.pnd"))
}

/// Standard-value journal key for `Key<n>` at `sqn`.
pub fn std_key(sqn: Sqn, name: &str) -> JournalKey {
    JournalKey::standard(sqn, LedgerKey::object(name.as_bytes().to_vec()))
}

/// `(object, deltas)` value whose parts embed `n` for easy assertions.
pub fn std_value(n: u64) -> Vec<u8> {
    StandardValue {
        object: format!("object_{n:04}").into_bytes(),
        deltas: format!("deltas_{n:04}").into_bytes(),
    }
    .to_bytes()
    .expect("encode standard value")
}

/// Write `count` records (`Key1..KeyN`, SQNs 1..=N) into a fresh writer.
pub fn write_sequence(writer: &mut SegmentWriter, count: u64) {
    for sqn in 1..=count {
        let key = std_key(sqn, &format!("Key{sqn}"));
        let outcome = writer.put(&key, &std_value(sqn)).expect("put");
        assert!(matches!(outcome, PutOutcome::Written { .. }));
    }
}
