use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::codec::{key_with_ts, Entry};
use crate::engine::Options;

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call repeatedly — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options sized so tests never rotate unless they mean to.
pub fn test_options(dir: &TempDir) -> Options {
    init_tracing();
    let mut opts = Options::new(dir.path().to_str().unwrap());
    opts.memtable_size = 1 << 20;
    opts
}

/// Options with a tiny memtable so a handful of writes forces
/// rotation.
pub fn small_memtable_options(dir: &TempDir) -> Options {
    init_tracing();
    let mut opts = Options::new(dir.path().to_str().unwrap());
    opts.memtable_size = 4096;
    opts
}

/// The `i`-th canned entry: key `%05d(i*10+5)` at timestamp 0.
pub fn test_entry(i: usize) -> Entry {
    Entry {
        key: key_with_ts(format!("{:05}", i * 10 + 5).as_bytes(), 0),
        value: format!("{i:05}").into_bytes(),
        expires_at: 0,
        meta: 0,
        user_meta: i as u8,
    }
}
