//! # Memtable Module
//!
//! A memtable binds one [`Skiplist`] to one [`LogFile`]: the skiplist
//! is the sorted in-memory index, the WAL its durable shadow. On a
//! crash, replaying the WAL reconstructs the skiplist exactly as it
//! was after the last fully-written record.
//!
//! ## Design Invariants
//!
//! - Writes are WAL-first: an entry reaches the skiplist only after
//!   its record has been copied into the mapped log. A failed WAL
//!   write leaves the skiplist untouched.
//! - A memtable's WAL contains, in order, every entry ever applied to
//!   its skiplist through [`MemTable::put`].
//! - Once a memtable becomes immutable (after rotation) only its
//!   reference count changes; the skiplist is never written again.
//! - `max_version` tracks the greatest key timestamp ever inserted.
//!
//! ## Lifecycle
//!
//! WAL files live at `<dir>/<fid zero-padded 5>.mem`. Opening a
//! directory scans and sorts these files, replays each into a fresh
//! skiplist, and keeps the non-empty ones as immutable memtables.
//! The skiplist's `on_close` hook deletes the WAL when the last
//! reference drops — unless the table still holds unflushed data, in
//! which case the engine disarms the hook first so the file survives
//! for the next recovery.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::codec::{parse_ts, Entry, ValueStruct};
use crate::engine::Options;
use crate::skiplist::Skiplist;
use crate::wal::{LogFile, WalError};

/// Extension of every memtable WAL file.
pub const MEM_FILE_EXT: &str = ".mem";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Filesystem failure while scanning the directory.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Creation attempted over an existing WAL file.
    #[error("file {0} already exists")]
    FileExists(String),

    /// Internal consistency error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// A skiplist plus its write-ahead log.
pub struct MemTable {
    skl: Skiplist,
    /// Absent in in-memory mode.
    wal: Option<Arc<LogFile>>,
    opts: Options,
    /// Reusable record-encoding buffer; the write path is
    /// single-writer, so contention here is nil.
    buf: Mutex<Vec<u8>>,
    /// Greatest key timestamp inserted so far.
    max_version: AtomicU64,
}

impl MemTable {
    /// Applies one entry: WAL first, then the skiplist.
    pub fn put(&self, key: &[u8], value: &ValueStruct) -> Result<(), MemtableError> {
        if let Some(wal) = &self.wal {
            let entry = Entry {
                key: key.to_vec(),
                value: value.value.clone(),
                expires_at: value.expires_at,
                meta: value.meta,
                user_meta: value.user_meta,
            };
            let mut buf = self
                .buf
                .lock()
                .map_err(|_| MemtableError::Internal("encode buffer mutex poisoned".into()))?;
            wal.write_entry(&mut buf, &entry)?;
        }

        self.skl.put(key, value);
        self.max_version
            .fetch_max(parse_ts(key), Ordering::Relaxed);
        Ok(())
    }

    /// The sorted index.
    pub fn skl(&self) -> &Skiplist {
        &self.skl
    }

    /// Greatest key timestamp ever applied.
    pub fn max_version(&self) -> u64 {
        self.max_version.load(Ordering::Relaxed)
    }

    /// Flushes the WAL mapping to disk. A no-op in in-memory mode.
    pub fn sync_wal(&self) -> Result<(), MemtableError> {
        match &self.wal {
            Some(wal) => Ok(wal.sync()?),
            None => Ok(()),
        }
    }

    /// Whether the engine must rotate before the next write.
    ///
    /// True once the arena has consumed 80 % of `memtable_size`, or
    /// the WAL cursor is within a `memtable_size / 5` margin of its
    /// mapped capacity. Conservative on purpose: running the arena or
    /// the map to the edge is fatal, not recoverable.
    pub fn is_full(&self) -> bool {
        let limit = self.opts.memtable_size;
        if u64::from(self.skl.arena_size()) >= limit - limit / 5 {
            return true;
        }
        match &self.wal {
            Some(wal) => u64::from(wal.write_at()) + limit / 5 > u64::from(wal.capacity()),
            None => false,
        }
    }

    /// Keeps the WAL file on disk when this table drops.
    ///
    /// Used for tables whose contents have not been flushed to a
    /// persistent level: the file must survive so the next open can
    /// replay it.
    pub(crate) fn preserve_wal(&self) {
        self.skl.take_on_close();
    }

    /// Replays the paired WAL into the (empty) skiplist.
    fn replay_wal(&self) -> Result<usize, MemtableError> {
        let Some(wal) = &self.wal else {
            return Ok(0);
        };
        let mut max_version = 0u64;
        let count = wal.replay(|entry| {
            let ts = parse_ts(&entry.key);
            if ts > max_version {
                max_version = ts;
            }
            let vs = ValueStruct {
                meta: entry.meta,
                user_meta: entry.user_meta,
                expires_at: entry.expires_at,
                value: entry.value,
                version: 0,
            };
            self.skl.put(&entry.key, &vs);
        })?;
        self.max_version.fetch_max(max_version, Ordering::Relaxed);
        if count > 0 {
            info!(
                fid = wal.fid(),
                records = count,
                max_version,
                "memtable recovered from wal"
            );
        }
        Ok(count)
    }
}

// ------------------------------------------------------------------------------------------------
// Construction & recovery
// ------------------------------------------------------------------------------------------------

/// Path of the WAL for file id `fid`: `<dir>/<fid zero-padded 5>.mem`.
pub fn mt_file_path(dir: &str, fid: u32) -> PathBuf {
    Path::new(dir).join(format!("{fid:05}{MEM_FILE_EXT}"))
}

/// Creates the memtable for a fresh file id.
///
/// Fails with [`MemtableError::FileExists`] if a WAL with this id is
/// already on disk.
pub fn new_mem_table(opts: &Options, fid: u32) -> Result<MemTable, MemtableError> {
    let (mt, is_new) = open_mem_table(opts, fid, false, true)?;
    if !is_new {
        return Err(MemtableError::FileExists(
            mt_file_path(&opts.dir, fid).display().to_string(),
        ));
    }
    Ok(mt)
}

/// Scans `opts.dir` for `.mem` files, replays each in fid order, and
/// returns the non-empty recovered memtables (oldest first) plus the
/// next free file id.
///
/// Empty recovered tables are dropped on the spot, which deletes
/// their WAL files through the `on_close` hook.
pub fn open_mem_tables(opts: &Options) -> Result<(Vec<MemTable>, u32), MemtableError> {
    if opts.in_memory {
        return Ok((Vec::new(), 1));
    }

    let mut fids = Vec::new();
    for dir_entry in fs::read_dir(&opts.dir)? {
        let name = dir_entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(stem) = name.strip_suffix(MEM_FILE_EXT) else {
            continue;
        };
        let fid: u32 = stem.parse().map_err(|_| {
            MemtableError::Internal(format!("cannot parse memtable file name {name}"))
        })?;
        fids.push(fid);
    }
    fids.sort_unstable();

    let mut tables = Vec::new();
    for &fid in &fids {
        let (mt, _) = open_mem_table(opts, fid, opts.read_only, false)?;
        if mt.skl.is_empty() {
            // Nothing was recovered; dropping the table removes its
            // file.
            debug!(fid, "dropping empty recovered memtable");
            continue;
        }
        tables.push(mt);
    }

    let next_fid = fids.last().map_or(1, |last| last + 1);
    Ok((tables, next_fid))
}

/// Opens one memtable: fresh skiplist, WAL at `fid`, `on_close` hook
/// armed to delete the file, and — for existing files — a full replay.
fn open_mem_table(
    opts: &Options,
    fid: u32,
    read_only: bool,
    create: bool,
) -> Result<(MemTable, bool), MemtableError> {
    let skl = Skiplist::new(opts.arena_size());

    if opts.in_memory {
        // No WAL to pair with; the table lives and dies with the
        // process.
        let mt = MemTable {
            skl,
            wal: None,
            opts: opts.clone(),
            buf: Mutex::new(Vec::new()),
            max_version: AtomicU64::new(0),
        };
        return Ok((mt, true));
    }

    let path = mt_file_path(&opts.dir, fid);
    let (log, is_new) = LogFile::open(&path, fid, read_only, create, 2 * opts.memtable_size)?;
    let wal = Arc::new(log);

    {
        let wal = Arc::clone(&wal);
        let path = path.clone();
        skl.set_on_close(move || {
            if let Err(e) = wal.delete() {
                error!(path = %path.display(), error = %e, "failed to delete memtable wal");
            }
        });
    }

    let mt = MemTable {
        skl,
        wal: Some(wal),
        opts: opts.clone(),
        buf: Mutex::new(Vec::new()),
        max_version: AtomicU64::new(0),
    };

    if !is_new {
        mt.replay_wal()?;
    }

    Ok((mt, is_new))
}
