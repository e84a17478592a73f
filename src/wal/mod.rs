//! Memory-mapped Write-Ahead Log.
//!
//! Every memtable owns one log file. Appends are plain memory copies
//! into a fixed-size mapped window, so the write path pays no syscall
//! per record; durability is deferred to an explicit [`LogFile::sync`]
//! (driven by the engine's `sync_writes` option) or to the OS page
//! cache writeback.
//!
//! # On-disk layout
//!
//! ```text
//! [reserved header: 20 bytes]
//! [entry_header][key bytes][value bytes][crc32c LE]
//! [entry_header][key bytes][value bytes][crc32c LE]
//! ...
//! ```
//!
//! - The leading 20 bytes are reserved (key id + base IV placeholder)
//!   and currently zero.
//! - Each record is an encoded [`Header`] followed by the raw key and
//!   value bytes and a little-endian CRC-32C (Castagnoli) computed
//!   over everything before it.
//!
//! # Recovery
//!
//! [`LogFile::replay`] walks records from the end of the reserved
//! header, verifying each checksum. Replay stops at the first invalid
//! or truncated record and positions the write cursor there, so the
//! log is logically truncated at the last fully-written record — data
//! past that point is dead and will be overwritten.
//!
//! # Concurrency
//!
//! The mapped region and write cursor live behind one mutex. In steady
//! state only the engine's write-batch task appends; replay runs at
//! open time before any writer exists.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::{Mmap, MmapMut};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::codec::{CodecError, Entry, Header, ValuePointer};

/// Reserved bytes at the start of every log file:
/// key id (8 bytes) + base IV (12 bytes), both currently unused.
pub const LOG_HEADER_SIZE: u32 = 20;

/// Bytes of the trailing record checksum.
const CRC_SIZE: usize = size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log-file operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O or mmap failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Read past the mapped extent of the file.
    #[error("end of log file")]
    Eof,

    /// A record's stored CRC-32C did not match its contents.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A record failed to decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Append attempted on a read-only mapping.
    #[error("log file is read-only")]
    ReadOnly,

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Log file
// ------------------------------------------------------------------------------------------------

/// Mapped window over a log file, writable unless the store was opened
/// read-only.
enum LogMap {
    Rw(MmapMut),
    Ro(Mmap),
}

impl LogMap {
    fn bytes(&self) -> &[u8] {
        match self {
            LogMap::Rw(m) => m,
            LogMap::Ro(m) => m,
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8], WalError> {
        match self {
            LogMap::Rw(m) => Ok(m),
            LogMap::Ro(_) => Err(WalError::ReadOnly),
        }
    }
}

struct LogInner {
    map: LogMap,
    /// Offset of the next append; starts past the reserved header on
    /// fresh files and is repositioned by replay on existing ones.
    write_at: u32,
}

/// One memory-mapped WAL file.
pub struct LogFile {
    path: PathBuf,
    fid: u32,
    inner: Mutex<LogInner>,
}

impl LogFile {
    /// Opens (or creates) the log file at `path`, mapping `size` bytes
    /// for fresh files.
    ///
    /// Returns the log plus a flag reporting whether the file was
    /// newly created. Existing files are mapped at their current
    /// length; the caller is expected to [`replay`](Self::replay) them
    /// to find the true end of data.
    pub fn open(
        path: impl AsRef<Path>,
        fid: u32,
        read_only: bool,
        create: bool,
        size: u64,
    ) -> Result<(LogFile, bool), WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create && !read_only)
            .open(&path)?;

        let is_new = file.metadata()?.len() == 0;
        if is_new {
            file.set_len(size)?;
        }

        // Safety: the mapping is private to this process and the file
        // is never truncated while mapped.
        let map = if read_only {
            LogMap::Ro(unsafe { Mmap::map(&file)? })
        } else {
            LogMap::Rw(unsafe { MmapMut::map_mut(&file)? })
        };

        debug!(
            path = %path.display(),
            fid,
            is_new,
            mapped = map.bytes().len(),
            "log file opened"
        );

        Ok((
            LogFile {
                path,
                fid,
                inner: Mutex::new(LogInner {
                    map,
                    write_at: LOG_HEADER_SIZE,
                }),
            },
            is_new,
        ))
    }

    /// File id of this log.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current append cursor.
    pub fn write_at(&self) -> u32 {
        self.lock().map(|inner| inner.write_at).unwrap_or(0)
    }

    /// Total mapped capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.lock()
            .map(|inner| inner.map.bytes().len() as u32)
            .unwrap_or(0)
    }

    /// Encodes `entry` into `buf` and appends it at the write cursor.
    ///
    /// `buf` is a reusable scratch buffer owned by the caller; it is
    /// cleared first. Returns a pointer to the appended record.
    ///
    /// Appends that would run past the mapped window are fatal: the
    /// memtable fullness policy must rotate before that can happen.
    pub fn write_entry(&self, buf: &mut Vec<u8>, entry: &Entry) -> Result<ValuePointer, WalError> {
        let record_len = encode_entry(buf, entry);

        let mut inner = self.lock()?;
        let offset = inner.write_at;
        let end = offset as usize + record_len;
        let data = inner.map.bytes_mut()?;
        assert!(
            end <= data.len(),
            "log file overflow: record of {record_len} bytes at {offset} exceeds mapped {} bytes",
            data.len()
        );
        data[offset as usize..end].copy_from_slice(buf);
        inner.write_at = end as u32;

        trace!(fid = self.fid, offset, len = record_len, "wal record appended");
        Ok(ValuePointer {
            fid: self.fid,
            len: record_len as u32,
            offset,
        })
    }

    /// Reads the raw record bytes addressed by `p`.
    ///
    /// Out-of-bounds reads yield [`WalError::Eof`].
    pub fn read(&self, p: ValuePointer) -> Result<Vec<u8>, WalError> {
        let inner = self.lock()?;
        let data = inner.map.bytes();
        let start = p.offset as usize;
        let end = start + p.len as usize;
        if start >= data.len() || end > data.len() {
            return Err(WalError::Eof);
        }
        Ok(data[start..end].to_vec())
    }

    /// Replays every valid record, invoking `apply` for each.
    ///
    /// Stops at the first truncated or checksum-failing record and
    /// positions the write cursor at the end of the last valid one
    /// (truncate-at semantics). Returns the number of records applied.
    pub fn replay(&self, mut apply: impl FnMut(Entry)) -> Result<usize, WalError> {
        let mut inner = self.lock()?;
        let data = inner.map.bytes();

        let mut offset = LOG_HEADER_SIZE as usize;
        let mut count = 0usize;
        while offset < data.len() {
            match decode_record(&data[offset..]) {
                Ok((entry, consumed)) => {
                    apply(entry);
                    offset += consumed;
                    count += 1;
                }
                // The zero-filled tail of the map, a torn write, or
                // true corruption: everything from here on is dead.
                Err(WalError::Eof | WalError::ChecksumMismatch | WalError::Codec(_)) => break,
                Err(e) => return Err(e),
            }
        }

        inner.write_at = offset as u32;
        debug!(
            fid = self.fid,
            records = count,
            write_at = offset,
            "wal replay finished"
        );
        Ok(count)
    }

    /// Flushes the mapped region to disk (msync).
    pub fn sync(&self) -> Result<(), WalError> {
        let inner = self.lock()?;
        if let LogMap::Rw(m) = &inner.map {
            m.flush()?;
        }
        Ok(())
    }

    /// Unlinks the backing file. The mapping stays valid until the
    /// log is dropped.
    pub fn delete(&self) -> Result<(), WalError> {
        debug!(path = %self.path.display(), fid = self.fid, "deleting log file");
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LogInner>, WalError> {
        self.inner
            .lock()
            .map_err(|_| WalError::Internal("log mutex poisoned".into()))
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => {
                warn!(path = %self.path.display(), "wal lock poisoned at drop");
                poisoned.into_inner()
            }
        };
        if let LogMap::Rw(m) = &inner.map {
            if let Err(e) = m.flush() {
                error!(path = %self.path.display(), error = %e, "wal flush failed on drop");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Record codec
// ------------------------------------------------------------------------------------------------

/// Encodes `entry` into `buf` (cleared first) as
/// `header ‖ key ‖ value ‖ crc32c`, returning the record length.
pub fn encode_entry(buf: &mut Vec<u8>, entry: &Entry) -> usize {
    buf.clear();
    let header = Header {
        key_len: entry.key.len() as u32,
        value_len: entry.value.len() as u32,
        expires_at: entry.expires_at,
        meta: entry.meta,
        user_meta: entry.user_meta,
    };
    header.encode_into(buf);
    buf.extend_from_slice(&entry.key);
    buf.extend_from_slice(&entry.value);
    let crc = crc32c::crc32c(buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.len()
}

/// Decodes and checksum-verifies one record from the front of `buf`.
pub fn decode_entry(buf: &[u8]) -> Result<Entry, WalError> {
    decode_record(buf).map(|(entry, _)| entry)
}

/// Decodes one record, returning it with the total bytes consumed
/// (CRC included).
fn decode_record(buf: &[u8]) -> Result<(Entry, usize), WalError> {
    let (header, header_len) = Header::decode(buf)?;

    let key_end = header_len + header.key_len as usize;
    let value_end = key_end + header.value_len as usize;
    let record_end = value_end + CRC_SIZE;
    if record_end > buf.len() {
        return Err(WalError::Eof);
    }

    let stored = u32::from_le_bytes(
        buf[value_end..record_end]
            .try_into()
            .expect("CRC slice is exactly four bytes"),
    );
    let computed = crc32c::crc32c(&buf[..value_end]);
    if computed != stored {
        return Err(WalError::ChecksumMismatch);
    }

    Ok((
        Entry {
            key: buf[header_len..key_end].to_vec(),
            value: buf[key_end..value_end].to_vec(),
            expires_at: header.expires_at,
            meta: header.meta,
            user_meta: header.user_meta,
        },
        record_end,
    ))
}
