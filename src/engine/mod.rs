//! # Storage Engine
//!
//! The engine owns the active memtable, the list of immutable
//! memtables awaiting flush, and the batched write pipeline that all
//! mutations funnel through.
//!
//! ## Write pipeline
//!
//! Producers enqueue [`Request`]s on a bounded channel and receive a
//! [`WriteRequest`] handle to await. A single writer-loop thread
//! drains bursts of requests into a batch; a capacity-1 semaphore
//! (the *pending* channel) admits at most one in-flight write task,
//! so at any moment there is one batch being written and at most one
//! being accumulated. A batch is dispatched the instant the semaphore
//! frees up — no timers — or force-dispatched once it reaches
//! 3 × the channel capacity.
//!
//! Within the pipeline, requests apply to the memtable in FIFO order
//! and entries within a request in their given order. A successful
//! `wait()` means every entry of the request is visible to subsequent
//! reads — and durable, when `sync_writes` is on.
//!
//! ## Reads
//!
//! A read snapshots the active and immutable memtables under a short
//! read lock (cloning their handles keeps them alive lock-free) and
//! walks them newest-first: an exact timestamp match returns
//! immediately, otherwise the highest-versioned value observed wins.
//!
//! ## Rotation
//!
//! The write path checks [`MemTable::is_full`] per request. A full
//! active memtable moves to the immutable list and a fresh one (next
//! file id) takes its place, which keeps the arena and the mapped WAL
//! from ever overflowing.
//!
//! ## Shutdown
//!
//! [`Engine::close`] signals the writer loop, which drains every
//! accepted request to completion before exiting. An empty active
//! memtable is dropped (removing its WAL); non-empty tables keep
//! their WAL files on disk so the next open can replay them.

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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::select;
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::codec::{parse_ts, Entry, ValueStruct};
use crate::memtable::{new_mem_table, open_mem_tables, MemTable, MemtableError};
use crate::txn::{Oracle, Txn};

/// Capacity of the write channel; producers block (backpressure) when
/// it fills.
pub const KV_WRITE_CH_CAPACITY: usize = 1000;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation attempted after [`Engine::close`].
    #[error("database closed")]
    DbClosed,

    /// Zero-length user key on a read or write.
    #[error("key cannot be empty")]
    EmptyKey,

    /// Use of a transaction handle after it was discarded.
    #[error("transaction has been discarded")]
    DiscardedTxn,

    /// Read found no live entry (absent, tombstoned, or expired).
    #[error("key not found")]
    KeyNotFound,

    /// Write attempted on a read-only store.
    #[error("database is read-only")]
    ReadOnly,

    /// Error originating from the memtable subsystem.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failure shared by every request of one write batch.
    #[error("write batch failed: {0}")]
    Batch(Arc<EngineError>),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory for WAL files. Must exist and be writable unless
    /// `in_memory`.
    pub dir: String,

    /// Fsync the active WAL at the end of every write batch.
    pub sync_writes: bool,

    /// Skip WALs entirely; the store is RAM-only and nothing survives
    /// the process.
    pub in_memory: bool,

    /// Open existing WALs read-only and reject writes.
    pub read_only: bool,

    /// Byte budget for one memtable's arena; each WAL maps twice this.
    pub memtable_size: u64,
}

impl Options {
    /// Defaults: asynchronous durability, on-disk, writable, 32 MiB
    /// memtables.
    pub fn new(dir: impl Into<String>) -> Options {
        Options {
            dir: dir.into(),
            sync_writes: false,
            in_memory: false,
            read_only: false,
            memtable_size: 32 << 20,
        }
    }

    /// Arena capacity for one skiplist.
    pub(crate) fn arena_size(&self) -> u64 {
        self.memtable_size
    }
}

// ------------------------------------------------------------------------------------------------
// Requests
// ------------------------------------------------------------------------------------------------

/// One producer submission travelling through the write channel.
struct Request {
    entries: Vec<Entry>,
    /// Signaled exactly once when the containing batch completes.
    done: Sender<Result<(), Arc<EngineError>>>,
}

/// Caller-side completion handle for a submitted write.
pub struct WriteRequest {
    done: Receiver<Result<(), Arc<EngineError>>>,
}

impl WriteRequest {
    /// Blocks until the writer loop has applied (or failed) the batch
    /// containing this request.
    pub fn wait(&self) -> Result<(), EngineError> {
        match self.done.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::Batch(e)),
            // Writer gone without signaling: only happens on shutdown.
            Err(_) => Err(EngineError::DbClosed),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// Memtables guarded by the engine's readers-writer lock.
struct Tables {
    /// Current mutable memtable; `None` when read-only.
    mt: Option<Arc<MemTable>>,
    /// Immutable memtables, oldest first. Reads walk them newest
    /// first.
    imm: Vec<Arc<MemTable>>,
    /// Next WAL file id; monotonic, persisted implicitly by file
    /// names.
    next_mem_fid: u32,
}

struct EngineInner {
    opts: Options,
    tables: RwLock<Tables>,
    oracle: Oracle,
    write_tx: Sender<Request>,
    shutdown_tx: Sender<()>,
    is_closed: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// The storage engine handle.
///
/// Cheap to clone and share across threads. [`Engine::close`] must be
/// called for a graceful shutdown; without it the writer thread stays
/// parked on its channel.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Engine {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine {
    /// Opens a store rooted at `opts.dir`: recovers existing WALs into
    /// immutable memtables, creates the active memtable (unless
    /// read-only), and starts the writer loop.
    pub fn open(opts: Options) -> Result<Engine, EngineError> {
        if !opts.in_memory {
            let meta = fs::metadata(&opts.dir)?;
            if !meta.is_dir() {
                return Err(EngineError::Internal(format!(
                    "{} is not a directory",
                    opts.dir
                )));
            }
        }

        let (recovered, mut next_mem_fid) = open_mem_tables(&opts)?;
        let imm: Vec<Arc<MemTable>> = recovered.into_iter().map(Arc::new).collect();

        let mt = if opts.read_only {
            None
        } else {
            let mt = Arc::new(new_mem_table(&opts, next_mem_fid)?);
            next_mem_fid += 1;
            Some(mt)
        };

        let (write_tx, write_rx) = bounded(KV_WRITE_CH_CAPACITY);
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let inner = Arc::new(EngineInner {
            opts,
            tables: RwLock::new(Tables {
                mt,
                imm,
                next_mem_fid,
            }),
            oracle: Oracle::default(),
            write_tx,
            shutdown_tx,
            is_closed: AtomicBool::new(false),
            writer: Mutex::new(None),
        });

        let handle = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("tenaxdb-writer".into())
                .spawn(move || do_writes(inner, write_rx, shutdown_rx))?
        };
        *inner
            .writer
            .lock()
            .map_err(|_| EngineError::Internal("writer handle mutex poisoned".into()))? =
            Some(handle);

        info!(
            dir = %inner.opts.dir,
            imm = inner
                .tables
                .read()
                .map(|t| t.imm.len())
                .unwrap_or(0),
            read_only = inner.opts.read_only,
            in_memory = inner.opts.in_memory,
            "engine opened"
        );
        Ok(Engine { inner })
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::SeqCst)
    }

    /// Starts a transaction against this engine.
    pub fn new_transaction(&self) -> Txn {
        Txn::new(self.clone(), self.inner.oracle.read_ts())
    }

    /// The engine's timestamp oracle.
    pub(crate) fn oracle(&self) -> &Oracle {
        &self.inner.oracle
    }

    /// Submits `entries` to the write pipeline, returning a handle to
    /// await their application.
    ///
    /// Blocks while the write channel is full (backpressure).
    pub fn send_to_write_ch(&self, entries: Vec<Entry>) -> Result<WriteRequest, EngineError> {
        if self.is_closed() {
            return Err(EngineError::DbClosed);
        }
        if self.inner.opts.read_only {
            return Err(EngineError::ReadOnly);
        }

        let (done_tx, done_rx) = bounded(1);
        trace!(entries = entries.len(), "enqueueing write request");
        self.inner
            .write_tx
            .send(Request {
                entries,
                done: done_tx,
            })
            .map_err(|_| EngineError::DbClosed)?;
        Ok(WriteRequest { done: done_rx })
    }

    /// Looks up a composite key across the active and immutable
    /// memtables, newest first.
    ///
    /// Returns the value whose version equals the key's timestamp if
    /// one exists, otherwise the highest-versioned value observed —
    /// possibly the empty value when no table holds the key at all.
    pub(crate) fn get(&self, key: &[u8]) -> Result<ValueStruct, EngineError> {
        if self.is_closed() {
            return Err(EngineError::DbClosed);
        }

        let tables = self.memtable_snapshot()?;
        let version = parse_ts(key);
        let mut max_vs = ValueStruct::default();
        for table in &tables {
            let vs = table.skl().get(key);
            if vs.is_empty() {
                continue;
            }
            if vs.version == version {
                return Ok(vs);
            }
            if vs.version > max_vs.version {
                max_vs = vs;
            }
        }
        // A persistent-level fallback would go here; within the core
        // the memtables are the whole store.
        Ok(max_vs)
    }

    /// Gracefully shuts down: drains accepted writes, stops the writer
    /// loop, and releases the memtables. WAL files holding unflushed
    /// data stay on disk for the next open.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::DbClosed);
        }

        // Wake the writer loop; it drains the channel before exiting.
        let _ = self.inner.shutdown_tx.send(());
        let handle = self
            .inner
            .writer
            .lock()
            .map_err(|_| EngineError::Internal("writer handle mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| EngineError::Internal("writer thread panicked".into()))?;
        }

        let mut tables = self
            .inner
            .tables
            .write()
            .map_err(|_| EngineError::Internal("table lock poisoned".into()))?;
        if let Some(mt) = tables.mt.take() {
            if mt.skl().is_empty() {
                // Nothing in it: dropping removes the WAL file.
                drop(mt);
            } else {
                // Unflushed entries must survive for the next replay.
                mt.preserve_wal();
            }
        }
        for imm in tables.imm.drain(..) {
            imm.preserve_wal();
        }

        info!(dir = %self.inner.opts.dir, "engine closed");
        Ok(())
    }

    /// Snapshots the memtables newest-first; the cloned handles keep
    /// them alive after the lock is released.
    fn memtable_snapshot(&self) -> Result<Vec<Arc<MemTable>>, EngineError> {
        let tables = self
            .inner
            .tables
            .read()
            .map_err(|_| EngineError::Internal("table lock poisoned".into()))?;
        let mut out = Vec::with_capacity(1 + tables.imm.len());
        if let Some(mt) = &tables.mt {
            out.push(Arc::clone(mt));
        }
        for imm in tables.imm.iter().rev() {
            out.push(Arc::clone(imm));
        }
        Ok(out)
    }
}

// ------------------------------------------------------------------------------------------------
// Writer loop
// ------------------------------------------------------------------------------------------------

/// The single batching serializer. Runs on its own thread from open
/// to close; spawns one background task per dispatched batch, with at
/// most one in flight at a time.
fn do_writes(inner: Arc<EngineInner>, write_rx: Receiver<Request>, shutdown_rx: Receiver<()>) {
    // Capacity-1 semaphore: holding the slot means a batch is being
    // written. `send` acquires, `recv` releases.
    let (pending_tx, pending_rx) = bounded::<()>(1);

    let mut reqs: Vec<Request> = Vec::with_capacity(10);
    let mut shutdown = false;

    while !shutdown {
        // Block for the first request of the next batch.
        select! {
            recv(write_rx) -> msg => match msg {
                Ok(r) => reqs.push(r),
                Err(_) => shutdown = true,
            },
            recv(shutdown_rx) -> _ => shutdown = true,
        }
        if shutdown {
            break;
        }

        // Accumulate until the pending slot frees up, then hand off.
        loop {
            if reqs.len() >= 3 * KV_WRITE_CH_CAPACITY {
                // Runaway batch: block for the slot, then flush.
                let _ = pending_tx.send(());
                dispatch(&inner, &pending_rx, &mut reqs);
                break;
            }

            select! {
                recv(write_rx) -> msg => match msg {
                    Ok(r) => reqs.push(r),
                    Err(_) => { shutdown = true; break; }
                },
                send(pending_tx, ()) -> _ => {
                    dispatch(&inner, &pending_rx, &mut reqs);
                    break;
                },
                recv(shutdown_rx) -> _ => { shutdown = true; break; }
            }
        }
    }

    // Drain path: pick up whatever is still queued, wait for the
    // running batch, then write the remainder synchronously.
    while let Ok(r) = write_rx.try_recv() {
        reqs.push(r);
    }
    let _ = pending_tx.send(());
    write_requests(&inner, std::mem::take(&mut reqs));
    let _ = pending_rx.recv();
    debug!("writer loop exited");
}

/// Hands the accumulated batch to a background task; the pending slot
/// (already held by the caller) is released when it finishes.
fn dispatch(inner: &Arc<EngineInner>, pending_rx: &Receiver<()>, reqs: &mut Vec<Request>) {
    let batch = std::mem::take(reqs);
    let inner = Arc::clone(inner);
    let pending_rx = pending_rx.clone();
    thread::spawn(move || {
        write_requests(&inner, batch);
        let _ = pending_rx.recv();
    });
}

/// Applies a batch and signals every request exactly once. Errors are
/// batch-granular: one failure marks all requests in the batch.
fn write_requests(inner: &Arc<EngineInner>, reqs: Vec<Request>) {
    if reqs.is_empty() {
        return;
    }
    debug!(requests = reqs.len(), "writing batch");

    match apply_requests(inner, &reqs) {
        Ok(entries) => {
            for req in &reqs {
                let _ = req.done.send(Ok(()));
            }
            debug!(entries, "batch written");
        }
        Err(e) => {
            error!(error = %e, "write batch failed");
            let shared = Arc::new(e);
            for req in &reqs {
                let _ = req.done.send(Err(Arc::clone(&shared)));
            }
        }
    }
}

/// Serially applies every entry of every request to the active
/// memtable, rotating when it fills. Returns the entry count.
fn apply_requests(inner: &Arc<EngineInner>, reqs: &[Request]) -> Result<usize, EngineError> {
    let mut count = 0usize;
    for req in reqs {
        if req.entries.is_empty() {
            continue;
        }
        ensure_room(inner)?;
        let mt = active_memtable(inner)?;
        for entry in &req.entries {
            let vs = ValueStruct {
                meta: entry.meta,
                user_meta: entry.user_meta,
                expires_at: entry.expires_at,
                value: entry.value.clone(),
                version: 0,
            };
            mt.put(&entry.key, &vs)?;
            count += 1;
        }
    }

    if inner.opts.sync_writes {
        active_memtable(inner)?.sync_wal()?;
    }
    Ok(count)
}

/// Clones the active memtable handle under a short read lock.
fn active_memtable(inner: &EngineInner) -> Result<Arc<MemTable>, EngineError> {
    let tables = inner
        .tables
        .read()
        .map_err(|_| EngineError::Internal("table lock poisoned".into()))?;
    tables
        .mt
        .as_ref()
        .map(Arc::clone)
        .ok_or(EngineError::ReadOnly)
}

/// Rotates the active memtable if it is full: the old table joins the
/// immutable list, a fresh one (next file id) becomes active.
fn ensure_room(inner: &EngineInner) -> Result<(), EngineError> {
    if !active_memtable(inner)?.is_full() {
        return Ok(());
    }

    let mut tables = inner
        .tables
        .write()
        .map_err(|_| EngineError::Internal("table lock poisoned".into()))?;
    let Some(current) = &tables.mt else {
        return Err(EngineError::ReadOnly);
    };
    // The writer loop is the only rotator, but re-check under the
    // write lock anyway.
    if !current.is_full() {
        return Ok(());
    }

    let fid = tables.next_mem_fid;
    let fresh = Arc::new(new_mem_table(&inner.opts, fid)?);
    tables.next_mem_fid += 1;
    let old = tables.mt.replace(fresh);
    if let Some(old) = old {
        if inner.opts.sync_writes {
            // The retiring WAL gets its final sync now; batch-end
            // syncs only cover the active table.
            old.sync_wal()?;
        }
        tables.imm.push(old);
    }
    info!(
        fid,
        imm = tables.imm.len(),
        "memtable rotated"
    );
    Ok(())
}
