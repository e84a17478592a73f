//! # TenaxDB
//!
//! An embeddable, **write-optimized** key-value storage core in the
//! LSM-tree family. The crate implements the in-memory write path and
//! crash-recovery foundation of such a store: an arena-backed lock-free
//! skiplist, memtables paired with memory-mapped write-ahead logs, and a
//! batched single-writer pipeline that amortizes durability cost across
//! concurrent producers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       Engine                           │
//! │                                                        │
//! │  producers ──► write channel ──► writer loop ──┐       │
//! │                 (bounded, FIFO)   (batching)   │       │
//! │                                                ▼       │
//! │  ┌─────────────┐   rotate   ┌───────────────────────┐  │
//! │  │   Active    │ ─────────► │  Immutable memtables  │  │
//! │  │  Memtable   │            │  (read-only, newest   │  │
//! │  │ skl + WAL   │            │   first on reads)     │  │
//! │  └─────────────┘            └───────────────────────┘  │
//! │        ▲                                               │
//! │        │ WAL replay on open                            │
//! │  ┌─────┴──────────────────────────────┐                │
//! │  │  00001.mem  00002.mem  ...  (mmap) │                │
//! │  └────────────────────────────────────┘                │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Engine handle — open, batched writes, versioned reads, close |
//! | [`memtable`] | Skiplist + WAL pairing, recovery, rotation policy |
//! | [`skiplist`] | Arena-backed lock-free concurrent skiplist |
//! | [`wal`] | Memory-mapped, CRC-protected write-ahead log |
//! | [`codec`] | Entry/value wire format and timestamped composite keys |
//! | [`txn`] | Transaction façade over the engine (stub oracle) |
//!
//! ## Key properties
//!
//! - **Lock-free reads** — readers traverse the skiplist concurrently
//!   with the single writer thread, guarded only by reference counts
//!   and atomic loads.
//! - **Write-ahead logging** — every mutation lands in a memory-mapped
//!   WAL before the skiplist, so a crash replays back to the last
//!   fully-written record.
//! - **Batch coalescing** — all writers funnel through one serializer
//!   that drains request bursts and issues at most one in-flight flush,
//!   bounding tail latency without timers.
//! - **Multi-version keys** — every key carries an 8-byte timestamp
//!   suffix; reads resolve an exact version or fall back to the newest
//!   one observed.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tenaxdb::engine::{Engine, Options};
//!
//! let engine = Engine::open(Options::new("/tmp/my_db")).unwrap();
//!
//! let mut txn = engine.new_transaction();
//! txn.set(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! txn.commit().unwrap();
//!
//! let txn = engine.new_transaction();
//! let item = txn.get(b"hello").unwrap();
//! assert_eq!(item.value(), b"world");
//!
//! engine.close().unwrap();
//! ```

pub mod codec;
pub mod engine;
pub mod memtable;
pub mod skiplist;
pub mod txn;
pub mod wal;

pub use engine::{Engine, EngineError, Options};
pub use txn::Txn;
