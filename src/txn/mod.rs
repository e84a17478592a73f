//! Transaction façade over the engine.
//!
//! A [`Txn`] buffers writes in a read-your-writes cache and funnels
//! them through the engine's write pipeline on commit. The [`Oracle`]
//! — timestamp assignment and conflict detection — is a stub: every
//! transaction reads and commits at timestamp 0, so the multi-version
//! machinery underneath is exercised with a single version per key.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use tracing::trace;

use crate::codec::{is_deleted_or_expired, key_with_ts, Entry, BIT_DELETE};
use crate::engine::{Engine, EngineError};

// ------------------------------------------------------------------------------------------------
// Oracle (stub)
// ------------------------------------------------------------------------------------------------

/// Timestamp manager and conflict detector for transactions.
///
/// Stubbed: hands out timestamp 0 for both reads and commits.
#[derive(Debug, Default)]
pub struct Oracle {}

impl Oracle {
    /// Read timestamp for a new transaction.
    pub fn read_ts(&self) -> u64 {
        0
    }

    /// Commit timestamp for a finalizing transaction.
    pub fn commit_ts(&self) -> u64 {
        0
    }
}

// ------------------------------------------------------------------------------------------------
// Item
// ------------------------------------------------------------------------------------------------

/// A key-value pair surfaced by [`Txn::get`].
#[derive(Debug, Clone)]
pub struct Item {
    key: Vec<u8>,
    value: Vec<u8>,
    user_meta: u8,
    version: u64,
    expires_at: u64,
}

impl Item {
    /// The user key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The stored value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Application meta byte stored with the entry.
    pub fn user_meta(&self) -> u8 {
        self.user_meta
    }

    /// Timestamp of the version read.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Expiry in unix seconds; 0 means none.
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }
}

// ------------------------------------------------------------------------------------------------
// Txn
// ------------------------------------------------------------------------------------------------

/// A transaction handle.
///
/// Writes stay in the pending cache until [`commit`](Txn::commit);
/// reads see the cache first, then the store at the transaction's
/// read timestamp.
pub struct Txn {
    engine: Engine,
    /// Uncommitted writes, keyed by user key.
    pending_writes: HashMap<Vec<u8>, Entry>,
    read_ts: u64,
    discarded: bool,
}

impl Txn {
    pub(crate) fn new(engine: Engine, read_ts: u64) -> Txn {
        Txn {
            engine,
            pending_writes: HashMap::new(),
            read_ts,
            discarded: false,
        }
    }

    /// Buffers a plain put of `key` → `value`.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        self.set_entry(Entry::new(key, value))
    }

    /// Buffers a tombstone for `key`.
    pub fn delete(&mut self, key: Vec<u8>) -> Result<(), EngineError> {
        self.set_entry(Entry::new(key, Vec::new()).with_meta(BIT_DELETE))
    }

    /// Buffers a fully-specified entry.
    pub fn set_entry(&mut self, entry: Entry) -> Result<(), EngineError> {
        self.modify(entry)
    }

    /// Reads `key`, preferring this transaction's own pending writes.
    ///
    /// Absent, tombstoned, and expired entries all surface as
    /// [`EngineError::KeyNotFound`].
    pub fn get(&self, key: &[u8]) -> Result<Item, EngineError> {
        if key.is_empty() {
            return Err(EngineError::EmptyKey);
        }
        if self.discarded {
            return Err(EngineError::DiscardedTxn);
        }

        if let Some(entry) = self.pending_writes.get(key) {
            if is_deleted_or_expired(entry.meta, entry.expires_at) {
                return Err(EngineError::KeyNotFound);
            }
            return Ok(Item {
                key: key.to_vec(),
                value: entry.value.clone(),
                user_meta: entry.user_meta,
                version: self.read_ts,
                expires_at: entry.expires_at,
            });
        }

        let seek = key_with_ts(key, self.read_ts);
        let vs = self.engine.get(&seek)?;
        if vs.is_empty() {
            return Err(EngineError::KeyNotFound);
        }
        if is_deleted_or_expired(vs.meta, vs.expires_at) {
            return Err(EngineError::KeyNotFound);
        }

        Ok(Item {
            key: key.to_vec(),
            value: vs.value,
            user_meta: vs.user_meta,
            version: vs.version,
            expires_at: vs.expires_at,
        })
    }

    /// Sends the pending writes through the write pipeline and waits
    /// for them to become visible (and durable under `sync_writes`).
    ///
    /// The transaction is discarded either way; an empty transaction
    /// commits trivially.
    pub fn commit(&mut self) -> Result<(), EngineError> {
        if self.discarded {
            return Err(EngineError::DiscardedTxn);
        }
        if self.pending_writes.is_empty() {
            self.discard();
            return Ok(());
        }

        let commit_ts = self.engine_oracle_commit_ts();
        let entries: Vec<Entry> = self
            .pending_writes
            .drain()
            .map(|(_, mut entry)| {
                entry.key = key_with_ts(&entry.key, commit_ts);
                entry
            })
            .collect();

        trace!(entries = entries.len(), commit_ts, "committing transaction");
        let req = self.engine.send_to_write_ch(entries);
        self.discard();
        req?.wait()
    }

    /// Finalizes the handle; every later operation fails with
    /// [`EngineError::DiscardedTxn`]. Idempotent.
    pub fn discard(&mut self) {
        if self.discarded {
            return;
        }
        self.discarded = true;
        self.pending_writes.clear();
    }

    fn modify(&mut self, entry: Entry) -> Result<(), EngineError> {
        if entry.key.is_empty() {
            return Err(EngineError::EmptyKey);
        }
        if self.discarded {
            return Err(EngineError::DiscardedTxn);
        }
        self.pending_writes.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn engine_oracle_commit_ts(&self) -> u64 {
        // Routed through the engine's oracle; a real oracle would
        // allocate a fresh timestamp and run conflict detection here.
        self.engine.oracle().commit_ts()
    }
}
