//! Arena-backed, lock-free concurrent skiplist.
//!
//! The skiplist is the sorted index inside every memtable. It maps
//! timestamped composite keys to encoded values, both stored in a
//! bump-allocated [`arena`](self::arena) and addressed by `u32`
//! offsets instead of pointers.
//!
//! ## Design Invariants
//!
//! - Level 0 links every node in ascending [`compare_keys`] order;
//!   each higher level is a subsequence of the level below.
//! - All next-pointer mutations go through per-slot CAS, making level 0
//!   a lock-free linked list. Upper levels are best-effort shortcuts:
//!   a stale upper pointer still lands a reader at or before the true
//!   position, and the descent corrects it.
//! - A node's value is a packed 64-bit atomic `(offset, size)` pair;
//!   readers observe the old value or the new one, never a mix.
//! - The list height only grows, never past [`MAX_HEIGHT`]; it is
//!   always ≥ 1 and ≤ the tallest node present.
//! - Equal-key puts (byte-for-byte, timestamp included) replace the
//!   value in place; they never add a node.
//!
//! ## Concurrency
//!
//! Readers share the list freely with the single logical writer — and
//! with each other — without locks. The structure also tolerates
//! concurrent writers (every splice is CAS-with-retry), which the
//! engine relies on only in tests; production writes are serialized by
//! the write pipeline.
//!
//! ## Lifetime
//!
//! A [`Skiplist`] handle is a cheap clone of a shared reference. When
//! the last handle drops, the registered `on_close` callback fires
//! (the memtable uses it to delete the paired WAL) and then the arena
//! is released. Iterators hold their own handle, so an iterator may
//! outlive the memtable that created it.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

mod arena;

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::{compare_keys, parse_ts, ValueStruct};

use arena::{encode_value, Arena, Node};

pub use arena::{MAX_HEIGHT, MAX_NODE_SIZE};

/// Probability threshold for growing a tower by one level: a draw at
/// or below `u32::MAX / 3` continues, giving expected fanout 3.
const HEIGHT_INCREASE: u32 = u32::MAX / 3;

// ------------------------------------------------------------------------------------------------
// Skiplist
// ------------------------------------------------------------------------------------------------

/// Shared handle to a concurrent skiplist.
///
/// Cloning increments the reference count; dropping the last clone
/// runs the `on_close` callback and frees the arena.
pub struct Skiplist {
    inner: Arc<SkiplistInner>,
}

struct SkiplistInner {
    /// Current list height; loads race benignly with raises.
    height: AtomicU32,
    /// Offset of the full-height head sentinel (no key, no value).
    head_offset: u32,
    arena: Arena,
    /// Fired exactly once, by whichever thread drops the last handle,
    /// before the arena is reclaimed.
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Clone for Skiplist {
    fn clone(&self) -> Self {
        Skiplist {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for SkiplistInner {
    fn drop(&mut self) {
        let callback = self
            .on_close
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(f) = callback {
            f();
        }
        // The arena drops after this body, so the callback may still
        // observe list contents if it wants to.
    }
}

impl Skiplist {
    /// Creates an empty skiplist with an arena of `arena_size` bytes.
    pub fn new(arena_size: u64) -> Skiplist {
        let arena = Arena::new(arena_size);
        // Head sentinel: full height, empty key, empty value.
        let head_offset = arena.put_node(MAX_HEIGHT);
        let head = arena.node_mut(head_offset);
        unsafe {
            (*head).height = MAX_HEIGHT as u16;
        }
        Skiplist {
            inner: Arc::new(SkiplistInner {
                height: AtomicU32::new(1),
                head_offset,
                arena,
                on_close: Mutex::new(None),
            }),
        }
    }

    /// Registers the callback to run when the last handle drops,
    /// replacing any previous one.
    pub fn set_on_close(&self, f: impl FnOnce() + Send + 'static) {
        *self
            .inner
            .on_close
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Box::new(f));
    }

    /// Removes the `on_close` callback without running it.
    ///
    /// The memtable uses this to keep its WAL file on disk when the
    /// data it holds has not been flushed yet.
    pub(crate) fn take_on_close(&self) {
        self.inner
            .on_close
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    /// Upserts `key`. An existing node with the exact composite key
    /// gets its value replaced atomically; otherwise a new node is
    /// spliced in at a randomized height.
    pub fn put(&self, key: &[u8], value: &ValueStruct) {
        let inner = &*self.inner;
        let mut list_height = inner.height();
        let mut prev = [0u32; MAX_HEIGHT + 1];
        let mut next = [0u32; MAX_HEIGHT + 1];
        prev[list_height] = inner.head_offset;

        // Top-down: find the splice at every level, stopping early on
        // an exact key match.
        for i in (0..list_height).rev() {
            let (p, n) = inner.find_splice_for_level(key, prev[i + 1], i);
            prev[i] = p;
            next[i] = n;
            if p == n {
                inner.node_at(p).set_value(&inner.arena, value);
                return;
            }
        }

        let height = random_height();
        let x_offset = inner.new_node(key, value, height);

        // Raise the list height to cover the new tower.
        list_height = inner.height();
        while height > list_height {
            match inner.height.compare_exchange(
                list_height as u32,
                height as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => list_height = current as usize,
            }
        }

        let x = inner.node_at(x_offset);
        for i in 0..height {
            loop {
                if prev[i] == 0 {
                    // The new height outgrew the splice arrays; search
                    // from the head at this level.
                    assert!(i > 1, "level 0 and 1 splices are always computed");
                    let (p, n) = inner.find_splice_for_level(key, inner.head_offset, i);
                    prev[i] = p;
                    next[i] = n;
                    assert_ne!(p, n, "duplicate key cannot appear above the base level");
                }

                // Link prev[i] -> x -> next[i]. The new node's forward
                // pointer is not yet visible, so a plain store is
                // enough; the CAS below publishes it with release
                // semantics.
                x.tower[i].store(next[i], Ordering::Relaxed);
                if inner.node_at(prev[i]).cas_next_offset(i, next[i], x_offset) {
                    break;
                }

                // CAS lost: somebody spliced here first. Recompute from
                // the last known prev and retry.
                let (p, n) = inner.find_splice_for_level(key, prev[i], i);
                prev[i] = p;
                next[i] = n;
                if p == n {
                    assert_eq!(i, 0, "equality can happen only on the base level");
                    inner.node_at(p).set_value(&inner.arena, value);
                    return;
                }
            }
        }
    }

    /// Exact-match lookup. Returns the empty value when no node holds
    /// this composite key; otherwise the stored value with `version`
    /// filled from the key's timestamp.
    pub fn get(&self, key: &[u8]) -> ValueStruct {
        let inner = &*self.inner;
        match inner.find_near(key, false, true) {
            (Some(node), true) => {
                let mut vs = node.value_struct(&inner.arena);
                vs.version = parse_ts(node.key(&inner.arena));
                vs
            }
            _ => ValueStruct::default(),
        }
    }

    /// True iff no nodes exist besides the head sentinel.
    pub fn is_empty(&self) -> bool {
        self.inner.find_last().is_none()
    }

    /// Bytes consumed in the arena so far. Drives the memtable
    /// fullness policy.
    pub fn arena_size(&self) -> u32 {
        self.inner.arena.size()
    }

    /// Creates an iterator holding its own list handle.
    pub fn iter(&self) -> SkiplistIterator {
        SkiplistIterator {
            skl: self.clone(),
            node: 0,
        }
    }
}

/// Geometric height draw: start at 1, grow while a cheap random u32
/// lands in the lower third, cap at [`MAX_HEIGHT`].
fn random_height() -> usize {
    let mut h = 1;
    while h < MAX_HEIGHT && rand::random::<u32>() <= HEIGHT_INCREASE {
        h += 1;
    }
    h
}

// ------------------------------------------------------------------------------------------------
// Search internals
// ------------------------------------------------------------------------------------------------

impl SkiplistInner {
    fn height(&self) -> usize {
        self.height.load(Ordering::SeqCst) as usize
    }

    /// Resolves a known-live node offset.
    fn node_at(&self, offset: u32) -> &Node {
        self.arena
            .node(offset)
            .expect("offset points at a live node")
    }

    /// Follows the tower link of `node` at `level`.
    fn next(&self, node: &Node, level: usize) -> Option<&Node> {
        self.arena.node(node.next_offset(level))
    }

    /// Allocates and initializes an unlinked node, returning its
    /// offset. The node becomes visible to readers only once a CAS
    /// links it at level 0.
    fn new_node(&self, key: &[u8], value: &ValueStruct, height: usize) -> u32 {
        let node_offset = self.arena.put_node(height);
        let key_offset = self.arena.put_key(key);
        let value_offset = self.arena.put_value(value);
        let node = self.arena.node_mut(node_offset);
        // Safety: the node is freshly allocated and unpublished; no
        // other thread can hold a reference to it yet.
        unsafe {
            (*node).key_offset = key_offset;
            (*node).key_size = key.len() as u16;
            (*node).height = height as u16;
            (*node).value = AtomicU64::new(encode_value(value_offset, value.encoded_size()));
        }
        node_offset
    }

    /// Walks forward at `level` from the node at offset `before` until
    /// the next node's key is ≥ `key`.
    ///
    /// Returns `(prev, next)` offsets; `(n, n)` signals an exact key
    /// match at `n`, and `next == 0` means `prev` is the last node on
    /// this level.
    fn find_splice_for_level(&self, key: &[u8], mut before: u32, level: usize) -> (u32, u32) {
        loop {
            let before_node = self.node_at(before);
            let next_offset = before_node.next_offset(level);
            let Some(next_node) = self.arena.node(next_offset) else {
                return (before, 0);
            };
            match compare_keys(key, next_node.key(&self.arena)) {
                CmpOrdering::Equal => return (next_offset, next_offset),
                CmpOrdering::Less => return (before, next_offset),
                CmpOrdering::Greater => before = next_offset,
            }
        }
    }

    /// Finds the node nearest to `key`:
    ///
    /// - `less=false, allow_equal=false` → first node `>` key
    /// - `less=false, allow_equal=true`  → first node `≥` key
    /// - `less=true,  allow_equal=false` → last node `<` key
    /// - `less=true,  allow_equal=true`  → last node `≤` key
    ///
    /// The bool reports an exact match. Runs in O(log n).
    fn find_near(&self, key: &[u8], less: bool, allow_equal: bool) -> (Option<&Node>, bool) {
        let mut x = self.node_at(self.head_offset);
        let mut level = self.height() - 1;
        loop {
            let Some(next) = self.next(x, level) else {
                // Nothing further on this level.
                if level > 0 {
                    level -= 1;
                    continue;
                }
                if !less {
                    return (None, false);
                }
                // x precedes key; it answers "<" unless it is the head.
                if std::ptr::eq(x, self.node_at(self.head_offset)) {
                    return (None, false);
                }
                return (Some(x), false);
            };

            match compare_keys(key, next.key(&self.arena)) {
                CmpOrdering::Greater => {
                    // key > next: keep moving right on this level.
                    x = next;
                }
                CmpOrdering::Equal => {
                    if allow_equal {
                        return (Some(next), true);
                    }
                    if !less {
                        // Strictly greater: step past the match at the
                        // base level.
                        return (self.next(next, 0), false);
                    }
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if std::ptr::eq(x, self.node_at(self.head_offset)) {
                        return (None, false);
                    }
                    return (Some(x), false);
                }
                CmpOrdering::Less => {
                    // key < next: descend, or answer at the base level.
                    if level > 0 {
                        level -= 1;
                        continue;
                    }
                    if !less {
                        return (Some(next), false);
                    }
                    if std::ptr::eq(x, self.node_at(self.head_offset)) {
                        return (None, false);
                    }
                    return (Some(x), false);
                }
            }
        }
    }

    /// Last node on the base level, or `None` for an empty list.
    fn find_last(&self) -> Option<&Node> {
        let mut x = self.node_at(self.head_offset);
        let mut level = self.height() - 1;
        loop {
            if let Some(next) = self.next(x, level) {
                x = next;
                continue;
            }
            if level == 0 {
                if std::ptr::eq(x, self.node_at(self.head_offset)) {
                    return None;
                }
                return Some(x);
            }
            level -= 1;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Bidirectional cursor over the skiplist in key order.
///
/// Holds its own [`Skiplist`] handle, keeping the arena alive for as
/// long as the iterator exists.
pub struct SkiplistIterator {
    skl: Skiplist,
    /// Offset of the current node; 0 = not positioned.
    node: u32,
}

impl SkiplistIterator {
    /// Whether the cursor is positioned on a node.
    pub fn valid(&self) -> bool {
        self.node != 0
    }

    /// Key of the current node. Panics if the cursor is not valid.
    pub fn key(&self) -> &[u8] {
        assert!(self.valid());
        let inner = &*self.skl.inner;
        inner.node_at(self.node).key(&inner.arena)
    }

    /// Value of the current node, with `version` filled from the key.
    /// Panics if the cursor is not valid.
    pub fn value(&self) -> ValueStruct {
        assert!(self.valid());
        let inner = &*self.skl.inner;
        let node = inner.node_at(self.node);
        let mut vs = node.value_struct(&inner.arena);
        vs.version = parse_ts(node.key(&inner.arena));
        vs
    }

    /// Advances to the next node in key order.
    pub fn next(&mut self) {
        assert!(self.valid());
        let inner = &*self.skl.inner;
        self.node = inner.node_at(self.node).next_offset(0);
    }

    /// Steps back to the previous node in key order.
    pub fn prev(&mut self) {
        assert!(self.valid());
        let inner = &*self.skl.inner;
        let key = inner.node_at(self.node).key(&inner.arena);
        let (node, _) = inner.find_near(key, true, false);
        self.node = inner.arena.node_offset(node);
    }

    /// Positions on the first node with key ≥ `key`, if any.
    pub fn seek(&mut self, key: &[u8]) {
        let inner = &*self.skl.inner;
        let (node, _) = inner.find_near(key, false, true);
        self.node = inner.arena.node_offset(node);
    }

    /// Positions on the smallest key in the list.
    pub fn seek_to_first(&mut self) {
        let inner = &*self.skl.inner;
        self.node = inner.node_at(inner.head_offset).next_offset(0);
    }

    /// Positions on the largest key in the list.
    pub fn seek_to_last(&mut self) {
        let inner = &*self.skl.inner;
        let node = inner.find_last();
        self.node = inner.arena.node_offset(node);
    }
}
