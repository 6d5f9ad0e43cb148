//! # Transaction Pool
//!
//! Fixed-capacity allocator of one-byte transaction ids with O(1) allocate
//! and release. Ids live on one of two circular doubly-linked lists threaded
//! through index arrays:
//!
//! ```text
//!   AVAILABLE(0) ⇄ a ⇄ b ⇄ … ⇄ AVAILABLE      allocate: pop head
//!   BUSY(255)    ⇄ x ⇄ y ⇄ … ⇄ BUSY           release: unlink, push tail
//! ```
//!
//! Ids 0 and 255 are the list heads and never handed out, leaving 254 usable
//! ids. Released ids go to the tail of the available list so a just-freed id
//! is the last to be reused.

use thiserror::Error;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Head of the available list.
const AVAILABLE: u8 = 0;

/// Head of the busy list.
const BUSY: u8 = 255;

/// Number of assignable transaction ids.
pub const CAPACITY: usize = 254;

/// Returned by [`TransactionPool::allocate`] when every id is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transaction id available")]
pub struct Exhausted;

// ─── TransactionPool ─────────────────────────────────────────────────────────

/// Partition of ids `1..=254` into available and busy lists.
#[derive(Clone)]
pub struct TransactionPool {
    next: [u8; 256],
    prev: [u8; 256],
    busy: [bool; 256],
    busy_count: usize,
}

impl TransactionPool {
    /// Create a pool with every id available, in ascending order.
    pub fn new() -> Self {
        let mut next = [0u8; 256];
        let mut prev = [0u8; 256];

        prev[AVAILABLE as usize] = 254;
        for i in 0..254usize {
            next[i] = (i + 1) as u8;
            prev[i + 1] = i as u8;
        }
        next[254] = AVAILABLE;
        prev[BUSY as usize] = BUSY;
        next[BUSY as usize] = BUSY;

        TransactionPool {
            next,
            prev,
            busy: [false; 256],
            busy_count: 0,
        }
    }

    /// The id the next [`allocate`](Self::allocate) would return.
    pub fn peek(&self) -> Option<u8> {
        match self.next[AVAILABLE as usize] {
            AVAILABLE => None,
            id => Some(id),
        }
    }

    /// Move the head of the available list onto the busy list.
    pub fn allocate(&mut self) -> Result<u8, Exhausted> {
        let id = self.peek().ok_or(Exhausted)?;
        self.unlink(id);
        self.push_front(BUSY, id);
        self.busy[id as usize] = true;
        self.busy_count += 1;
        Ok(id)
    }

    /// Return a busy id to the tail of the available list.
    ///
    /// Returns `false` and leaves the pool untouched if `id` is not busy.
    pub fn release(&mut self, id: u8) -> bool {
        if !self.is_busy(id) {
            return false;
        }
        self.unlink(id);
        self.push_back(AVAILABLE, id);
        self.busy[id as usize] = false;
        self.busy_count -= 1;
        true
    }

    pub fn is_busy(&self, id: u8) -> bool {
        id != AVAILABLE && id != BUSY && self.busy[id as usize]
    }

    pub fn busy_len(&self) -> usize {
        self.busy_count
    }

    pub fn available_len(&self) -> usize {
        CAPACITY - self.busy_count
    }

    pub fn is_exhausted(&self) -> bool {
        self.busy_count == CAPACITY
    }

    /// Busy ids, most recently allocated first.
    pub fn busy_ids(&self) -> Ids<'_> {
        Ids {
            pool: self,
            head: BUSY,
            cursor: self.next[BUSY as usize],
        }
    }

    /// Available ids in allocation order.
    pub fn available_ids(&self) -> Ids<'_> {
        Ids {
            pool: self,
            head: AVAILABLE,
            cursor: self.next[AVAILABLE as usize],
        }
    }

    /// Verify that every id `1..=254` is on exactly one list and that the
    /// links agree with the busy flags. Intended for tests and debugging.
    pub fn check_partition(&self) -> Result<(), String> {
        let mut seen = [false; 256];
        for (head, expect_busy) in [(AVAILABLE, false), (BUSY, true)] {
            let mut cur = head;
            loop {
                let nxt = self.next[cur as usize];
                if self.prev[nxt as usize] != cur {
                    return Err(format!("broken back-link at {nxt}"));
                }
                if nxt == head {
                    break;
                }
                if nxt == AVAILABLE || nxt == BUSY {
                    return Err(format!("list {head} reached foreign head {nxt}"));
                }
                if seen[nxt as usize] {
                    return Err(format!("id {nxt} linked twice"));
                }
                if self.busy[nxt as usize] != expect_busy {
                    return Err(format!("id {nxt} busy flag disagrees with list {head}"));
                }
                seen[nxt as usize] = true;
                cur = nxt;
            }
        }
        match (1..=254usize).find(|&i| !seen[i]) {
            Some(missing) => Err(format!("id {missing} on neither list")),
            None => Ok(()),
        }
    }

    fn unlink(&mut self, id: u8) {
        let (p, n) = (self.prev[id as usize], self.next[id as usize]);
        self.next[p as usize] = n;
        self.prev[n as usize] = p;
    }

    fn push_front(&mut self, head: u8, id: u8) {
        let first = self.next[head as usize];
        self.next[id as usize] = first;
        self.prev[first as usize] = id;
        self.next[head as usize] = id;
        self.prev[id as usize] = head;
    }

    fn push_back(&mut self, head: u8, id: u8) {
        let last = self.prev[head as usize];
        self.prev[id as usize] = last;
        self.next[id as usize] = head;
        self.next[last as usize] = id;
        self.prev[head as usize] = id;
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionPool")
            .field("busy", &self.busy_count)
            .field("available", &self.available_len())
            .finish()
    }
}

/// Iterator over one of the pool's lists.
pub struct Ids<'a> {
    pool: &'a TransactionPool,
    head: u8,
    cursor: u8,
}

impl Iterator for Ids<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.cursor == self.head {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.pool.next[id as usize];
        Some(id)
    }
}
