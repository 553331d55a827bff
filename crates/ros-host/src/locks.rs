//! Lock state for the RPC lock protocols.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Snapshot of one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockState {
    /// Whether someone holds the lock.
    pub held: bool,
    /// Requesters queued behind the holder.
    pub waiters: usize,
}

/// Outcome of [`LockTable::enqueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue<W> {
    /// The lock was free and now belongs to the waiter, handed back.
    Granted(W),
    /// The waiter was queued.
    Queued,
}

/// Outcome of [`LockTable::release`].
#[derive(Debug, PartialEq, Eq)]
pub enum Release<W> {
    /// The lock was not held; nothing changed.
    NotHeld,
    /// The lock is free.
    Released,
    /// The lock passed to the first queued waiter, handed back.
    HandedOver(W),
}

struct Slot<W> {
    held: bool,
    waiters: VecDeque<W>,
}

/// Per-lock test-and-set flag and FIFO wait queue, keyed by lock id.
///
/// `W` is whatever the caller needs to answer a queued requester later.
pub struct LockTable<W> {
    locks: Mutex<HashMap<u64, Slot<W>>>,
}

impl<W> LockTable<W> {
    /// Create a table where every lock is free.
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self, lock_id: u64) -> bool {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        let slot = locks.entry(lock_id).or_insert_with(|| Slot {
            held: false,
            waiters: VecDeque::new(),
        });
        if slot.held {
            false
        } else {
            slot.held = true;
            true
        }
    }

    /// Take the lock if it is free, otherwise queue `waiter` behind the
    /// current holder.
    pub fn enqueue(&self, lock_id: u64, waiter: W) -> Enqueue<W> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        let slot = locks.entry(lock_id).or_insert_with(|| Slot {
            held: false,
            waiters: VecDeque::new(),
        });
        if slot.held {
            slot.waiters.push_back(waiter);
            Enqueue::Queued
        } else {
            slot.held = true;
            Enqueue::Granted(waiter)
        }
    }

    /// Release the lock, passing it to the first waiter if there is one.
    pub fn release(&self, lock_id: u64) -> Release<W> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        let Some(slot) = locks.get_mut(&lock_id) else {
            return Release::NotHeld;
        };
        if !slot.held {
            return Release::NotHeld;
        }
        if let Some(next) = slot.waiters.pop_front() {
            return Release::HandedOver(next);
        }
        locks.remove(&lock_id);
        Release::Released
    }

    /// Current state of `lock_id`.
    pub fn state(&self, lock_id: u64) -> LockState {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .get(&lock_id)
            .map(|slot| LockState {
                held: slot.held,
                waiters: slot.waiters.len(),
            })
            .unwrap_or_default()
    }
}

impl<W> Default for LockTable<W> {
    fn default() -> Self {
        Self::new()
    }
}
