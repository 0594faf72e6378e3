//! Per-key mutual exclusion with FIFO handoff
//!
//! A key is locked while it has an entry in the table. Blocked callers queue
//! a ticket on the key; `unlock` passes ownership straight to the oldest
//! ticket so the key never becomes free while anyone is waiting. Each
//! waiter parks on its own condvar, so a handoff wakes exactly one thread.

use crate::context::Context;
use converge_core::ContextError;
use parking_lot::{Condvar, Mutex as ParkingMutex};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;

struct Waiter {
    ticket: u64,
    wake: Arc<Condvar>,
}

#[derive(Default)]
struct KeyState {
    waiters: VecDeque<Waiter>,
    /// Ticket that was handed the lock but has not woken up yet
    granted: Option<u64>,
}

struct Table<K> {
    keys: FxHashMap<K, KeyState>,
    next_ticket: u64,
}

/// Set of independently lockable keys
pub struct ElementLocks<K> {
    table: Arc<ParkingMutex<Table<K>>>,
}

impl<K> ElementLocks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Empty lock table
    pub fn new() -> Self {
        Self {
            table: Arc::new(ParkingMutex::new(Table {
                keys: FxHashMap::default(),
                next_ticket: 0,
            })),
        }
    }

    /// Acquire `key` only if it is free
    pub fn try_lock(&self, key: &K) -> bool {
        let mut table = self.table.lock();
        if table.keys.contains_key(key) {
            return false;
        }
        table.keys.insert(key.clone(), KeyState::default());
        true
    }

    /// Acquire `key` and release it when the guard drops
    pub fn try_guard(&self, key: &K) -> Option<KeyGuard<'_, K>> {
        self.try_lock(key).then(|| KeyGuard {
            locks: self,
            key: key.clone(),
        })
    }

    /// Acquire `key`, blocking in FIFO order behind earlier callers
    ///
    /// # Errors
    ///
    /// The context's error if it is done before the lock is handed over.
    /// A cancelled caller leaves nothing behind in the wait list.
    pub fn lock(&self, ctx: &Context, key: &K) -> Result<(), ContextError> {
        let mut table = self.table.lock();
        if !table.keys.contains_key(key) {
            table.keys.insert(key.clone(), KeyState::default());
            return Ok(());
        }
        ctx.check()?;

        let ticket = table.next_ticket;
        table.next_ticket += 1;
        let wake = Arc::new(Condvar::new());
        if let Some(state) = table.keys.get_mut(key) {
            state.waiters.push_back(Waiter {
                ticket,
                wake: Arc::clone(&wake),
            });
        }

        // Taking the table lock orders the notify after the waiter parks.
        let weak = Arc::downgrade(&self.table);
        let cancel_wake = Arc::clone(&wake);
        let _waker = ctx.on_cancel(Arc::new(move || {
            if let Some(table) = weak.upgrade() {
                let _table = table.lock();
                cancel_wake.notify_one();
            }
        }));

        loop {
            let granted = table
                .keys
                .get(key)
                .map_or(false, |s| s.granted == Some(ticket));
            if granted {
                if let Some(state) = table.keys.get_mut(key) {
                    state.granted = None;
                }
                return Ok(());
            }
            if let Some(err) = ctx.err() {
                if let Some(state) = table.keys.get_mut(key) {
                    state.waiters.retain(|w| w.ticket != ticket);
                }
                return Err(err);
            }
            ctx.wait(&wake, &mut table);
        }
    }

    /// Release `key`, handing it to the oldest waiter if there is one
    ///
    /// # Panics
    ///
    /// If `key` is not locked. That is a logic error in the caller.
    pub fn unlock(&self, key: &K) {
        let mut table = self.table.lock();
        let state = match table.keys.get_mut(key) {
            Some(state) if state.granted.is_none() => state,
            _ => panic!("unlock of unlocked key"),
        };
        match state.waiters.pop_front() {
            Some(next) => {
                state.granted = Some(next.ticket);
                next.wake.notify_one();
            }
            None => {
                table.keys.remove(key);
            }
        }
    }

    /// `key` is held by someone
    pub fn is_locked(&self, key: &K) -> bool {
        self.table.lock().keys.contains_key(key)
    }

    /// Someone is blocked in `lock` on `key`
    pub fn has_waiting(&self, key: &K) -> bool {
        self.table
            .lock()
            .keys
            .get(key)
            .map_or(false, |s| !s.waiters.is_empty() || s.granted.is_some())
    }
}

impl<K> Default for ElementLocks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Releases a key of an [`ElementLocks`] on drop
pub struct KeyGuard<'a, K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    locks: &'a ElementLocks<K>,
    key: K,
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.locks.unlock(&self.key);
    }
}

/// A single lock with the same semantics as one key of [`ElementLocks`]
#[derive(Default)]
pub struct Mutex {
    locks: ElementLocks<()>,
}

impl Mutex {
    /// Unlocked mutex
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire only if free
    pub fn try_lock(&self) -> bool {
        self.locks.try_lock(&())
    }

    /// Acquire, blocking until handed over or `ctx` is done
    pub fn lock(&self, ctx: &Context) -> Result<(), ContextError> {
        self.locks.lock(ctx, &())
    }

    /// Release; panics if not locked
    pub fn unlock(&self) {
        self.locks.unlock(&())
    }

    /// Held by someone
    pub fn is_locked(&self) -> bool {
        self.locks.is_locked(&())
    }

    /// Someone is blocked in `lock`
    pub fn has_waiting(&self) -> bool {
        self.locks.has_waiting(&())
    }
}
