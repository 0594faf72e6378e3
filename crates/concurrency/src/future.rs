//! Wait/notify primitives
//!
//! A [`Future`] counts triggers that nobody was waiting for, so a later
//! `wait` returns immediately once per undelivered trigger. A one-shot
//! future stays fired after its first trigger.

use crate::context::Context;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct State {
    /// Triggers with no parked waiter
    pending: usize,
    /// Waiters currently parked
    parked: usize,
    /// Wakeups handed to parked waiters, not yet collected
    tokens: usize,
    /// One-shot future has fired
    fired: bool,
}

/// Trigger/wait rendezvous
pub struct Future {
    retrigger: bool,
    state: Mutex<State>,
    cond: Condvar,
}

impl Future {
    /// Future that resets after each delivered trigger
    pub fn retriggerable() -> Arc<Self> {
        Arc::new(Self::with_mode(true))
    }

    /// Future consumed by its first trigger
    pub fn once() -> Arc<Self> {
        Arc::new(Self::with_mode(false))
    }

    fn with_mode(retrigger: bool) -> Self {
        Self {
            retrigger,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    /// Wake a parked waiter, or remember the trigger for the next `wait`
    pub fn trigger(&self) {
        let mut state = self.state.lock();
        if !self.retrigger {
            state.fired = true;
            self.cond.notify_all();
            return;
        }
        if state.parked > state.tokens {
            state.tokens += 1;
            self.cond.notify_all();
        } else {
            state.pending += 1;
        }
    }

    /// Block until triggered
    ///
    /// Returns `false` if `ctx` is done first.
    pub fn wait(self: &Arc<Self>, ctx: &Context) -> bool {
        let mut state = self.state.lock();
        if state.fired {
            return true;
        }
        if state.pending > 0 {
            state.pending -= 1;
            return true;
        }
        if ctx.is_done() {
            return false;
        }

        state.parked += 1;
        let weak = Arc::downgrade(self);
        let _waker = ctx.on_cancel(Arc::new(move || {
            if let Some(f) = weak.upgrade() {
                let _state = f.state.lock();
                f.cond.notify_all();
            }
        }));
        let delivered = loop {
            if state.tokens > 0 {
                state.tokens -= 1;
                break true;
            }
            if state.fired {
                break true;
            }
            if ctx.is_done() {
                break false;
            }
            ctx.wait(&self.cond, &mut state);
        };
        state.parked -= 1;
        delivered
    }

    /// Undelivered trigger count
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }
}

impl std::fmt::Debug for Future {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("retrigger", &self.retrigger)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Futures scoped to (event, id) pairs
///
/// The manager holds futures weakly; a future lives as long as a waiter
/// keeps its `Arc`.
pub struct EventManager<I, E> {
    futures: Mutex<FxHashMap<(E, I), Vec<Weak<Future>>>>,
}

impl<I, E> EventManager<I, E>
where
    I: Eq + Hash + Clone,
    E: Eq + Hash + Clone,
{
    /// Empty manager
    pub fn new() -> Self {
        Self {
            futures: Mutex::new(FxHashMap::default()),
        }
    }

    /// A new retriggerable future for `(event, id)`
    pub fn future(&self, event: E, id: I) -> Arc<Future> {
        let future = Future::retriggerable();
        let mut futures = self.futures.lock();
        let list = futures.entry((event, id)).or_default();
        list.retain(|w| w.strong_count() > 0);
        list.push(Arc::downgrade(&future));
        future
    }

    /// Trigger every live future registered for `(event, id)`
    ///
    /// Returns how many futures were triggered.
    pub fn trigger(&self, event: &E, id: &I) -> usize {
        let live: Vec<Arc<Future>> = {
            let mut futures = self.futures.lock();
            let key = (event.clone(), id.clone());
            let live: Vec<Arc<Future>> = match futures.get(&key) {
                Some(list) => list.iter().filter_map(Weak::upgrade).collect(),
                None => return 0,
            };
            if live.is_empty() {
                futures.remove(&key);
            }
            live
        };
        for f in &live {
            f.trigger();
        }
        live.len()
    }

    /// Number of (event, id) pairs with registrations
    pub fn len(&self) -> usize {
        self.futures.lock().len()
    }

    /// No registrations
    pub fn is_empty(&self) -> bool {
        self.futures.lock().is_empty()
    }
}

impl<I, E> Default for EventManager<I, E>
where
    I: Eq + Hash + Clone,
    E: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
