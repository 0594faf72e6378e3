//! Keyed worker pool
//!
//! A fixed set of worker threads consumes a deduplicated queue of keys.
//! Work on one key is strictly serialized: a key enqueued while it is
//! running is parked as dirty and re-queued when the current run finishes.
//! Different keys run concurrently up to the pool size.
//!
//! Commands are free-form strings delivered to [`Action::command`]; they are
//! neither deduplicated nor serialized.

use crate::context::Context;
use converge_core::error::{Error, Result};
use parking_lot::{Condvar, Mutex as ParkingMutex};
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Outcome of one action invocation
#[derive(Debug)]
pub enum Status {
    /// Done; an attached error is logged but not counted as a failure
    Completed(Option<Error>),
    /// Done with an error
    Failed(Error),
    /// Run the key again
    Redo,
}

/// Work executed by the pool
pub trait Action<K>: Send + Sync {
    /// Reconcile one key
    fn reconcile(&self, ctx: &Context, key: &K) -> Status;

    /// Execute a pool command
    fn command(&self, _ctx: &Context, _cmd: &str) -> Status {
        Status::Completed(None)
    }
}

/// Pool metrics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Items ready to run
    pub queue_depth: usize,
    /// Items scheduled for later
    pub delayed: usize,
    /// Items currently executing
    pub active: usize,
    /// Invocations finished, including failed and panicked ones
    pub completed: u64,
    /// Invocations that returned `Failed` or panicked
    pub failed: u64,
    /// Invocations that returned `Redo`
    pub redone: u64,
    /// Number of worker threads
    pub worker_count: usize,
}

#[derive(Debug, Clone)]
enum Work<K> {
    Key(K),
    Command(String),
}

struct Delayed<K> {
    at: Instant,
    sequence: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.sequence == other.sequence
    }
}

impl<K> Eq for Delayed<K> {}

// Earliest deadline first, then lower sequence (older) first
impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Queue<K> {
    ready: VecDeque<Work<K>>,
    queued: FxHashSet<K>,
    running: FxHashSet<K>,
    dirty: FxHashSet<K>,
    delayed: BinaryHeap<Delayed<K>>,
    active: usize,
}

impl<K: Eq + Hash + Clone> Queue<K> {
    fn push_key(&mut self, key: K) -> bool {
        if self.running.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.ready.push_back(Work::Key(key));
        true
    }

    fn promote_due(&mut self, now: Instant) -> bool {
        let mut promoted = false;
        while self.delayed.peek().map_or(false, |d| d.at <= now) {
            if let Some(d) = self.delayed.pop() {
                promoted |= self.push_key(d.key);
            }
        }
        promoted
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.active == 0
    }
}

struct PoolInner<K> {
    queue: ParkingMutex<Queue<K>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    redone: AtomicU64,
    workers: AtomicUsize,
    ctx: Context,
}

/// Cloneable handle for submitting work to a [`Pool`]
pub struct PoolHandle<K> {
    inner: Arc<PoolInner<K>>,
}

impl<K> Clone for PoolHandle<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> PoolHandle<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Queue `key`; a no-op if it is already queued
    ///
    /// Returns false once the pool is shut down.
    pub fn enqueue(&self, key: K) -> bool {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return false;
        }
        let pushed = self.inner.queue.lock().push_key(key);
        if pushed {
            self.inner.work_ready.notify_one();
        }
        true
    }

    /// Queue `key` once `delay` has elapsed
    pub fn enqueue_after(&self, key: K, delay: Duration) -> bool {
        if delay.is_zero() {
            return self.enqueue(key);
        }
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return false;
        }
        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.queue.lock().delayed.push(Delayed {
            at: Instant::now() + delay,
            sequence,
            key,
        });
        // A sleeping worker may need an earlier wakeup.
        self.inner.work_ready.notify_one();
        true
    }

    /// Queue a command
    pub fn command(&self, cmd: impl Into<String>) -> bool {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return false;
        }
        self.inner
            .queue
            .lock()
            .ready
            .push_back(Work::Command(cmd.into()));
        self.inner.work_ready.notify_one();
        true
    }

    /// Context handed to actions; cancelled on shutdown
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Pool has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(AtomicOrdering::Acquire)
    }

    /// Return a snapshot of pool metrics
    pub fn stats(&self) -> PoolStats {
        let queue = self.inner.queue.lock();
        PoolStats {
            queue_depth: queue.ready.len(),
            delayed: queue.delayed.len(),
            active: queue.active,
            completed: self.inner.completed.load(AtomicOrdering::Relaxed),
            failed: self.inner.failed.load(AtomicOrdering::Relaxed),
            redone: self.inner.redone.load(AtomicOrdering::Relaxed),
            worker_count: self.inner.workers.load(AtomicOrdering::Relaxed),
        }
    }

    /// Block until nothing is queued, delayed or running
    ///
    /// Workers remain running after drain completes.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while !queue.is_idle() && !self.is_shutdown() {
            self.inner
                .drain_cond
                .wait_for(&mut queue, Duration::from_millis(50));
        }
    }
}

/// Fixed-size pool of worker threads
pub struct Pool<K> {
    handle: PoolHandle<K>,
    name: String,
    workers: ParkingMutex<Vec<JoinHandle<()>>>,
}

impl<K> Pool<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a pool with no workers yet
    ///
    /// Work may be queued before [`start`](Self::start).
    pub fn new(name: impl Into<String>) -> Self {
        let inner = Arc::new(PoolInner {
            queue: ParkingMutex::new(Queue {
                ready: VecDeque::new(),
                queued: FxHashSet::default(),
                running: FxHashSet::default(),
                dirty: FxHashSet::default(),
                delayed: BinaryHeap::new(),
                active: 0,
            }),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            redone: AtomicU64::new(0),
            workers: AtomicUsize::new(0),
            ctx: Context::background(),
        });
        Self {
            handle: PoolHandle { inner },
            name: name.into(),
            workers: ParkingMutex::new(Vec::new()),
        }
    }

    /// Handle for submitting work
    pub fn handle(&self) -> PoolHandle<K> {
        self.handle.clone()
    }

    /// Spawn `num_threads` workers running `action`
    ///
    /// Workers are named `<name>-0`, `<name>-1`, etc.
    pub fn start(&self, num_threads: usize, action: Arc<dyn Action<K>>) -> Result<()> {
        if self.handle.is_shutdown() {
            return Err(Error::InvalidOperation("pool is shut down".into()));
        }
        let mut workers = self.workers.lock();
        let base = workers.len();
        for i in base..base + num_threads {
            let inner = Arc::clone(&self.handle.inner);
            let action = Arc::clone(&action);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || worker_loop(&inner, action.as_ref()))
                .map_err(|e| Error::InvalidOperation(format!("failed to spawn worker: {}", e)))?;
            workers.push(handle);
            self.handle.inner.workers.fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(())
    }

    /// Queue `key`; see [`PoolHandle::enqueue`]
    pub fn enqueue(&self, key: K) -> bool {
        self.handle.enqueue(key)
    }

    /// Block until idle; see [`PoolHandle::drain`]
    pub fn drain(&self) {
        self.handle.drain()
    }

    /// Return a snapshot of pool metrics
    pub fn stats(&self) -> PoolStats {
        self.handle.stats()
    }

    /// Stop accepting work, cancel running actions and join all workers
    ///
    /// Queued work that has not started is discarded.
    pub fn shutdown(&self) {
        let inner = &self.handle.inner;
        inner.shutdown.store(true, AtomicOrdering::Release);
        inner.ctx.cancel();
        {
            // Lock before notifying so no worker misses the wakeup between its
            // shutdown check and its wait.
            let mut queue = inner.queue.lock();
            queue.ready.clear();
            queue.queued.clear();
            queue.delayed.clear();
            queue.dirty.clear();
            inner.work_ready.notify_all();
            inner.drain_cond.notify_all();
        }

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
            inner.workers.fetch_sub(1, AtomicOrdering::Relaxed);
        }
    }
}

impl<K> Drop for Pool<K> {
    fn drop(&mut self) {
        let inner = &self.handle.inner;
        if !inner.shutdown.swap(true, AtomicOrdering::AcqRel) {
            inner.ctx.cancel();
            let _queue = inner.queue.lock();
            inner.work_ready.notify_all();
        }
    }
}

/// Bookkeeping for one dequeued item; runs even if the action panics
struct ActiveGuard<'a, K: Eq + Hash + Clone> {
    inner: &'a PoolInner<K>,
    key: Option<K>,
}

impl<K: Eq + Hash + Clone> Drop for ActiveGuard<'_, K> {
    fn drop(&mut self) {
        self.inner.completed.fetch_add(1, AtomicOrdering::Relaxed);
        let mut queue = self.inner.queue.lock();
        queue.active -= 1;
        if let Some(key) = self.key.take() {
            queue.running.remove(&key);
            if queue.dirty.remove(&key) && queue.push_key(key) {
                self.inner.work_ready.notify_one();
            }
        }
        if queue.is_idle() {
            self.inner.drain_cond.notify_all();
        }
    }
}

fn next_work<K: Eq + Hash + Clone>(inner: &PoolInner<K>) -> Option<Work<K>> {
    let mut queue = inner.queue.lock();
    loop {
        if inner.shutdown.load(AtomicOrdering::Acquire) {
            return None;
        }
        queue.promote_due(Instant::now());
        if let Some(work) = queue.ready.pop_front() {
            if let Work::Key(key) = &work {
                queue.queued.remove(key);
                queue.running.insert(key.clone());
            }
            queue.active += 1;
            return Some(work);
        }
        match queue.delayed.peek().map(|d| d.at) {
            Some(at) => {
                inner.work_ready.wait_until(&mut queue, at);
            }
            None => inner.work_ready.wait(&mut queue),
        }
    }
}

fn worker_loop<K>(inner: &PoolInner<K>, action: &dyn Action<K>)
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    while let Some(work) = next_work(inner) {
        let key = match &work {
            Work::Key(k) => Some(k.clone()),
            Work::Command(_) => None,
        };
        let _guard = ActiveGuard {
            inner,
            key: key.clone(),
        };

        // catch_unwind keeps a panicking action from killing the worker; the
        // guard does the bookkeeping either way.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match &work {
            Work::Key(k) => action.reconcile(&inner.ctx, k),
            Work::Command(cmd) => action.command(&inner.ctx, cmd),
        }));

        match outcome {
            Ok(Status::Completed(None)) => {}
            Ok(Status::Completed(Some(e))) => {
                debug!(target: "converge::pool", work = ?work, error = %e, "completed with error");
            }
            Ok(Status::Failed(e)) => {
                inner.failed.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(target: "converge::pool", work = ?work, error = %e, "action failed");
            }
            Ok(Status::Redo) => {
                inner.redone.fetch_add(1, AtomicOrdering::Relaxed);
                if let Some(k) = key {
                    // Still marked running, so this parks the key as dirty and
                    // the guard re-queues it.
                    inner.queue.lock().push_key(k);
                }
            }
            Err(e) => {
                inner.failed.fetch_add(1, AtomicOrdering::Relaxed);
                error!(
                    target: "converge::pool",
                    work = ?work,
                    "action panicked: {:?}",
                    e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
                );
            }
        }
    }
}
