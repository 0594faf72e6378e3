//! Cancellable contexts
//!
//! Every blocking call in this crate takes a [`Context`]. A context is done
//! once it is cancelled explicitly, once any ancestor is cancelled, or once
//! its deadline passes. Timeouts are watchdog children: they inherit the
//! parent's cancellation and add their own deadline, whichever comes first.
//!
//! Blocking primitives register a waker while parked so that `cancel` can
//! interrupt them; deadlines are honored by the primitives themselves via
//! timed condvar waits.

use converge_core::ContextError;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

type Waker = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Registry {
    done: Option<ContextError>,
    next_waker: u64,
    wakers: Vec<(u64, Waker)>,
    children: Vec<Weak<Inner>>,
}

struct Inner {
    deadline: Option<Instant>,
    registry: Mutex<Registry>,
}

impl Inner {
    fn cancel(self: &Arc<Self>, reason: ContextError) {
        let mut stack = vec![Arc::clone(self)];
        while let Some(ctx) = stack.pop() {
            let (wakers, children) = {
                let mut reg = ctx.registry.lock();
                if reg.done.is_some() {
                    continue;
                }
                reg.done = Some(reason);
                (
                    std::mem::take(&mut reg.wakers),
                    std::mem::take(&mut reg.children),
                )
            };
            for (_, wake) in wakers {
                wake();
            }
            stack.extend(children.iter().filter_map(Weak::upgrade));
        }
    }
}

/// Cancellation and deadline scope for blocking calls
///
/// Cloning yields another handle to the same context.
///
/// # Example
///
/// ```
/// use converge_concurrency::Context;
/// use std::time::Duration;
///
/// let root = Context::background();
/// let ctx = root.with_timeout(Duration::from_millis(5));
/// assert!(ctx.err().is_none());
/// root.cancel();
/// assert!(ctx.is_done());
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A context that is never done unless cancelled
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline: None,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    fn child(&self, deadline: Option<Instant>) -> Self {
        let deadline = match (self.inner.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let child = Arc::new(Inner {
            deadline,
            registry: Mutex::new(Registry::default()),
        });
        let inherited = {
            let mut reg = self.inner.registry.lock();
            if reg.done.is_none() {
                reg.children.retain(|c| c.strong_count() > 0);
                reg.children.push(Arc::downgrade(&child));
            }
            reg.done
        };
        if let Some(reason) = inherited {
            child.cancel(reason);
        }
        Self { inner: child }
    }

    /// Child context cancelled with this one or by its own `cancel`
    pub fn with_cancel(&self) -> Self {
        self.child(None)
    }

    /// Watchdog child done after `timeout` or when this context is done
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.child(Some(Instant::now() + timeout))
    }

    /// Watchdog child done at `deadline` or when this context is done
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.child(Some(deadline))
    }

    /// Cancel this context and all its descendants
    pub fn cancel(&self) {
        self.inner.cancel(ContextError::Canceled);
    }

    /// Effective deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Why the context is done, or `None` while still live
    pub fn err(&self) -> Option<ContextError> {
        if let Some(reason) = self.inner.registry.lock().done {
            return Some(reason);
        }
        match self.inner.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Shorthand for `err().is_some()`
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// `Err` once done
    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Call `wake` when this context is cancelled
    ///
    /// The registration lasts until the returned guard is dropped. If the
    /// context is already cancelled `wake` is not called; callers re-check
    /// [`err`](Self::err) after registering.
    pub fn on_cancel(&self, wake: Waker) -> WakerGuard {
        let mut reg = self.inner.registry.lock();
        let id = reg.next_waker;
        reg.next_waker += 1;
        if reg.done.is_none() {
            reg.wakers.push((id, wake));
        }
        WakerGuard {
            ctx: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Park on `cond` until woken, cancelled, or past the deadline
    ///
    /// The caller must have registered a waker that notifies `cond` while
    /// holding the mutex guarded by `guard`.
    pub fn wait<T>(&self, cond: &Condvar, guard: &mut parking_lot::MutexGuard<'_, T>) {
        match self.inner.deadline {
            Some(deadline) => {
                cond.wait_until(guard, deadline);
            }
            None => cond.wait(guard),
        }
    }

    /// Sleep for `duration`, returning early with an error when done
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        let pair = Arc::new((Mutex::new(()), Condvar::new()));
        let waker_pair = Arc::clone(&pair);
        let _waker = self.on_cancel(Arc::new(move || {
            let _guard = waker_pair.0.lock();
            waker_pair.1.notify_all();
        }));
        let until = Instant::now() + duration;
        let mut guard = pair.0.lock();
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            let wake_at = self.deadline().map_or(until, |d| d.min(until));
            pair.1.wait_until(&mut guard, wake_at);
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

/// Deregisters a cancellation waker on drop
pub struct WakerGuard {
    ctx: Weak<Inner>,
    id: u64,
}

impl Drop for WakerGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.registry.lock().wakers.retain(|(id, _)| *id != self.id);
        }
    }
}
