//! Single-holder exclusive lock with dual-mode acquisition.
//!
//! An [`ExclusiveLock`] can be acquired by blocking the calling thread
//! ([`lock`](ExclusiveLock::lock), [`lock_timeout`](ExclusiveLock::lock_timeout))
//! or by awaiting a future ([`lock_async`](ExclusiveLock::lock_async)), and
//! both kinds of caller contend through the same FIFO waiter queue. A
//! successful acquisition yields a [`LockToken`]; dropping or releasing the
//! token is the only way to relinquish the lock, and doing so more than once
//! has the effect of exactly one release.
//!
//! # Hand-off protocol
//!
//! Releasing a held lock does not clear the taken flag while waiters are
//! queued: ownership is handed directly to the first waiter that accepts it.
//! A waiter that timed out or was cancelled refuses the grant and is skipped,
//! preserving FIFO order among the remainder. The flag only clears when the
//! queue is exhausted.
//!
//! # Example
//!
//! ```
//! use dualock::ExclusiveLock;
//!
//! let lock = ExclusiveLock::new();
//! let token = lock.lock();
//! assert!(lock.try_lock().is_none());
//! token.release();
//! assert!(lock.try_lock().is_some());
//! ```

use parking_lot::Mutex as ParkingMutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::error::AcquireError;
use crate::waiter::{TaskWaiter, ThreadWaiter, WaitOutcome, Waiter};

/// A single-holder lock acquirable from threads and tasks alike.
///
/// Clones share the same underlying lock.
#[derive(Clone, Default)]
pub struct ExclusiveLock {
    inner: Arc<LockInner>,
}

#[derive(Default)]
struct LockInner {
    state: ParkingMutex<LockState>,
}

#[derive(Default)]
struct LockState {
    taken: bool,
    waiters: VecDeque<Waiter<LockToken>>,
}

impl ExclusiveLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, blocking the calling thread until it is granted.
    pub fn lock(&self) -> LockToken {
        let waiter = {
            let mut state = self.inner.state.lock();
            if !state.taken {
                state.taken = true;
                return LockToken::new(Arc::clone(&self.inner));
            }
            let waiter = ThreadWaiter::new();
            state.waiters.push_back(Waiter::Thread(Arc::clone(&waiter)));
            waiter
        };
        trace!(target: "dualock::mutex", "thread parked on exclusive lock");
        waiter.wait()
    }

    /// Acquires the lock, giving up after `timeout`.
    ///
    /// On timeout the waiter retracts itself atomically. If a concurrent
    /// release granted the lock in the same instant, the delivered token is
    /// released immediately and `TimedOut` is still returned — the caller
    /// never observes a lock it logically failed to acquire.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<LockToken, AcquireError> {
        let waiter = {
            let mut state = self.inner.state.lock();
            if !state.taken {
                state.taken = true;
                return Ok(LockToken::new(Arc::clone(&self.inner)));
            }
            let waiter = ThreadWaiter::new();
            state.waiters.push_back(Waiter::Thread(Arc::clone(&waiter)));
            waiter
        };
        match waiter.wait_timeout(timeout) {
            WaitOutcome::Granted(token) => Ok(token),
            WaitOutcome::GrantedLate(token) => {
                drop(token);
                Err(AcquireError::TimedOut)
            }
            WaitOutcome::TimedOut => {
                let mut state = self.inner.state.lock();
                state.waiters.retain(|entry| !entry.is_thread(&waiter));
                Err(AcquireError::TimedOut)
            }
        }
    }

    /// Acquires the lock if it is free, without waiting.
    #[must_use]
    pub fn try_lock(&self) -> Option<LockToken> {
        let mut state = self.inner.state.lock();
        if state.taken {
            return None;
        }
        state.taken = true;
        Some(LockToken::new(Arc::clone(&self.inner)))
    }

    /// Acquires the lock asynchronously.
    ///
    /// The returned future resolves once ownership is handed over; no thread
    /// blocks while it is pending.
    #[must_use]
    pub fn lock_async(&self) -> LockFuture {
        LockFuture {
            inner: Arc::clone(&self.inner),
            cancel: None,
            core: None,
        }
    }

    /// Acquires the lock asynchronously, observing a cancellation signal.
    ///
    /// If `cancel` fires before the grant, the future resolves to
    /// [`AcquireError::Cancelled`] and the waiter is skipped by the release
    /// path. Cancellation after the grant is not observed.
    #[must_use]
    pub fn lock_async_cancellable(&self, cancel: &CancelToken) -> LockFuture {
        LockFuture {
            inner: Arc::clone(&self.inner),
            cancel: Some(cancel.clone()),
            core: None,
        }
    }

    /// Returns true if a token is currently outstanding.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().taken
    }

    /// Returns the number of queued waiters (both kinds).
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }
}

impl std::fmt::Debug for ExclusiveLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ExclusiveLock")
            .field("taken", &state.taken)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl LockInner {
    /// Hands ownership to the next live waiter, or clears the taken flag if
    /// the queue is exhausted. The loop is unconditional: the head of the
    /// queue may have timed out or been cancelled since it was enqueued.
    fn unlock(self: &Arc<Self>) {
        let waker = {
            let mut state = self.state.lock();
            loop {
                let Some(waiter) = state.waiters.pop_front() else {
                    state.taken = false;
                    break None;
                };
                match waiter.grant_with(|| LockToken::new(Arc::clone(self))) {
                    Some(waker) => break waker,
                    None => {
                        trace!(target: "dualock::mutex", "skipping dead waiter on release");
                    }
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Ownership token for an [`ExclusiveLock`].
///
/// Releasing is idempotent: the first of an explicit
/// [`release`](Self::release) or the drop performs the release, anything
/// after that is a no-op.
#[must_use = "dropping the token releases the lock"]
pub struct LockToken {
    inner: Arc<LockInner>,
    released: AtomicBool,
}

impl LockToken {
    fn new(inner: Arc<LockInner>) -> Self {
        Self {
            inner,
            released: AtomicBool::new(false),
        }
    }

    /// Releases the lock. Safe to call any number of times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.unlock();
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockToken")
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

/// Future returned by [`ExclusiveLock::lock_async`].
pub struct LockFuture {
    inner: Arc<LockInner>,
    cancel: Option<CancelToken>,
    core: Option<Arc<TaskWaiter<LockToken>>>,
}

impl Future for LockFuture {
    type Output = Result<LockToken, AcquireError>;

    fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(core) = &this.core {
            return match core.poll_token(context.waker()) {
                Poll::Ready(result) => {
                    this.core = None;
                    Poll::Ready(result)
                }
                Poll::Pending => {
                    if let Some(cancel) = &this.cancel {
                        cancel.register(context.waker());
                    }
                    Poll::Pending
                }
            };
        }

        if this.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Poll::Ready(Err(AcquireError::Cancelled));
        }

        let mut state = this.inner.state.lock();
        if !state.taken {
            state.taken = true;
            drop(state);
            return Poll::Ready(Ok(LockToken::new(Arc::clone(&this.inner))));
        }

        let core = TaskWaiter::new(this.cancel.clone(), context.waker().clone());
        state.waiters.push_back(Waiter::Task(Arc::clone(&core)));
        drop(state);
        trace!(target: "dualock::mutex", "task enqueued on exclusive lock");

        if let Some(cancel) = &this.cancel {
            cancel.register(context.waker());
        }
        this.core = Some(core);
        Poll::Pending
    }
}

impl Drop for LockFuture {
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        if core.retract() {
            // Still queued: remove the entry eagerly instead of leaving a
            // dead waiter for the release loop to skip.
            let mut state = self.inner.state.lock();
            state.waiters.retain(|entry| !entry.is_task(&core));
        } else if let Some(token) = core.take_granted() {
            // The grant landed before the drop; pass the lock straight on.
            drop(token);
        }
    }
}

impl std::fmt::Debug for LockFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFuture")
            .field("queued", &self.core.is_some())
            .finish()
    }
}
