//! Multi-reader/single-writer lock with writer-starvation avoidance.
//!
//! An [`RwLock`] tracks occupancy in one signed counter: `0` free, `-1` one
//! writer, `n > 0` that many readers. Readers and writers each have their own
//! FIFO queue, and both blocking and future-backed callers wait in the same
//! queues.
//!
//! # Fairness
//!
//! - A reader acquires immediately only when no writer holds the lock *and*
//!   no writer is queued. Readers defer to any already-waiting writer, which
//!   bounds writer wait time under read-heavy load.
//! - A writer acquires immediately only when the lock is completely free.
//! - On release, the writer queue is preferred. Only when no live writer is
//!   queued are the waiting readers released — all of them together, in one
//!   batch from a single release call, so concurrently-freed readers resume
//!   at effectively the same time.
//!
//! Cancellation and timeout behave as for the exclusive lock: a dead waiter
//! refuses its grant and the release path advances to the next candidate.

use parking_lot::Mutex as ParkingMutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::error::AcquireError;
use crate::waiter::{TaskWaiter, ThreadWaiter, WaitOutcome, Waiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Reader,
    Writer,
}

/// A reader/writer lock acquirable from threads and tasks alike.
///
/// Clones share the same underlying lock.
#[derive(Clone, Default)]
pub struct RwLock {
    inner: Arc<RwInner>,
}

#[derive(Default)]
struct RwInner {
    state: ParkingMutex<RwState>,
}

#[derive(Default)]
struct RwState {
    /// `0` free, `-1` writer held, `n > 0` reader count.
    status: i64,
    reader_queue: VecDeque<Waiter<RwToken>>,
    writer_queue: VecDeque<Waiter<RwToken>>,
}

impl RwState {
    fn try_acquire(&mut self, role: Role) -> bool {
        match role {
            Role::Reader => {
                if self.status >= 0 && self.writer_queue.is_empty() {
                    self.status += 1;
                    true
                } else {
                    false
                }
            }
            Role::Writer => {
                if self.status == 0 {
                    self.status = -1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn queue_mut(&mut self, role: Role) -> &mut VecDeque<Waiter<RwToken>> {
        match role {
            Role::Reader => &mut self.reader_queue,
            Role::Writer => &mut self.writer_queue,
        }
    }
}

impl RwLock {
    /// Creates a free lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires shared (reader) access, blocking until granted.
    ///
    /// Blocks while a writer holds the lock or is queued, even if other
    /// readers are currently active.
    pub fn read(&self) -> RwToken {
        self.acquire_blocking(Role::Reader)
    }

    /// Acquires exclusive (writer) access, blocking until granted.
    pub fn write(&self) -> RwToken {
        self.acquire_blocking(Role::Writer)
    }

    /// Acquires shared access, giving up after `timeout`.
    pub fn read_timeout(&self, timeout: Duration) -> Result<RwToken, AcquireError> {
        self.acquire_blocking_timeout(Role::Reader, timeout)
    }

    /// Acquires exclusive access, giving up after `timeout`.
    pub fn write_timeout(&self, timeout: Duration) -> Result<RwToken, AcquireError> {
        self.acquire_blocking_timeout(Role::Writer, timeout)
    }

    /// Acquires shared access if immediately available.
    #[must_use]
    pub fn try_read(&self) -> Option<RwToken> {
        self.try_acquire(Role::Reader)
    }

    /// Acquires exclusive access if immediately available.
    #[must_use]
    pub fn try_write(&self) -> Option<RwToken> {
        self.try_acquire(Role::Writer)
    }

    /// Acquires shared access asynchronously.
    #[must_use]
    pub fn read_async(&self) -> RwFuture {
        self.acquire_async(Role::Reader, None)
    }

    /// Acquires exclusive access asynchronously.
    #[must_use]
    pub fn write_async(&self) -> RwFuture {
        self.acquire_async(Role::Writer, None)
    }

    /// Acquires shared access asynchronously, observing a cancellation signal.
    #[must_use]
    pub fn read_async_cancellable(&self, cancel: &CancelToken) -> RwFuture {
        self.acquire_async(Role::Reader, Some(cancel.clone()))
    }

    /// Acquires exclusive access asynchronously, observing a cancellation
    /// signal.
    #[must_use]
    pub fn write_async_cancellable(&self, cancel: &CancelToken) -> RwFuture {
        self.acquire_async(Role::Writer, Some(cancel.clone()))
    }

    /// Returns the number of active readers.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        usize::try_from(self.inner.state.lock().status.max(0)).unwrap_or(0)
    }

    /// Returns true if a writer currently holds the lock.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.inner.state.lock().status < 0
    }

    /// Returns the number of queued writers.
    #[must_use]
    pub fn queued_writers(&self) -> usize {
        self.inner.state.lock().writer_queue.len()
    }

    /// Returns the number of queued readers.
    #[must_use]
    pub fn queued_readers(&self) -> usize {
        self.inner.state.lock().reader_queue.len()
    }

    fn try_acquire(&self, role: Role) -> Option<RwToken> {
        let mut state = self.inner.state.lock();
        state
            .try_acquire(role)
            .then(|| RwToken::new(Arc::clone(&self.inner), role))
    }

    fn acquire_blocking(&self, role: Role) -> RwToken {
        let waiter = {
            let mut state = self.inner.state.lock();
            if state.try_acquire(role) {
                return RwToken::new(Arc::clone(&self.inner), role);
            }
            let waiter = ThreadWaiter::new();
            state
                .queue_mut(role)
                .push_back(Waiter::Thread(Arc::clone(&waiter)));
            waiter
        };
        trace!(target: "dualock::rwlock", role = ?role, "thread parked on rwlock");
        waiter.wait()
    }

    fn acquire_blocking_timeout(
        &self,
        role: Role,
        timeout: Duration,
    ) -> Result<RwToken, AcquireError> {
        let waiter = {
            let mut state = self.inner.state.lock();
            if state.try_acquire(role) {
                return Ok(RwToken::new(Arc::clone(&self.inner), role));
            }
            let waiter = ThreadWaiter::new();
            state
                .queue_mut(role)
                .push_back(Waiter::Thread(Arc::clone(&waiter)));
            waiter
        };
        match waiter.wait_timeout(timeout) {
            WaitOutcome::Granted(token) => Ok(token),
            WaitOutcome::GrantedLate(token) => {
                drop(token);
                Err(AcquireError::TimedOut)
            }
            WaitOutcome::TimedOut => {
                self.inner.remove_thread_waiter(role, &waiter);
                Err(AcquireError::TimedOut)
            }
        }
    }

    fn acquire_async(&self, role: Role, cancel: Option<CancelToken>) -> RwFuture {
        RwFuture {
            inner: Arc::clone(&self.inner),
            role,
            cancel,
            core: None,
        }
    }
}

impl std::fmt::Debug for RwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RwLock")
            .field("status", &state.status)
            .field("queued_readers", &state.reader_queue.len())
            .field("queued_writers", &state.writer_queue.len())
            .finish()
    }
}

impl RwInner {
    fn release(self: &Arc<Self>, role: Role) {
        let wakers = {
            let mut state = self.state.lock();
            match role {
                Role::Reader => {
                    debug_assert!(state.status > 0, "reader release with no readers");
                    state.status -= 1;
                    if state.status == 0 {
                        self.grant_next(&mut state)
                    } else {
                        SmallVec::new()
                    }
                }
                Role::Writer => {
                    debug_assert!(state.status == -1, "writer release with no writer");
                    state.status = 0;
                    self.grant_next(&mut state)
                }
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Called with `status == 0`: hand the lock to the next live writer, or
    /// failing that release every queued reader as one batch. Dead waiters
    /// (timed out, cancelled) are skipped unconditionally.
    fn grant_next(self: &Arc<Self>, state: &mut RwState) -> SmallVec<[Waker; 4]> {
        let mut wakers = SmallVec::new();
        while let Some(waiter) = state.writer_queue.pop_front() {
            match waiter.grant_with(|| RwToken::new(Arc::clone(self), Role::Writer)) {
                Some(waker) => {
                    state.status = -1;
                    wakers.extend(waker);
                    return wakers;
                }
                None => {
                    trace!(target: "dualock::rwlock", "skipping dead writer on release");
                }
            }
        }
        self.drain_readers(state, &mut wakers);
        wakers
    }

    /// Wakes every queued reader that still wants the lock, bumping `status`
    /// once per accepted grant. Requires `status >= 0` and an empty writer
    /// queue.
    fn drain_readers(self: &Arc<Self>, state: &mut RwState, wakers: &mut SmallVec<[Waker; 4]>) {
        while let Some(waiter) = state.reader_queue.pop_front() {
            if let Some(waker) = waiter.grant_with(|| RwToken::new(Arc::clone(self), Role::Reader)) {
                state.status += 1;
                wakers.extend(waker);
            }
        }
    }

    /// Removes a timed-out thread waiter. A retracted writer may have been
    /// the only thing holding back queued readers, so the reader queue is
    /// re-examined.
    fn remove_thread_waiter(self: &Arc<Self>, role: Role, target: &Arc<ThreadWaiter<RwToken>>) {
        let wakers = {
            let mut state = self.state.lock();
            state.queue_mut(role).retain(|entry| !entry.is_thread(target));
            self.readers_unblocked_by_writer_departure(role, &mut state)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Removes a dropped task waiter that never received a grant.
    fn remove_task_waiter(self: &Arc<Self>, role: Role, target: &Arc<TaskWaiter<RwToken>>) {
        let wakers = {
            let mut state = self.state.lock();
            state.queue_mut(role).retain(|entry| !entry.is_task(target));
            self.readers_unblocked_by_writer_departure(role, &mut state)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    fn readers_unblocked_by_writer_departure(
        self: &Arc<Self>,
        role: Role,
        state: &mut RwState,
    ) -> SmallVec<[Waker; 4]> {
        let mut wakers = SmallVec::new();
        if role == Role::Writer && state.writer_queue.is_empty() && state.status >= 0 {
            self.drain_readers(state, &mut wakers);
        }
        wakers
    }
}

/// Ownership token for an [`RwLock`], covering either a shared or an
/// exclusive grant.
///
/// Releasing is idempotent: the first of an explicit
/// [`release`](Self::release) or the drop performs the release.
#[must_use = "dropping the token releases the lock"]
pub struct RwToken {
    inner: Arc<RwInner>,
    role: Role,
    released: AtomicBool,
}

impl RwToken {
    fn new(inner: Arc<RwInner>, role: Role) -> Self {
        Self {
            inner,
            role,
            released: AtomicBool::new(false),
        }
    }

    /// Returns true if this token represents shared (reader) access.
    #[must_use]
    pub fn is_reader(&self) -> bool {
        self.role == Role::Reader
    }

    /// Releases the lock. Safe to call any number of times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.release(self.role);
    }
}

impl Drop for RwToken {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for RwToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwToken")
            .field("role", &self.role)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

/// Future returned by the async acquisition methods of [`RwLock`].
pub struct RwFuture {
    inner: Arc<RwInner>,
    role: Role,
    cancel: Option<CancelToken>,
    core: Option<Arc<TaskWaiter<RwToken>>>,
}

impl Future for RwFuture {
    type Output = Result<RwToken, AcquireError>;

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
        if state.try_acquire(this.role) {
            drop(state);
            return Poll::Ready(Ok(RwToken::new(Arc::clone(&this.inner), this.role)));
        }

        let core = TaskWaiter::new(this.cancel.clone(), context.waker().clone());
        state
            .queue_mut(this.role)
            .push_back(Waiter::Task(Arc::clone(&core)));
        drop(state);
        trace!(target: "dualock::rwlock", role = ?this.role, "task enqueued on rwlock");

        if let Some(cancel) = &this.cancel {
            cancel.register(context.waker());
        }
        this.core = Some(core);
        Poll::Pending
    }
}

impl Drop for RwFuture {
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        if core.retract() {
            self.inner.remove_task_waiter(self.role, &core);
        } else if let Some(token) = core.take_granted() {
            drop(token);
        }
    }
}

impl std::fmt::Debug for RwFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwFuture")
            .field("role", &self.role)
            .field("queued", &self.core.is_some())
            .finish()
    }
}
