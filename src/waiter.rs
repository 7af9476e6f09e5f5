//! The waiter/grant protocol shared by every lock in the crate.
//!
//! A [`Waiter`] represents one pending acquisition, either a parked OS thread
//! or a pending future. Both variants sit in the same FIFO queue and expose
//! one capability: *attempt to hand over an ownership token, exactly once*.
//! The attempt fails when the waiter already left the race (timed out or
//! cancelled); the releasing side then advances to the next queued waiter, so
//! ownership is never dropped on the floor and never granted twice.
//!
//! The variant is chosen at enqueue time and never re-dispatched.
//!
//! # Blocking discipline
//!
//! Each thread waiter carries its own `parking_lot::Condvar`, so a grant
//! wakes exactly the intended thread — there is no shared condition variable
//! and no thundering herd among blocking callers. Task waiters store a waker;
//! `grant_with` returns it so the caller can invoke it *after* dropping the
//! lock's internal state mutex.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::sync::Arc;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::AcquireError;

/// A queued acquisition request, thread-backed or future-backed.
pub(crate) enum Waiter<T> {
    Thread(Arc<ThreadWaiter<T>>),
    Task(Arc<TaskWaiter<T>>),
}

impl<T> Waiter<T> {
    /// Attempts to hand a token to this waiter.
    ///
    /// `make_token` runs only if the waiter accepts, so a refused grant never
    /// constructs (and therefore never has to defuse) a token. On success the
    /// returned waker, if any, must be invoked after the caller drops its
    /// state mutex. `None` means the waiter refused and the caller must try
    /// the next one in the queue.
    pub(crate) fn grant_with<F>(&self, make_token: F) -> Option<Option<Waker>>
    where
        F: FnOnce() -> T,
    {
        match self {
            Self::Thread(waiter) => waiter.grant_with(make_token).then_some(None),
            Self::Task(waiter) => waiter.grant_with(make_token),
        }
    }

    /// Returns true if this entry is the given thread waiter.
    pub(crate) fn is_thread(&self, target: &Arc<ThreadWaiter<T>>) -> bool {
        matches!(self, Self::Thread(waiter) if Arc::ptr_eq(waiter, target))
    }

    /// Returns true if this entry is the given task waiter.
    pub(crate) fn is_task(&self, target: &Arc<TaskWaiter<T>>) -> bool {
        matches!(self, Self::Task(waiter) if Arc::ptr_eq(waiter, target))
    }
}

// ============================================================================
// Thread waiter
// ============================================================================

/// Outcome of a bounded blocking wait.
pub(crate) enum WaitOutcome<T> {
    /// The token arrived within the timeout.
    Granted(T),
    /// The timeout expired, but a concurrent release had already delivered
    /// the token by the time the retraction ran. The caller holds a lock it
    /// never logically acquired and must release the token immediately.
    GrantedLate(T),
    /// The timeout expired and the waiter was retracted.
    TimedOut,
}

enum ThreadSlot<T> {
    Waiting,
    Granted(T),
    /// The waiter retracted itself after a timeout; grants must be refused.
    Abandoned,
}

/// A parked thread waiting for a token, with its own condition variable.
pub(crate) struct ThreadWaiter<T> {
    slot: ParkingMutex<ThreadSlot<T>>,
    condvar: Condvar,
}

impl<T> ThreadWaiter<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: ParkingMutex::new(ThreadSlot::Waiting),
            condvar: Condvar::new(),
        })
    }

    /// Delivers a token and pulses the condvar. Returns false if the waiter
    /// already abandoned the wait.
    fn grant_with<F>(&self, make_token: F) -> bool
    where
        F: FnOnce() -> T,
    {
        let mut slot = self.slot.lock();
        match *slot {
            ThreadSlot::Waiting => {
                *slot = ThreadSlot::Granted(make_token());
                self.condvar.notify_one();
                true
            }
            ThreadSlot::Granted(_) | ThreadSlot::Abandoned => false,
        }
    }

    /// Parks the calling thread until a token is delivered.
    pub(crate) fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, ThreadSlot::Waiting) {
                ThreadSlot::Granted(token) => return token,
                state => *slot = state,
            }
            self.condvar.wait(&mut slot);
        }
    }

    /// Parks the calling thread until a token is delivered or the timeout
    /// expires. Retraction happens under the slot lock, so it is atomic with
    /// respect to concurrent grants: either the grant landed first (reported
    /// as [`WaitOutcome::GrantedLate`]) or the slot transitions to abandoned
    /// and any later grant is refused.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> WaitOutcome<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, ThreadSlot::Waiting) {
                ThreadSlot::Granted(token) => return WaitOutcome::Granted(token),
                state => *slot = state,
            }
            if self.condvar.wait_until(&mut slot, deadline).timed_out() {
                return match std::mem::replace(&mut *slot, ThreadSlot::Abandoned) {
                    ThreadSlot::Granted(token) => WaitOutcome::GrantedLate(token),
                    _ => WaitOutcome::TimedOut,
                };
            }
        }
    }
}

// ============================================================================
// Task waiter
// ============================================================================

enum TaskState<T> {
    Pending,
    Granted(T),
    Cancelled,
    /// The owning future observed a terminal state and will not poll again.
    Finished,
}

struct TaskSlot<T> {
    state: TaskState<T>,
    waker: Option<Waker>,
}

/// A pending future waiting for a token.
pub(crate) struct TaskWaiter<T> {
    slot: ParkingMutex<TaskSlot<T>>,
    cancel: Option<CancelToken>,
}

impl<T> TaskWaiter<T> {
    pub(crate) fn new(cancel: Option<CancelToken>, waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            slot: ParkingMutex::new(TaskSlot {
                state: TaskState::Pending,
                waker: Some(waker),
            }),
            cancel,
        })
    }

    /// Delivers a token, returning the stored waker on success. Refuses the
    /// grant if the waiter was cancelled — including the case where the
    /// signal fired but the future has not been polled since.
    fn grant_with<F>(&self, make_token: F) -> Option<Option<Waker>>
    where
        F: FnOnce() -> T,
    {
        let mut slot = self.slot.lock();
        match slot.state {
            TaskState::Pending => {
                if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                    slot.state = TaskState::Cancelled;
                    return None;
                }
                slot.state = TaskState::Granted(make_token());
                Some(slot.waker.take())
            }
            TaskState::Cancelled | TaskState::Granted(_) | TaskState::Finished => None,
        }
    }

    /// Polls the slot on behalf of the owning future.
    pub(crate) fn poll_token(&self, context_waker: &Waker) -> Poll<Result<T, AcquireError>> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut slot.state, TaskState::Finished) {
            TaskState::Granted(token) => Poll::Ready(Ok(token)),
            TaskState::Cancelled => Poll::Ready(Err(AcquireError::Cancelled)),
            TaskState::Pending => {
                if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                    slot.state = TaskState::Cancelled;
                    return Poll::Ready(Err(AcquireError::Cancelled));
                }
                slot.state = TaskState::Pending;
                match &mut slot.waker {
                    Some(existing) if existing.will_wake(context_waker) => {}
                    other => *other = Some(context_waker.clone()),
                }
                Poll::Pending
            }
            // Futures are not polled after completion; stay pending if the
            // contract is violated rather than fabricating a grant.
            TaskState::Finished => Poll::Pending,
        }
    }

    /// Marks the waiter cancelled if it is still pending. Returns false if a
    /// grant (or cancellation) already landed.
    pub(crate) fn retract(&self) -> bool {
        let mut slot = self.slot.lock();
        if matches!(slot.state, TaskState::Pending) {
            slot.state = TaskState::Cancelled;
            true
        } else {
            false
        }
    }

    /// Takes a delivered token that the owning future never observed, so the
    /// caller can pass the lock straight on.
    pub(crate) fn take_granted(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut slot.state, TaskState::Finished) {
            TaskState::Granted(token) => Some(token),
            state => {
                slot.state = state;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn thread_waiter_receives_token() {
        let waiter: Arc<ThreadWaiter<u32>> = ThreadWaiter::new();
        let granter = Arc::clone(&waiter);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            assert!(granter.grant_with(|| 7));
        });
        assert_eq!(waiter.wait(), 7);
        handle.join().expect("granter panicked");
    }

    #[test]
    fn thread_waiter_timeout_refuses_late_grant() {
        let waiter: Arc<ThreadWaiter<u32>> = ThreadWaiter::new();
        let outcome = waiter.wait_timeout(Duration::from_millis(10));
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        // The retraction must make any later grant fail.
        assert!(!waiter.grant_with(|| 1));
    }

    #[test]
    fn task_waiter_grant_then_poll() {
        let waiter: Arc<TaskWaiter<u32>> = TaskWaiter::new(None, Waker::noop().clone());
        assert!(waiter.grant_with(|| 9).is_some());
        match waiter.poll_token(Waker::noop()) {
            Poll::Ready(Ok(token)) => assert_eq!(token, 9),
            _ => panic!("expected granted token"),
        }
    }

    #[test]
    fn cancelled_task_waiter_refuses_grant_without_a_poll() {
        let cancel = CancelToken::new();
        let waiter: Arc<TaskWaiter<u32>> =
            TaskWaiter::new(Some(cancel.clone()), Waker::noop().clone());
        cancel.cancel();
        // The release side must observe the refusal even though the future
        // never ran again.
        assert!(waiter.grant_with(|| 1).is_none());
        assert!(matches!(
            waiter.poll_token(Waker::noop()),
            Poll::Ready(Err(AcquireError::Cancelled))
        ));
    }

    #[test]
    fn retract_loses_to_a_delivered_grant() {
        let waiter: Arc<TaskWaiter<u32>> = TaskWaiter::new(None, Waker::noop().clone());
        assert!(waiter.grant_with(|| 3).is_some());
        assert!(!waiter.retract());
        assert_eq!(waiter.take_granted(), Some(3));
        assert_eq!(waiter.take_granted(), None);
    }
}
