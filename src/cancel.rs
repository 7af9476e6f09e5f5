//! External cancellation signal observed by pending lock futures.
//!
//! A [`CancelToken`] is a clonable handle to a one-shot flag. Firing it wakes
//! every future that registered interest, and the release path of each lock
//! consults the flag before handing over ownership, so a cancelled waiter is
//! never granted a lock — even if its future was never polled again.
//!
//! Cancellation is only observable while a request is queued. Once a lock has
//! been granted, firing the token has no effect on that grant.

use parking_lot::Mutex as ParkingMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;

/// A clonable one-shot cancellation signal.
///
/// All clones observe the same flag. [`cancel`](Self::cancel) is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    fired: AtomicBool,
    wakers: ParkingMutex<Vec<Waker>>,
}

impl CancelToken {
    /// Creates a token that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal and wakes every registered future.
    ///
    /// Subsequent calls are no-ops.
    pub fn cancel(&self) {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        // Drain under the lock, wake outside it.
        let wakers = std::mem::take(&mut *self.inner.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns true if the signal has fired.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Registers a waker to be woken when the signal fires.
    ///
    /// If the signal already fired the waker is woken immediately. The flag
    /// is re-checked under the waker-list lock so a registration can never
    /// slide in after `cancel` drained the list.
    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.inner.wakers.lock();
        if self.is_cancelled() {
            drop(wakers);
            waker.wake_by_ref();
            return;
        }
        if !wakers.iter().any(|existing| existing.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }
}
