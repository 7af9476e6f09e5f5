//! Exclusive locking keyed by value, with zero steady-state memory.
//!
//! A [`KeyedLock`] serializes work per key: requests for the same key take
//! turns in FIFO order, requests for different keys never interact. The lock
//! keeps a map entry for a key only while that key is held or contended;
//! once the last holder releases an uncontended key, the entry is removed, so
//! an idle lock occupies no per-key memory regardless of how many distinct
//! keys it has ever seen.
//!
//! Each key behaves like an [`ExclusiveLock`](crate::ExclusiveLock): the same
//! blocking, timeout, try and async acquisition paths, the same waiter/grant
//! protocol, the same cancellation semantics.

use parking_lot::Mutex as ParkingMutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::error::{AcquireError, ReleaseError};
use crate::waiter::{TaskWaiter, ThreadWaiter, WaitOutcome, Waiter};

/// A lock that provides one independent exclusive lock per key.
///
/// Clones share the same underlying map.
#[derive(Clone)]
pub struct KeyedLock<K>
where
    K: Clone + Eq + Hash,
{
    inner: Arc<KeyedInner<K>>,
}

struct KeyedInner<K>
where
    K: Clone + Eq + Hash,
{
    map: ParkingMutex<HashMap<K, KeyState<K>>>,
}

/// Present in the map only while the key is held or contended.
struct KeyState<K>
where
    K: Clone + Eq + Hash,
{
    taken: bool,
    waiters: VecDeque<Waiter<KeyToken<K>>>,
}

impl<K> KeyState<K>
where
    K: Clone + Eq + Hash,
{
    fn held() -> Self {
        Self {
            taken: true,
            waiters: VecDeque::new(),
        }
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: Arc::new(KeyedInner {
                map: ParkingMutex::new(HashMap::new()),
            }),
        }
    }
}

impl<K> KeyedLock<K>
where
    K: Clone + Eq + Hash,
{
    /// Creates an empty keyed lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, blocking until granted.
    pub fn lock(&self, key: K) -> KeyToken<K> {
        let waiter = {
            let mut map = self.inner.map.lock();
            match map.entry(key.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(KeyState::held());
                    return KeyToken::new(Arc::clone(&self.inner), key);
                }
                Entry::Occupied(mut entry) => {
                    let waiter = ThreadWaiter::new();
                    entry
                        .get_mut()
                        .waiters
                        .push_back(Waiter::Thread(Arc::clone(&waiter)));
                    waiter
                }
            }
        };
        trace!(target: "dualock::keyed", "thread parked on contended key");
        waiter.wait()
    }

    /// Acquires the lock for `key`, giving up after `timeout`.
    pub fn lock_timeout(&self, key: K, timeout: Duration) -> Result<KeyToken<K>, AcquireError> {
        let waiter = {
            let mut map = self.inner.map.lock();
            match map.entry(key.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(KeyState::held());
                    return Ok(KeyToken::new(Arc::clone(&self.inner), key));
                }
                Entry::Occupied(mut entry) => {
                    let waiter = ThreadWaiter::new();
                    entry
                        .get_mut()
                        .waiters
                        .push_back(Waiter::Thread(Arc::clone(&waiter)));
                    waiter
                }
            }
        };
        match waiter.wait_timeout(timeout) {
            WaitOutcome::Granted(token) => Ok(token),
            WaitOutcome::GrantedLate(token) => {
                drop(token);
                Err(AcquireError::TimedOut)
            }
            WaitOutcome::TimedOut => {
                self.inner.remove_thread_waiter(&key, &waiter);
                Err(AcquireError::TimedOut)
            }
        }
    }

    /// Acquires the lock for `key` if it is immediately available.
    #[must_use]
    pub fn try_lock(&self, key: K) -> Option<KeyToken<K>> {
        let mut map = self.inner.map.lock();
        match map.entry(key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(KeyState::held());
                Some(KeyToken::new(Arc::clone(&self.inner), key))
            }
            Entry::Occupied(_) => None,
        }
    }

    /// Acquires the lock for `key` asynchronously.
    #[must_use]
    pub fn lock_async(&self, key: K) -> KeyedLockFuture<K> {
        KeyedLockFuture {
            inner: Arc::clone(&self.inner),
            key,
            cancel: None,
            core: None,
        }
    }

    /// Acquires the lock for `key` asynchronously, observing a cancellation
    /// signal.
    #[must_use]
    pub fn lock_async_cancellable(&self, key: K, cancel: &CancelToken) -> KeyedLockFuture<K> {
        KeyedLockFuture {
            inner: Arc::clone(&self.inner),
            key,
            cancel: Some(cancel.clone()),
            core: None,
        }
    }

    /// Releases the lock for `key` without going through a token.
    ///
    /// This is the release primitive [`KeyToken`] uses internally. Releasing
    /// a key that is not held is a programming error and reported as
    /// [`ReleaseError::NotLocked`].
    ///
    /// Do not call this while a [`KeyToken`] for the same key is still live:
    /// the token cannot observe a by-key release happening underneath it, so
    /// its own eventual release would target whichever holder owns the key by
    /// then. Use either tokens or `unlock` for a given key, not both.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotLocked`] if no lock record exists for the
    /// key.
    pub fn unlock(&self, key: &K) -> Result<(), ReleaseError> {
        self.inner.unlock(key)
    }

    /// Returns the number of keys currently held or contended.
    ///
    /// An idle lock always reports zero: entries are removed as soon as a key
    /// is released with nobody waiting.
    #[must_use]
    pub fn contended_keys(&self) -> usize {
        self.inner.map.lock().len()
    }
}

impl<K> std::fmt::Debug for KeyedLock<K>
where
    K: Clone + Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLock")
            .field("contended_keys", &self.inner.map.lock().len())
            .finish()
    }
}

impl<K> KeyedInner<K>
where
    K: Clone + Eq + Hash,
{
    fn unlock(self: &Arc<Self>, key: &K) -> Result<(), ReleaseError> {
        let waker = {
            let mut map = self.map.lock();
            let Some(state) = map.get_mut(key) else {
                return Err(ReleaseError::NotLocked);
            };
            debug_assert!(state.taken, "map entry for an unheld key");

            let mut accepted = None;
            while let Some(waiter) = state.waiters.pop_front() {
                match waiter.grant_with(|| KeyToken::new(Arc::clone(self), key.clone())) {
                    Some(waker) => {
                        accepted = Some(waker);
                        break;
                    }
                    None => {
                        trace!(target: "dualock::keyed", "skipping dead waiter on keyed release");
                    }
                }
            }
            match accepted {
                Some(waker) => waker,
                None => {
                    // Nobody took over; the entry is removed only if the
                    // emptiness still holds in this same critical section.
                    state.taken = false;
                    if state.waiters.is_empty() {
                        map.remove(key);
                    }
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    fn remove_thread_waiter(&self, key: &K, target: &Arc<ThreadWaiter<KeyToken<K>>>) {
        let mut map = self.map.lock();
        if let Some(state) = map.get_mut(key) {
            state.waiters.retain(|entry| !entry.is_thread(target));
            if !state.taken && state.waiters.is_empty() {
                map.remove(key);
            }
        }
    }

    fn remove_task_waiter(&self, key: &K, target: &Arc<TaskWaiter<KeyToken<K>>>) {
        let mut map = self.map.lock();
        if let Some(state) = map.get_mut(key) {
            state.waiters.retain(|entry| !entry.is_task(target));
            if !state.taken && state.waiters.is_empty() {
                map.remove(key);
            }
        }
    }
}

/// Ownership token for one key of a [`KeyedLock`].
///
/// Releasing is idempotent: the first of an explicit
/// [`release`](Self::release) or the drop performs the release.
#[must_use = "dropping the token releases the key"]
pub struct KeyToken<K>
where
    K: Clone + Eq + Hash,
{
    inner: Arc<KeyedInner<K>>,
    key: K,
    released: AtomicBool,
}

impl<K> KeyToken<K>
where
    K: Clone + Eq + Hash,
{
    fn new(inner: Arc<KeyedInner<K>>, key: K) -> Self {
        Self {
            inner,
            key,
            released: AtomicBool::new(false),
        }
    }

    /// The key this token holds.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Releases the key. Safe to call any number of times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // The token exists, so the record exists; the error is unreachable.
        let _ = self.inner.unlock(&self.key);
    }
}

impl<K> Drop for KeyToken<K>
where
    K: Clone + Eq + Hash,
{
    fn drop(&mut self) {
        self.release();
    }
}

impl<K> std::fmt::Debug for KeyToken<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyToken")
            .field("key", &self.key)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

/// Future returned by the async acquisition methods of [`KeyedLock`].
pub struct KeyedLockFuture<K>
where
    K: Clone + Eq + Hash,
{
    inner: Arc<KeyedInner<K>>,
    key: K,
    cancel: Option<CancelToken>,
    core: Option<Arc<TaskWaiter<KeyToken<K>>>>,
}

impl<K> Future for KeyedLockFuture<K>
where
    K: Clone + Eq + Hash + Unpin,
{
    type Output = Result<KeyToken<K>, AcquireError>;

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

        let mut map = this.inner.map.lock();
        let core = match map.entry(this.key.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(KeyState::held());
                drop(map);
                return Poll::Ready(Ok(KeyToken::new(
                    Arc::clone(&this.inner),
                    this.key.clone(),
                )));
            }
            Entry::Occupied(mut entry) => {
                let core = TaskWaiter::new(this.cancel.clone(), context.waker().clone());
                entry
                    .get_mut()
                    .waiters
                    .push_back(Waiter::Task(Arc::clone(&core)));
                core
            }
        };
        drop(map);
        trace!(target: "dualock::keyed", "task enqueued on contended key");

        if let Some(cancel) = &this.cancel {
            cancel.register(context.waker());
        }
        this.core = Some(core);
        Poll::Pending
    }
}

impl<K> Drop for KeyedLockFuture<K>
where
    K: Clone + Eq + Hash,
{
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        if core.retract() {
            self.inner.remove_task_waiter(&self.key, &core);
        } else if let Some(token) = core.take_granted() {
            drop(token);
        }
    }
}

impl<K> std::fmt::Debug for KeyedLockFuture<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLockFuture")
            .field("key", &self.key)
            .field("queued", &self.core.is_some())
            .finish()
    }
}
