//! Dual-mode mutual exclusion: every lock in this crate can be acquired by
//! blocking an OS thread *or* by awaiting a future, and both kinds of caller
//! contend on the same lock instance with the same FIFO fairness.
//!
//! # Primitives
//!
//! - [`ExclusiveLock`] — a mutual-exclusion lock delivering an ownership
//!   token ([`LockToken`]) rather than a data guard.
//! - [`RwLock`] — a multi-reader/single-writer lock with writer-starvation
//!   avoidance and batched reader wake-ups.
//! - [`KeyedLock`] — one independent exclusive lock per key, holding memory
//!   only for keys that are currently held or contended.
//! - [`atomic_apply`] — a retrying compare-exchange helper for the integer
//!   atomics.
//!
//! # Acquisition modes
//!
//! Each lock exposes blocking (`lock`/`read`/`write`), bounded blocking
//! (`*_timeout`), non-blocking (`try_*`) and asynchronous (`*_async`,
//! `*_async_cancellable`) acquisition. Waiters of both kinds share one FIFO
//! queue per lock, so a parked thread and a pending future are served in
//! arrival order relative to each other.
//!
//! # Ownership tokens
//!
//! Acquisition yields a token owning the grant. Tokens release on drop and
//! expose an explicit, idempotent `release()`; exactly one release takes
//! effect per token. Because tokens are `'static` handles (not borrowing
//! guards), they can be sent across threads and outlive the call site that
//! acquired them.
//!
//! # Cancellation
//!
//! Async acquisition can be tied to a [`CancelToken`]. Firing it resolves
//! pending acquisitions to [`AcquireError::Cancelled`] and makes the release
//! path skip the cancelled waiter, so cancellation can never strand lock
//! ownership. A grant that already landed is unaffected.
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

mod atomic;
mod cancel;
mod error;
mod keyed;
mod mutex;
mod rwlock;
#[cfg(test)]
mod test_support;
mod waiter;

pub use atomic::{AtomicApply, atomic_apply};
pub use cancel::CancelToken;
pub use error::{AcquireError, ReleaseError};
pub use keyed::{KeyToken, KeyedLock, KeyedLockFuture};
pub use mutex::{ExclusiveLock, LockFuture, LockToken};
pub use rwlock::{RwFuture, RwLock, RwToken};
