//! Error types shared by every lock in the crate.
//!
//! The taxonomy is deliberately small:
//!
//! - [`AcquireError`]: a wait ended without the lock being granted, either
//!   because an external cancellation signal fired or because a blocking
//!   timeout expired.
//! - [`ReleaseError`]: a keyed release was issued for a key that holds no
//!   lock. This is a programming error, not a concurrency race.
//!
//! Internal races (a grant refused by a cancelled waiter) are absorbed by the
//! release path and never surface through these types.

/// Error returned when a lock acquisition ends without a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The cancellation signal fired before the lock was granted.
    Cancelled,
    /// The blocking wait timed out before the lock was granted.
    TimedOut,
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "lock acquisition cancelled"),
            Self::TimedOut => write!(f, "lock acquisition timed out"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Error returned when releasing a keyed lock fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseError {
    /// The key holds no lock and has no waiters.
    NotLocked,
}

impl std::fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLocked => write!(f, "released a key that is not locked"),
        }
    }
}

impl std::error::Error for ReleaseError {}
