//! Lock-free apply-a-function helper for the integer atomics.
//!
//! [`atomic_apply`] replaces the value at an atomic location with `f(value)`
//! as if no other writer intervened, by retrying a `compare_exchange_weak`
//! loop until the swap lands. The same retry idiom underpins the release
//! protocol of every lock in this crate.
//!
//! `f` may be invoked several times for one logical call and must therefore
//! be pure: no observable side effects beyond its return value.

use std::sync::atomic::{
    AtomicI32, AtomicI64, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

/// Integer atomics that support the retrying apply loop.
pub trait AtomicApply {
    /// The plain integer type stored at the location.
    type Value: Copy;

    /// Atomically replaces the stored value `v` with `f(v)`, returning the
    /// new value. Spins on contention; never blocks a thread.
    fn apply<F>(&self, f: F) -> Self::Value
    where
        F: Fn(Self::Value) -> Self::Value;
}

macro_rules! impl_atomic_apply {
    ($($atomic:ty => $value:ty),* $(,)?) => {
        $(
            impl AtomicApply for $atomic {
                type Value = $value;

                fn apply<F>(&self, f: F) -> Self::Value
                where
                    F: Fn(Self::Value) -> Self::Value,
                {
                    let mut current = self.load(Ordering::Acquire);
                    loop {
                        let next = f(current);
                        match self.compare_exchange_weak(
                            current,
                            next,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => return next,
                            Err(observed) => current = observed,
                        }
                    }
                }
            }
        )*
    };
}

impl_atomic_apply! {
    AtomicI32 => i32,
    AtomicI64 => i64,
    AtomicIsize => isize,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
}

/// Atomically replaces the value at `location` with `f(value)` and returns
/// the new value.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::AtomicU64;
/// use dualock::atomic_apply;
///
/// let counter = AtomicU64::new(41);
/// assert_eq!(atomic_apply(&counter, |v| v + 1), 42);
/// ```
pub fn atomic_apply<A, F>(location: &A, f: F) -> A::Value
where
    A: AtomicApply,
    F: Fn(A::Value) -> A::Value,
{
    location.apply(f)
}
