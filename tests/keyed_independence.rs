//! Per-key serialization, cross-key independence and memory behavior of the
//! keyed lock.

mod common;

use common::{init_test_logging, spawn_op};
use dualock::{KeyedLock, ReleaseError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                expected = ?$expected,
                actual = ?$actual,
                concat!("ASSERTION FAILED: ", $msg)
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

#[test]
fn operations_on_one_key_are_serialized() {
    init_test_logging();
    test_phase!("operations_on_one_key_are_serialized");

    const WORKERS: usize = 4;
    const ITERS: u64 = 200;

    let lock: KeyedLock<&str> = KeyedLock::new();
    let counter = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for _ in 0..WORKERS {
        let lock = lock.clone();
        let counter = Arc::clone(&counter);
        handles.push(thread::spawn(move || {
            for _ in 0..ITERS {
                let token = lock.lock("hot");
                let seen = counter.load(Ordering::Relaxed);
                thread::yield_now();
                counter.store(seen + 1, Ordering::Relaxed);
                token.release();
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let total = counter.load(Ordering::Relaxed);
    let expected = (WORKERS as u64) * ITERS;
    assert_with_log!(total == expected, "no lost updates on one key", expected, total);

    let remaining = lock.contended_keys();
    assert_with_log!(remaining == 0, "idle lock holds no entries", 0usize, remaining);
    test_complete!("operations_on_one_key_are_serialized");
}

#[test]
fn a_held_key_does_not_block_other_keys() {
    init_test_logging();
    test_phase!("a_held_key_does_not_block_other_keys");

    let lock: KeyedLock<u64> = KeyedLock::new();
    let holder = lock.lock(1);

    // Same key blocks.
    let same_key = lock.clone();
    let blocked = spawn_op(move || {
        let token = same_key.lock(1);
        token.release();
    });
    blocked.assert_blocked_for(Duration::from_millis(100));

    // Different key goes straight through.
    let other_key = lock.clone();
    let independent = spawn_op(move || {
        let token = other_key.lock(2);
        token.release();
    });
    let finished = independent.completes_within(Duration::from_secs(2));
    assert_with_log!(finished, "other key unaffected", true, finished);
    independent.join();

    holder.release();
    let unblocked = blocked.completes_within(Duration::from_secs(2));
    assert_with_log!(unblocked, "same key flows after release", true, unblocked);
    blocked.join();
    test_complete!("a_held_key_does_not_block_other_keys");
}

#[test]
fn entries_exist_only_while_held_or_contended() {
    init_test_logging();
    test_phase!("entries_exist_only_while_held_or_contended");

    let lock: KeyedLock<String> = KeyedLock::new();

    let alpha = lock.lock("alpha".to_owned());
    let beta = lock.lock("beta".to_owned());
    let during = lock.contended_keys();
    assert_with_log!(during == 2, "two keys tracked while held", 2usize, during);

    alpha.release();
    let after_one = lock.contended_keys();
    assert_with_log!(after_one == 1, "released key forgotten", 1usize, after_one);

    beta.release();
    let after_all = lock.contended_keys();
    assert_with_log!(after_all == 0, "idle lock empty", 0usize, after_all);
    test_complete!("entries_exist_only_while_held_or_contended");
}

#[test]
fn spurious_unlock_is_rejected_and_harmless() {
    init_test_logging();
    test_phase!("spurious_unlock_is_rejected_and_harmless");

    let lock: KeyedLock<u64> = KeyedLock::new();
    let outcome = lock.unlock(&7);
    let rejected = matches!(outcome, Err(ReleaseError::NotLocked));
    assert_with_log!(rejected, "unheld key refuses release", true, rejected);

    // The failed release must not have created state.
    let remaining = lock.contended_keys();
    assert_with_log!(remaining == 0, "no entry created", 0usize, remaining);

    // Normal operation is unaffected.
    let token = lock.lock(7);
    let unlocked = lock.unlock(&7).is_ok();
    assert_with_log!(unlocked, "low-level release works", true, unlocked);
    // The token was released out from under it; its drop must fail
    // harmlessly rather than disturb later holders.
    drop(token);
    let free = lock.try_lock(7).is_some();
    assert_with_log!(free, "key acquirable again", true, free);
    test_complete!("spurious_unlock_is_rejected_and_harmless");
}

#[test]
fn many_keys_in_flight_then_none() {
    init_test_logging();
    test_phase!("many_keys_in_flight_then_none");

    const KEYS: u64 = 32;

    let lock: KeyedLock<u64> = KeyedLock::new();
    let mut handles = Vec::new();
    for key in 0..KEYS {
        let lock = lock.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                let token = lock.lock(key);
                token.release();
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let remaining = lock.contended_keys();
    assert_with_log!(remaining == 0, "all entries reclaimed", 0usize, remaining);
    test_complete!("many_keys_in_flight_then_none");
}
