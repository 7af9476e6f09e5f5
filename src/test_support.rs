//! Shared logging setup and structured assertion macros for unit tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the test subscriber once per process. Safe to call from every
/// test; later calls are no-ops.
pub(crate) fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .try_init();
    });
}

/// Marks the start of a test in the structured log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Marks the successful end of a test in the structured log.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Asserts a condition, logging expected/actual values on failure before
/// panicking so the structured log carries the mismatch.
#[macro_export]
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
