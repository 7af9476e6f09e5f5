//! Shared test logging and timing probes.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Installs the test subscriber once per process.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .try_init();
    });
}

/// An operation running on its own thread, with a completion flag the test
/// can probe without joining.
pub struct PendingOp {
    done: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Spawns `op` on a fresh thread. The returned probe observes when the whole
/// closure has finished.
pub fn spawn_op<F>(op: F) -> PendingOp
where
    F: FnOnce() + Send + 'static,
{
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let handle = thread::spawn(move || {
        op();
        flag.store(true, Ordering::Release);
    });
    PendingOp { done, handle }
}

impl PendingOp {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Asserts the operation is still blocked after `duration` has elapsed.
    pub fn assert_blocked_for(&self, duration: Duration) {
        thread::sleep(duration);
        assert!(
            !self.is_done(),
            "operation completed although it should still be blocked"
        );
    }

    /// Polls the completion flag until it is set or `duration` elapses.
    pub fn completes_within(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.is_done()
    }

    pub fn join(self) {
        self.handle.join().expect("probed operation panicked");
    }
}

/// Spins until `flag` is set. Used to await the true start of an operation:
/// the operation sets the flag right before its blocking call.
pub fn await_flag(flag: &Arc<AtomicBool>) {
    while !flag.load(Ordering::Acquire) {
        thread::yield_now();
    }
}
