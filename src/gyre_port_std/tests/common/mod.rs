//! Utilities shared by the kernel tests.
#![allow(dead_code)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Tracks a linear sequence of checkpoints spread across activities. Each
/// participant asserts the step it expects and installs the next one, so any
/// ordering violation panics right where it happens.
pub struct SeqTracker {
    counter: AtomicUsize,
}

impl SeqTracker {
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    #[track_caller]
    pub fn expect_and_replace(&self, expected: usize, new: usize) {
        let result =
            self.counter
                .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst);
        assert!(
            result.is_ok(),
            "expected checkpoint {expected}, but the tracker was at {result:?}"
        );
    }
}

/// How long the host side waits for the simulated system before declaring a
/// hang.
pub const DEADLINE: Duration = Duration::from_secs(10);

/// Poll (from the host side) until `cond` holds.
#[track_caller]
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !cond() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for: {what} (an activity may have panicked; check the output)"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// An append-only event log shared between activities and the host.
pub struct EventLog {
    events: std::sync::Mutex<Vec<&'static str>>,
}

impl EventLog {
    pub const fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}
