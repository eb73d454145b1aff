//! Blocking synchronisation helpers shared by the receive, transmit,
//! backend and timer threads.
//!
//! Every wait that can outlive a connection takes a [`CancelToken`] so a
//! torn-down connection never leaves a thread parked forever.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How often cancellable waits re-check their token
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Outcome of a bounded or cancellable wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
    Cancelled,
}

/// Cooperative stop flag observed by the connection threads
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Resettable completion signal
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Completion::default()
    }

    pub fn complete(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// Block until completed, cancelled, or the optional timeout elapses
    pub fn wait_cancellable(&self, timeout: Option<Duration>, cancel: &CancelToken) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut done = self.done.lock();
        loop {
            if *done {
                return WaitOutcome::Completed;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            let mut slice = CANCEL_POLL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return WaitOutcome::TimedOut;
                }
                slice = slice.min(deadline - now);
            }
            self.cond.wait_for(&mut done, slice);
        }
    }
}

/// Reference count whose drop to zero wakes waiters
///
/// Teardown waits for the count to drain before releasing the transport, so
/// callbacks running on other threads hold a [`UsageGuard`] while they touch
/// the owner.
#[derive(Debug, Default)]
pub struct UsageCount {
    count: Mutex<usize>,
    cond: Condvar,
}

impl UsageCount {
    pub fn new() -> Self {
        UsageCount::default()
    }

    pub fn hold(&self) -> UsageGuard<'_> {
        *self.count.lock() += 1;
        UsageGuard { usage: self }
    }

    fn release(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every guard has been dropped
    pub fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait_for(&mut count, CANCEL_POLL);
        }
    }
}

#[must_use = "the usage is released as soon as the guard is dropped"]
pub struct UsageGuard<'a> {
    usage: &'a UsageCount,
}

impl Drop for UsageGuard<'_> {
    fn drop(&mut self) {
        self.usage.release();
    }
}

/// Observable state cell
///
/// Writers publish transitions with [`Watch::set`]; other threads block in
/// [`Watch::wait_until`] until a predicate over the value holds. Connection
/// reinstatement uses this as its promise: the requester awaits the
/// `Closed` state that teardown publishes.
#[derive(Debug, Default)]
pub struct Watch<T> {
    value: Mutex<T>,
    cond: Condvar,
}

impl<T: Copy> Watch<T> {
    pub fn new(value: T) -> Self {
        Watch {
            value: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> T {
        *self.value.lock()
    }

    pub fn set(&self, value: T) {
        *self.value.lock() = value;
        self.cond.notify_all();
    }

    /// Apply `f` to the current value atomically and publish the result
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let r = f(&mut self.value.lock());
        self.cond.notify_all();
        r
    }

    /// Wait until `pred` holds; returns the last observed value and whether
    /// the predicate was satisfied before the timeout.
    pub fn wait_until(&self, mut pred: impl FnMut(&T) -> bool, timeout: Option<Duration>) -> (T, bool) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut value = self.value.lock();
        loop {
            if pred(&value) {
                return (*value, true);
            }
            let mut slice = CANCEL_POLL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return (*value, false);
                }
                slice = slice.min(deadline - now);
            }
            self.cond.wait_for(&mut value, slice);
        }
    }
}
