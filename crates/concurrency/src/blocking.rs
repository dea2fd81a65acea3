//! Blocking retry support
//!
//! A transaction that calls `retry()` registers a [`RetryLatch`] on every
//! reference it read. Any commit that changes one of those references opens
//! the latch, waking the thread parked on it.
//!
//! References keep only `Weak` handles to latches, so a waiter that gave up
//! (timeout, abandoned attempt) does not keep its latch alive.

use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// One-shot wake-up signal for a blocked transaction
#[derive(Debug, Default)]
pub struct RetryLatch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl RetryLatch {
    /// Create a closed latch
    pub fn new() -> Arc<Self> {
        Arc::new(RetryLatch::default())
    }

    /// Open the latch and wake every waiter
    pub fn open(&self) {
        let mut open = self.open.lock();
        if !*open {
            *open = true;
            self.cond.notify_all();
        }
    }

    /// Whether the latch has been opened
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Block until the latch opens or `timeout` elapses.
    ///
    /// Returns `true` if the latch opened. Spurious wake-ups re-check the
    /// latch and keep waiting until the deadline.
    pub fn await_open(&self, timeout: Option<Duration>) -> bool {
        let mut open = self.open.lock();
        match timeout {
            None => {
                while !*open {
                    self.cond.wait(&mut open);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*open {
                    if self.cond.wait_until(&mut open, deadline).timed_out() {
                        return *open;
                    }
                }
                true
            }
        }
    }
}

/// Waiters registered on a single reference
#[derive(Debug, Default)]
pub(crate) struct WaiterList {
    latches: Mutex<Vec<Weak<RetryLatch>>>,
}

impl WaiterList {
    pub(crate) fn register(&self, latch: &Arc<RetryLatch>) {
        let mut latches = self.latches.lock();
        latches.retain(|w| w.strong_count() > 0);
        latches.push(Arc::downgrade(latch));
    }

    /// Open and drop every registered latch
    pub(crate) fn wake_all(&self) -> usize {
        let drained: Vec<_> = std::mem::take(&mut *self.latches.lock());
        let mut woken = 0;
        for latch in drained.iter().filter_map(Weak::upgrade) {
            latch.open();
            woken += 1;
        }
        woken
    }

    pub(crate) fn len(&self) -> usize {
        self.latches
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_open_before_wait_returns_immediately() {
        let latch = RetryLatch::new();
        latch.open();
        assert!(latch.is_open());
        assert!(latch.await_open(Some(Duration::from_millis(1))));
    }

    #[test]
    fn test_wait_times_out() {
        let latch = RetryLatch::new();
        let start = Instant::now();
        assert!(!latch.await_open(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_open_from_other_thread_wakes_waiter() {
        let latch = RetryLatch::new();
        let opener = Arc::clone(&latch);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            opener.open();
        });
        assert!(latch.await_open(None));
        handle.join().unwrap();
    }

    #[test]
    fn test_waiter_list_skips_dropped_latches() {
        let list = WaiterList::default();
        let kept = RetryLatch::new();
        {
            let dropped = RetryLatch::new();
            list.register(&dropped);
        }
        list.register(&kept);
        assert_eq!(list.len(), 1);
        assert_eq!(list.wake_all(), 1);
        assert!(kept.is_open());
        assert_eq!(list.len(), 0);
    }
}
