//! Waiter - a count-based wake/wait primitive.
//!
//! Wakes accumulate: a `wake()` that happens before the matching `wait()`
//! is not lost. `wait(n, timeout)` consumes `n` wakes.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Count-based synchronization primitive used by the `_s` convenience calls.
#[derive(Clone, Default)]
pub struct Waiter {
    inner: Arc<WaiterInner>,
}

#[derive(Default)]
struct WaiterInner {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one wake.
    pub fn wake(&self) {
        self.wake_n(1);
    }

    /// Add `n` wakes at once.
    pub fn wake_n(&self, n: usize) {
        let mut count = self.inner.count.lock().unwrap();
        *count += n;
        self.inner.cond.notify_all();
    }

    /// Block until `n` wakes have accumulated, consuming them.
    ///
    /// With a timeout, returns `Error::Timeout` and consumes nothing if the
    /// wakes do not arrive in time.
    pub fn wait(&self, n: usize, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.inner.count.lock().unwrap();
        while *count < n {
            match deadline {
                None => count = self.inner.cond.wait(count).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    count = self.inner.cond.wait_timeout(count, deadline - now).unwrap().0;
                }
            }
        }
        *count -= n;
        Ok(())
    }

    /// Number of wakes not yet consumed.
    pub fn pending(&self) -> usize {
        *self.inner.count.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wake_before_wait() {
        let w = Waiter::new();
        w.wake();
        w.wake();
        assert!(w.wait(2, Some(Duration::from_millis(10))).is_ok());
        assert_eq!(w.pending(), 0);
    }

    #[test]
    fn test_wait_timeout_consumes_nothing() {
        let w = Waiter::new();
        w.wake();
        let err = w.wait(2, Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_eq!(w.pending(), 1);
    }

    #[test]
    fn test_cross_thread_wake_n() {
        let w = Waiter::new();
        let w2 = w.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            w2.wake_n(3);
        });
        w.wait(3, Some(Duration::from_secs(5))).unwrap();
        h.join().unwrap();
    }
}
