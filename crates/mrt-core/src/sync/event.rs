use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Result of waiting on an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
}

/// Auto- or manual-reset event.
///
/// A manual-reset event stays signaled until [`Event::reset`]; an
/// auto-reset event releases one waiter and clears itself.
///
/// This is the raw OS-style primitive. Runtime threads that may be in
/// cooperative mode wait through `Thread::wait_on`, which leaves
/// cooperative mode around the wait.
#[derive(Debug)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
    manual_reset: bool,
}

impl Event {
    #[must_use]
    pub const fn new_manual(initially_signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(initially_signaled),
            cond: Condvar::new(),
            manual_reset: true,
        }
    }

    #[must_use]
    pub const fn new_auto(initially_signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(initially_signaled),
            cond: Condvar::new(),
            manual_reset: false,
        }
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        if self.manual_reset {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Blocks until signaled or until `timeout` elapses (`None` waits forever).
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = self.signaled.lock();
        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() && !*signaled {
                        return WaitResult::TimedOut;
                    }
                }
                None => self.cond.wait(&mut signaled),
            }
        }
        if !self.manual_reset {
            *signaled = false;
        }
        WaitResult::Signaled
    }
}
