//! Synchronization primitives shared across sequences.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub trait LockExt<T> {
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> LockExt<T> for Mutex<T> {
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// How a [`WaitableEvent`] behaves after releasing a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Stays signaled until [`WaitableEvent::reset`] is called.
    Manual,
    /// Resets after releasing a single waiter.
    Automatic,
}

/// A signal that one thread can wait on and another can raise.
#[derive(Debug)]
pub struct WaitableEvent {
    policy: ResetPolicy,
    signaled: Mutex<bool>,
    cvar: Condvar,
}

impl WaitableEvent {
    pub fn new(policy: ResetPolicy, initially_signaled: bool) -> Self {
        Self {
            policy,
            signaled: Mutex::new(initially_signaled),
            cvar: Condvar::new(),
        }
    }

    /// Raise the signal, waking waiters.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock_or_recover();
        *signaled = true;
        match self.policy {
            ResetPolicy::Manual => self.cvar.notify_all(),
            ResetPolicy::Automatic => self.cvar.notify_one(),
        }
    }

    /// Clear the signal.
    pub fn reset(&self) {
        *self.signaled.lock_or_recover() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock_or_recover()
    }

    /// Block until signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock_or_recover();
        while !*signaled {
            signaled = self
                .cvar
                .wait(signaled)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if self.policy == ResetPolicy::Automatic {
            *signaled = false;
        }
    }

    /// Block until signaled or `timeout` elapses. Returns whether the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock_or_recover();
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cvar
                .wait_timeout(signaled, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            signaled = guard;
        }
        if self.policy == ResetPolicy::Automatic {
            *signaled = false;
        }
        true
    }
}
