//! Thread-safe promises settled from the engine or client sequences.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rustkit_common::LockExt;
use tracing::error;

use crate::client::ServiceWorkerRegistration;
use crate::ServiceWorkerError;

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

enum Settlement<T> {
    Pending,
    Fulfilled(T),
    Rejected(ServiceWorkerError),
}

struct Shared<T> {
    settlement: Mutex<Settlement<T>>,
    settled: Condvar,
}

/// A single-assignment result that can be settled from any thread and waited on.
///
/// Clones share the same underlying settlement.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                settlement: Mutex::new(Settlement::Pending),
                settled: Condvar::new(),
            }),
        }
    }

    /// A promise already rejected with `error`.
    pub fn rejected(error: ServiceWorkerError) -> Self {
        let promise = Self::new();
        promise.reject(error);
        promise
    }

    /// Fulfill the promise. Returns false if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Fulfilled(value))
    }

    /// Reject the promise. Returns false if it was already settled.
    pub fn reject(&self, error: ServiceWorkerError) -> bool {
        self.settle(Settlement::Rejected(error))
    }

    fn settle(&self, settlement: Settlement<T>) -> bool {
        let mut current = self.shared.settlement.lock_or_recover();
        if !matches!(*current, Settlement::Pending) {
            return false;
        }
        *current = settlement;
        self.shared.settled.notify_all();
        true
    }

    pub fn state(&self) -> PromiseState {
        match *self.shared.settlement.lock_or_recover() {
            Settlement::Pending => PromiseState::Pending,
            Settlement::Fulfilled(_) => PromiseState::Fulfilled,
            Settlement::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Clone> Promise<T> {
    /// A promise already fulfilled with `value`.
    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        promise.resolve(value);
        promise
    }

    /// The settled outcome, or `None` while pending.
    pub fn result(&self) -> Option<Result<T, ServiceWorkerError>> {
        Self::outcome(&self.shared.settlement.lock_or_recover())
    }

    /// Block until settled.
    ///
    /// Must not be called on the sequence that is expected to settle the promise.
    pub fn wait(&self) -> Result<T, ServiceWorkerError> {
        let mut settlement = self.shared.settlement.lock_or_recover();
        loop {
            if let Some(outcome) = Self::outcome(&settlement) {
                return outcome;
            }
            settlement = self
                .shared
                .settled
                .wait(settlement)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block until settled or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, ServiceWorkerError>> {
        let deadline = Instant::now() + timeout;
        let mut settlement = self.shared.settlement.lock_or_recover();
        loop {
            if let Some(outcome) = Self::outcome(&settlement) {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .settled
                .wait_timeout(settlement, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            settlement = guard;
        }
    }

    fn outcome(settlement: &Settlement<T>) -> Option<Result<T, ServiceWorkerError>> {
        match settlement {
            Settlement::Pending => None,
            Settlement::Fulfilled(value) => Some(Ok(value.clone())),
            Settlement::Rejected(error) => Some(Err(error.clone())),
        }
    }
}

/// The promise a job settles: unregister jobs produce a boolean, register and
/// update jobs produce a registration.
#[derive(Debug, Clone)]
pub enum JobPromise {
    Bool(Promise<bool>),
    Registration(Promise<ServiceWorkerRegistration>),
}

impl JobPromise {
    pub fn state(&self) -> PromiseState {
        match self {
            JobPromise::Bool(promise) => promise.state(),
            JobPromise::Registration(promise) => promise.state(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    pub fn resolve_bool(&self, value: bool) {
        match self {
            JobPromise::Bool(promise) => {
                promise.resolve(value);
            }
            JobPromise::Registration(_) => {
                error!("Boolean resolution of a registration promise");
                debug_assert!(false, "boolean resolution of a registration promise");
            }
        }
    }

    pub fn resolve_registration(&self, registration: ServiceWorkerRegistration) {
        match self {
            JobPromise::Registration(promise) => {
                promise.resolve(registration);
            }
            JobPromise::Bool(_) => {
                error!("Registration resolution of a boolean promise");
                debug_assert!(false, "registration resolution of a boolean promise");
            }
        }
    }

    pub fn reject(&self, error: ServiceWorkerError) {
        match self {
            JobPromise::Bool(promise) => {
                promise.reject(error);
            }
            JobPromise::Registration(promise) => {
                promise.reject(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_settles_once() {
        let promise = Promise::new();
        assert!(promise.is_pending());
        assert!(promise.resolve(1));
        assert!(!promise.resolve(2));
        assert!(!promise.reject(ServiceWorkerError::type_error("late")));
        assert_eq!(promise.result(), Some(Ok(1)));
        assert_eq!(promise.state(), PromiseState::Fulfilled);
    }

    #[test]
    fn test_wait_for_other_thread() {
        let promise: Promise<&'static str> = Promise::new();
        let settler = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            settler.reject(ServiceWorkerError::security("denied"));
        });
        let outcome = promise.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, Err(ServiceWorkerError::security("denied")));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_while_pending() {
        let promise: Promise<bool> = Promise::new();
        assert!(promise.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_job_promise_bool() {
        let promise = Promise::new();
        let job_promise = JobPromise::Bool(promise.clone());
        assert!(job_promise.is_pending());
        job_promise.resolve_bool(true);
        assert_eq!(promise.result(), Some(Ok(true)));
        assert_eq!(job_promise.state(), PromiseState::Fulfilled);
    }
}
