//! The worker-side API surface handed to the script host.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;
use url::Url;

use rustkit_common::TaskRunner;

use crate::client::{Client, ClientMatchOptions};
use crate::engine::JobsEngine;
use crate::promise::Promise;
use crate::worker::ServiceWorkerRecord;
use crate::{ServiceWorkerError, ServiceWorkerId};

/// Global scope of a running service worker.
///
/// Calls that reach the jobs engine are posted and return a [`Promise`] that
/// settles on the worker's own agent thread. None of them may be made while
/// the worker's main script is still being evaluated: the engine is blocked
/// waiting for that evaluation and they reject with `InvalidStateError`.
pub struct ServiceWorkerGlobalScope {
    worker: Weak<ServiceWorkerRecord>,
    worker_id: ServiceWorkerId,
    script_url: Url,
    engine: TaskRunner<JobsEngine>,
    agent: TaskRunner,
    started: AtomicBool,
    closing: AtomicBool,
}

impl ServiceWorkerGlobalScope {
    pub(crate) fn new(
        worker: &Arc<ServiceWorkerRecord>,
        engine: TaskRunner<JobsEngine>,
        agent: TaskRunner,
    ) -> Self {
        Self {
            worker: Arc::downgrade(worker),
            worker_id: worker.id(),
            script_url: worker.script_url().clone(),
            engine,
            agent,
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> ServiceWorkerId {
        self.worker_id
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    /// The agent's task runner.
    pub fn agent(&self) -> &TaskRunner {
        &self.agent
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// `importScripts()` for one classic script whose text the host already has.
    pub fn import_script(&self, url: &str, source: &str) -> Result<(), ServiceWorkerError> {
        let url = self
            .script_url
            .join(url)
            .map_err(|e| {
                ServiceWorkerError::type_error(format!("invalid import URL {}: {}", url, e))
            })?;
        let worker = self
            .worker
            .upgrade()
            .ok_or_else(|| ServiceWorkerError::invalid_state("service worker is gone"))?;
        worker.record_imported_script(url, source)
    }

    /// `skipWaiting()`.
    pub fn skip_waiting(&self) -> Promise<()> {
        self.post_to_engine("skipWaiting", |engine, worker, agent, promise| {
            engine.skip_waiting_sub_steps(worker, agent, promise)
        })
    }

    /// `clients.get(id)`.
    pub fn clients_get(&self, id: &str) -> Promise<Option<Client>> {
        let id = id.to_string();
        self.post_to_engine("clients.get", move |engine, worker, agent, promise| {
            engine.clients_get_sub_steps(worker, agent, promise, id)
        })
    }

    /// `clients.matchAll(options)`.
    pub fn clients_match_all(&self, options: ClientMatchOptions) -> Promise<Vec<Client>> {
        self.post_to_engine("clients.matchAll", move |engine, worker, agent, promise| {
            engine.clients_match_all_sub_steps(worker, agent, promise, options)
        })
    }

    /// `clients.claim()`.
    pub fn clients_claim(&self) -> Promise<()> {
        if let Some(worker) = self.worker.upgrade() {
            let is_active = worker
                .registration()
                .and_then(|registration| registration.active_worker())
                .map_or(false, |active| Arc::ptr_eq(&active, &worker));
            if !is_active {
                return Promise::rejected(ServiceWorkerError::invalid_state(
                    "clients.claim() requires an active service worker",
                ));
            }
        }
        self.post_to_engine("clients.claim", |engine, worker, agent, promise| {
            engine.claim_sub_steps(worker, agent, promise)
        })
    }

    fn post_to_engine<T, F>(&self, what: &'static str, task: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut JobsEngine, Arc<ServiceWorkerRecord>, TaskRunner, Promise<T>)
            + Send
            + 'static,
    {
        if !self.is_started() {
            debug!(worker = %self.worker_id, call = what, "Rejected while the worker is starting");
            return Promise::rejected(ServiceWorkerError::invalid_state(format!(
                "{}() is unavailable while the service worker is starting",
                what
            )));
        }
        if self.is_closing() {
            return Promise::rejected(ServiceWorkerError::invalid_state(format!(
                "{}() called on a closing service worker",
                what
            )));
        }
        let Some(worker) = self.worker.upgrade() else {
            return Promise::rejected(ServiceWorkerError::invalid_state("service worker is gone"));
        };

        let promise = Promise::new();
        let settle = promise.clone();
        let agent = self.agent.clone();
        if let Err(e) = self
            .engine
            .post_task(move |engine| task(engine, worker, agent, settle))
        {
            promise.reject(e.into());
        }
        promise
    }
}

impl fmt::Debug for ServiceWorkerGlobalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorkerGlobalScope")
            .field("worker", &self.worker_id)
            .field("script_url", &self.script_url.as_str())
            .field("started", &self.is_started())
            .field("closing", &self.is_closing())
            .finish()
    }
}
