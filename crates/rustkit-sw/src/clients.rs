//! Web context bookkeeping and the Clients API sub-steps.

use std::sync::Arc;
use tracing::{debug, error, trace};
use url::Url;

use rustkit_common::TaskRunner;

use crate::client::{Client, ClientMatchOptions, ClientType, ServiceWorkerRegistration};
use crate::context::WebContext;
use crate::engine::JobsEngine;
use crate::origin::StorageKey;
use crate::promise::Promise;
use crate::worker::ServiceWorkerRecord;
use crate::ServiceWorkerError;

/// Run `task` on the client's own loop. Returns false if the loop is gone.
pub(crate) fn post_to_client<F>(context: &Arc<WebContext>, task: F) -> bool
where
    F: FnOnce(&WebContext) + Send + 'static,
{
    let target = context.clone();
    match context.runner().post_task(move |_| task(&target)) {
        Ok(()) => true,
        Err(e) => {
            debug!(client = %context.id(), error = %e, "Client loop is gone");
            false
        }
    }
}

/// Settle `promise` on a worker's agent loop.
fn settle_on_agent<T: Send + 'static>(
    agent: &TaskRunner,
    promise: Promise<T>,
    outcome: Result<T, ServiceWorkerError>,
) {
    let settle = promise.clone();
    let posted = agent.post_task(move |_| match outcome {
        Ok(value) => {
            settle.resolve(value);
        }
        Err(error) => {
            settle.reject(error);
        }
    });
    if let Err(e) = posted {
        debug!(agent = %agent.name(), error = %e, "Worker agent is gone");
        promise.reject(e.into());
    }
}

fn worker_storage_key(worker: &ServiceWorkerRecord) -> StorageKey {
    worker
        .registration()
        .map(|registration| registration.storage_key().clone())
        .unwrap_or_else(|| StorageKey::from_url(worker.script_url()))
}

fn same_storage_key(context: &WebContext, storage_key: &StorageKey) -> bool {
    context.storage_key().origin().same_origin(storage_key.origin())
}

impl JobsEngine {
    // ==================== Web contexts ====================

    pub(crate) fn register_web_context(&mut self, context: Arc<WebContext>) {
        if self.web_contexts.iter().any(|known| Arc::ptr_eq(known, &context)) {
            error!(client = %context.id(), "Web context registered twice");
            debug_assert!(false, "web context registered twice");
            return;
        }
        self.contexts_cleared.reset();

        let registration = self
            .registration_map
            .match_registration(context.storage_key(), context.creation_url());
        if let Some(active) = registration.and_then(|registration| registration.active_worker()) {
            debug!(client = %context.id(), worker = %active.id(), "New client is controlled");
            context.set_active_service_worker(Some(active));
        }
        debug!(client = %context.id(), url = %context.creation_url(), "Web context registered");
        self.web_contexts.push(context);
    }

    pub(crate) fn unregister_web_context(&mut self, context: Arc<WebContext>) {
        let before = self.web_contexts.len();
        self.web_contexts.retain(|known| !Arc::ptr_eq(known, &context));
        if self.web_contexts.len() == before {
            error!(client = %context.id(), "Unregistering an unknown web context");
            debug_assert!(false, "unregistering an unknown web context");
        }
        debug!(
            client = %context.id(),
            remaining = self.web_contexts.len(),
            "Web context unregistered"
        );

        self.handle_client_unload(context.active_service_worker());
        if self.web_contexts.is_empty() {
            self.contexts_cleared.signal();
        }
    }

    /// Handle Service Worker Client Unload, given the departed client's controller.
    pub(crate) fn handle_client_unload(&mut self, controller: Option<Arc<ServiceWorkerRecord>>) {
        let Some(registration) = controller.and_then(|worker| worker.registration()) else {
            return;
        };
        if self.is_any_client_using_registration(&registration) {
            return;
        }
        trace!(registration = %registration.id(), "Last client of registration unloaded");
        if self.registration_map.is_unregistered(&registration) {
            self.try_clear_registration(&registration);
        }
        self.try_activate(&registration);
    }

    // ==================== Container sub-steps ====================

    pub(crate) fn get_registration_sub_steps(
        &mut self,
        context: Arc<WebContext>,
        client_url: Url,
        promise: Promise<Option<ServiceWorkerRegistration>>,
    ) {
        let registration = self
            .registration_map
            .match_registration(context.storage_key(), &client_url);
        trace!(
            client = %context.id(),
            url = %client_url,
            registration = ?registration.as_ref().map(|registration| registration.id()),
            "Get registration"
        );
        post_to_client(&context, move |context| {
            let wrapper = registration
                .map(|registration| context.get_service_worker_registration(&registration));
            promise.resolve(wrapper);
        });
    }

    pub(crate) fn maybe_resolve_ready_promise_sub_steps(&mut self, context: Arc<WebContext>) {
        let registration = self
            .registration_map
            .match_registration(context.storage_key(), context.creation_url());
        let Some(registration) =
            registration.filter(|registration| registration.active_worker().is_some())
        else {
            return;
        };
        post_to_client(&context, move |context| context.maybe_resolve_ready_promise(&registration));
    }

    // ==================== Global scope sub-steps ====================

    pub(crate) fn skip_waiting_sub_steps(
        &mut self,
        worker: Arc<ServiceWorkerRecord>,
        agent: TaskRunner,
        promise: Promise<()>,
    ) {
        debug!(worker = %worker.id(), "Skip waiting");
        worker.set_skip_waiting();
        if let Some(registration) = worker.registration() {
            self.try_activate(&registration);
        }
        settle_on_agent(&agent, promise, Ok(()));
    }

    pub(crate) fn clients_get_sub_steps(
        &mut self,
        worker: Arc<ServiceWorkerRecord>,
        agent: TaskRunner,
        promise: Promise<Option<Client>>,
        id: String,
    ) {
        let storage_key = worker_storage_key(&worker);
        let target = self
            .web_contexts
            .iter()
            .find(|context| same_storage_key(context, &storage_key) && context.id() == id)
            .cloned();
        trace!(worker = %worker.id(), %id, found = target.is_some(), "clients.get");

        let Some(target) = target else {
            settle_on_agent(&agent, promise, Ok(None));
            return;
        };
        if !target.is_window() {
            settle_on_agent(&agent, promise, Ok(Some(target.client_snapshot())));
            return;
        }

        let pending = promise.clone();
        let client_agent = agent.clone();
        let posted = post_to_client(&target, move |context| {
            settle_on_agent(&client_agent, promise, Ok(Some(context.client_snapshot())));
        });
        if !posted {
            settle_on_agent(&agent, pending, Ok(None));
        }
    }

    pub(crate) fn clients_match_all_sub_steps(
        &mut self,
        worker: Arc<ServiceWorkerRecord>,
        agent: TaskRunner,
        promise: Promise<Vec<Client>>,
        options: ClientMatchOptions,
    ) {
        let storage_key = worker_storage_key(&worker);
        let targets = self.web_contexts.iter().filter(|context| {
            same_storage_key(context, &storage_key)
                && (options.include_uncontrolled || context.is_controlled_by(&worker))
        });

        let want_windows = matches!(options.client_type, ClientType::Window | ClientType::All);
        let want_workers = matches!(options.client_type, ClientType::Worker | ClientType::All);
        let mut windows = Vec::new();
        let mut workers = Vec::new();
        for context in targets {
            match context.client_type() {
                ClientType::Window if want_windows => windows.push(context),
                ClientType::Worker if want_workers => workers.push(context),
                _ => {}
            }
        }
        windows.sort_by(|a, b| {
            b.focused()
                .cmp(&a.focused())
                .then(a.creation_order().cmp(&b.creation_order()))
        });
        workers.sort_by_key(|context| context.creation_order());

        let clients: Vec<Client> = windows
            .into_iter()
            .chain(workers)
            .map(|context| context.client_snapshot())
            .collect();
        trace!(worker = %worker.id(), matched = clients.len(), "clients.matchAll");
        settle_on_agent(&agent, promise, Ok(clients));
    }

    pub(crate) fn claim_sub_steps(
        &mut self,
        worker: Arc<ServiceWorkerRecord>,
        agent: TaskRunner,
        promise: Promise<()>,
    ) {
        let registration = worker
            .registration()
            .filter(|registration| {
                registration
                    .active_worker()
                    .map_or(false, |active| Arc::ptr_eq(&active, &worker))
            });
        let Some(registration) = registration else {
            settle_on_agent(
                &agent,
                promise,
                Err(ServiceWorkerError::invalid_state(
                    "clients.claim() requires an active service worker",
                )),
            );
            return;
        };
        debug!(worker = %worker.id(), registration = %registration.id(), "Claim");

        let storage_key = registration.storage_key().clone();
        for context in self.web_contexts.clone() {
            if !same_storage_key(&context, &storage_key) || context.is_controlled_by(&worker) {
                continue;
            }
            let matched = self
                .registration_map
                .match_registration(context.storage_key(), context.creation_url());
            if !matched.map_or(false, |matched| Arc::ptr_eq(&matched, &registration)) {
                continue;
            }
            let previous = context.active_service_worker();
            context.set_active_service_worker(Some(worker.clone()));
            self.notify_controller_change(&context);
            self.handle_client_unload(previous);
        }
        settle_on_agent(&agent, promise, Ok(()));
    }
}
