//! Install, activate, clear and terminate, plus the broadcasts that keep
//! client-visible objects in step with the engine's records.

use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::client::ServiceWorkerEvent;
use crate::clients::post_to_client;
use crate::context::WebContext;
use crate::engine::JobsEngine;
use crate::job::Job;
use crate::jobs::JobValue;
use crate::origin::Origin;
use crate::registration::{RegistrationRecord, RegistrationSlot};
use crate::worker::{LifecycleEvent, ServiceWorkerRecord};
use crate::{ServiceWorkerState, UpdateViaCache};

const SLOTS: [RegistrationSlot; 3] = [
    RegistrationSlot::Installing,
    RegistrationSlot::Waiting,
    RegistrationSlot::Active,
];

impl JobsEngine {
    /// Run Service Worker. Returns the start status, or `None` on failure.
    ///
    /// Blocks the engine sequence until the worker's agent has evaluated the
    /// main script.
    pub(crate) fn run_service_worker(
        &self,
        worker: &Arc<ServiceWorkerRecord>,
        force_bypass_cache: bool,
    ) -> Option<String> {
        if worker.is_running() {
            return worker.start_status();
        }
        if worker.state() == ServiceWorkerState::Redundant {
            debug!(worker = %worker.id(), "Not starting a redundant worker");
            return None;
        }
        trace!(worker = %worker.id(), force_bypass_cache, "Starting worker");
        worker.start(
            self.script_host.clone(),
            self.runner.clone(),
            self.config.worker_start_timeout(),
        )
    }

    // ==================== Install ====================

    pub(crate) fn install(
        &mut self,
        job: Arc<Job>,
        worker: Arc<ServiceWorkerRecord>,
        registration: Arc<RegistrationRecord>,
    ) {
        debug!(job = %job.id, worker = %worker.id(), registration = %registration.id(), "Install");
        let newest_worker = registration.newest_worker();

        self.update_registration_cache_mode(&registration, job.update_via_cache);
        self.update_registration_state(
            &registration,
            RegistrationSlot::Installing,
            Some(worker.clone()),
        );
        self.update_worker_state(&worker, ServiceWorkerState::Installing);
        self.resolve_job_promise(&job, JobValue::Registration(registration.clone()));

        let scope_origin = Origin::from_url(registration.scope_url());
        let registration_id = registration.id();
        for context in self.web_contexts.iter().filter(|c| c.origin().same_origin(&scope_origin)) {
            post_to_client(context, move |context| {
                if context.lookup_service_worker_registration(registration_id).is_some() {
                    context.dispatch_event(ServiceWorkerEvent::UpdateFound {
                        registration: registration_id,
                    });
                }
            });
        }

        let mut install_failed = false;
        if !self.should_skip_event(LifecycleEvent::Install, &worker) {
            if self.run_service_worker(&worker, job.force_bypass_cache).is_none() {
                install_failed = true;
            } else if let Err(e) =
                worker.dispatch_lifecycle_event(self.script_host.clone(), LifecycleEvent::Install)
            {
                warn!(worker = %worker.id(), error = %e, "Install handler failed");
            }
        }

        if install_failed {
            debug!(job = %job.id, worker = %worker.id(), "Install failed");
            self.update_worker_state(&worker, ServiceWorkerState::Redundant);
            self.update_registration_state(&registration, RegistrationSlot::Installing, None);
            if newest_worker.is_none() {
                self.registration_map
                    .remove(registration.storage_key(), registration.scope_url());
            }
            self.finish_job(&job);
            return;
        }

        worker.purge_script_resource_map();
        if let Some(waiting) = registration.waiting_worker() {
            self.update_worker_state(&waiting, ServiceWorkerState::Redundant);
            self.terminate_service_worker(&waiting);
        }
        self.update_registration_state(
            &registration,
            RegistrationSlot::Waiting,
            Some(worker.clone()),
        );
        self.update_registration_state(&registration, RegistrationSlot::Installing, None);
        self.update_worker_state(&worker, ServiceWorkerState::Installed);
        self.finish_job(&job);
        self.try_activate(&registration);
    }

    // ==================== Activate ====================

    pub(crate) fn try_activate(&mut self, registration: &Arc<RegistrationRecord>) {
        let Some(waiting) = registration.waiting_worker() else {
            return;
        };
        let active = registration.active_worker();
        if active
            .as_ref()
            .map_or(false, |active| active.state() == ServiceWorkerState::Activating)
        {
            return;
        }

        let invoke = match &active {
            None => true,
            Some(active) => {
                (self.has_no_pending_events(active)
                    && !self.is_any_client_using_registration(registration))
                    || waiting.skip_waiting()
            }
        };
        trace!(registration = %registration.id(), invoke, "Try activate");
        if invoke {
            self.activate(registration);
        }
    }

    pub(crate) fn activate(&mut self, registration: &Arc<RegistrationRecord>) {
        let Some(worker) = registration.waiting_worker() else {
            return;
        };
        debug!(registration = %registration.id(), worker = %worker.id(), "Activate");

        if let Some(active) = registration.active_worker() {
            self.update_worker_state(&active, ServiceWorkerState::Redundant);
            self.terminate_service_worker(&active);
        }
        self.update_registration_state(
            registration,
            RegistrationSlot::Active,
            Some(worker.clone()),
        );
        self.update_registration_state(registration, RegistrationSlot::Waiting, None);
        self.update_worker_state(&worker, ServiceWorkerState::Activating);

        for context in &self.web_contexts {
            let matched = self
                .registration_map
                .match_registration(context.storage_key(), context.creation_url());
            if matched.map_or(false, |matched| Arc::ptr_eq(&matched, registration)) {
                let registration = registration.clone();
                post_to_client(context, move |context| {
                    context.maybe_resolve_ready_promise(&registration)
                });
            }
        }

        for context in &self.web_contexts {
            if context.is_using_registration(registration) && !context.is_controlled_by(&worker) {
                context.set_active_service_worker(Some(worker.clone()));
                self.notify_controller_change(context);
            }
        }

        if !self.should_skip_event(LifecycleEvent::Activate, &worker)
            && self.run_service_worker(&worker, false).is_some()
        {
            let host = self.script_host.clone();
            if let Err(e) = worker.dispatch_lifecycle_event(host, LifecycleEvent::Activate) {
                warn!(worker = %worker.id(), error = %e, "Activate handler failed");
            }
        }
        self.update_worker_state(&worker, ServiceWorkerState::Activated);
    }

    pub(crate) fn notify_controller_change(&self, context: &Arc<WebContext>) {
        let controller = context.active_service_worker().map(|worker| worker.id());
        trace!(client = %context.id(), ?controller, "Controller change");
        post_to_client(context, move |context| {
            context.dispatch_event(ServiceWorkerEvent::ControllerChange { controller });
        });
    }

    // ==================== Clear ====================

    pub(crate) fn clear_registration(&self, registration: &Arc<RegistrationRecord>) {
        debug!(
            registration = %registration.id(),
            scope = %registration.scope_url(),
            "Clear registration"
        );
        for slot in SLOTS {
            if let Some(worker) = registration.worker(slot) {
                self.update_worker_state(&worker, ServiceWorkerState::Redundant);
                self.terminate_service_worker(&worker);
                self.update_registration_state(registration, slot, None);
            }
        }
    }

    pub(crate) fn try_clear_registration(&self, registration: &Arc<RegistrationRecord>) {
        if self.is_any_client_using_registration(registration) {
            trace!(registration = %registration.id(), "Registration still in use");
            return;
        }
        let busy = SLOTS
            .iter()
            .filter_map(|slot| registration.worker(*slot))
            .any(|worker| !self.has_no_pending_events(&worker));
        if busy {
            return;
        }
        self.clear_registration(registration);
    }

    pub(crate) fn is_any_client_using_registration(
        &self,
        registration: &Arc<RegistrationRecord>,
    ) -> bool {
        self.web_contexts
            .iter()
            .any(|context| context.is_using_registration(registration))
    }

    // ==================== Broadcasts ====================

    /// Set the worker's state and post `statechange` to same-origin clients.
    pub(crate) fn update_worker_state(
        &self,
        worker: &Arc<ServiceWorkerRecord>,
        state: ServiceWorkerState,
    ) {
        if state == ServiceWorkerState::Parsed {
            error!(worker = %worker.id(), "Broadcasting the parsed state");
            debug_assert!(false, "parsed is never broadcast");
            return;
        }
        if !worker.set_state(state) {
            return;
        }
        debug!(worker = %worker.id(), %state, "Worker state changed");

        let worker_origin = Origin::from_url(worker.script_url());
        let worker_id = worker.id();
        for context in self
            .web_contexts
            .iter()
            .filter(|context| context.origin().same_origin(&worker_origin))
        {
            post_to_client(context, move |context| {
                if let Some(wrapper) = context.lookup_service_worker(worker_id) {
                    if wrapper.advance_state(state) {
                        context.dispatch_event(ServiceWorkerEvent::StateChange {
                            worker: worker_id,
                            state,
                        });
                    }
                }
            });
        }
    }

    /// Set a registration slot and post the new value to every client's wrapper.
    pub(crate) fn update_registration_state(
        &self,
        registration: &Arc<RegistrationRecord>,
        slot: RegistrationSlot,
        worker: Option<Arc<ServiceWorkerRecord>>,
    ) {
        trace!(
            registration = %registration.id(),
            ?slot,
            worker = ?worker.as_ref().map(|worker| worker.id()),
            "Registration slot changed"
        );
        registration.set_worker(slot, worker.clone());

        let registration_id = registration.id();
        for context in &self.web_contexts {
            let worker = worker.clone();
            post_to_client(context, move |context| {
                if let Some(wrapper) = context.lookup_service_worker_registration(registration_id) {
                    let worker = worker.as_ref().map(|worker| context.get_service_worker(worker));
                    wrapper.set_slot(slot, worker);
                }
            });
        }
    }

    /// Set a registration's cache mode and post it to every client's wrapper.
    pub(crate) fn update_registration_cache_mode(
        &self,
        registration: &Arc<RegistrationRecord>,
        mode: UpdateViaCache,
    ) {
        if registration.update_via_cache() == mode {
            return;
        }
        trace!(registration = %registration.id(), ?mode, "Registration cache mode changed");
        registration.set_update_via_cache(mode);

        let registration_id = registration.id();
        for context in &self.web_contexts {
            post_to_client(context, move |context| {
                if let Some(wrapper) = context.lookup_service_worker_registration(registration_id) {
                    wrapper.set_update_via_cache(mode);
                }
            });
        }
    }

    // ==================== Terminate ====================

    pub(crate) fn terminate_service_worker(&self, worker: &Arc<ServiceWorkerRecord>) {
        debug!(worker = %worker.id(), running = worker.is_running(), "Terminate worker");
        if let Some(scope) = worker.global_scope() {
            scope.set_closing();
        }
        let worker_id = worker.id();
        for context in &self.web_contexts {
            post_to_client(context, move |context| context.remove_service_worker(worker_id));
        }
        worker.abort();
    }

    /// Event-skipping is not implemented; every lifecycle event is dispatched.
    pub(crate) fn should_skip_event(
        &self,
        _event: LifecycleEvent,
        _worker: &ServiceWorkerRecord,
    ) -> bool {
        false
    }

    /// Extended lifetimes (`waitUntil`) are not tracked, so a worker never has
    /// pending events.
    pub(crate) fn has_no_pending_events(&self, _worker: &ServiceWorkerRecord) -> bool {
        true
    }

    // ==================== Shutdown ====================

    pub(crate) fn handle_user_agent_shutdown(&mut self) {
        info!(registrations = self.registration_map.len(), "User agent shutdown");
        let registrations: Vec<_> = self.registration_map.iter().cloned().collect();
        for registration in &registrations {
            let installing = registration.installing_worker();
            if installing.is_some()
                && registration.waiting_worker().is_none()
                && registration.active_worker().is_none()
            {
                self.clear_registration(registration);
                continue;
            }
            if let Some(installing) = installing {
                self.update_worker_state(&installing, ServiceWorkerState::Redundant);
                self.terminate_service_worker(&installing);
                self.update_registration_state(registration, RegistrationSlot::Installing, None);
            }
            if registration.waiting_worker().is_some() {
                self.activate(registration);
            }
        }

        for registration in self.registration_map.drain() {
            for slot in SLOTS {
                if let Some(worker) = registration.worker(slot) {
                    if worker.is_running() {
                        self.terminate_service_worker(&worker);
                    }
                }
            }
        }
        self.job_queues.clear();
        self.pending_updates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::InMemoryScriptLoader;
    use crate::origin::StorageKey;
    use crate::worker::{NoopScriptHost, ScriptResourceMap};
    use crate::{JobsConfig, ServiceWorkerJobs, UpdateViaCache, WorkerType};
    use url::Url;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn jobs() -> ServiceWorkerJobs {
        ServiceWorkerJobs::spawn(
            JobsConfig::default(),
            Arc::new(InMemoryScriptLoader::new().unwrap()),
            Arc::new(NoopScriptHost),
        )
        .unwrap()
    }

    fn worker_for(registration: &Arc<RegistrationRecord>) -> Arc<ServiceWorkerRecord> {
        let mut map = ScriptResourceMap::new();
        map.insert(url("https://example.com/sw.js"), "main".to_string());
        Arc::new(ServiceWorkerRecord::new(
            url("https://example.com/sw.js"),
            WorkerType::Classic,
            registration,
            map,
        ))
    }

    #[test]
    fn test_activate_promotes_waiting_worker() {
        let jobs = jobs();
        let states = jobs
            .runner()
            .post_blocking_task(|engine| {
                let key = StorageKey::from_url(&url("https://example.com/"));
                let registration = engine
                    .registration_map
                    .set(key, url("https://example.com/"), UpdateViaCache::Imports);
                let worker = worker_for(&registration);
                engine.update_registration_state(
                    &registration,
                    RegistrationSlot::Waiting,
                    Some(worker.clone()),
                );
                engine.update_worker_state(&worker, ServiceWorkerState::Installed);
                engine.try_activate(&registration);
                (
                    registration.waiting_worker().is_none(),
                    registration.active_worker().map(|active| Arc::ptr_eq(&active, &worker)),
                    worker.state(),
                    worker.is_running(),
                )
            })
            .unwrap();
        assert_eq!(states, (true, Some(true), ServiceWorkerState::Activated, true));
    }

    #[test]
    fn test_clear_registration_makes_workers_redundant() {
        let jobs = jobs();
        let cleared = jobs
            .runner()
            .post_blocking_task(|engine| {
                let key = StorageKey::from_url(&url("https://example.com/"));
                let registration = engine
                    .registration_map
                    .set(key, url("https://example.com/"), UpdateViaCache::Imports);
                let worker = worker_for(&registration);
                engine.update_registration_state(
                    &registration,
                    RegistrationSlot::Active,
                    Some(worker.clone()),
                );
                engine.try_clear_registration(&registration);
                (registration.active_worker().is_none(), worker.state())
            })
            .unwrap();
        assert_eq!(cleared, (true, ServiceWorkerState::Redundant));
    }

    #[test]
    fn test_redundant_worker_does_not_run() {
        let jobs = jobs();
        let started = jobs
            .runner()
            .post_blocking_task(|engine| {
                let key = StorageKey::from_url(&url("https://example.com/"));
                let registration = engine
                    .registration_map
                    .set(key, url("https://example.com/"), UpdateViaCache::Imports);
                let worker = worker_for(&registration);
                worker.set_state(ServiceWorkerState::Redundant);
                engine.run_service_worker(&worker, false)
            })
            .unwrap();
        assert!(started.is_none());
    }

    #[test]
    fn test_shutdown_empties_the_map() {
        let jobs = jobs();
        let remaining = jobs
            .runner()
            .post_blocking_task(|engine| {
                let key = StorageKey::from_url(&url("https://example.com/"));
                let registration = engine
                    .registration_map
                    .set(key, url("https://example.com/"), UpdateViaCache::Imports);
                let worker = worker_for(&registration);
                engine.update_registration_state(
                    &registration,
                    RegistrationSlot::Installing,
                    Some(worker.clone()),
                );
                engine.handle_user_agent_shutdown();
                (engine.registration_map.len(), worker.state())
            })
            .unwrap();
        assert_eq!(remaining, (0, ServiceWorkerState::Redundant));
    }
}
