//! Job scheduling and the Register, Update and Unregister algorithms.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};
use url::Url;

use rustkit_common::LockExt;

use crate::context::WebContext;
use crate::engine::JobsEngine;
use crate::job::{Job, JobId, JobQueue, JobType, Scheduled};
use crate::loader::{LoadTarget, ScriptRequest, ScriptSink};
use crate::origin::{is_potentially_trustworthy, Origin};
use crate::promise::JobPromise;
use crate::registration::RegistrationRecord;
use crate::worker::{ScriptResourceMap, ServiceWorkerRecord};
use crate::{ServiceWorkerError, UpdateViaCache};

/// Bookkeeping for one Update while its fetches are outstanding.
pub(crate) struct UpdateJobState {
    pub job: Arc<Job>,
    pub registration: Arc<RegistrationRecord>,
    pub newest_worker: Option<Arc<ServiceWorkerRecord>>,
    pub updated_resource_map: ScriptResourceMap,
    pub has_updated_resources: bool,
    /// Imported-script fetches still in flight.
    pub pending_imports: usize,
}

/// Value a job resolves with.
#[derive(Clone)]
pub(crate) enum JobValue {
    Bool(bool),
    Registration(Arc<RegistrationRecord>),
}

#[derive(Clone)]
enum JobOutcome {
    Resolved(JobValue),
    Rejected(ServiceWorkerError),
}

impl JobsEngine {
    // ==================== Scheduling ====================

    pub(crate) fn schedule_job(&mut self, job: Arc<Job>) {
        let scope = job.scope_url.as_str().to_string();
        let queue = self
            .job_queues
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(JobQueue::new(scope)))
            .clone();

        match queue.coalesce_or_enqueue(job.clone()) {
            Scheduled::Started => {
                debug!(job = %job.id, kind = %job.job_type, scope = %job.scope_url, "Job started");
                self.run_job(&queue);
            }
            Scheduled::Queued => {
                debug!(
                    job = %job.id,
                    kind = %job.job_type,
                    scope = %job.scope_url,
                    queued = queue.len(),
                    "Job queued"
                );
            }
            Scheduled::Coalesced => {
                debug!(
                    job = %job.id,
                    kind = %job.job_type,
                    scope = %job.scope_url,
                    "Job coalesced into pending equivalent"
                );
            }
        }
    }

    fn run_job(&self, queue: &Arc<JobQueue>) {
        let queue = queue.clone();
        if let Err(e) = self.runner.post_task(move |engine| engine.run_job_task(queue)) {
            warn!(error = %e, "Engine stopped before the job could run");
        }
    }

    fn run_job_task(&mut self, queue: Arc<JobQueue>) {
        let Some(job) = queue.first_item() else {
            error!(scope = %queue.scope(), "Running an empty job queue");
            debug_assert!(false, "running an empty job queue");
            return;
        };
        trace!(job = %job.id, kind = %job.job_type, "Running job");
        match job.job_type {
            JobType::Register => self.register(job),
            JobType::Update => self.update(job),
            JobType::Unregister => self.unregister(job),
        }
    }

    /// Dequeue `job`, which must be at the front of its queue, and run the next one.
    pub(crate) fn finish_job(&mut self, job: &Arc<Job>) {
        let scope = job.scope_url.as_str();
        let Some(queue) = self.job_queues.get(scope).cloned() else {
            error!(job = %job.id, %scope, "Finishing a job without a queue");
            debug_assert!(false, "finishing a job without a queue");
            return;
        };
        match queue.first_item() {
            Some(first) if Arc::ptr_eq(&first, job) => {}
            _ => {
                error!(job = %job.id, %scope, "Finishing a job that is not running");
                debug_assert!(false, "finishing a job that is not running");
                return;
            }
        }

        queue.dequeue();
        debug!(job = %job.id, kind = %job.job_type, %scope, "Job finished");
        if queue.is_empty() {
            self.job_queues.remove(scope);
        } else {
            self.run_job(&queue);
        }
    }

    // ==================== Register ====================

    fn register(&mut self, job: Arc<Job>) {
        let Some(script_url) = job.script_url.clone() else {
            error!(job = %job.id, "Register job without a script URL");
            self.reject_job_promise(&job, ServiceWorkerError::type_error("missing script URL"));
            self.finish_job(&job);
            return;
        };
        debug!(job = %job.id, scope = %job.scope_url, script = %script_url, "Register");

        if !is_potentially_trustworthy(&script_url, &self.config.trusted_schemes) {
            self.reject_job_promise(
                &job,
                ServiceWorkerError::security(
                    "Service Worker Register failed: Script URL is Not Trusted.",
                ),
            );
            self.finish_job(&job);
            return;
        }

        let referrer_origin = job.referrer.as_ref().map(Origin::from_url);
        let same_as_referrer = |url: &Url| {
            referrer_origin
                .as_ref()
                .map_or(false, |referrer| Origin::from_url(url).same_origin(referrer))
        };
        if !same_as_referrer(&script_url) {
            self.reject_job_promise(
                &job,
                ServiceWorkerError::security(
                    "Service Worker Register failed: Script URL and referrer origin are not the same.",
                ),
            );
            self.finish_job(&job);
            return;
        }
        if !same_as_referrer(&job.scope_url) {
            self.reject_job_promise(
                &job,
                ServiceWorkerError::security(
                    "Service Worker Register failed: Scope URL and referrer origin are not the same.",
                ),
            );
            self.finish_job(&job);
            return;
        }

        match self.registration_map.get(&job.storage_key, &job.scope_url) {
            Some(registration) => {
                let unchanged = registration
                    .newest_worker()
                    .map_or(false, |newest| newest.script_url() == &script_url);
                if unchanged {
                    debug!(
                        job = %job.id,
                        registration = %registration.id(),
                        "Already registered with this script"
                    );
                    self.resolve_job_promise(&job, JobValue::Registration(registration));
                    self.finish_job(&job);
                    return;
                }
            }
            None => {
                self.registration_map
                    .set(job.storage_key.clone(), job.scope_url.clone(), job.update_via_cache);
            }
        }

        self.update(job);
    }

    // ==================== Update ====================

    fn update(&mut self, job: Arc<Job>) {
        let Some(registration) = self.registration_map.get(&job.storage_key, &job.scope_url) else {
            debug!(job = %job.id, scope = %job.scope_url, "Update of a missing registration");
            self.reject_job_promise(
                &job,
                ServiceWorkerError::type_error("no registration for scope"),
            );
            self.finish_job(&job);
            return;
        };
        let Some(script_url) = job.script_url.clone() else {
            error!(job = %job.id, "Update job without a script URL");
            self.reject_job_promise(&job, ServiceWorkerError::type_error("missing script URL"));
            self.finish_job(&job);
            return;
        };

        let newest_worker = registration.newest_worker();
        if job.job_type == JobType::Update {
            if let Some(newest) = &newest_worker {
                if newest.script_url() != &script_url {
                    debug!(
                        job = %job.id,
                        script = %script_url,
                        "Update may not change the script URL"
                    );
                    self.reject_job_promise(
                        &job,
                        ServiceWorkerError::type_error(
                            "script URL differs from the newest worker's",
                        ),
                    );
                    self.finish_job(&job);
                    return;
                }
            }
        }

        let stale = newest_worker.is_some()
            && registration.is_stale(self.config.registration_stale_after());
        let bypass_cache = registration.update_via_cache() != UpdateViaCache::All
            || job.force_bypass_cache
            || stale;
        debug!(
            job = %job.id,
            script = %script_url,
            bypass_cache,
            has_newest_worker = newest_worker.is_some(),
            "Update: fetching main script"
        );

        self.pending_updates.insert(
            job.id,
            UpdateJobState {
                job: job.clone(),
                registration,
                newest_worker,
                updated_resource_map: ScriptResourceMap::new(),
                has_updated_resources: false,
                pending_imports: 0,
            },
        );

        let sink = ScriptSink::new(
            self.runner.clone(),
            job.id,
            script_url.clone(),
            LoadTarget::MainScript,
        );
        self.loader
            .load(ScriptRequest::new(script_url).with_bypass_cache(bypass_cache), sink);
    }

    pub(crate) fn update_on_content_produced(
        &mut self,
        job_id: JobId,
        url: Url,
        target: LoadTarget,
        content: String,
    ) {
        let Some(state) = self.pending_updates.get_mut(&job_id) else {
            debug!(job = %job_id, url = %url, "Content for a finished update");
            return;
        };
        trace!(
            job = %job_id,
            url = %url,
            bytes = content.len(),
            ?target,
            "Script content produced"
        );

        match target {
            LoadTarget::MainScript => {
                state.registration.set_last_update_check_time(Instant::now());
                let changed = match &state.newest_worker {
                    None => true,
                    Some(newest) if newest.script_url() != &url => true,
                    Some(newest) => newest
                        .lookup_script_resource(&url)
                        .map_or(false, |previous| previous != content),
                };
                if changed {
                    state.has_updated_resources = true;
                }
                state.updated_resource_map.insert(url, content);
            }
            LoadTarget::ImportedScript => {
                state.updated_resource_map.insert(url, content);
            }
        }
    }

    pub(crate) fn update_on_loading_complete(
        &mut self,
        job_id: JobId,
        url: Url,
        target: LoadTarget,
        error: Option<String>,
    ) {
        let Some(state) = self.pending_updates.get_mut(&job_id) else {
            debug!(job = %job_id, url = %url, "Load completion for a finished update");
            return;
        };
        if let Some(error) = &error {
            debug!(job = %job_id, url = %url, %error, ?target, "Script load failed");
        }

        match target {
            LoadTarget::MainScript => {
                let imports = match &state.newest_worker {
                    Some(newest)
                        if !state.has_updated_resources
                            && newest.classic_scripts_imported()
                            && state.updated_resource_map.contains_key(&url) =>
                    {
                        newest.imported_script_urls()
                    }
                    _ => Vec::new(),
                };
                if imports.is_empty() {
                    self.finish_update(job_id);
                    return;
                }

                let bypass_cache = state.job.update_via_cache == UpdateViaCache::None
                    || state.job.force_bypass_cache;
                state.pending_imports = imports.len();
                debug!(job = %job_id, imports = imports.len(), "Update: checking imported scripts");
                for import in imports {
                    let sink = ScriptSink::new(
                        self.runner.clone(),
                        job_id,
                        import.clone(),
                        LoadTarget::ImportedScript,
                    );
                    self.loader
                        .load(ScriptRequest::new(import).with_bypass_cache(bypass_cache), sink);
                }
            }
            LoadTarget::ImportedScript => {
                let changed = match (&state.newest_worker, state.updated_resource_map.get(&url)) {
                    _ if error.is_some() => true,
                    (_, None) => true,
                    (Some(newest), Some(fetched)) => {
                        newest.lookup_script_resource(&url).as_deref() != Some(fetched.as_str())
                    }
                    (None, Some(_)) => true,
                };
                if changed {
                    trace!(job = %job_id, url = %url, "Imported script changed");
                    state.has_updated_resources = true;
                }
                state.pending_imports = state.pending_imports.saturating_sub(1);
                if state.pending_imports == 0 {
                    self.finish_update(job_id);
                }
            }
        }
    }

    /// Update steps 7 onwards, once every fetch has completed.
    fn finish_update(&mut self, job_id: JobId) {
        let Some(state) = self.pending_updates.remove(&job_id) else {
            return;
        };
        let UpdateJobState {
            job,
            registration,
            newest_worker,
            updated_resource_map,
            has_updated_resources,
            ..
        } = state;
        let Some(script_url) = job.script_url.clone() else {
            self.reject_job_promise(&job, ServiceWorkerError::type_error("missing script URL"));
            self.finish_job(&job);
            return;
        };

        if !updated_resource_map.contains_key(&script_url) {
            debug!(job = %job.id, script = %script_url, "Update: main script unavailable");
            self.reject_job_promise(
                &job,
                ServiceWorkerError::type_error(format!("failed to fetch {}", script_url)),
            );
            if newest_worker.is_none() {
                self.registration_map.remove(&job.storage_key, &job.scope_url);
            }
            self.finish_job(&job);
            return;
        }

        if !has_updated_resources {
            debug!(job = %job.id, registration = %registration.id(), "Update: scripts unchanged");
            self.update_registration_cache_mode(&registration, job.update_via_cache);
            self.resolve_job_promise(&job, JobValue::Registration(registration));
            self.finish_job(&job);
            return;
        }

        let worker = Arc::new(ServiceWorkerRecord::new(
            script_url,
            job.worker_type,
            &registration,
            updated_resource_map,
        ));
        debug!(job = %job.id, worker = %worker.id(), "Update: starting new worker");
        if self.run_service_worker(&worker, job.force_bypass_cache).is_none() {
            self.reject_job_promise(
                &job,
                ServiceWorkerError::type_error("service worker failed to start"),
            );
            if newest_worker.is_none() {
                self.registration_map.remove(&job.storage_key, &job.scope_url);
            }
            self.finish_job(&job);
            return;
        }

        self.install(job, worker, registration);
    }

    // ==================== Unregister ====================

    fn unregister(&mut self, job: Arc<Job>) {
        debug!(job = %job.id, scope = %job.scope_url, "Unregister");
        let scope_origin = Origin::from_url(&job.scope_url);
        let same_origin = job
            .referrer
            .as_ref()
            .map_or(false, |referrer| Origin::from_url(referrer).same_origin(&scope_origin));
        if !same_origin {
            self.reject_job_promise(
                &job,
                ServiceWorkerError::security(
                    "Service Worker Unregister failed: Scope origin does not match.",
                ),
            );
            self.finish_job(&job);
            return;
        }

        let Some(registration) = self.registration_map.get(&job.storage_key, &job.scope_url) else {
            self.resolve_job_promise(&job, JobValue::Bool(false));
            self.finish_job(&job);
            return;
        };

        self.registration_map.remove(&job.storage_key, &job.scope_url);
        self.resolve_job_promise(&job, JobValue::Bool(true));
        self.try_clear_registration(&registration);
        self.finish_job(&job);
    }

    // ==================== Promise settlement ====================

    pub(crate) fn resolve_job_promise(&self, job: &Arc<Job>, value: JobValue) {
        self.settle_job_promise(job, JobOutcome::Resolved(value));
    }

    pub(crate) fn reject_job_promise(&self, job: &Arc<Job>, error: ServiceWorkerError) {
        debug!(job = %job.id, kind = %job.job_type, %error, "Rejecting job");
        self.settle_job_promise(job, JobOutcome::Rejected(error));
    }

    /// Settle `job` and every job coalesced into it, each on its own client's loop.
    fn settle_job_promise(&self, job: &Arc<Job>, outcome: JobOutcome) {
        let equivalents = {
            let mut shared = job.shared.lock_or_recover();
            if let Some(promise) = shared.promise.take() {
                match &job.client {
                    Some(client) => post_settlement(client, promise, outcome.clone()),
                    None => trace!(job = %job.id, "Job without a client; promise dropped"),
                }
            }
            std::mem::take(&mut shared.equivalent_jobs)
        };

        for equivalent in equivalents {
            let promise = equivalent.shared.lock_or_recover().promise.take();
            if let (Some(client), Some(promise)) = (&equivalent.client, promise) {
                trace!(job = %equivalent.id, of = %job.id, "Settling equivalent job");
                post_settlement(client, promise, outcome.clone());
            }
        }
    }
}

fn post_settlement(client: &Arc<WebContext>, promise: JobPromise, outcome: JobOutcome) {
    let context = client.clone();
    let runner = client.runner().clone();
    let posted = runner.post_task(move |_| match outcome {
        JobOutcome::Rejected(error) => promise.reject(error),
        JobOutcome::Resolved(JobValue::Bool(value)) => promise.resolve_bool(value),
        JobOutcome::Resolved(JobValue::Registration(registration)) => {
            let wrapper = context.get_service_worker_registration(&registration);
            promise.resolve_registration(wrapper);
        }
    });
    if let Err(e) = posted {
        debug!(client = %client.id(), error = %e, "Client loop is gone; settlement dropped");
    }
}
