//! The jobs engine and its thread-safe handle.

use hashbrown::HashMap;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};
use url::Url;

use rustkit_common::{EventLoop, ResetPolicy, Result, TaskRunner, WaitableEvent};

use crate::client::ServiceWorkerRegistration;
use crate::config::JobsConfig;
use crate::context::WebContext;
use crate::job::{Job, JobId, JobQueue, JobType};
use crate::jobs::UpdateJobState;
use crate::loader::ScriptLoader;
use crate::origin::{
    is_http_or_https, path_contains_escaped_slash, strip_fragment, Origin, StorageKey,
};
use crate::promise::{JobPromise, Promise};
use crate::registration::{RegistrationMap, RegistrationSnapshot};
use crate::worker::ScriptHost;
use crate::{RegistrationOptions, ServiceWorkerError};

/// State owned by the engine sequence.
///
/// Every method runs on the engine thread; the registration map, job queues
/// and context list are never touched from anywhere else.
pub struct JobsEngine {
    pub(crate) config: JobsConfig,
    pub(crate) runner: TaskRunner<JobsEngine>,
    pub(crate) loader: Arc<dyn ScriptLoader>,
    pub(crate) script_host: Arc<dyn ScriptHost>,
    pub(crate) registration_map: RegistrationMap,
    pub(crate) job_queues: HashMap<String, Arc<JobQueue>>,
    pub(crate) pending_updates: HashMap<JobId, UpdateJobState>,
    pub(crate) web_contexts: Vec<Arc<WebContext>>,
    pub(crate) contexts_cleared: Arc<WaitableEvent>,
}

impl JobsEngine {
    pub fn registration_map(&self) -> &RegistrationMap {
        &self.registration_map
    }

    pub fn web_context_count(&self) -> usize {
        self.web_contexts.len()
    }

    pub(crate) fn soft_update(&mut self, storage_key: StorageKey, scope_url: Url) {
        let Some(registration) = self.registration_map.get(&storage_key, &scope_url) else {
            debug!(scope = %scope_url, "Soft update of unknown registration");
            return;
        };
        let Some(newest_worker) = registration.newest_worker() else {
            return;
        };
        let job = Job::new(
            JobType::Update,
            storage_key,
            scope_url,
            Some(newest_worker.script_url().clone()),
            None,
            None,
        )
        .with_update_via_cache(registration.update_via_cache())
        .with_force_bypass_cache();
        self.schedule_job(Arc::new(job));
    }

    pub(crate) fn start_update(
        &mut self,
        client: Arc<WebContext>,
        scope_url: Url,
        promise: Promise<ServiceWorkerRegistration>,
    ) {
        let newest_worker = self
            .registration_map
            .get(client.storage_key(), &scope_url)
            .and_then(|registration| {
                let worker = registration.newest_worker()?;
                Some((registration, worker))
            });
        let Some((registration, newest_worker)) = newest_worker else {
            debug!(scope = %scope_url, "Update of a registration without workers");
            let runner = client.runner().clone();
            if runner
                .post_task(move |_| {
                    promise.reject(ServiceWorkerError::invalid_state(
                        "Service Worker Update failed: registration has no worker",
                    ));
                })
                .is_err()
            {
                debug!(client = %client.id(), "Client loop is gone");
            }
            return;
        };
        let job = Job::new(
            JobType::Update,
            client.storage_key().clone(),
            scope_url,
            Some(newest_worker.script_url().clone()),
            Some(JobPromise::Registration(promise)),
            Some(client),
        )
        .with_update_via_cache(registration.update_via_cache());
        self.schedule_job(Arc::new(job));
    }
}

/// Handle to the jobs engine.
///
/// Public entry points may be called from any thread except the engine's own.
/// Dropping the handle waits until every registered web context has been
/// unregistered, then runs user agent shutdown and stops the engine thread.
pub struct ServiceWorkerJobs {
    config: JobsConfig,
    event_loop: Option<EventLoop<JobsEngine>>,
    runner: TaskRunner<JobsEngine>,
    contexts_cleared: Arc<WaitableEvent>,
}

impl ServiceWorkerJobs {
    /// Start the engine sequence.
    pub fn spawn(
        config: JobsConfig,
        loader: Arc<dyn ScriptLoader>,
        script_host: Arc<dyn ScriptHost>,
    ) -> Result<Self> {
        let contexts_cleared = Arc::new(WaitableEvent::new(ResetPolicy::Manual, true));
        let engine_config = config.clone();
        let engine_cleared = contexts_cleared.clone();
        let event_loop = EventLoop::spawn(config.thread_name.clone(), move |runner| JobsEngine {
            config: engine_config,
            runner: runner.clone(),
            loader,
            script_host,
            registration_map: RegistrationMap::new(),
            job_queues: HashMap::new(),
            pending_updates: HashMap::new(),
            web_contexts: Vec::new(),
            contexts_cleared: engine_cleared,
        })?;
        info!(thread = %config.thread_name, "Service worker jobs engine started");
        Ok(Self {
            config,
            runner: event_loop.runner(),
            event_loop: Some(event_loop),
            contexts_cleared,
        })
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// The engine sequence's task runner.
    pub fn runner(&self) -> &TaskRunner<JobsEngine> {
        &self.runner
    }

    // ==================== ServiceWorkerContainer ====================

    /// `navigator.serviceWorker.register(scriptURL, options)` (Start Register).
    pub fn start_register(
        &self,
        client: &Arc<WebContext>,
        script_url: &str,
        options: RegistrationOptions,
    ) -> Promise<ServiceWorkerRegistration> {
        let validated = self.validate_register(client, script_url, options.scope.as_deref());
        let (script_url, scope_url) = match validated {
            Ok(urls) => urls,
            Err(e) => {
                debug!(client = %client.id(), error = %e, "Register rejected");
                return Promise::rejected(e);
            }
        };
        debug!(client = %client.id(), scope = %scope_url, script = %script_url, "Start register");

        let promise = Promise::new();
        let job = Job::new(
            JobType::Register,
            client.storage_key().clone(),
            scope_url,
            Some(script_url),
            Some(JobPromise::Registration(promise.clone())),
            Some(client.clone()),
        )
        .with_worker_type(options.worker_type)
        .with_update_via_cache(options.update_via_cache);
        self.post_job(job, |e| {
            promise.reject(e);
        });
        promise
    }

    fn validate_register(
        &self,
        client: &WebContext,
        script_url: &str,
        scope: Option<&str>,
    ) -> std::result::Result<(Url, Url), ServiceWorkerError> {
        if script_url.is_empty() {
            return Err(ServiceWorkerError::type_error("script URL is empty"));
        }
        let script_url = client
            .creation_url()
            .join(script_url)
            .map_err(|e| ServiceWorkerError::type_error(format!("invalid script URL: {}", e)))?;
        let script_url = strip_fragment(&script_url);
        if !is_http_or_https(&script_url) {
            return Err(ServiceWorkerError::type_error(format!(
                "script URL scheme '{}' is not http or https",
                script_url.scheme()
            )));
        }
        if path_contains_escaped_slash(&script_url) {
            return Err(ServiceWorkerError::type_error("script URL path contains an escaped slash"));
        }

        let scope_url = match scope {
            Some(scope) => client.creation_url().join(scope),
            None => script_url.join("./"),
        }
        .map_err(|e| ServiceWorkerError::type_error(format!("invalid scope URL: {}", e)))?;
        let scope_url = strip_fragment(&scope_url);
        if !is_http_or_https(&scope_url) {
            return Err(ServiceWorkerError::type_error(format!(
                "scope URL scheme '{}' is not http or https",
                scope_url.scheme()
            )));
        }
        if path_contains_escaped_slash(&scope_url) {
            return Err(ServiceWorkerError::type_error("scope URL path contains an escaped slash"));
        }
        Ok((script_url, scope_url))
    }

    /// `registration.update()`.
    pub fn start_update(
        &self,
        client: &Arc<WebContext>,
        registration: &ServiceWorkerRegistration,
    ) -> Promise<ServiceWorkerRegistration> {
        let promise = Promise::new();
        let settle = promise.clone();
        let client = client.clone();
        let scope_url = registration.scope().clone();
        if let Err(e) = self
            .runner
            .post_task(move |engine| engine.start_update(client, scope_url, settle))
        {
            promise.reject(e.into());
        }
        promise
    }

    /// `registration.unregister()`.
    pub fn start_unregister(&self, client: &Arc<WebContext>, scope_url: &Url) -> Promise<bool> {
        let promise = Promise::new();
        let job = Job::new(
            JobType::Unregister,
            client.storage_key().clone(),
            strip_fragment(scope_url),
            None,
            Some(JobPromise::Bool(promise.clone())),
            Some(client.clone()),
        );
        self.post_job(job, |e| {
            promise.reject(e);
        });
        promise
    }

    /// Soft Update: an internally triggered update that bypasses the cache.
    pub fn soft_update(&self, storage_key: StorageKey, scope_url: Url) {
        if let Err(e) = self
            .runner
            .post_task(move |engine| engine.soft_update(storage_key, scope_url))
        {
            warn!(error = %e, "Soft update not scheduled");
        }
    }

    /// `navigator.serviceWorker.getRegistration(clientURL)`.
    pub fn get_registration(
        &self,
        client: &Arc<WebContext>,
        client_url: Option<&str>,
    ) -> Promise<Option<ServiceWorkerRegistration>> {
        let client_url = match client_url {
            Some(url) => match client.creation_url().join(url) {
                Ok(url) => url,
                Err(e) => {
                    return Promise::rejected(ServiceWorkerError::type_error(format!(
                        "invalid client URL: {}",
                        e
                    )))
                }
            },
            None => client.creation_url().clone(),
        };
        if !Origin::from_url(&client_url).same_origin(&client.origin()) {
            return Promise::rejected(ServiceWorkerError::security(
                "getRegistration() URL is not same-origin with the client",
            ));
        }

        let promise = Promise::new();
        let settle = promise.clone();
        let context = client.clone();
        if let Err(e) = self
            .runner
            .post_task(move |engine| engine.get_registration_sub_steps(context, client_url, settle))
        {
            promise.reject(e.into());
        }
        promise
    }

    /// `navigator.serviceWorker.ready`.
    pub fn ready(&self, client: &Arc<WebContext>) -> Promise<ServiceWorkerRegistration> {
        let ready = client.ready_promise();
        if ready.is_pending() {
            let context = client.clone();
            if let Err(e) = self
                .runner
                .post_task(move |engine| engine.maybe_resolve_ready_promise_sub_steps(context))
            {
                debug!(error = %e, "Ready check not scheduled");
            }
        }
        ready
    }

    // ==================== Web contexts ====================

    /// Make a client known to the engine.
    pub fn register_web_context(&self, context: &Arc<WebContext>) {
        self.contexts_cleared.reset();
        let context = context.clone();
        if let Err(e) = self
            .runner
            .post_task(move |engine| engine.register_web_context(context))
        {
            warn!(error = %e, "Web context not registered");
        }
    }

    /// Forget a client. Returns once the engine no longer references it.
    pub fn unregister_web_context(&self, context: &Arc<WebContext>) {
        let context = context.clone();
        if let Err(e) = self
            .runner
            .post_blocking_task(move |engine| engine.unregister_web_context(context))
        {
            warn!(error = %e, "Web context not unregistered");
        }
    }

    // ==================== Diagnostics ====================

    /// Snapshot of the registration for (storage key, scope).
    pub fn registration(
        &self,
        storage_key: &StorageKey,
        scope_url: &Url,
    ) -> Option<RegistrationSnapshot> {
        let storage_key = storage_key.clone();
        let scope_url = scope_url.clone();
        self.runner
            .post_blocking_task(move |engine| {
                engine
                    .registration_map
                    .get(&storage_key, &scope_url)
                    .map(|registration| registration.snapshot())
            })
            .ok()
            .flatten()
    }

    /// Snapshots of every registration, ordered by scope.
    pub fn registrations(&self) -> Vec<RegistrationSnapshot> {
        let mut snapshots = self
            .runner
            .post_blocking_task(|engine| {
                engine
                    .registration_map
                    .iter()
                    .map(|registration| registration.snapshot())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        snapshots.sort_by(|a, b| a.scope.as_str().cmp(b.scope.as_str()));
        snapshots
    }

    /// Block until every task posted to the engine so far has run.
    pub fn flush(&self) -> Result<()> {
        self.runner.post_blocking_task(|_| ())
    }

    fn post_job(&self, job: Job, on_error: impl FnOnce(ServiceWorkerError)) {
        let job = Arc::new(job);
        if let Err(e) = self.runner.post_task(move |engine| engine.schedule_job(job)) {
            warn!(error = %e, "Job not scheduled");
            on_error(e.into());
        }
    }
}

impl std::fmt::Debug for ServiceWorkerJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerJobs")
            .field("thread", &self.config.thread_name)
            .finish_non_exhaustive()
    }
}

impl Drop for ServiceWorkerJobs {
    fn drop(&mut self) {
        let Some(event_loop) = self.event_loop.take() else {
            return;
        };
        if !thread::panicking() {
            debug!("Waiting for web contexts to unregister");
            self.contexts_cleared.wait();
            if let Err(e) = event_loop
                .runner()
                .post_blocking_task(|engine| engine.handle_user_agent_shutdown())
            {
                warn!(error = %e, "User agent shutdown did not run");
            }
        }
        drop(event_loop);
        info!("Service worker jobs engine stopped");
    }
}
