//! Service worker records and the embedder's script host.

use hashbrown::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use url::Url;

use rustkit_common::{EventLoop, LockExt, ResetPolicy, TaskRunner, WaitableEvent};

use crate::engine::JobsEngine;
use crate::registration::RegistrationRecord;
use crate::scope::ServiceWorkerGlobalScope;
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState, WorkerType};

/// URL to script text.
pub type ScriptResourceMap = HashMap<Url, String>;

/// Lifecycle events dispatched at a worker's global scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Install,
    Activate,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Install => f.write_str("install"),
            LifecycleEvent::Activate => f.write_str("activate"),
        }
    }
}

/// Script execution supplied by the embedder.
///
/// Both methods run on the worker's own agent thread. They may call the
/// non-blocking methods of [`ServiceWorkerGlobalScope`] but must not block on
/// the jobs engine.
pub trait ScriptHost: Send + Sync {
    /// Evaluate the worker's main script. The returned string becomes the
    /// worker's start status.
    fn evaluate(
        &self,
        scope: &ServiceWorkerGlobalScope,
        source: &str,
    ) -> Result<String, ServiceWorkerError>;

    /// Dispatch `install` or `activate`. Returns once the handlers have run;
    /// extended lifetimes are not tracked.
    fn dispatch_lifecycle_event(
        &self,
        _scope: &ServiceWorkerGlobalScope,
        _event: LifecycleEvent,
    ) -> Result<(), ServiceWorkerError> {
        Ok(())
    }
}

/// Script host that accepts every script and ignores events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScriptHost;

impl ScriptHost for NoopScriptHost {
    fn evaluate(
        &self,
        _scope: &ServiceWorkerGlobalScope,
        _source: &str,
    ) -> Result<String, ServiceWorkerError> {
        Ok(String::new())
    }
}

struct WorkerInner {
    state: ServiceWorkerState,
    start_status: Option<String>,
    start_failed: bool,
    skip_waiting: bool,
    script_resource_map: ScriptResourceMap,
    used_scripts: HashSet<Url>,
    classic_scripts_imported: bool,
    agent: Option<EventLoop>,
    global_scope: Option<Arc<ServiceWorkerGlobalScope>>,
}

/// The engine's record of one service worker.
pub struct ServiceWorkerRecord {
    id: ServiceWorkerId,
    script_url: Url,
    worker_type: WorkerType,
    registration: Weak<RegistrationRecord>,
    inner: Mutex<WorkerInner>,
}

impl ServiceWorkerRecord {
    pub(crate) fn new(
        script_url: Url,
        worker_type: WorkerType,
        registration: &Arc<RegistrationRecord>,
        script_resource_map: ScriptResourceMap,
    ) -> Self {
        let mut used_scripts = HashSet::new();
        used_scripts.insert(script_url.clone());
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            worker_type,
            registration: Arc::downgrade(registration),
            inner: Mutex::new(WorkerInner {
                state: ServiceWorkerState::Parsed,
                start_status: None,
                start_failed: false,
                skip_waiting: false,
                script_resource_map,
                used_scripts,
                classic_scripts_imported: false,
                agent: None,
                global_scope: None,
            }),
        }
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    /// The containing registration, while it is alive.
    pub fn registration(&self) -> Option<Arc<RegistrationRecord>> {
        self.registration.upgrade()
    }

    pub(crate) fn belongs_to(&self, registration: &Arc<RegistrationRecord>) -> bool {
        Weak::ptr_eq(&self.registration, &Arc::downgrade(registration))
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.inner.lock_or_recover().state
    }

    /// Set the lifecycle state. Backwards moves are refused.
    pub(crate) fn set_state(&self, state: ServiceWorkerState) -> bool {
        let mut inner = self.inner.lock_or_recover();
        if state < inner.state {
            error!(
                worker = %self.id,
                from = %inner.state,
                to = %state,
                "Refusing backwards state transition"
            );
            return false;
        }
        trace!(worker = %self.id, from = %inner.state, to = %state, "Worker state");
        inner.state = state;
        true
    }

    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock_or_recover();
        inner.start_status.is_some() && inner.agent.is_some()
    }

    pub fn start_status(&self) -> Option<String> {
        self.inner.lock_or_recover().start_status.clone()
    }

    pub fn start_failed(&self) -> bool {
        self.inner.lock_or_recover().start_failed
    }

    pub fn skip_waiting(&self) -> bool {
        self.inner.lock_or_recover().skip_waiting
    }

    pub(crate) fn set_skip_waiting(&self) {
        self.inner.lock_or_recover().skip_waiting = true;
    }

    pub fn classic_scripts_imported(&self) -> bool {
        self.inner.lock_or_recover().classic_scripts_imported
    }

    pub fn global_scope(&self) -> Option<Arc<ServiceWorkerGlobalScope>> {
        self.inner.lock_or_recover().global_scope.clone()
    }

    // ==================== Script resources ====================

    pub fn lookup_script_resource(&self, url: &Url) -> Option<String> {
        self.inner.lock_or_recover().script_resource_map.get(url).cloned()
    }

    pub fn has_script_resource(&self) -> bool {
        self.inner
            .lock_or_recover()
            .script_resource_map
            .contains_key(&self.script_url)
    }

    /// URLs of imported scripts held in the resource map.
    pub fn imported_script_urls(&self) -> Vec<Url> {
        let inner = self.inner.lock_or_recover();
        let mut urls: Vec<Url> = inner
            .script_resource_map
            .keys()
            .filter(|url| **url != self.script_url)
            .cloned()
            .collect();
        urls.sort();
        urls
    }

    /// Drop resources that the worker never used.
    pub(crate) fn purge_script_resource_map(&self) {
        let mut inner = self.inner.lock_or_recover();
        let WorkerInner {
            script_resource_map,
            used_scripts,
            ..
        } = &mut *inner;
        let before = script_resource_map.len();
        script_resource_map.retain(|url, _| used_scripts.contains(url));
        trace!(
            worker = %self.id,
            purged = before - script_resource_map.len(),
            "Purged script resource map"
        );
    }

    /// Record a classic script imported by the main script.
    ///
    /// Once past `installing`, only imports already in the resource map are
    /// accepted.
    pub(crate) fn record_imported_script(
        &self,
        url: Url,
        source: &str,
    ) -> Result<(), ServiceWorkerError> {
        let mut inner = self.inner.lock_or_recover();
        match inner.state {
            ServiceWorkerState::Parsed | ServiceWorkerState::Installing => {
                inner.script_resource_map.insert(url.clone(), source.to_string());
            }
            _ => {
                if !inner.script_resource_map.contains_key(&url) {
                    debug!(worker = %self.id, url = %url, "Import of unknown script after install");
                    return Err(ServiceWorkerError::Network(format!(
                        "{} was not imported before the worker was installed",
                        url
                    )));
                }
            }
        }
        inner.used_scripts.insert(url);
        inner.classic_scripts_imported = true;
        Ok(())
    }

    // ==================== Agent ====================

    /// Spin up the worker's agent thread, evaluate the main script there and
    /// block until evaluation finishes, fails, or `timeout` elapses.
    ///
    /// The agent never calls back into the engine synchronously, so blocking
    /// the engine sequence here cannot deadlock.
    pub(crate) fn start(
        self: &Arc<Self>,
        host: Arc<dyn ScriptHost>,
        engine: TaskRunner<JobsEngine>,
        timeout: Option<Duration>,
    ) -> Option<String> {
        let Some(source) = self.lookup_script_resource(&self.script_url) else {
            error!(worker = %self.id, "Starting a worker without its main script");
            debug_assert!(false, "worker started without a main script");
            return None;
        };

        let agent: EventLoop = match EventLoop::new(format!("ServiceWorker-{}", self.id.raw())) {
            Ok(agent) => agent,
            Err(e) => {
                warn!(worker = %self.id, error = %e, "Failed to spawn worker agent");
                self.inner.lock_or_recover().start_failed = true;
                return None;
            }
        };
        let scope = Arc::new(ServiceWorkerGlobalScope::new(self, engine, agent.runner()));
        {
            let mut inner = self.inner.lock_or_recover();
            inner.start_failed = false;
            inner.global_scope = Some(scope.clone());
        }

        let started = Arc::new(WaitableEvent::new(ResetPolicy::Manual, false));
        let outcome: Arc<Mutex<Option<Result<String, ServiceWorkerError>>>> =
            Arc::new(Mutex::new(None));
        let posted = {
            let started = started.clone();
            let outcome = outcome.clone();
            let scope = scope.clone();
            agent.runner().post_task(move |_| {
                let result = host.evaluate(&scope, &source);
                if result.is_ok() {
                    scope.mark_started();
                }
                *outcome.lock_or_recover() = Some(result);
                started.signal();
            })
        };
        if let Err(e) = posted {
            warn!(worker = %self.id, error = %e, "Worker agent refused the start task");
            self.fail_start(&scope);
            return None;
        }

        let signaled = match timeout {
            Some(timeout) => started.wait_timeout(timeout),
            None => {
                started.wait();
                true
            }
        };
        if !signaled {
            warn!(worker = %self.id, ?timeout, "Worker start timed out");
            self.fail_start(&scope);
            agent.detach();
            return None;
        }

        let result = outcome.lock_or_recover().take();
        match result {
            Some(Ok(status)) => {
                debug!(worker = %self.id, "Worker started");
                let mut inner = self.inner.lock_or_recover();
                inner.start_status = Some(status.clone());
                inner.agent = Some(agent);
                Some(status)
            }
            Some(Err(e)) => {
                debug!(worker = %self.id, error = %e, "Worker script evaluation failed");
                self.fail_start(&scope);
                None
            }
            None => {
                self.fail_start(&scope);
                None
            }
        }
    }

    fn fail_start(&self, scope: &ServiceWorkerGlobalScope) {
        scope.set_closing();
        let mut inner = self.inner.lock_or_recover();
        inner.start_failed = true;
        inner.global_scope = None;
    }

    /// Dispatch a lifecycle event on the agent and wait for the handlers to return.
    pub(crate) fn dispatch_lifecycle_event(
        &self,
        host: Arc<dyn ScriptHost>,
        event: LifecycleEvent,
    ) -> Result<(), ServiceWorkerError> {
        let (runner, scope) = {
            let inner = self.inner.lock_or_recover();
            match (inner.agent.as_ref(), inner.global_scope.clone()) {
                (Some(agent), Some(scope)) => (agent.runner(), scope),
                _ => {
                    return Err(ServiceWorkerError::invalid_state(format!(
                        "{} is not running",
                        self.id
                    )))
                }
            }
        };
        trace!(worker = %self.id, %event, "Dispatching lifecycle event");
        runner.post_blocking_task(move |_| host.dispatch_lifecycle_event(&scope, event))?
    }

    /// Stop the agent and clear the start status.
    pub(crate) fn abort(&self) {
        let (agent, scope) = {
            let mut inner = self.inner.lock_or_recover();
            inner.start_status = None;
            (inner.agent.take(), inner.global_scope.take())
        };
        if let Some(scope) = scope {
            scope.set_closing();
        }
        if agent.is_some() {
            debug!(worker = %self.id, "Worker agent stopped");
        }
        drop(agent);
    }
}

impl fmt::Debug for ServiceWorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorkerRecord")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::StorageKey;
    use crate::UpdateViaCache;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn record(resources: &[(&str, &str)]) -> (Arc<RegistrationRecord>, ServiceWorkerRecord) {
        let registration = Arc::new(RegistrationRecord::new(
            StorageKey::from_url(&url("https://example.com/")),
            url("https://example.com/"),
            UpdateViaCache::Imports,
        ));
        let map = resources
            .iter()
            .map(|(u, s)| (url(u), s.to_string()))
            .collect();
        let worker = ServiceWorkerRecord::new(
            url("https://example.com/sw.js"),
            WorkerType::Classic,
            &registration,
            map,
        );
        (registration, worker)
    }

    #[test]
    fn test_new_worker_uses_main_script() {
        let (registration, worker) = record(&[("https://example.com/sw.js", "main")]);
        assert_eq!(worker.state(), ServiceWorkerState::Parsed);
        assert!(worker.has_script_resource());
        assert!(!worker.is_running());
        assert!(worker.belongs_to(&registration));
    }

    #[test]
    fn test_purge_keeps_used_scripts() {
        let (_registration, worker) = record(&[
            ("https://example.com/sw.js", "main"),
            ("https://example.com/a.js", "a"),
            ("https://example.com/b.js", "b"),
        ]);
        worker
            .record_imported_script(url("https://example.com/a.js"), "a")
            .unwrap();
        worker.purge_script_resource_map();
        assert!(worker.lookup_script_resource(&url("https://example.com/a.js")).is_some());
        assert!(worker.lookup_script_resource(&url("https://example.com/b.js")).is_none());
        assert_eq!(worker.imported_script_urls(), vec![url("https://example.com/a.js")]);
        assert!(worker.classic_scripts_imported());
    }

    #[test]
    fn test_imports_after_install_need_cached_copy() {
        let (_registration, worker) = record(&[
            ("https://example.com/sw.js", "main"),
            ("https://example.com/known.js", "k"),
        ]);
        worker.set_state(ServiceWorkerState::Installing);
        worker.set_state(ServiceWorkerState::Installed);
        assert!(worker
            .record_imported_script(url("https://example.com/known.js"), "k")
            .is_ok());
        let err = worker
            .record_imported_script(url("https://example.com/late.js"), "late")
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Network(_)));
    }

    #[test]
    fn test_state_never_moves_backwards() {
        let (_registration, worker) = record(&[("https://example.com/sw.js", "main")]);
        assert!(worker.set_state(ServiceWorkerState::Installed));
        assert!(!worker.set_state(ServiceWorkerState::Installing));
        assert_eq!(worker.state(), ServiceWorkerState::Installed);
    }
}
