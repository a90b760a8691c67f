//! Shared fixtures for the service worker integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rustkit_common::logging::{try_init_logging, LogConfig};
use rustkit_common::EventLoop;
use rustkit_sw::{
    ClientType, InMemoryScriptLoader, JobsConfig, LifecycleEvent, Promise, RegistrationOptions,
    RegistrationSnapshot, ScriptHost, ServiceWorkerError, ServiceWorkerEvent,
    ServiceWorkerGlobalScope, ServiceWorkerJobs, ServiceWorkerRegistration, ServiceWorkerState,
    StorageKey, WebContext,
};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

/// Poll `condition` until it holds or [`TIMEOUT`] elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Wait for a promise to settle, failing the test on timeout.
pub fn settle<T: Clone>(promise: &Promise<T>) -> Result<T, ServiceWorkerError> {
    promise
        .wait_timeout(TIMEOUT)
        .unwrap_or_else(|| panic!("promise still pending after {:?}", TIMEOUT))
}

// ==================== Script host ====================

type EvaluateHook = Arc<dyn Fn(&ServiceWorkerGlobalScope) + Send + Sync>;
type EventHook = Arc<dyn Fn(&ServiceWorkerGlobalScope, LifecycleEvent) + Send + Sync>;

/// Script host that records what it runs and lets tests script worker behavior.
#[derive(Default)]
pub struct RecordingHost {
    evaluated: Mutex<Vec<Url>>,
    dispatched: Mutex<Vec<(Url, LifecycleEvent)>>,
    failing: Mutex<HashSet<Url>>,
    on_evaluate: Mutex<Option<EvaluateHook>>,
    on_event: Mutex<Option<EventHook>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make evaluation of `script` throw.
    pub fn fail_evaluation(&self, script: Url) {
        self.failing.lock().unwrap().insert(script);
    }

    pub fn on_evaluate(&self, hook: impl Fn(&ServiceWorkerGlobalScope) + Send + Sync + 'static) {
        *self.on_evaluate.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn on_event(
        &self,
        hook: impl Fn(&ServiceWorkerGlobalScope, LifecycleEvent) + Send + Sync + 'static,
    ) {
        *self.on_event.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn evaluated(&self) -> Vec<Url> {
        self.evaluated.lock().unwrap().clone()
    }

    pub fn dispatched(&self) -> Vec<(Url, LifecycleEvent)> {
        self.dispatched.lock().unwrap().clone()
    }
}

impl ScriptHost for RecordingHost {
    fn evaluate(
        &self,
        scope: &ServiceWorkerGlobalScope,
        _source: &str,
    ) -> Result<String, ServiceWorkerError> {
        self.evaluated.lock().unwrap().push(scope.script_url().clone());
        if self.failing.lock().unwrap().contains(scope.script_url()) {
            return Err(ServiceWorkerError::Script(format!("{} threw", scope.script_url())));
        }
        let hook = self.on_evaluate.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(scope);
        }
        Ok("started".to_string())
    }

    fn dispatch_lifecycle_event(
        &self,
        scope: &ServiceWorkerGlobalScope,
        event: LifecycleEvent,
    ) -> Result<(), ServiceWorkerError> {
        self.dispatched
            .lock()
            .unwrap()
            .push((scope.script_url().clone(), event));
        let hook = self.on_event.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(scope, event);
        }
        Ok(())
    }
}

// ==================== Clients ====================

/// A web context with its own event loop.
pub struct TestClient {
    pub context: Arc<WebContext>,
    pub events: UnboundedReceiver<ServiceWorkerEvent>,
    event_loop: EventLoop,
}

impl TestClient {
    pub fn new(creation_url: &str, client_type: ClientType) -> Self {
        let event_loop: EventLoop = EventLoop::new(format!("Client {}", creation_url)).unwrap();
        let (context, events) =
            WebContext::new(url(creation_url), client_type, event_loop.runner());
        Self {
            context,
            events,
            event_loop,
        }
    }

    /// Run every task already posted to this client.
    pub fn flush(&self) {
        self.event_loop.flush().unwrap();
    }

    /// Events received so far.
    pub fn drain_events(&mut self) -> Vec<ServiceWorkerEvent> {
        let mut received = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            received.push(event);
        }
        received
    }

    /// Collect events until one matches `done`.
    pub fn wait_for_event(
        &mut self,
        done: impl Fn(&ServiceWorkerEvent) -> bool,
    ) -> Vec<ServiceWorkerEvent> {
        let mut received = Vec::new();
        let found = wait_until(|| {
            while let Ok(event) = self.events.try_recv() {
                let matched = done(&event);
                received.push(event);
                if matched {
                    return true;
                }
            }
            false
        });
        assert!(found, "expected event not received; got {:?}", received);
        received
    }
}

// ==================== Harness ====================

/// An engine, an in-memory loader and a recording host. Unregisters every
/// client it created before the engine is dropped.
pub struct Harness {
    pub jobs: ServiceWorkerJobs,
    pub loader: InMemoryScriptLoader,
    pub host: Arc<RecordingHost>,
    contexts: Mutex<Vec<Arc<WebContext>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(JobsConfig::default())
    }

    pub fn with_config(config: JobsConfig) -> Self {
        let _ = try_init_logging(LogConfig::test());
        let loader = InMemoryScriptLoader::new().unwrap();
        let host = RecordingHost::new();
        let jobs =
            ServiceWorkerJobs::spawn(config, Arc::new(loader.clone()), host.clone()).unwrap();
        Self {
            jobs,
            loader,
            host,
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, script: &str, source: &str) {
        self.loader.insert(url(script), source);
    }

    /// A window client registered with the engine.
    pub fn window(&self, creation_url: &str) -> TestClient {
        self.client(creation_url, ClientType::Window)
    }

    pub fn client(&self, creation_url: &str, client_type: ClientType) -> TestClient {
        let client = TestClient::new(creation_url, client_type);
        self.jobs.register_web_context(&client.context);
        self.contexts.lock().unwrap().push(client.context.clone());
        self.jobs.flush().unwrap();
        client
    }

    /// Unregister a client before the harness is dropped.
    pub fn close(&self, client: &TestClient) {
        self.contexts
            .lock()
            .unwrap()
            .retain(|context| !Arc::ptr_eq(context, &client.context));
        self.jobs.unregister_web_context(&client.context);
    }

    pub fn register(
        &self,
        client: &TestClient,
        script: &str,
        options: RegistrationOptions,
    ) -> Result<ServiceWorkerRegistration, ServiceWorkerError> {
        settle(&self.jobs.start_register(&client.context, script, options))
    }

    pub fn snapshot(&self, scope: &str) -> Option<RegistrationSnapshot> {
        let scope = url(scope);
        self.jobs.registration(&StorageKey::from_url(&scope), &scope)
    }

    /// Wait until the registration at `scope` has an activated worker for `script`.
    pub fn wait_for_active(&self, scope: &str, script: &str) -> RegistrationSnapshot {
        let script = url(script);
        let mut last = None;
        let activated = wait_until(|| {
            last = self.snapshot(scope);
            last.as_ref()
                .and_then(|snapshot| snapshot.active.as_ref())
                .map_or(false, |active| {
                    active.script_url == script && active.state == ServiceWorkerState::Activated
                })
        });
        assert!(activated, "no activated worker at {}: {:?}", scope, last);
        last.unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let contexts = std::mem::take(&mut *self.contexts.lock().unwrap());
        for context in contexts {
            self.jobs.unregister_web_context(&context);
        }
    }
}
