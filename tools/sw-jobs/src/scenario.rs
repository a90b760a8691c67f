//! Scenario files and their execution.
//!
//! A scenario names a set of clients, the scripts the in-memory loader
//! serves, and an ordered list of steps. Each step runs to completion (its
//! promise settles) before the next one starts.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rustkit_common::{EventLoop, RustKitError};
use rustkit_sw::{
    ClientType, InMemoryScriptLoader, JobsConfig, LifecycleEvent, Promise, RegistrationOptions,
    RegistrationSnapshot, ScriptHost, ServiceWorkerError, ServiceWorkerEvent,
    ServiceWorkerGlobalScope, ServiceWorkerJobs, ServiceWorkerRegistration, ServiceWorkerState,
    StorageKey, WebContext,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};
use url::Url;

/// Error type for scenario loading and execution.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid scenario: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid URL '{0}': {1}")]
    Url(String, url::ParseError),

    #[error("Unknown client '{0}'")]
    UnknownClient(String),

    #[error("Duplicate client '{0}'")]
    DuplicateClient(String),

    #[error("Engine error: {0}")]
    Engine(#[from] RustKitError),

    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),
}

// ==================== Scenario file ====================

fn default_step_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: JobsConfig,

    /// Script bodies keyed by absolute URL.
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,

    /// Scripts whose evaluation throws.
    #[serde(default)]
    pub failing_scripts: Vec<String>,

    /// Call `skipWaiting()` from every install handler.
    #[serde(default)]
    pub skip_waiting: bool,

    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    pub clients: Vec<ClientSpec>,

    pub steps: Vec<StepSpec>,
}

impl Scenario {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSpec {
    pub name: String,
    pub url: String,
    #[serde(default, rename = "type")]
    pub client_type: ClientType,
}

/// A step plus the outcome it is expected to have.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    #[serde(flatten)]
    pub step: Step,
    #[serde(default)]
    pub expect: Option<Expect>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Register {
        client: String,
        script: String,
        #[serde(default)]
        options: RegistrationOptions,
    },
    Update {
        client: String,
        scope: String,
    },
    Unregister {
        client: String,
        scope: String,
    },
    GetRegistration {
        client: String,
        #[serde(default)]
        url: Option<String>,
    },
    SetScript {
        url: String,
        source: String,
    },
    RemoveScript {
        url: String,
    },
    /// Wait until `scope` has an activated worker.
    WaitActive {
        scope: String,
    },
    Close {
        client: String,
    },
}

impl Step {
    pub fn action(&self) -> &'static str {
        match self {
            Step::Register { .. } => "register",
            Step::Update { .. } => "update",
            Step::Unregister { .. } => "unregister",
            Step::GetRegistration { .. } => "get_registration",
            Step::SetScript { .. } => "set_script",
            Step::RemoveScript { .. } => "remove_script",
            Step::WaitActive { .. } => "wait_active",
            Step::Close { .. } => "close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    Resolved,
    Rejected,
}

// ==================== Report ====================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Resolved { value: Value },
    Rejected { name: &'static str, error: String },
}

impl Outcome {
    fn done() -> Self {
        Outcome::Resolved { value: Value::Null }
    }

    fn rejected(error: &ServiceWorkerError) -> Self {
        Outcome::Rejected {
            name: error.name(),
            error: error.to_string(),
        }
    }

    pub fn kind(&self) -> Expect {
        match self {
            Outcome::Resolved { .. } => Expect::Resolved,
            Outcome::Rejected { .. } => Expect::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientEventReport {
    pub client: String,
    pub event: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub action: &'static str,
    pub outcome: Outcome,
    /// `None` when the step carried no expectation.
    pub matched: Option<bool>,
    pub events: Vec<ClientEventReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub steps: Vec<StepReport>,
    pub registrations: Vec<RegistrationSnapshot>,
}

impl ScenarioReport {
    /// Whether every step with an expectation met it.
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|step| step.matched != Some(false))
    }
}

fn describe_event(event: &ServiceWorkerEvent) -> String {
    match event {
        ServiceWorkerEvent::UpdateFound { registration } => format!("updatefound {}", registration),
        ServiceWorkerEvent::StateChange { worker, state } => {
            format!("statechange {} {}", worker, state)
        }
        ServiceWorkerEvent::ControllerChange {
            controller: Some(worker),
        } => format!("controllerchange {}", worker),
        ServiceWorkerEvent::ControllerChange { controller: None } => {
            "controllerchange none".to_string()
        }
    }
}

fn describe_registration(registration: &ServiceWorkerRegistration) -> Value {
    json!({
        "id": registration.id(),
        "scope": registration.scope().as_str(),
    })
}

// ==================== Script host ====================

/// Host that accepts every script except the configured failures.
struct ScenarioHost {
    failing: HashSet<Url>,
    skip_waiting: bool,
}

impl ScriptHost for ScenarioHost {
    fn evaluate(
        &self,
        scope: &ServiceWorkerGlobalScope,
        source: &str,
    ) -> Result<String, ServiceWorkerError> {
        if self.failing.contains(scope.script_url()) {
            return Err(ServiceWorkerError::Script(format!(
                "{} threw during evaluation",
                scope.script_url()
            )));
        }
        debug!(script = %scope.script_url(), bytes = source.len(), "Evaluated scenario script");
        Ok("evaluated".to_string())
    }

    fn dispatch_lifecycle_event(
        &self,
        scope: &ServiceWorkerGlobalScope,
        event: LifecycleEvent,
    ) -> Result<(), ServiceWorkerError> {
        if self.skip_waiting && event == LifecycleEvent::Install {
            // Settles later on this worker's loop.
            let _ = scope.skip_waiting();
        }
        Ok(())
    }
}

// ==================== Runner ====================

struct ScenarioClient {
    context: Arc<WebContext>,
    events: UnboundedReceiver<ServiceWorkerEvent>,
    event_loop: EventLoop,
    open: bool,
}

struct ScenarioRunner {
    jobs: ServiceWorkerJobs,
    loader: InMemoryScriptLoader,
    clients: BTreeMap<String, ScenarioClient>,
    timeout: Duration,
}

fn parse_url(input: &str) -> Result<Url, ScenarioError> {
    Url::parse(input).map_err(|e| ScenarioError::Url(input.to_string(), e))
}

impl ScenarioRunner {
    fn new(scenario: &Scenario) -> Result<Self, ScenarioError> {
        let loader = InMemoryScriptLoader::new()?;
        for (url, source) in &scenario.scripts {
            loader.insert(parse_url(url)?, source.clone());
        }
        let failing = scenario
            .failing_scripts
            .iter()
            .map(|url| parse_url(url))
            .collect::<Result<HashSet<_>, _>>()?;
        let host = Arc::new(ScenarioHost {
            failing,
            skip_waiting: scenario.skip_waiting,
        });
        let jobs =
            ServiceWorkerJobs::spawn(scenario.config.clone(), Arc::new(loader.clone()), host)?;

        let mut runner = Self {
            jobs,
            loader,
            clients: BTreeMap::new(),
            timeout: Duration::from_millis(scenario.step_timeout_ms),
        };
        for spec in &scenario.clients {
            runner.open_client(spec)?;
        }
        runner.jobs.flush()?;
        Ok(runner)
    }

    fn open_client(&mut self, spec: &ClientSpec) -> Result<(), ScenarioError> {
        if self.clients.contains_key(&spec.name) {
            return Err(ScenarioError::DuplicateClient(spec.name.clone()));
        }
        let url = parse_url(&spec.url)?;
        let event_loop: EventLoop = EventLoop::new(format!("Client {}", spec.name))?;
        let (context, events) = WebContext::new(url, spec.client_type, event_loop.runner());
        self.jobs.register_web_context(&context);
        debug!(client = %spec.name, id = %context.id(), "Opened scenario client");
        self.clients.insert(
            spec.name.clone(),
            ScenarioClient {
                context,
                events,
                event_loop,
                open: true,
            },
        );
        Ok(())
    }

    fn context(&self, name: &str) -> Result<Arc<WebContext>, ScenarioError> {
        self.clients
            .get(name)
            .filter(|client| client.open)
            .map(|client| client.context.clone())
            .ok_or_else(|| ScenarioError::UnknownClient(name.to_string()))
    }

    fn resolve_against(context: &WebContext, input: &str) -> Result<Url, ScenarioError> {
        context
            .creation_url()
            .join(input)
            .map_err(|e| ScenarioError::Url(input.to_string(), e))
    }

    fn settle<T: Clone>(
        &self,
        what: &str,
        promise: Promise<T>,
        describe: impl FnOnce(T) -> Value,
    ) -> Result<Outcome, ScenarioError> {
        match promise.wait_timeout(self.timeout) {
            Some(Ok(value)) => Ok(Outcome::Resolved { value: describe(value) }),
            Some(Err(error)) => Ok(Outcome::rejected(&error)),
            None => Err(ScenarioError::Timeout(self.timeout, what.to_string())),
        }
    }

    fn execute(&mut self, step: &Step) -> Result<Outcome, ScenarioError> {
        match step {
            Step::Register { client, script, options } => {
                let context = self.context(client)?;
                let promise = self.jobs.start_register(&context, script, options.clone());
                self.settle("register", promise, |registration| {
                    describe_registration(&registration)
                })
            }
            Step::Update { client, scope } => {
                let context = self.context(client)?;
                let lookup = self.jobs.get_registration(&context, Some(scope));
                let found = match lookup.wait_timeout(self.timeout) {
                    Some(Ok(found)) => found,
                    Some(Err(error)) => return Ok(Outcome::rejected(&error)),
                    None => {
                        return Err(ScenarioError::Timeout(
                            self.timeout,
                            "get_registration".to_string(),
                        ))
                    }
                };
                let Some(registration) = found else {
                    let error = ServiceWorkerError::invalid_state(format!(
                        "no registration matches {}",
                        scope
                    ));
                    return Ok(Outcome::rejected(&error));
                };
                let promise = self.jobs.start_update(&context, &registration);
                self.settle("update", promise, |registration| describe_registration(&registration))
            }
            Step::Unregister { client, scope } => {
                let context = self.context(client)?;
                let scope = Self::resolve_against(&context, scope)?;
                let promise = self.jobs.start_unregister(&context, &scope);
                self.settle("unregister", promise, Value::Bool)
            }
            Step::GetRegistration { client, url } => {
                let context = self.context(client)?;
                let promise = self.jobs.get_registration(&context, url.as_deref());
                self.settle("get_registration", promise, |found| {
                    found.map_or(Value::Null, |registration| describe_registration(&registration))
                })
            }
            Step::SetScript { url, source } => {
                self.loader.insert(parse_url(url)?, source.clone());
                Ok(Outcome::done())
            }
            Step::RemoveScript { url } => {
                self.loader.remove(&parse_url(url)?);
                Ok(Outcome::done())
            }
            Step::WaitActive { scope } => {
                let scope = parse_url(scope)?;
                let snapshot = self.wait_active(&scope)?;
                Ok(Outcome::Resolved {
                    value: serde_json::to_value(snapshot)?,
                })
            }
            Step::Close { client } => {
                let context = self.context(client)?;
                self.jobs.unregister_web_context(&context);
                if let Some(closed) = self.clients.get_mut(client) {
                    closed.open = false;
                }
                Ok(Outcome::done())
            }
        }
    }

    fn wait_active(&self, scope: &Url) -> Result<RegistrationSnapshot, ScenarioError> {
        let storage_key = StorageKey::from_url(scope);
        let deadline = Instant::now() + self.timeout;
        loop {
            let snapshot = self.jobs.registration(&storage_key, scope);
            let activated = snapshot
                .as_ref()
                .and_then(|snapshot| snapshot.active.as_ref())
                .map_or(false, |active| active.state == ServiceWorkerState::Activated);
            match snapshot {
                Some(snapshot) if activated => return Ok(snapshot),
                _ if Instant::now() >= deadline => {
                    return Err(ScenarioError::Timeout(
                        self.timeout,
                        format!("an active worker at {}", scope),
                    ))
                }
                _ => thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    fn drain_events(&mut self) -> Result<Vec<ClientEventReport>, ScenarioError> {
        let mut reports = Vec::new();
        for (name, client) in self.clients.iter_mut() {
            client.event_loop.flush()?;
            while let Ok(event) = client.events.try_recv() {
                reports.push(ClientEventReport {
                    client: name.clone(),
                    event: describe_event(&event),
                });
            }
        }
        Ok(reports)
    }
}

impl Drop for ScenarioRunner {
    fn drop(&mut self) {
        for client in self.clients.values_mut().filter(|client| client.open) {
            self.jobs.unregister_web_context(&client.context);
            client.open = false;
        }
    }
}

/// Run every step of `scenario` in order.
pub fn run(scenario: &Scenario) -> Result<ScenarioReport, ScenarioError> {
    let mut runner = ScenarioRunner::new(scenario)?;
    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (index, spec) in scenario.steps.iter().enumerate() {
        let outcome = runner.execute(&spec.step)?;
        runner.jobs.flush()?;
        let events = runner.drain_events()?;
        let matched = spec.expect.map(|expect| expect == outcome.kind());
        info!(index, action = spec.step.action(), ?matched, "Step finished");
        steps.push(StepReport {
            index,
            action: spec.step.action(),
            outcome,
            matched,
            events,
        });
    }
    let registrations = runner.jobs.registrations();
    Ok(ScenarioReport { steps, registrations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASIC: &str = r#"{
        "scripts": {
            "https://example.com/sw.js": "self.oninstall = () => {};"
        },
        "clients": [
            { "name": "page", "url": "https://example.com/index.html" }
        ],
        "steps": [
            {
                "action": "register", "client": "page", "script": "/sw.js",
                "options": { "scope": "/" }, "expect": "resolved"
            },
            { "action": "wait_active", "scope": "https://example.com/" },
            {
                "action": "register", "client": "page", "script": "/missing.js",
                "options": { "scope": "/other/" }, "expect": "rejected"
            },
            { "action": "unregister", "client": "page", "scope": "/", "expect": "resolved" }
        ]
    }"#;

    fn scenario(json: &str) -> Scenario {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_steps() {
        let scenario = scenario(BASIC);
        assert_eq!(scenario.clients.len(), 1);
        assert_eq!(scenario.clients[0].client_type, ClientType::Window);
        assert_eq!(scenario.steps.len(), 4);
        assert_eq!(scenario.steps[0].step.action(), "register");
        assert_eq!(scenario.steps[0].expect, Some(Expect::Resolved));
        assert_eq!(scenario.steps[1].expect, None);
        assert_eq!(scenario.step_timeout_ms, 5_000);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(BASIC.as_bytes()).unwrap();
        let scenario = Scenario::from_file(file.path()).unwrap();
        assert_eq!(scenario.scripts.len(), 1);

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        broken.write_all(b"{ \"steps\": ").unwrap();
        assert!(matches!(Scenario::from_file(broken.path()), Err(ScenarioError::Parse(_))));
    }

    #[test]
    fn test_run_basic_scenario() {
        let report = run(&scenario(BASIC)).unwrap();
        assert!(report.passed(), "{:#?}", report);
        assert_eq!(report.steps.len(), 4);
        assert_eq!(
            report.steps[3].outcome,
            Outcome::Resolved {
                value: Value::Bool(true)
            }
        );
        assert!(matches!(
            report.steps[2].outcome,
            Outcome::Rejected { name: "TypeError", .. }
        ));
        let events: Vec<_> = report.steps.iter().flat_map(|step| step.events.iter()).collect();
        assert!(events.iter().all(|event| event.client == "page"));
        assert!(report.registrations.is_empty());
    }

    #[test]
    fn test_unknown_client_is_an_error() {
        let json = r#"{
            "clients": [],
            "steps": [ { "action": "close", "client": "ghost" } ]
        }"#;
        assert!(matches!(
            run(&scenario(json)),
            Err(ScenarioError::UnknownClient(name)) if name == "ghost"
        ));
    }

    #[test]
    fn test_failed_expectation_is_reported() {
        let json = r#"{
            "clients": [ { "name": "page", "url": "http://insecure.example/" } ],
            "steps": [
                { "action": "register", "client": "page", "script": "sw.js", "expect": "resolved" }
            ]
        }"#;
        let report = run(&scenario(json)).unwrap();
        assert!(!report.passed());
        assert_eq!(report.steps[0].matched, Some(false));
        assert!(matches!(
            report.steps[0].outcome,
            Outcome::Rejected { name: "SecurityError", .. }
        ));
    }

    #[test]
    fn test_update_without_registration_is_rejected() {
        let json = r#"{
            "clients": [ { "name": "page", "url": "https://example.com/" } ],
            "steps": [ { "action": "update", "client": "page", "scope": "/" } ]
        }"#;
        let report = run(&scenario(json)).unwrap();
        assert!(matches!(
            report.steps[0].outcome,
            Outcome::Rejected { name: "InvalidStateError", .. }
        ));
    }
}
