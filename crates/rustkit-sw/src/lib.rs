//! # RustKit Service Workers
//!
//! Service worker lifecycle and job scheduling for the RustKit browser engine.
//!
//! ## Features
//!
//! - **Registration**: `navigator.serviceWorker.register()` as a queued Register job
//! - **Update**: script re-fetch with byte-for-byte change detection, including imported scripts
//! - **Lifecycle**: install, activate, skip waiting, unregister and registration clearing
//! - **Job queues**: one FIFO queue per scope, equivalent jobs coalesced into a single outcome
//! - **Clients API**: `clients.get()`, `clients.matchAll()`, `clients.claim()`
//! - **Cross-thread delivery**: promises and events settle on each client's own event loop
//!
//! ## Architecture
//!
//! ```text
//! client loop ──StartRegister / Update / Unregister──┐
//!                                                    ▼
//!                             ServiceWorkerJobs (engine sequence thread)
//!                                 │
//!                                 ├── JobQueue per scope ── Job (+ equivalent jobs)
//!                                 ├── RegistrationMap
//!                                 │       └── RegistrationRecord
//!                                 │               ├── installing ─┐
//!                                 │               ├── waiting ────┼── ServiceWorkerRecord ── agent
//!                                 │               └── active ─────┘
//!                                 ├── ScriptLoader (async fetch, answers back on the engine)
//!                                 └── live WebContexts ──post──▶ client loop
//!                                                                  ├── ServiceWorkerRegistration
//!                                                                  ├── ServiceWorker
//!                                                                  └── ServiceWorkerEvent channel
//! ```
//!
//! All registration, worker and queue mutation happens on the engine sequence.
//! Other threads only read snapshots or post tasks.

use rustkit_common::RustKitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub mod client;
pub mod config;
pub mod context;
pub mod job;
pub mod loader;
pub mod origin;
pub mod promise;
pub mod registration;
pub mod scope;
pub mod worker;

mod clients;
mod engine;
mod jobs;
mod lifecycle;

pub use client::{
    Client, ClientMatchOptions, ClientType, FrameType, ServiceWorker, ServiceWorkerEvent,
    ServiceWorkerRegistration, VisibilityState,
};
pub use config::JobsConfig;
pub use context::WebContext;
pub use engine::{JobsEngine, ServiceWorkerJobs};
pub use job::JobType;
pub use loader::{InMemoryScriptLoader, ScriptLoader, ScriptRequest, ScriptSink};
pub use origin::{Origin, StorageKey};
pub use promise::{Promise, PromiseState};
pub use registration::{RegistrationSnapshot, WorkerSnapshot};
pub use scope::ServiceWorkerGlobalScope;
pub use worker::{LifecycleEvent, NoopScriptHost, ScriptHost};

// ==================== Errors ====================

/// Errors surfaced to web content, mirroring the exception each algorithm rejects with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("TypeError: {0}")]
    TypeError(String),

    #[error("SecurityError: {0}")]
    SecurityError(String),

    #[error("InvalidStateError: {0}")]
    InvalidStateError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl ServiceWorkerError {
    /// The exception name web content sees.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceWorkerError::TypeError(_) => "TypeError",
            ServiceWorkerError::SecurityError(_) => "SecurityError",
            ServiceWorkerError::InvalidStateError(_) => "InvalidStateError",
            ServiceWorkerError::NotFound(_) => "NotFoundError",
            ServiceWorkerError::Network(_) => "NetworkError",
            ServiceWorkerError::Script(_) => "Error",
            ServiceWorkerError::Runtime(_) => "AbortError",
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::TypeError(message.into())
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::SecurityError(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidStateError(message.into())
    }
}

impl From<RustKitError> for ServiceWorkerError {
    fn from(err: RustKitError) -> Self {
        tracing::debug!(
            category = err.category(),
            error = %err,
            "Engine failure surfaced as a runtime error"
        );
        ServiceWorkerError::Runtime(err.to_string())
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Unique identifier for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(u64);

impl RegistrationId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registration-{}", self.0)
    }
}

/// Service worker state.
///
/// Ordered by lifecycle progression; a worker's state only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Initial state, script parsed but never announced to clients.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced, cleared or install failed).
    Redundant,
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Service worker update via cache type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateViaCache {
    #[default]
    Imports,
    All,
    None,
}

/// Service worker type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    #[default]
    Classic,
    /// Accepted, but run as a classic script.
    Module,
}

/// Options for service worker registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationOptions {
    /// Scope URL, resolved against the client's creation URL.
    pub scope: Option<String>,

    /// Worker type.
    #[serde(rename = "type")]
    pub worker_type: WorkerType,

    /// Update via cache mode.
    pub update_via_cache: UpdateViaCache,
}

impl RegistrationOptions {
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_update_via_cache(mut self, mode: UpdateViaCache) -> Self {
        self.update_via_cache = mode;
        self
    }
}
