//! Client-visible objects: the `ServiceWorker` and `ServiceWorkerRegistration`
//! wrappers a client holds, `Client` snapshots, and client events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use url::Url;

use rustkit_common::LockExt;

use crate::registration::RegistrationSlot;
use crate::{RegistrationId, ServiceWorkerId, ServiceWorkerState, UpdateViaCache};

// ==================== Service Worker ====================

struct ServiceWorkerInner {
    id: ServiceWorkerId,
    script_url: Url,
    state: Mutex<ServiceWorkerState>,
}

/// A client's view of one service worker.
///
/// Each client owns at most one wrapper per worker; clones share it.
#[derive(Clone)]
pub struct ServiceWorker {
    inner: Arc<ServiceWorkerInner>,
}

impl ServiceWorker {
    pub(crate) fn new(id: ServiceWorkerId, script_url: Url, state: ServiceWorkerState) -> Self {
        Self {
            inner: Arc::new(ServiceWorkerInner {
                id,
                script_url,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.inner.id
    }

    pub fn script_url(&self) -> &Url {
        &self.inner.script_url
    }

    pub fn state(&self) -> ServiceWorkerState {
        *self.inner.state.lock_or_recover()
    }

    /// Move the state forward. Returns false unless `state` is later than the current one.
    pub(crate) fn advance_state(&self, state: ServiceWorkerState) -> bool {
        let mut current = self.inner.state.lock_or_recover();
        if state <= *current {
            return false;
        }
        *current = state;
        true
    }
}

impl PartialEq for ServiceWorker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.inner.id)
            .field("script_url", &self.inner.script_url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

// ==================== Registration ====================

#[derive(Default)]
struct Slots {
    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,
}

struct RegistrationInner {
    id: RegistrationId,
    scope: Url,
    update_via_cache: Mutex<UpdateViaCache>,
    slots: Mutex<Slots>,
}

/// A client's view of one registration.
#[derive(Clone)]
pub struct ServiceWorkerRegistration {
    inner: Arc<RegistrationInner>,
}

impl ServiceWorkerRegistration {
    pub(crate) fn new(id: RegistrationId, scope: Url, update_via_cache: UpdateViaCache) -> Self {
        Self {
            inner: Arc::new(RegistrationInner {
                id,
                scope,
                update_via_cache: Mutex::new(update_via_cache),
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    pub fn id(&self) -> RegistrationId {
        self.inner.id
    }

    pub fn scope(&self) -> &Url {
        &self.inner.scope
    }

    pub fn update_via_cache(&self) -> UpdateViaCache {
        *self.inner.update_via_cache.lock_or_recover()
    }

    pub(crate) fn set_update_via_cache(&self, mode: UpdateViaCache) {
        *self.inner.update_via_cache.lock_or_recover() = mode;
    }

    pub fn installing(&self) -> Option<ServiceWorker> {
        self.inner.slots.lock_or_recover().installing.clone()
    }

    pub fn waiting(&self) -> Option<ServiceWorker> {
        self.inner.slots.lock_or_recover().waiting.clone()
    }

    pub fn active(&self) -> Option<ServiceWorker> {
        self.inner.slots.lock_or_recover().active.clone()
    }

    /// Installing, else waiting, else active worker.
    pub fn newest_worker(&self) -> Option<ServiceWorker> {
        let slots = self.inner.slots.lock_or_recover();
        slots
            .installing
            .clone()
            .or_else(|| slots.waiting.clone())
            .or_else(|| slots.active.clone())
    }

    pub(crate) fn set_slot(&self, slot: RegistrationSlot, worker: Option<ServiceWorker>) {
        let mut slots = self.inner.slots.lock_or_recover();
        match slot {
            RegistrationSlot::Installing => slots.installing = worker,
            RegistrationSlot::Waiting => slots.waiting = worker,
            RegistrationSlot::Active => slots.active = worker,
        }
    }
}

impl PartialEq for ServiceWorkerRegistration {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ServiceWorkerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots.lock_or_recover();
        f.debug_struct("ServiceWorkerRegistration")
            .field("id", &self.inner.id)
            .field("scope", &self.inner.scope.as_str())
            .field("installing", &slots.installing.as_ref().map(|w| w.id()))
            .field("waiting", &slots.waiting.as_ref().map(|w| w.id()))
            .field("active", &slots.active.as_ref().map(|w| w.id()))
            .finish()
    }
}

// ==================== Client ====================

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameType {
    Auxiliary,
    TopLevel,
    Nested,
    None,
}

/// Visibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityState {
    Hidden,
    #[default]
    Visible,
}

/// Snapshot of a client as seen through the Clients API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client creation URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Frame type (`None` for worker clients).
    pub frame_type: FrameType,

    /// Visibility state (window clients).
    pub visibility_state: VisibilityState,

    /// Whether focused (window clients).
    pub focused: bool,
}

/// Options for clients.matchAll().
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    #[serde(rename = "type")]
    pub client_type: ClientType,
}

impl ClientMatchOptions {
    pub fn all() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::All,
        }
    }
}

// ==================== Events ====================

/// Events fired at a client's service worker objects, in dispatch order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// `updatefound` on a registration.
    UpdateFound { registration: RegistrationId },
    /// `statechange` on a worker.
    StateChange {
        worker: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// `controllerchange` on the client's container.
    ControllerChange { controller: Option<ServiceWorkerId> },
}
