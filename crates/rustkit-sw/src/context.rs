//! Web contexts: the service worker clients known to the engine.

use hashbrown::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;
use url::Url;

use rustkit_common::{LockExt, TaskRunner};

use crate::client::{
    Client, ClientType, FrameType, ServiceWorker, ServiceWorkerEvent, ServiceWorkerRegistration,
    VisibilityState,
};
use crate::origin::{Origin, StorageKey};
use crate::promise::Promise;
use crate::registration::{RegistrationRecord, RegistrationSlot};
use crate::worker::ServiceWorkerRecord;
use crate::{RegistrationId, ServiceWorkerId};

struct ContextState {
    active_service_worker: Option<Arc<ServiceWorkerRecord>>,
    service_workers: HashMap<ServiceWorkerId, ServiceWorker>,
    registrations: HashMap<RegistrationId, ServiceWorkerRegistration>,
    focused: bool,
    visibility_state: VisibilityState,
}

/// A window or worker client.
///
/// Owns the client's wrapper objects and its event loop handle. The engine
/// posts wrapper updates, promise settlements and events onto `runner`.
pub struct WebContext {
    id: String,
    creation_url: Url,
    client_type: ClientType,
    storage_key: StorageKey,
    creation_order: u64,
    runner: TaskRunner,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ready: Promise<ServiceWorkerRegistration>,
    state: Mutex<ContextState>,
}

impl WebContext {
    /// Create a client living on `runner`. The receiver yields the client's events.
    pub fn new(
        creation_url: Url,
        client_type: ClientType,
        runner: TaskRunner,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        static CREATION_ORDER: AtomicU64 = AtomicU64::new(0);

        let (events, receiver) = mpsc::unbounded_channel();
        let storage_key = StorageKey::from_url(&creation_url);
        let context = Arc::new(Self {
            id: format!("client-{}", uuid_simple()),
            creation_url,
            client_type,
            storage_key,
            creation_order: CREATION_ORDER.fetch_add(1, Ordering::Relaxed),
            runner,
            events,
            ready: Promise::new(),
            state: Mutex::new(ContextState {
                active_service_worker: None,
                service_workers: HashMap::new(),
                registrations: HashMap::new(),
                focused: client_type == ClientType::Window,
                visibility_state: VisibilityState::Visible,
            }),
        });
        (context, receiver)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn creation_url(&self) -> &Url {
        &self.creation_url
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    pub fn origin(&self) -> Origin {
        Origin::from_url(&self.creation_url)
    }

    pub(crate) fn creation_order(&self) -> u64 {
        self.creation_order
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn is_window(&self) -> bool {
        self.client_type == ClientType::Window
    }

    pub fn focused(&self) -> bool {
        self.state.lock_or_recover().focused
    }

    pub fn set_focused(&self, focused: bool) {
        self.state.lock_or_recover().focused = focused;
    }

    pub fn visibility_state(&self) -> VisibilityState {
        self.state.lock_or_recover().visibility_state
    }

    pub fn set_visibility_state(&self, visibility_state: VisibilityState) {
        self.state.lock_or_recover().visibility_state = visibility_state;
    }

    /// The `Client` object describing this context.
    pub fn client_snapshot(&self) -> Client {
        let state = self.state.lock_or_recover();
        Client {
            id: self.id.clone(),
            url: self.creation_url.clone(),
            client_type: self.client_type,
            frame_type: if self.is_window() {
                FrameType::TopLevel
            } else {
                FrameType::None
            },
            visibility_state: state.visibility_state,
            focused: self.is_window() && state.focused,
        }
    }

    // ==================== Controller ====================

    /// `navigator.serviceWorker.controller`.
    pub fn controller(&self) -> Option<ServiceWorker> {
        let mut state = self.state.lock_or_recover();
        let active = state.active_service_worker.clone()?;
        Some(Self::service_worker_locked(&mut state, &active))
    }

    pub(crate) fn active_service_worker(&self) -> Option<Arc<ServiceWorkerRecord>> {
        self.state.lock_or_recover().active_service_worker.clone()
    }

    pub(crate) fn set_active_service_worker(&self, worker: Option<Arc<ServiceWorkerRecord>>) {
        self.state.lock_or_recover().active_service_worker = worker;
    }

    pub(crate) fn is_controlled_by(&self, worker: &Arc<ServiceWorkerRecord>) -> bool {
        self.state
            .lock_or_recover()
            .active_service_worker
            .as_ref()
            .map_or(false, |active| Arc::ptr_eq(active, worker))
    }

    /// Whether this client's controller belongs to `registration`.
    pub(crate) fn is_using_registration(&self, registration: &Arc<RegistrationRecord>) -> bool {
        self.state
            .lock_or_recover()
            .active_service_worker
            .as_ref()
            .map_or(false, |active| active.belongs_to(registration))
    }

    // ==================== Wrapper objects ====================

    /// The client's `ServiceWorker` for `worker`, created on first use.
    pub(crate) fn get_service_worker(&self, worker: &Arc<ServiceWorkerRecord>) -> ServiceWorker {
        let mut state = self.state.lock_or_recover();
        Self::service_worker_locked(&mut state, worker)
    }

    fn service_worker_locked(
        state: &mut ContextState,
        worker: &Arc<ServiceWorkerRecord>,
    ) -> ServiceWorker {
        state
            .service_workers
            .entry(worker.id())
            .or_insert_with(|| {
                ServiceWorker::new(worker.id(), worker.script_url().clone(), worker.state())
            })
            .clone()
    }

    pub fn lookup_service_worker(&self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        self.state.lock_or_recover().service_workers.get(&id).cloned()
    }

    pub(crate) fn remove_service_worker(&self, id: ServiceWorkerId) {
        if self.state.lock_or_recover().service_workers.remove(&id).is_some() {
            trace!(client = %self.id, worker = %id, "Removed service worker object");
        }
    }

    /// The client's `ServiceWorkerRegistration` for `registration`, created on first use.
    pub(crate) fn get_service_worker_registration(
        &self,
        registration: &Arc<RegistrationRecord>,
    ) -> ServiceWorkerRegistration {
        let mut state = self.state.lock_or_recover();
        if let Some(existing) = state.registrations.get(&registration.id()) {
            return existing.clone();
        }
        let wrapper = ServiceWorkerRegistration::new(
            registration.id(),
            registration.scope_url().clone(),
            registration.update_via_cache(),
        );
        for slot in [
            RegistrationSlot::Installing,
            RegistrationSlot::Waiting,
            RegistrationSlot::Active,
        ] {
            let worker = registration
                .worker(slot)
                .map(|worker| Self::service_worker_locked(&mut state, &worker));
            wrapper.set_slot(slot, worker);
        }
        state.registrations.insert(registration.id(), wrapper.clone());
        wrapper
    }

    pub fn lookup_service_worker_registration(
        &self,
        id: RegistrationId,
    ) -> Option<ServiceWorkerRegistration> {
        self.state.lock_or_recover().registrations.get(&id).cloned()
    }

    // ==================== Container ====================

    /// `navigator.serviceWorker.ready`.
    pub fn ready_promise(&self) -> Promise<ServiceWorkerRegistration> {
        self.ready.clone()
    }

    /// Resolve the ready promise with `registration` if it is still pending.
    pub(crate) fn maybe_resolve_ready_promise(&self, registration: &Arc<RegistrationRecord>) {
        if !self.ready.is_pending() {
            return;
        }
        let wrapper = self.get_service_worker_registration(registration);
        if self.ready.resolve(wrapper) {
            trace!(client = %self.id, registration = %registration.id(), "Ready promise resolved");
        }
    }

    /// Fire an event at the client. Dropped receivers are ignored.
    pub(crate) fn dispatch_event(&self, event: ServiceWorkerEvent) {
        trace!(client = %self.id, ?event, "Dispatching event");
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for WebContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebContext")
            .field("id", &self.id)
            .field("creation_url", &self.creation_url.as_str())
            .field("client_type", &self.client_type)
            .finish_non_exhaustive()
    }
}

fn uuid_simple() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!(
        "{:016x}-{:04x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
