//! Registration records and the registration map.

use hashbrown::HashMap;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error};
use url::Url;

use rustkit_common::LockExt;

use crate::origin::{Origin, StorageKey};
use crate::worker::ServiceWorkerRecord;
use crate::{RegistrationId, ServiceWorkerId, ServiceWorkerState, UpdateViaCache};

/// One of the three worker slots of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationSlot {
    Installing,
    Waiting,
    Active,
}

#[derive(Default)]
struct RegistrationState {
    installing: Option<Arc<ServiceWorkerRecord>>,
    waiting: Option<Arc<ServiceWorkerRecord>>,
    active: Option<Arc<ServiceWorkerRecord>>,
    update_via_cache: UpdateViaCache,
    last_update_check: Option<Instant>,
}

/// The engine's record of a registration.
///
/// Slots and mode are only mutated on the engine sequence; other sequences
/// read them through the accessors.
pub struct RegistrationRecord {
    id: RegistrationId,
    storage_key: StorageKey,
    scope_url: Url,
    state: Mutex<RegistrationState>,
}

impl RegistrationRecord {
    pub(crate) fn new(
        storage_key: StorageKey,
        scope_url: Url,
        update_via_cache: UpdateViaCache,
    ) -> Self {
        Self {
            id: RegistrationId::new(),
            storage_key,
            scope_url,
            state: Mutex::new(RegistrationState {
                update_via_cache,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    pub fn scope_url(&self) -> &Url {
        &self.scope_url
    }

    pub fn installing_worker(&self) -> Option<Arc<ServiceWorkerRecord>> {
        self.state.lock_or_recover().installing.clone()
    }

    pub fn waiting_worker(&self) -> Option<Arc<ServiceWorkerRecord>> {
        self.state.lock_or_recover().waiting.clone()
    }

    pub fn active_worker(&self) -> Option<Arc<ServiceWorkerRecord>> {
        self.state.lock_or_recover().active.clone()
    }

    pub fn worker(&self, slot: RegistrationSlot) -> Option<Arc<ServiceWorkerRecord>> {
        let state = self.state.lock_or_recover();
        match slot {
            RegistrationSlot::Installing => state.installing.clone(),
            RegistrationSlot::Waiting => state.waiting.clone(),
            RegistrationSlot::Active => state.active.clone(),
        }
    }

    pub(crate) fn set_worker(
        &self,
        slot: RegistrationSlot,
        worker: Option<Arc<ServiceWorkerRecord>>,
    ) {
        let mut state = self.state.lock_or_recover();
        match slot {
            RegistrationSlot::Installing => state.installing = worker,
            RegistrationSlot::Waiting => state.waiting = worker,
            RegistrationSlot::Active => state.active = worker,
        }
    }

    /// Installing, else waiting, else active worker.
    pub fn newest_worker(&self) -> Option<Arc<ServiceWorkerRecord>> {
        let state = self.state.lock_or_recover();
        state
            .installing
            .clone()
            .or_else(|| state.waiting.clone())
            .or_else(|| state.active.clone())
    }

    pub fn update_via_cache(&self) -> UpdateViaCache {
        self.state.lock_or_recover().update_via_cache
    }

    pub(crate) fn set_update_via_cache(&self, mode: UpdateViaCache) {
        self.state.lock_or_recover().update_via_cache = mode;
    }

    pub fn last_update_check_time(&self) -> Option<Instant> {
        self.state.lock_or_recover().last_update_check
    }

    pub(crate) fn set_last_update_check_time(&self, time: Instant) {
        self.state.lock_or_recover().last_update_check = Some(time);
    }

    /// Whether the last update check is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.last_update_check_time() {
            Some(last) => last.elapsed() > max_age,
            None => false,
        }
    }

    pub fn snapshot(&self) -> RegistrationSnapshot {
        let state = self.state.lock_or_recover();
        RegistrationSnapshot {
            id: self.id,
            storage_key: self.storage_key.clone(),
            scope: self.scope_url.clone(),
            update_via_cache: state.update_via_cache,
            installing: state.installing.as_deref().map(WorkerSnapshot::of),
            waiting: state.waiting.as_deref().map(WorkerSnapshot::of),
            active: state.active.as_deref().map(WorkerSnapshot::of),
        }
    }
}

impl fmt::Debug for RegistrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationRecord")
            .field("id", &self.id)
            .field("storage_key", &self.storage_key)
            .field("scope_url", &self.scope_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub id: ServiceWorkerId,
    pub script_url: Url,
    pub state: ServiceWorkerState,
    pub running: bool,
}

impl WorkerSnapshot {
    fn of(worker: &ServiceWorkerRecord) -> Self {
        Self {
            id: worker.id(),
            script_url: worker.script_url().clone(),
            state: worker.state(),
            running: worker.is_running(),
        }
    }
}

/// Point-in-time view of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationSnapshot {
    pub id: RegistrationId,
    pub storage_key: StorageKey,
    pub scope: Url,
    pub update_via_cache: UpdateViaCache,
    pub installing: Option<WorkerSnapshot>,
    pub waiting: Option<WorkerSnapshot>,
    pub active: Option<WorkerSnapshot>,
}

// ==================== Registration Map ====================

type RegistrationKey = (StorageKey, String);

/// Registrations keyed by (storage key, serialized scope URL).
#[derive(Debug, Default)]
pub struct RegistrationMap {
    registrations: HashMap<RegistrationKey, Arc<RegistrationRecord>>,
}

impl RegistrationMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(storage_key: &StorageKey, scope_url: &Url) -> RegistrationKey {
        (storage_key.clone(), scope_url.as_str().to_string())
    }

    /// Exact lookup.
    pub fn get(
        &self,
        storage_key: &StorageKey,
        scope_url: &Url,
    ) -> Option<Arc<RegistrationRecord>> {
        self.registrations
            .get(&Self::key(storage_key, scope_url))
            .cloned()
    }

    /// Create and store a registration. The key must not already be present.
    pub fn set(
        &mut self,
        storage_key: StorageKey,
        scope_url: Url,
        update_via_cache: UpdateViaCache,
    ) -> Arc<RegistrationRecord> {
        let key = Self::key(&storage_key, &scope_url);
        if self.registrations.contains_key(&key) {
            error!(%storage_key, scope = %scope_url, "Registration already exists for key");
            debug_assert!(false, "registration already exists for {}", scope_url);
        }
        let registration =
            Arc::new(RegistrationRecord::new(storage_key, scope_url, update_via_cache));
        debug!(id = %registration.id(), scope = %registration.scope_url(), "Registration created");
        self.registrations.insert(key, registration.clone());
        registration
    }

    /// Remove the entry for the key, if any.
    pub fn remove(
        &mut self,
        storage_key: &StorageKey,
        scope_url: &Url,
    ) -> Option<Arc<RegistrationRecord>> {
        let removed = self.registrations.remove(&Self::key(storage_key, scope_url));
        if let Some(ref registration) = removed {
            debug!(id = %registration.id(), scope = %scope_url, "Registration removed");
        }
        removed
    }

    /// Find the registration whose scope is the longest prefix of `client_url`.
    pub fn match_registration(
        &self,
        storage_key: &StorageKey,
        client_url: &Url,
    ) -> Option<Arc<RegistrationRecord>> {
        let client_origin = Origin::from_url(client_url);
        let mut client_url = client_url.clone();
        client_url.set_fragment(None);
        let client_spec = client_url.as_str();

        self.registrations
            .iter()
            .filter(|((key, scope), registration)| {
                key == storage_key
                    && client_spec.starts_with(scope.as_str())
                    && Origin::from_url(registration.scope_url()).same_origin(&client_origin)
            })
            .max_by_key(|((_, scope), _)| scope.len())
            .map(|(_, registration)| registration.clone())
    }

    /// True if the map no longer holds this exact registration.
    pub fn is_unregistered(&self, registration: &Arc<RegistrationRecord>) -> bool {
        match self.get(registration.storage_key(), registration.scope_url()) {
            Some(current) => !Arc::ptr_eq(&current, registration),
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegistrationRecord>> {
        self.registrations.values()
    }

    /// Remove and return every registration.
    pub fn drain(&mut self) -> Vec<Arc<RegistrationRecord>> {
        self.registrations.drain().map(|(_, registration)| registration).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn key() -> StorageKey {
        StorageKey::from_url(&url("https://example.com/"))
    }

    #[test]
    fn test_set_get_remove() {
        let mut map = RegistrationMap::new();
        let scope = url("https://example.com/app/");
        assert!(map.get(&key(), &scope).is_none());

        let registration = map.set(key(), scope.clone(), UpdateViaCache::All);
        let found = map.get(&key(), &scope).unwrap();
        assert!(Arc::ptr_eq(&registration, &found));
        assert_eq!(found.update_via_cache(), UpdateViaCache::All);

        assert!(map.remove(&key(), &scope).is_some());
        assert!(map.remove(&key(), &scope).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_longest_prefix_match() {
        let mut map = RegistrationMap::new();
        map.set(key(), url("https://example.com/a/"), UpdateViaCache::Imports);
        let deeper = map.set(key(), url("https://example.com/a/b/"), UpdateViaCache::Imports);

        let matched = map
            .match_registration(&key(), &url("https://example.com/a/b/c"))
            .unwrap();
        assert!(Arc::ptr_eq(&matched, &deeper));

        let shallow = map
            .match_registration(&key(), &url("https://example.com/a/x"))
            .unwrap();
        assert_eq!(shallow.scope_url().as_str(), "https://example.com/a/");

        assert!(map
            .match_registration(&key(), &url("https://example.com/other"))
            .is_none());
    }

    #[test]
    fn test_match_requires_storage_key_and_origin() {
        let mut map = RegistrationMap::new();
        map.set(key(), url("https://example.com/"), UpdateViaCache::Imports);

        let other_key = StorageKey::from_url(&url("https://other.example/"));
        assert!(map
            .match_registration(&other_key, &url("https://example.com/page"))
            .is_none());
        assert!(map
            .match_registration(&key(), &url("https://example.com.evil/page"))
            .is_none());
    }

    #[test]
    fn test_is_unregistered() {
        let mut map = RegistrationMap::new();
        let scope = url("https://example.com/");
        let first = map.set(key(), scope.clone(), UpdateViaCache::Imports);
        assert!(!map.is_unregistered(&first));

        map.remove(&key(), &scope);
        assert!(map.is_unregistered(&first));

        let second = map.set(key(), scope, UpdateViaCache::Imports);
        assert!(map.is_unregistered(&first));
        assert!(!map.is_unregistered(&second));
    }

    #[test]
    fn test_staleness() {
        let registration = RegistrationRecord::new(
            key(),
            url("https://example.com/"),
            UpdateViaCache::Imports,
        );
        assert!(!registration.is_stale(Duration::from_secs(1)));
        registration.set_last_update_check_time(Instant::now());
        assert!(!registration.is_stale(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(registration.is_stale(Duration::from_millis(1)));
    }
}
