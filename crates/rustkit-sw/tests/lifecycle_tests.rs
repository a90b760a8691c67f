//! Install/activate ordering, client control and the Clients API.

mod common;

use std::sync::{Arc, Mutex};

use common::{settle, url, wait_until, Harness};
use rustkit_sw::{
    Client, ClientMatchOptions, ClientType, LifecycleEvent, Promise, RegistrationOptions,
    ServiceWorkerEvent, ServiceWorkerState,
};

type Stash<T> = Arc<Mutex<Vec<Promise<T>>>>;

fn stash<T>() -> Stash<T> {
    Arc::new(Mutex::new(Vec::new()))
}

fn ids(clients: &[Client]) -> Vec<&str> {
    clients.iter().map(|client| client.id.as_str()).collect()
}

#[test]
fn test_new_worker_waits_while_client_is_controlled() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    let a = h.window("https://example.com/a.html");
    let registration = h
        .register(&a, "/sw.js", RegistrationOptions::default().with_scope("/"))
        .unwrap();
    let first = h.wait_for_active("https://example.com/", "https://example.com/sw.js");
    let first_id = first.active.unwrap().id;

    let b = h.window("https://example.com/b.html");
    assert_eq!(b.context.controller().map(|worker| worker.id()), Some(first_id));
    assert!(a.context.controller().is_none(), "existing clients are not claimed");

    h.script("https://example.com/sw.js", "v2");
    settle(&h.jobs.start_update(&a.context, &registration)).unwrap();
    assert!(wait_until(|| h
        .snapshot("https://example.com/")
        .and_then(|snapshot| snapshot.waiting)
        .map_or(false, |waiting| waiting.state == ServiceWorkerState::Installed)));
    let snapshot = h.snapshot("https://example.com/").unwrap();
    assert_eq!(snapshot.active.as_ref().map(|active| active.id), Some(first_id));
    let waiting_id = snapshot.waiting.unwrap().id;

    h.close(&b);
    assert!(wait_until(|| h
        .snapshot("https://example.com/")
        .and_then(|snapshot| snapshot.active)
        .map_or(false, |active| {
            active.id == waiting_id && active.state == ServiceWorkerState::Activated
        })));
    assert!(h.snapshot("https://example.com/").unwrap().waiting.is_none());
}

#[test]
fn test_skip_waiting_during_install_takes_control() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    let a = h.window("https://example.com/a.html");
    let registration = h
        .register(&a, "/sw.js", RegistrationOptions::default().with_scope("/"))
        .unwrap();
    let first_id = h
        .wait_for_active("https://example.com/", "https://example.com/sw.js")
        .active
        .unwrap()
        .id;
    let mut b = h.window("https://example.com/b.html");
    assert_eq!(b.context.controller().map(|worker| worker.id()), Some(first_id));
    b.drain_events();

    h.host.on_event(|scope, event| {
        if event == LifecycleEvent::Install {
            let _ = scope.skip_waiting();
        }
    });
    h.script("https://example.com/sw.js", "v2");
    settle(&h.jobs.start_update(&a.context, &registration)).unwrap();

    let events =
        b.wait_for_event(|event| matches!(event, ServiceWorkerEvent::ControllerChange { .. }));
    let Some(ServiceWorkerEvent::ControllerChange {
        controller: Some(controller),
    }) = events.last().cloned()
    else {
        panic!("expected a controller change, got {:?}", events);
    };
    assert_ne!(controller, first_id);
    assert!(events.contains(&ServiceWorkerEvent::StateChange {
        worker: first_id,
        state: ServiceWorkerState::Redundant
    }));
    assert!(wait_until(|| h
        .snapshot("https://example.com/")
        .and_then(|snapshot| snapshot.active)
        .map_or(false, |active| active.id == controller)));
}

#[test]
fn test_claim_during_activate_controls_existing_client() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    h.host.on_event(|scope, event| {
        if event == LifecycleEvent::Activate {
            let _ = scope.clients_claim();
        }
    });
    let mut a = h.window("https://example.com/");
    let other = h.window("https://example.com:8443/");

    h.register(&a, "sw.js", RegistrationOptions::default()).unwrap();
    let active_id = h
        .wait_for_active("https://example.com/", "https://example.com/sw.js")
        .active
        .unwrap()
        .id;

    a.wait_for_event(|event| {
        *event
            == ServiceWorkerEvent::ControllerChange {
                controller: Some(active_id),
            }
    });
    assert_eq!(a.context.controller().map(|worker| worker.id()), Some(active_id));
    assert!(other.context.controller().is_none());
}

#[test]
fn test_claim_from_installing_worker_is_rejected() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    let claims: Stash<()> = stash();
    let stashed = claims.clone();
    h.host.on_event(move |scope, event| {
        if event == LifecycleEvent::Install {
            stashed.lock().unwrap().push(scope.clients_claim());
        }
    });
    let a = h.window("https://example.com/");
    h.register(&a, "sw.js", RegistrationOptions::default()).unwrap();
    h.wait_for_active("https://example.com/", "https://example.com/sw.js");

    let claim = claims.lock().unwrap().pop().unwrap();
    assert_eq!(settle(&claim).unwrap_err().name(), "InvalidStateError");
}

#[test]
fn test_match_all_orders_windows_then_workers() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    let everything: Stash<Vec<Client>> = stash();
    let controlled: Stash<Vec<Client>> = stash();
    let (all_promises, default_promises) = (everything.clone(), controlled.clone());
    h.host.on_event(move |scope, event| {
        if event == LifecycleEvent::Activate {
            all_promises
                .lock()
                .unwrap()
                .push(scope.clients_match_all(ClientMatchOptions::all()));
            default_promises
                .lock()
                .unwrap()
                .push(scope.clients_match_all(ClientMatchOptions::default()));
        }
    });

    let b = h.window("https://example.com/b.html");
    b.context.set_focused(false);
    let a = h.window("https://example.com/a.html");
    let w = h.client("https://example.com/worker.js", ClientType::Worker);
    let _elsewhere = h.window("https://other.com/");

    h.register(&a, "/sw.js", RegistrationOptions::default().with_scope("/"))
        .unwrap();
    h.wait_for_active("https://example.com/", "https://example.com/sw.js");

    let all = settle(&everything.lock().unwrap()[0]).unwrap();
    assert_eq!(ids(&all), vec![a.context.id(), b.context.id(), w.context.id()]);
    assert!(all[0].focused);
    assert!(!all[1].focused);
    assert_eq!(all[2].client_type, ClientType::Worker);

    let uncontrolled = settle(&controlled.lock().unwrap()[0]).unwrap();
    assert!(uncontrolled.is_empty());
}

#[test]
fn test_clients_get_finds_same_origin_clients() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    let a = h.window("https://example.com/a.html");
    let w = h.client("https://example.com/worker.js", ClientType::Worker);
    let elsewhere = h.window("https://other.com/");

    let lookups: Stash<Option<Client>> = stash();
    let stashed = lookups.clone();
    let wanted = vec![
        a.context.id().to_string(),
        w.context.id().to_string(),
        elsewhere.context.id().to_string(),
        "client-unknown".to_string(),
    ];
    h.host.on_event(move |scope, event| {
        if event == LifecycleEvent::Activate {
            let mut stashed = stashed.lock().unwrap();
            for id in &wanted {
                stashed.push(scope.clients_get(id));
            }
        }
    });

    h.register(&a, "sw.js", RegistrationOptions::default()).unwrap();
    h.wait_for_active("https://example.com/", "https://example.com/sw.js");

    let lookups = lookups.lock().unwrap().clone();
    assert_eq!(lookups.len(), 4);
    let window = settle(&lookups[0]).unwrap().unwrap();
    assert_eq!(window.id, a.context.id());
    assert_eq!(window.url, url("https://example.com/a.html"));
    assert_eq!(window.client_type, ClientType::Window);
    let worker = settle(&lookups[1]).unwrap().unwrap();
    assert_eq!(worker.client_type, ClientType::Worker);
    assert_eq!(settle(&lookups[2]), Ok(None));
    assert_eq!(settle(&lookups[3]), Ok(None));
}

#[test]
fn test_ready_resolves_after_activation() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    let a = h.window("https://example.com/");

    let ready = h.jobs.ready(&a.context);
    h.jobs.flush().unwrap();
    a.flush();
    assert!(ready.is_pending());

    let registration = h.register(&a, "sw.js", RegistrationOptions::default()).unwrap();
    let resolved = settle(&ready).unwrap();
    assert_eq!(resolved, registration);
    assert!(h.jobs.ready(&a.context).ptr_eq(&ready));
}

#[test]
fn test_unregister_clears_uncontrolled_registration() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    let mut a = h.window("https://example.com/");
    let registration = h.register(&a, "sw.js", RegistrationOptions::default()).unwrap();
    h.wait_for_active("https://example.com/", "https://example.com/sw.js");
    assert!(wait_until(|| {
        a.flush();
        registration.active().is_some()
    }));
    let active = registration.active().unwrap();
    a.drain_events();

    assert_eq!(settle(&h.jobs.start_unregister(&a.context, registration.scope())), Ok(true));
    a.wait_for_event(|event| {
        *event
            == ServiceWorkerEvent::StateChange {
                worker: active.id(),
                state: ServiceWorkerState::Redundant,
            }
    });
    assert_eq!(active.state(), ServiceWorkerState::Redundant);
    assert!(wait_until(|| {
        a.flush();
        registration.active().is_none()
    }));
    assert!(h.snapshot("https://example.com/").is_none());
}

#[test]
fn test_unregister_keeps_worker_until_last_client_leaves() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    let a = h.window("https://example.com/a.html");
    let registration = h
        .register(&a, "/sw.js", RegistrationOptions::default().with_scope("/"))
        .unwrap();
    h.wait_for_active("https://example.com/", "https://example.com/sw.js");
    let b = h.window("https://example.com/b.html");
    assert!(b.context.controller().is_some());
    assert!(wait_until(|| {
        a.flush();
        registration.active().is_some()
    }));
    let active = registration.active().unwrap();

    assert_eq!(settle(&h.jobs.start_unregister(&a.context, registration.scope())), Ok(true));
    assert!(h.snapshot("https://example.com/").is_none());
    a.flush();
    assert_eq!(active.state(), ServiceWorkerState::Activated);

    h.close(&b);
    assert!(wait_until(|| {
        a.flush();
        active.state() == ServiceWorkerState::Redundant
    }));
}

#[test]
fn test_scope_calls_reject_while_starting() {
    let h = Harness::new();
    h.script("https://example.com/sw.js", "v1");
    let results = Arc::new(Mutex::new(Vec::new()));
    let stashed = results.clone();
    h.host.on_evaluate(move |scope| {
        let mut stashed = stashed.lock().unwrap();
        stashed.push(scope.skip_waiting().result());
        stashed.push(scope.clients_claim().result());
        let matched = scope.clients_match_all(ClientMatchOptions::all()).result();
        stashed.push(matched.map(|r| r.map(|_| ())));
    });
    let a = h.window("https://example.com/");
    h.register(&a, "sw.js", RegistrationOptions::default()).unwrap();
    h.wait_for_active("https://example.com/", "https://example.com/sw.js");

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 3);
    for result in results.iter() {
        let err = result.clone().unwrap().unwrap_err();
        assert_eq!(err.name(), "InvalidStateError");
    }
}
