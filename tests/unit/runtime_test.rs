//! Tests for the tokio spawner and coordinator health

use std::sync::Arc;

use slotkeeper::builders::{build_coordinator, StoreSet};
use slotkeeper::config::CoordinatorConfig;
use slotkeeper::core::{Spawn, StoreError};
use slotkeeper::infra::{InMemoryLimiterStore, MemoryHub, MemoryStore, RecordingPushGateway};
use slotkeeper::runtime::{ComponentHealth, TokioSpawner};
use slotkeeper::util::clock::{Clock, SystemClock};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[test]
fn test_tokio_spawner_requires_runtime() {
    assert!(TokioSpawner::current().is_err());
}

#[test]
fn test_component_health_from_result() {
    let ok = ComponentHealth::from(Ok(()));
    assert!(ok.ok);
    assert_eq!(ok.error, None);

    let down = ComponentHealth::from(Err(StoreError::Unavailable("refused".into())));
    assert!(!down.ok);
    assert_eq!(down.error.as_deref(), Some("store unavailable: refused"));
}

#[tokio::test]
async fn test_health_reports_each_store() {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let limiter = Arc::new(InMemoryLimiterStore::new(clock.clone()));
    let stores = StoreSet::in_memory(
        &store,
        limiter.clone(),
        Arc::new(MemoryHub::new()),
        Arc::new(RecordingPushGateway::new()),
    );
    let coordinator = build_coordinator(
        &CoordinatorConfig::default(),
        stores,
        TokioSpawner::current().unwrap(),
        clock,
    )
    .unwrap();

    let health = coordinator.health().await;
    assert!(health.ok && health.appointments.ok && health.limiter.ok);

    limiter.set_available(false);
    let degraded = coordinator.health().await;
    assert!(degraded.ok);
    assert!(!degraded.limiter.ok);

    store.set_available(false);
    let down = coordinator.health().await;
    assert!(!down.ok);
    assert!(down.appointments.error.is_some());
}
