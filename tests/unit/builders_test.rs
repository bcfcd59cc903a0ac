//! Tests for builder modules

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use slotkeeper::builders::{call_limits, engine_settings, build_coordinator, StoreSet};
use slotkeeper::config::{CoordinatorConfig, DependencyLimits, SchedulingConfig, StoreBackendConfig};
use slotkeeper::core::CoordError;
use slotkeeper::infra::{InMemoryLimiterStore, MemoryHub, MemoryStore, RecordingPushGateway};
use slotkeeper::runtime::TokioSpawner;
use slotkeeper::util::clock::{Clock, SystemClock};

fn clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

fn in_memory_stores(clock: &Arc<dyn Clock>) -> StoreSet {
    StoreSet::in_memory(
        &Arc::new(MemoryStore::new(clock.clone())),
        Arc::new(InMemoryLimiterStore::new(clock.clone())),
        Arc::new(MemoryHub::new()),
        Arc::new(RecordingPushGateway::new()),
    )
}

#[test]
fn test_engine_settings_from_scheduling() {
    let cfg = SchedulingConfig {
        lookahead_days: 14,
        max_alternative_offset: 3,
        default_work_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        default_work_end: NaiveTime::from_hms_opt(12, 30, 0).unwrap(),
    };
    let settings = engine_settings(&cfg).unwrap();
    assert_eq!(settings.lookahead_days, 14);
    assert_eq!(settings.max_alternative_offset, 3);
    assert_eq!(settings.default_schedule.hourly_marks(), vec![8, 9, 10, 11, 12]);
}

#[test]
fn test_engine_settings_rejects_empty_window() {
    let cfg = SchedulingConfig {
        default_work_end: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        ..SchedulingConfig::default()
    };
    assert!(matches!(engine_settings(&cfg), Err(CoordError::Config(_))));
}

#[test]
fn test_call_limits_add_margin() {
    let limits = call_limits(&DependencyLimits {
        min_interval_ms: 1_000,
        lock_margin_ms: 250,
        per_minute: Some(30),
        per_day: Some(5_000),
    });
    assert_eq!(limits.min_interval, Duration::from_secs(1));
    assert_eq!(limits.lock_ttl, Duration::from_millis(1_250));
    assert_eq!(limits.per_minute, Some(30));
    assert_eq!(limits.per_day, Some(5_000));
}

#[tokio::test]
async fn test_build_registers_dependencies() {
    let mut cfg = CoordinatorConfig::default();
    cfg.dependencies.insert(
        "llm".into(),
        DependencyLimits {
            min_interval_ms: 0,
            lock_margin_ms: 100,
            per_minute: Some(10),
            per_day: None,
        },
    );
    let clock = clock();
    let coordinator = build_coordinator(
        &cfg,
        in_memory_stores(&clock),
        TokioSpawner::current().unwrap(),
        clock,
    )
    .unwrap();

    let names: Vec<_> = coordinator.limiter().dependencies().collect();
    assert_eq!(names, vec!["llm"]);
    assert_eq!(coordinator.engine().settings().lookahead_days, 8);
}

#[tokio::test]
async fn test_build_rejects_invalid_config() {
    let mut cfg = CoordinatorConfig::default();
    cfg.scheduling.lookahead_days = 0;
    let clock = clock();
    let result = build_coordinator(
        &cfg,
        in_memory_stores(&clock),
        TokioSpawner::current().unwrap(),
        clock,
    );
    assert!(matches!(result, Err(CoordError::Config(_))));
}

#[tokio::test]
async fn test_from_config_in_memory() {
    let cfg = CoordinatorConfig::default();
    let clock = clock();
    let stores = StoreSet::from_config(
        &cfg,
        clock.clone(),
        Arc::new(MemoryHub::new()),
        Arc::new(RecordingPushGateway::new()),
    )
    .await
    .unwrap();
    let coordinator =
        build_coordinator(&cfg, stores, TokioSpawner::current().unwrap(), clock).unwrap();
    assert!(coordinator.health().await.ok);
}

#[cfg(not(feature = "postgres"))]
#[tokio::test]
async fn test_from_config_postgres_requires_feature() {
    let mut cfg = CoordinatorConfig::default();
    cfg.backends.appointments = StoreBackendConfig::Postgres;
    cfg.backends.database_url = Some("postgres://localhost/slotkeeper".into());
    let result = StoreSet::from_config(
        &cfg,
        clock(),
        Arc::new(MemoryHub::new()),
        Arc::new(RecordingPushGateway::new()),
    )
    .await;
    assert!(matches!(result, Err(CoordError::Config(message)) if message.contains("postgres")));
}

#[cfg(not(feature = "redis-store"))]
#[tokio::test]
async fn test_from_config_redis_requires_feature() {
    let mut cfg = CoordinatorConfig::default();
    cfg.backends.limiter = StoreBackendConfig::Redis;
    cfg.backends.redis_url = Some("redis://localhost".into());
    let result = StoreSet::from_config(
        &cfg,
        clock(),
        Arc::new(MemoryHub::new()),
        Arc::new(RecordingPushGateway::new()),
    )
    .await;
    assert!(matches!(result, Err(CoordError::Config(message)) if message.contains("redis")));
}
