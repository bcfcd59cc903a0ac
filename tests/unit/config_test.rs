//! Tests for configuration validation

use std::io::Write;

use chrono::NaiveTime;
use slotkeeper::config::{
    BackendConfig, CoordinatorConfig, DependencyLimits, SchedulingConfig, StoreBackendConfig,
};

fn limits(per_minute: Option<u64>, per_day: Option<u64>) -> DependencyLimits {
    DependencyLimits {
        min_interval_ms: 1_000,
        lock_margin_ms: 100,
        per_minute,
        per_day,
    }
}

#[test]
fn test_default_config_is_valid() {
    let cfg = CoordinatorConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.scheduling.lookahead_days, 8);
    assert_eq!(cfg.scheduling.max_alternative_offset, 12);
    assert_eq!(cfg.key_prefix(), "slotkeeper");
}

#[test]
fn test_scheduling_rejects_zero_lookahead() {
    let cfg = SchedulingConfig {
        lookahead_days: 0,
        ..SchedulingConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_scheduling_rejects_inverted_window() {
    let cfg = SchedulingConfig {
        default_work_start: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        ..SchedulingConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_dependency_limits_validation() {
    assert!(limits(Some(10), Some(1_000)).validate().is_ok());
    assert!(limits(None, None).validate().is_ok());
    assert!(limits(Some(0), None).validate().is_err());
    assert!(limits(None, Some(0)).validate().is_err());
    assert!(limits(Some(50), Some(10)).validate().is_err());
}

#[test]
fn test_dependency_errors_name_the_dependency() {
    let mut cfg = CoordinatorConfig::default();
    cfg.dependencies.insert("geocoder".into(), limits(Some(0), None));
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("geocoder"), "{err}");
}

#[test]
fn test_backend_validation() {
    let redis_appointments = BackendConfig {
        appointments: StoreBackendConfig::Redis,
        redis_url: Some("redis://localhost".into()),
        ..BackendConfig::default()
    };
    assert!(redis_appointments.validate().is_err());

    let postgres_without_url = BackendConfig {
        appointments: StoreBackendConfig::Postgres,
        ..BackendConfig::default()
    };
    assert!(postgres_without_url.validate().is_err());

    let postgres_limiter = BackendConfig {
        limiter: StoreBackendConfig::Postgres,
        database_url: Some("postgres://localhost/sk".into()),
        ..BackendConfig::default()
    };
    assert!(postgres_limiter.validate().is_err());

    let production = BackendConfig {
        appointments: StoreBackendConfig::Postgres,
        limiter: StoreBackendConfig::Redis,
        database_url: Some("postgres://localhost/sk".into()),
        redis_url: Some("redis://localhost".into()),
    };
    assert!(production.validate().is_ok());
}

#[test]
fn test_from_json_str_applies_defaults() {
    let cfg = CoordinatorConfig::from_json_str(
        r#"{
            "dependencies": { "llm": { "min_interval_ms": 1000, "per_minute": 30, "per_day": 5000 } },
            "backends": { "limiter": "redis", "redis_url": "redis://cache:6379" },
            "key_prefix": "bookings"
        }"#,
    )
    .unwrap();
    let llm = &cfg.dependencies["llm"];
    assert_eq!(llm.lock_margin_ms, 100);
    assert_eq!(llm.per_minute, Some(30));
    assert_eq!(cfg.backends.limiter, StoreBackendConfig::Redis);
    assert_eq!(cfg.backends.appointments, StoreBackendConfig::InMemory);
    assert_eq!(cfg.scheduling, SchedulingConfig::default());
    assert_eq!(cfg.key_prefix(), "bookings");
}

#[test]
fn test_from_json_str_rejects_invalid() {
    assert!(CoordinatorConfig::from_json_str("{ not json").is_err());
    let err = CoordinatorConfig::from_json_str(r#"{ "scheduling": { "lookahead_days": 0 } }"#)
        .unwrap_err();
    assert!(err.contains("lookahead_days"), "{err}");
}

#[test]
fn test_from_file_reads_json() {
    let path = std::env::temp_dir().join(format!("slotkeeper-{}.json", uuid::Uuid::new_v4()));
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, r#"{{ "scheduling": {{ "lookahead_days": 3 }} }}"#).unwrap();
    drop(file);

    let cfg = CoordinatorConfig::from_file(&path).unwrap();
    assert_eq!(cfg.scheduling.lookahead_days, 3);
    std::fs::remove_file(&path).unwrap();

    assert!(CoordinatorConfig::from_file(&path).is_err());
}
