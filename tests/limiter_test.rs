//! Integration tests for call pacing and quota guards.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{harness_with, Harness};
use slotkeeper::builders::Hooks;
use slotkeeper::config::{CoordinatorConfig, DependencyLimits};
use slotkeeper::core::{CoordError, QuotaWindowKind};

fn with_dependency(name: &str, limits: DependencyLimits) -> Harness {
    let mut cfg = CoordinatorConfig::default();
    cfg.dependencies.insert(name.to_string(), limits);
    harness_with(cfg, Hooks::default())
}

fn quota(per_minute: Option<u64>, per_day: Option<u64>) -> DependencyLimits {
    DependencyLimits {
        min_interval_ms: 0,
        lock_margin_ms: 100,
        per_minute,
        per_day,
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_are_spaced_by_min_interval() {
    let h = with_dependency(
        "geocoder",
        DependencyLimits {
            min_interval_ms: 1_000,
            lock_margin_ms: 100,
            per_minute: None,
            per_day: None,
        },
    );

    let first = {
        let coordinator = Arc::clone(&h.coordinator);
        tokio::spawn(async move { coordinator.acquire_pacing_slot("geocoder").await })
    };
    let second = {
        let coordinator = Arc::clone(&h.coordinator);
        tokio::spawn(async move { coordinator.acquire_pacing_slot("geocoder").await })
    };
    let mut permits = vec![
        first.await.unwrap().unwrap(),
        second.await.unwrap().unwrap(),
    ];
    permits.sort_by_key(|p| p.waited);

    assert!(permits[0].immediate());
    assert!(permits[0].enforced);
    assert!(!permits[1].immediate());
    assert!(permits[1].waited >= Duration::from_millis(1_000));
    assert!(h.limiter_store.token_holder("slotkeeper:pace:geocoder").is_some());
}

#[tokio::test(start_paused = true)]
async fn pacing_token_is_never_released_early() {
    let h = with_dependency(
        "llm",
        DependencyLimits {
            min_interval_ms: 500,
            lock_margin_ms: 50,
            per_minute: None,
            per_day: None,
        },
    );

    let first = h.coordinator.acquire_pacing_slot("llm").await.unwrap();
    assert!(first.immediate());

    tokio::time::advance(Duration::from_millis(200)).await;
    let second = h.coordinator.acquire_pacing_slot("llm").await.unwrap();
    // 550ms token, 200ms already elapsed.
    assert!(second.waited >= Duration::from_millis(350));
    assert!(second.attempts >= 2);
}

async fn race_admits(h: &Harness, dependency: &'static str, callers: usize) -> Vec<Result<(), CoordError>> {
    // Hold the token first so every caller passes the early check and then queues.
    h.coordinator.acquire_pacing_slot(dependency).await.unwrap();
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let coordinator = Arc::clone(&h.coordinator);
            tokio::spawn(async move { coordinator.admit(dependency).await.map(|_| ()) })
        })
        .collect();
    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn queued_callers_cannot_overrun_the_minute_quota() {
    let h = with_dependency(
        "geocoder",
        DependencyLimits {
            min_interval_ms: 1_000,
            lock_margin_ms: 100,
            per_minute: Some(1),
            per_day: None,
        },
    );

    let results = race_admits(&h, "geocoder", 4).await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            result,
            Err(CoordError::QuotaExceeded {
                window: QuotaWindowKind::Minute,
                ..
            })
        ));
    }
    let usage = h.coordinator.quota_usage("geocoder").await.unwrap();
    assert_eq!(usage.minute, Some(1));
}

#[tokio::test(start_paused = true)]
async fn refused_daily_call_gives_back_its_minute_entry() {
    let h = with_dependency(
        "translate",
        DependencyLimits {
            min_interval_ms: 500,
            lock_margin_ms: 50,
            per_minute: Some(10),
            per_day: Some(1),
        },
    );

    let results = race_admits(&h, "translate", 3).await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
        r,
        Err(CoordError::QuotaExceeded {
            window: QuotaWindowKind::Day,
            ..
        })
    )));
    let usage = h.coordinator.quota_usage("translate").await.unwrap();
    assert_eq!(usage.day, Some(1));
    assert_eq!(usage.minute, Some(1));
}

#[tokio::test]
async fn zero_interval_skips_pacing() {
    let h = with_dependency("search", quota(None, None));
    let permit = h.coordinator.acquire_pacing_slot("search").await.unwrap();
    assert_eq!(permit.waited, Duration::ZERO);
    assert!(!permit.enforced);
    assert!(h.limiter_store.token_holder("slotkeeper:pace:search").is_none());
}

#[tokio::test]
async fn minute_quota_recovers_after_window() {
    let h = with_dependency("maps", quota(Some(2), Some(100)));

    h.coordinator.admit("maps").await.unwrap();
    h.coordinator.admit("maps").await.unwrap();
    let err = h.coordinator.admit("maps").await.unwrap_err();
    assert!(matches!(
        err,
        CoordError::QuotaExceeded { ref dependency, window: QuotaWindowKind::Minute } if dependency == "maps"
    ));
    assert!(err.is_transient());

    h.clock.advance(chrono::Duration::seconds(61));
    h.coordinator.check_quota("maps").await.unwrap();
}

#[tokio::test]
async fn daily_quota_resets_at_utc_midnight() {
    let h = with_dependency("translate", quota(None, Some(2)));

    h.coordinator.record_call("translate").await.unwrap();
    h.coordinator.record_call("translate").await.unwrap();
    let err = h.coordinator.check_quota("translate").await.unwrap_err();
    assert!(matches!(
        err,
        CoordError::QuotaExceeded {
            window: QuotaWindowKind::Day,
            ..
        }
    ));

    // Monday 08:30 plus 16 hours is Tuesday 00:30 UTC.
    h.clock.advance(chrono::Duration::hours(16));
    h.coordinator.check_quota("translate").await.unwrap();
    let usage = h.coordinator.quota_usage("translate").await.unwrap();
    assert_eq!(usage.day, Some(0));
}

#[tokio::test]
async fn usage_reports_both_windows() {
    let h = with_dependency("maps", quota(Some(5), Some(10)));
    h.coordinator.admit("maps").await.unwrap();
    h.coordinator.admit("maps").await.unwrap();

    let usage = h.coordinator.quota_usage("maps").await.unwrap();
    assert_eq!(usage.minute, Some(2));
    assert_eq!(usage.day, Some(2));
}

#[tokio::test]
async fn limiter_fails_open_when_store_is_down() {
    let h = with_dependency(
        "geocoder",
        DependencyLimits {
            min_interval_ms: 1_000,
            lock_margin_ms: 100,
            per_minute: Some(1),
            per_day: Some(1),
        },
    );
    h.limiter_store.set_available(false);

    for _ in 0..3 {
        let permit = h.coordinator.admit("geocoder").await.unwrap();
        assert!(!permit.enforced);
    }
    let usage = h.coordinator.quota_usage("geocoder").await.unwrap();
    assert_eq!(usage.minute, None);
    assert_eq!(usage.day, None);

    let health = h.coordinator.health().await;
    assert!(health.ok);
    assert!(!health.limiter.ok);
    assert!(health.limiter.error.is_some());
}

#[tokio::test]
async fn unknown_dependency_is_not_found() {
    let h = with_dependency("maps", quota(Some(1), None));
    for result in [
        h.coordinator.check_quota("weather").await,
        h.coordinator.record_call("weather").await,
    ] {
        assert!(matches!(result, Err(CoordError::NotFound(_))));
    }
    assert!(matches!(
        h.coordinator.acquire_pacing_slot("weather").await,
        Err(CoordError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn custom_key_prefix_namespaces_pacing_tokens() {
    let mut cfg = CoordinatorConfig::default();
    cfg.key_prefix = Some("tenant-a".into());
    cfg.dependencies.insert(
        "llm".into(),
        DependencyLimits {
            min_interval_ms: 10,
            lock_margin_ms: 5,
            per_minute: None,
            per_day: None,
        },
    );
    let h = harness_with(cfg, Hooks::default());

    h.coordinator.acquire_pacing_slot("llm").await.unwrap();
    assert!(h.limiter_store.token_holder("tenant-a:pace:llm").is_some());
    assert!(h.limiter_store.token_holder("slotkeeper:pace:llm").is_none());
}
