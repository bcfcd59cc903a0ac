//! Tests for audit sinks

use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use slotkeeper::builders::{build_coordinator_with, Hooks, StoreSet};
use slotkeeper::config::CoordinatorConfig;
use slotkeeper::core::{
    build_audit_event, AppointmentRequest, AppointmentStatus, AuditEvent, AuditSink,
    InMemoryAuditSink,
};
use slotkeeper::infra::{InMemoryLimiterStore, MemoryHub, MemoryStore, RecordingPushGateway};
use slotkeeper::runtime::TokioSpawner;
use slotkeeper::util::clock::{Clock, ManualClock};
use slotkeeper::util::serde::Slot;
use uuid::Uuid;

struct SharedSink(Arc<Mutex<Vec<AuditEvent>>>);

impl AuditSink for SharedSink {
    fn record(&mut self, event: AuditEvent) {
        self.0.lock().push(event);
    }
}

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);
    let actor = Uuid::new_v4();

    sink.record(build_audit_event(
        1,
        actor,
        "create",
        None,
        AppointmentStatus::Pending,
        Some("first proposal".to_string()),
    ));
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].appointment_id, 1);
    assert_eq!(events[0].actor, actor);
    assert_eq!(events[0].action, "create");
    assert_eq!(events[0].from_status, None);
    assert_eq!(events[0].payload.as_deref(), Some("first proposal"));
    assert!(events[0].created_at_ms > 0);
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);
    let actor = Uuid::new_v4();
    for id in 1..=3 {
        sink.record(build_audit_event(id, actor, "create", None, AppointmentStatus::Pending, None));
    }
    let ids: Vec<_> = sink.events().iter().map(|e| e.appointment_id).collect();
    assert_eq!(ids, vec![2, 3]);
}

#[test]
fn test_zero_capacity_sink_drops_everything() {
    let mut sink = InMemoryAuditSink::new(0);
    sink.record(build_audit_event(
        1,
        Uuid::new_v4(),
        "cancel",
        Some(AppointmentStatus::Pending),
        AppointmentStatus::Cancelled,
        None,
    ));
    assert!(sink.events().is_empty());
}

#[test]
fn test_event_ids_are_unique() {
    let actor = Uuid::new_v4();
    let a = build_audit_event(1, actor, "confirm", None, AppointmentStatus::Confirmed, None);
    let b = build_audit_event(1, actor, "confirm", None, AppointmentStatus::Confirmed, None);
    assert_ne!(a.event_id, b.event_id);
}

#[tokio::test]
async fn test_engine_records_transitions() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let hooks = Hooks {
        audit: Box::new(SharedSink(recorded.clone())),
        cascade: None,
    };
    let local = NaiveDate::from_ymd_opt(2030, 1, 7)
        .and_then(|d| d.and_hms_opt(8, 0, 0))
        .unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_local(local));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let stores = StoreSet::in_memory(
        &store,
        Arc::new(InMemoryLimiterStore::new(clock.clone())),
        Arc::new(MemoryHub::new()),
        Arc::new(RecordingPushGateway::new()),
    );
    let coordinator = build_coordinator_with(
        &CoordinatorConfig::default(),
        stores,
        TokioSpawner::current().unwrap(),
        clock,
        hooks,
    )
    .unwrap();

    let (requester, provider) = (Uuid::new_v4(), Uuid::new_v4());
    let appt = coordinator
        .create_appointment(
            requester,
            AppointmentRequest {
                resource_id: Uuid::new_v4(),
                requester_id: requester,
                provider_id: provider,
                slot: Slot::new(local.date(), 10),
                notes: None,
            },
        )
        .await
        .unwrap();
    coordinator.confirm_appointment(appt.id, provider).await.unwrap();
    coordinator.complete_appointment(appt.id, provider).await.unwrap();

    let events = recorded.lock();
    let trail: Vec<_> = events
        .iter()
        .map(|e| (e.action.as_str(), e.from_status, e.to_status))
        .collect();
    assert_eq!(
        trail,
        vec![
            ("create", None, AppointmentStatus::Pending),
            ("confirm", Some(AppointmentStatus::Pending), AppointmentStatus::Confirmed),
            ("complete", Some(AppointmentStatus::Confirmed), AppointmentStatus::Completed),
        ]
    );
    assert!(events.iter().all(|e| e.appointment_id == appt.id));
}
