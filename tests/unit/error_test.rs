//! Tests for error types

use chrono::NaiveDate;
use slotkeeper::core::{ConflictKind, CoordError, QuotaWindowKind, StoreError};
use slotkeeper::runtime::ErrorResponse;
use slotkeeper::util::serde::Slot;
use uuid::Uuid;

fn slot(hour: u8) -> Slot {
    Slot::new(NaiveDate::from_ymd_opt(2030, 1, 8).unwrap(), hour)
}

#[test]
fn test_conflict_display() {
    let err = CoordError::Conflict(ConflictKind::SlotOccupied {
        slot: slot(10),
        holder: Some(4),
    });
    assert_eq!(format!("{err}"), "conflict: slot 2030-01-08 10:00 is already booked");
}

#[test]
fn test_store_error_maps_to_unavailable() {
    let err: CoordError = StoreError::Unavailable("pool timed out".into()).into();
    assert!(matches!(err, CoordError::StoreUnavailable(_)));
    assert_eq!(format!("{err}"), "store unavailable: store unavailable: pool timed out");
}

#[test]
fn test_corrupt_record_is_not_transient() {
    let err: CoordError = StoreError::Corrupt("unknown status `archived`".into()).into();
    assert!(matches!(err, CoordError::StoreCorrupt(ref detail) if detail == "unknown status `archived`"));
    assert!(!err.is_transient());
    let response = ErrorResponse::from(&err);
    assert_eq!(response.code, "store_corrupt");
    assert!(!response.transient);

    let backend: CoordError = StoreError::Backend("deadlock detected".into()).into();
    assert!(backend.is_transient());
}

#[test]
fn test_transient_classification() {
    let quota = CoordError::QuotaExceeded {
        dependency: "maps".into(),
        window: QuotaWindowKind::Day,
    };
    assert!(quota.is_transient());
    assert_eq!(format!("{quota}"), "per-day quota exceeded for maps");
    assert!(CoordError::StoreUnavailable("down".into()).is_transient());
    assert!(!CoordError::Conflict(ConflictKind::SelfBooking).is_transient());
    assert!(!CoordError::NotFound("appointment 1".into()).is_transient());
}

#[test]
fn test_suggestion_and_cancelled_accessors() {
    let err = CoordError::SlotTaken {
        suggestion: Some(slot(11)),
        cancelled: vec![3, 5],
    };
    assert_eq!(err.suggestion(), Some(slot(11)));
    assert_eq!(err.cancelled(), &[3, 5]);
    assert_eq!(err.user_message(), "slot taken, try 2030-01-08 11:00 instead");

    let none = CoordError::OutOfHours {
        suggestion: None,
        cancelled: Vec::new(),
    };
    assert_eq!(none.user_message(), "outside working hours and no free hour that day");
    assert!(CoordError::Config("x".into()).cancelled().is_empty());
}

#[test]
fn test_error_response_carries_suggestion() {
    let owner = Uuid::new_v4();
    let claimed = ErrorResponse::from(&CoordError::Conflict(ConflictKind::AlreadyClaimed { owner }));
    assert!(!claimed.transient);
    assert!(claimed.message.contains(&owner.to_string()));

    let out = ErrorResponse::from(&CoordError::OutOfHours {
        suggestion: Some(slot(9)),
        cancelled: vec![7],
    });
    assert_eq!(out.suggestion, Some(slot(9)));
    assert_eq!(out.cancelled, vec![7]);
    let json = serde_json::to_value(&out).unwrap();
    assert_eq!(json["suggestion"]["hour"], 9);
}
