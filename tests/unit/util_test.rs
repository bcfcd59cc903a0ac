//! Tests for utility types

use chrono::{Duration, FixedOffset, NaiveDate};
use slotkeeper::util::clock::{Clock, ManualClock};
use slotkeeper::util::serde::{AppointmentId, Slot};

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 8).unwrap()
}

#[test]
fn test_slot_display() {
    assert_eq!(Slot::new(date(), 9).to_string(), "2030-01-08 09:00");
}

#[test]
fn test_slot_ordering() {
    assert!(Slot::new(date(), 9) < Slot::new(date(), 10));
    assert!(Slot::new(date(), 23) < Slot::new(date().succ_opt().unwrap(), 0));
}

#[test]
fn test_slot_is_past() {
    let slot = Slot::new(date(), 10);
    assert!(slot.is_past(date().and_hms_opt(10, 1, 0).unwrap()));
    assert!(!slot.is_past(date().and_hms_opt(10, 0, 0).unwrap()));
    assert!(!slot.is_past(date().and_hms_opt(9, 59, 0).unwrap()));
    // Out-of-range hours never start.
    assert!(Slot::new(date(), 24).is_past(date().and_hms_opt(0, 0, 0).unwrap()));
}

#[test]
fn test_slot_serde_shape() {
    let json = serde_json::to_value(Slot::new(date(), 14)).unwrap();
    assert_eq!(json, serde_json::json!({ "date": "2030-01-08", "hour": 14 }));
}

#[test]
fn test_manual_clock_local_offset() {
    let utc = date().and_hms_opt(22, 30, 0).unwrap().and_utc();
    let clock = ManualClock::with_offset(utc, FixedOffset::east_opt(2 * 3600).unwrap());
    assert_eq!(clock.now_local(), date().succ_opt().unwrap().and_hms_opt(0, 30, 0).unwrap());
    clock.advance(Duration::minutes(45));
    assert_eq!(clock.now_ms(), (utc + Duration::minutes(45)).timestamp_millis());
}

#[test]
fn test_appointment_id() {
    let id: AppointmentId = 12345;
    assert_eq!(id, 12345);
}
