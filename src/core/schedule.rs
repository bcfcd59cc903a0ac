//! Work windows and hour-granular slot search.
//!
//! Everything here is pure: callers fetch the provider's schedule and the set of
//! occupied hours for a day, then ask which hours are free.

use std::collections::HashSet;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// A provider's daily availability window, in provider-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSchedule {
    /// Start of the working day.
    pub start: NaiveTime,
    /// End of the working day.
    pub end: NaiveTime,
}

/// Availability of one hourly mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAvailability {
    /// Hour of day.
    pub hour: u8,
    /// Whether no active appointment occupies the hour.
    pub available: bool,
}

#[allow(clippy::cast_possible_truncation)]
fn hour_of(t: NaiveTime) -> u8 {
    // NaiveTime::hour is always < 24.
    t.hour() as u8
}

impl WorkSchedule {
    /// Build a schedule, rejecting empty or inverted windows.
    ///
    /// # Errors
    ///
    /// Returns a description when `start` is not before `end`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, String> {
        if start >= end {
            return Err(format!("work window {start}..{end} is empty"));
        }
        Ok(Self { start, end })
    }

    /// Whole-hour window `start_hour:00 .. end_hour:00`.
    #[must_use]
    pub fn from_hours(start_hour: u8, end_hour: u8) -> Option<Self> {
        let start = NaiveTime::from_hms_opt(u32::from(start_hour), 0, 0)?;
        let end = NaiveTime::from_hms_opt(u32::from(end_hour), 0, 0)?;
        Self::new(start, end).ok()
    }

    /// First offered hour.
    #[must_use]
    pub fn start_hour(&self) -> u8 {
        hour_of(self.start)
    }

    /// Whether `hour` is one of the offered marks.
    ///
    /// The end hour itself is offered only when the window ends past the full
    /// hour (an 17:30 end still offers 17:00).
    #[must_use]
    pub fn contains(&self, hour: u8) -> bool {
        let end_hour = hour_of(self.end);
        hour >= self.start_hour() && (hour < end_hour || (hour == end_hour && self.end.minute() > 0))
    }

    /// Offered hours in ascending order.
    #[must_use]
    pub fn hourly_marks(&self) -> Vec<u8> {
        (self.start_hour()..24).filter(|h| self.contains(*h)).collect()
    }
}

/// Mark each offered hour as available unless it is occupied.
#[must_use]
pub fn availability(schedule: &WorkSchedule, occupied: &HashSet<u8>) -> Vec<SlotAvailability> {
    schedule
        .hourly_marks()
        .into_iter()
        .map(|hour| SlotAvailability {
            hour,
            available: !occupied.contains(&hour),
        })
        .collect()
}

/// First unoccupied offered hour at or after `from_hour`.
#[must_use]
pub fn first_free_from(schedule: &WorkSchedule, occupied: &HashSet<u8>, from_hour: u8) -> Option<u8> {
    schedule
        .hourly_marks()
        .into_iter()
        .find(|h| *h >= from_hour && !occupied.contains(h))
}

/// Nearest free hour to `requested`, trying `+1, -1, +2, -2, …` up to `max_offset`.
///
/// Candidates outside the work window are skipped.
#[must_use]
pub fn nearest_free(
    schedule: &WorkSchedule,
    occupied: &HashSet<u8>,
    requested: u8,
    max_offset: u8,
) -> Option<u8> {
    let free = |h: u8| schedule.contains(h) && !occupied.contains(&h);
    for offset in 1..=max_offset {
        if let Some(later) = requested.checked_add(offset).filter(|h| *h < 24) {
            if free(later) {
                return Some(later);
            }
        }
        if let Some(earlier) = requested.checked_sub(offset) {
            if free(earlier) {
                return Some(earlier);
            }
        }
    }
    None
}
