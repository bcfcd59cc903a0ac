//! Identifier aliases and small serializable value types shared across modules.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a user (requester, provider, claimant or message participant).
pub type UserId = Uuid;

/// Identity of a shared resource such as a listing or a prospect record.
pub type ResourceId = Uuid;

/// Store-assigned appointment identifier.
pub type AppointmentId = i64;

/// Store-assigned, monotonically increasing message identifier.
pub type MessageId = i64;

/// One bookable hour on a provider's calendar, in provider-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    /// Calendar day.
    pub date: NaiveDate,
    /// Hour of day, `0..=23`.
    pub hour: u8,
}

impl Slot {
    /// Build a slot from a date and an hour.
    #[must_use]
    pub const fn new(date: NaiveDate, hour: u8) -> Self {
        Self { date, hour }
    }

    /// Local start instant of the slot, `None` when `hour` is out of range.
    #[must_use]
    pub fn starts_at(&self) -> Option<NaiveDateTime> {
        NaiveTime::from_hms_opt(u32::from(self.hour), 0, 0).map(|t| self.date.and_time(t))
    }

    /// Whether the slot has already started at `now` (provider-local).
    #[must_use]
    pub fn is_past(&self, now: NaiveDateTime) -> bool {
        self.starts_at().is_none_or(|start| start < now)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}:00", self.date.format("%Y-%m-%d"), self.hour)
    }
}
