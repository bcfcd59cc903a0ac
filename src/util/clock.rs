//! Clock abstraction so calendar and quota logic can be driven by tests.

use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDateTime, Offset, Utc};
use parking_lot::Mutex;

/// Milliseconds since the Unix epoch according to the system clock.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Source of the current time.
///
/// Appointment times are provider-local; quota windows are UTC. Implementations
/// must keep both views consistent with each other.
pub trait Clock: Send + Sync + Debug {
    /// Current instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current wall-clock time in provider-local time.
    fn now_local(&self) -> NaiveDateTime;

    /// Current instant as milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64 {
        self.now_utc().timestamp_millis()
    }
}

/// Clock backed by the operating system, local time from the host timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_local(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    /// Clock pinned at `now`, with local time equal to UTC.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_offset(now, Utc.fix())
    }

    /// Clock pinned at `now` whose local time is shifted by `offset`.
    #[must_use]
    pub const fn with_offset(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(now),
            offset,
        }
    }

    /// Clock whose local time reads `local` (local time equal to UTC).
    #[must_use]
    pub fn at_local(local: NaiveDateTime) -> Self {
        Self::new(local.and_utc())
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Advance the clock by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn now_local(&self) -> NaiveDateTime {
        self.now.lock().with_timezone(&self.offset).naive_local()
    }
}
