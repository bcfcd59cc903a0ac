//! Call pacing and quota guards for metered external dependencies.
//!
//! Two independent guards protect each dependency:
//!
//! - **Pacing lock**: a short-lived token taken with set-if-absent. Its expiry is
//!   slightly longer than the minimum gap between calls and it is never released
//!   early, so at most one call per gap gets through across all processes.
//! - **Quota**: a trailing 60 second window of call timestamps plus a per-day
//!   counter expiring at the next UTC midnight.
//!
//! Both guards fail open: if the limiter store is unreachable the call is
//! allowed and a warning is logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{CoordError, QuotaWindowKind, StoreError};
use crate::util::clock::Clock;

/// Length of the sliding quota window.
pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Shortest sleep between pacing attempts when the lock's expiry is unknown.
const RETRY_FLOOR: Duration = Duration::from_millis(5);

/// Store seam for the limiter, shaped after Redis primitives.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Set `key` to `token` with expiry `ttl` only if absent. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Time left before `key` expires, `None` if it is absent.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Drop window entries older than `now_ms - window` and count the rest.
    async fn window_count(&self, key: &str, now_ms: i64, window: Duration) -> Result<u64, StoreError>;

    /// Add an entry stamped `now_ms` to the window.
    async fn window_record(
        &self,
        key: &str,
        now_ms: i64,
        member: &str,
        window: Duration,
    ) -> Result<(), StoreError>;

    /// Prune the window and add `member` only if fewer than `max` entries remain,
    /// as one atomic step. Returns whether the entry was added.
    async fn window_record_if_below(
        &self,
        key: &str,
        now_ms: i64,
        member: &str,
        window: Duration,
        max: u64,
    ) -> Result<bool, StoreError>;

    /// Remove `member` from the window.
    async fn window_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Current counter value, zero if absent.
    async fn counter_get(&self, key: &str) -> Result<u64, StoreError>;

    /// Increment the counter and pin its expiry to `expire_at`.
    async fn counter_incr(&self, key: &str, expire_at: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Increment the counter only if it stays within `max`, as one atomic step.
    /// Returns whether the increment was kept.
    async fn counter_incr_if_below(
        &self,
        key: &str,
        max: u64,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Health probe.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Limits for one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLimits {
    /// Minimum gap between two calls; zero disables pacing.
    pub min_interval: Duration,
    /// Expiry of the pacing token, at least `min_interval`.
    pub lock_ttl: Duration,
    /// Calls allowed in any trailing 60 seconds.
    pub per_minute: Option<u64>,
    /// Calls allowed per UTC day.
    pub per_day: Option<u64>,
}

impl CallLimits {
    /// Pacing-only limits with a lock slightly longer than `min_interval`.
    #[must_use]
    pub fn paced(min_interval: Duration, margin: Duration) -> Self {
        Self {
            min_interval,
            lock_ttl: min_interval + margin,
            per_minute: None,
            per_day: None,
        }
    }

    /// Add quota ceilings.
    #[must_use]
    pub fn with_quota(mut self, per_minute: Option<u64>, per_day: Option<u64>) -> Self {
        self.per_minute = per_minute;
        self.per_day = per_day;
        self
    }
}

/// Outcome of a pacing acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPermit {
    /// Time spent waiting for the previous caller's token to expire.
    pub waited: Duration,
    /// Number of set-if-absent attempts, 1 for an immediate grant.
    pub attempts: u32,
    /// `false` when the store failed and the permit was granted without a lock.
    pub enforced: bool,
}

impl PacingPermit {
    /// Whether the permit was granted on the first attempt.
    #[must_use]
    pub const fn immediate(&self) -> bool {
        self.attempts <= 1
    }
}

/// Current usage of a dependency's quotas; `None` when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Calls in the trailing minute.
    pub minute: Option<u64>,
    /// Calls today (UTC).
    pub day: Option<u64>,
}

/// Pacing and quota guard over a shared [`LimiterStore`].
pub struct CallLimiter {
    store: Arc<dyn LimiterStore>,
    clock: Arc<dyn Clock>,
    limits: HashMap<String, CallLimits>,
    prefix: String,
}

impl CallLimiter {
    /// Create a limiter. Keys are namespaced by `prefix`.
    pub fn new(
        store: Arc<dyn LimiterStore>,
        clock: Arc<dyn Clock>,
        limits: HashMap<String, CallLimits>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            limits,
            prefix: prefix.into(),
        }
    }

    /// Registered dependency names.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.limits.keys().map(String::as_str)
    }

    /// Health probe of the limiter store.
    ///
    /// # Errors
    ///
    /// Propagates the store failure.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    /// Refuse the call if either ceiling has been reached.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` when a ceiling is met, `NotFound` for unknown dependencies.
    pub async fn check_quota(&self, dependency: &str) -> Result<(), CoordError> {
        let limits = self.limits_for(dependency)?;
        let now = self.clock.now_utc();

        if let Some(max) = limits.per_minute {
            let key = self.minute_key(dependency);
            match self
                .store
                .window_count(&key, now.timestamp_millis(), MINUTE_WINDOW)
                .await
            {
                Ok(count) if count >= max => {
                    tracing::info!(dependency, count, max, "per-minute quota reached");
                    return Err(CoordError::QuotaExceeded {
                        dependency: dependency.to_string(),
                        window: QuotaWindowKind::Minute,
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(dependency, error = %err, "quota store unavailable, allowing call");
                    return Ok(());
                }
            }
        }

        if let Some(max) = limits.per_day {
            let key = self.day_key(dependency, now);
            match self.store.counter_get(&key).await {
                Ok(count) if count >= max => {
                    tracing::info!(dependency, count, max, "daily quota reached");
                    return Err(CoordError::QuotaExceeded {
                        dependency: dependency.to_string(),
                        window: QuotaWindowKind::Day,
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(dependency, error = %err, "quota store unavailable, allowing call");
                }
            }
        }
        Ok(())
    }

    /// Count one call against both windows.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown dependencies. Store failures are logged, not returned.
    pub async fn record_call(&self, dependency: &str) -> Result<(), CoordError> {
        let limits = self.limits_for(dependency)?;
        let now = self.clock.now_utc();

        if limits.per_minute.is_some() {
            let member = format!("{}-{}", now.timestamp_millis(), uuid::Uuid::new_v4());
            if let Err(err) = self
                .store
                .window_record(&self.minute_key(dependency), now.timestamp_millis(), &member, MINUTE_WINDOW)
                .await
            {
                tracing::warn!(dependency, error = %err, "failed to record call in minute window");
            }
        }
        if limits.per_day.is_some() {
            if let Err(err) = self
                .store
                .counter_incr(&self.day_key(dependency, now), next_utc_midnight(now))
                .await
            {
                tracing::warn!(dependency, error = %err, "failed to record call in daily counter");
            }
        }
        Ok(())
    }

    /// Wait until this process holds the dependency's pacing token.
    ///
    /// Sleeps for the token's remaining expiry between attempts; never spins.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown dependencies. Store failures grant an unenforced permit.
    pub async fn acquire_pacing_slot(&self, dependency: &str) -> Result<PacingPermit, CoordError> {
        let limits = self.limits_for(dependency)?;
        if limits.min_interval.is_zero() {
            return Ok(PacingPermit {
                waited: Duration::ZERO,
                attempts: 0,
                enforced: false,
            });
        }

        let key = self.pace_key(dependency);
        let token = uuid::Uuid::new_v4().to_string();
        let started = tokio::time::Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.store.set_if_absent(&key, &token, limits.lock_ttl).await {
                Ok(true) => {
                    let waited = started.elapsed();
                    tracing::debug!(dependency, attempts, ?waited, "pacing slot acquired");
                    return Ok(PacingPermit {
                        waited,
                        attempts,
                        enforced: true,
                    });
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(dependency, error = %err, "pacing store unavailable, allowing call");
                    return Ok(PacingPermit {
                        waited: started.elapsed(),
                        attempts,
                        enforced: false,
                    });
                }
            }

            let wait = match self.store.remaining_ttl(&key).await {
                Ok(Some(ttl)) => ttl.min(limits.lock_ttl).max(RETRY_FLOOR),
                Ok(None) => RETRY_FLOOR,
                Err(err) => {
                    tracing::warn!(dependency, error = %err, "pacing store unavailable, allowing call");
                    return Ok(PacingPermit {
                        waited: started.elapsed(),
                        attempts,
                        enforced: false,
                    });
                }
            };
            tracing::trace!(dependency, ?wait, "pacing slot busy");
            tokio::time::sleep(wait).await;
        }
    }

    /// Quota check, pacing wait and call accounting in one step.
    ///
    /// A quick check refuses early without waiting for the pacing token. Once the
    /// token is held the call is counted with conditional writes, so callers that
    /// queued behind the token cannot push a window past its ceiling.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` when a ceiling is met; callers should fail over to another
    /// provider rather than wait.
    pub async fn admit(&self, dependency: &str) -> Result<PacingPermit, CoordError> {
        self.check_quota(dependency).await?;
        let permit = self.acquire_pacing_slot(dependency).await?;
        self.reserve_call(dependency).await?;
        Ok(permit)
    }

    /// Count one call only if both ceilings still allow it.
    ///
    /// A call refused by the daily ceiling gives back its minute window entry.
    async fn reserve_call(&self, dependency: &str) -> Result<(), CoordError> {
        let limits = self.limits_for(dependency)?;
        let now = self.clock.now_utc();
        let now_ms = now.timestamp_millis();
        let minute_key = self.minute_key(dependency);
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
        let mut minute_entry = false;

        if let Some(max) = limits.per_minute {
            match self
                .store
                .window_record_if_below(&minute_key, now_ms, &member, MINUTE_WINDOW, max)
                .await
            {
                Ok(true) => minute_entry = true,
                Ok(false) => {
                    tracing::info!(dependency, max, "per-minute quota reached while paced");
                    return Err(CoordError::QuotaExceeded {
                        dependency: dependency.to_string(),
                        window: QuotaWindowKind::Minute,
                    });
                }
                Err(err) => {
                    tracing::warn!(dependency, error = %err, "quota store unavailable, allowing call");
                }
            }
        }

        if let Some(max) = limits.per_day {
            match self
                .store
                .counter_incr_if_below(&self.day_key(dependency, now), max, next_utc_midnight(now))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    if minute_entry {
                        if let Err(err) = self.store.window_remove(&minute_key, &member).await {
                            tracing::warn!(dependency, error = %err, "failed to release minute window entry");
                        }
                    }
                    tracing::info!(dependency, max, "daily quota reached while paced");
                    return Err(CoordError::QuotaExceeded {
                        dependency: dependency.to_string(),
                        window: QuotaWindowKind::Day,
                    });
                }
                Err(err) => {
                    tracing::warn!(dependency, error = %err, "quota store unavailable, allowing call");
                }
            }
        }
        Ok(())
    }

    /// Current quota usage, as far as the store can tell.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown dependencies.
    pub async fn usage(&self, dependency: &str) -> Result<QuotaUsage, CoordError> {
        self.limits_for(dependency)?;
        let now = self.clock.now_utc();
        let minute = self
            .store
            .window_count(&self.minute_key(dependency), now.timestamp_millis(), MINUTE_WINDOW)
            .await
            .ok();
        let day = self.store.counter_get(&self.day_key(dependency, now)).await.ok();
        Ok(QuotaUsage { minute, day })
    }

    fn limits_for(&self, dependency: &str) -> Result<&CallLimits, CoordError> {
        self.limits
            .get(dependency)
            .ok_or_else(|| CoordError::NotFound(format!("dependency `{dependency}`")))
    }

    fn pace_key(&self, dependency: &str) -> String {
        format!("{}:pace:{dependency}", self.prefix)
    }

    fn minute_key(&self, dependency: &str) -> String {
        format!("{}:quota:{dependency}:minute", self.prefix)
    }

    fn day_key(&self, dependency: &str, now: DateTime<Utc>) -> String {
        format!("{}:quota:{dependency}:day:{}", self.prefix, now.format("%Y-%m-%d"))
    }
}

/// The first instant of the next UTC day.
#[must_use]
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(now, |midnight| midnight.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn midnight_rolls_to_next_day() {
        let now = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 30).unwrap();
        assert_eq!(
            next_utc_midnight(now),
            Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn paced_limits_add_margin() {
        let limits = CallLimits::paced(Duration::from_secs(1), Duration::from_millis(100));
        assert_eq!(limits.lock_ttl, Duration::from_millis(1100));
        assert_eq!(limits.per_minute, None);
    }
}
