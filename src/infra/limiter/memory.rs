//! In-process limiter store with expiring keys.
//!
//! Pacing tokens expire on the tokio clock, so tests running with paused time
//! see expiry exactly when they advance past it. Day counters expire on the
//! injected [`Clock`], matching the UTC midnight they are pinned to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::core::{LimiterStore, StoreError};
use crate::util::clock::Clock;

#[derive(Default)]
struct Keys {
    tokens: HashMap<String, (String, Instant)>,
    windows: HashMap<String, Vec<(i64, String)>>,
    counters: HashMap<String, (u64, DateTime<Utc>)>,
}

/// Limiter store kept in process memory; shared only by clones of the same `Arc`.
pub struct InMemoryLimiterStore {
    keys: Mutex<Keys>,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl InMemoryLimiterStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: Mutex::new(Keys::default()),
            available: AtomicBool::new(true),
            clock,
        }
    }

    /// Simulate the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Holder of a live pacing token, if any.
    #[must_use]
    pub fn token_holder(&self, key: &str) -> Option<String> {
        let keys = self.keys.lock();
        keys.tokens
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(token, _)| token.clone())
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("limiter store offline".into()))
        }
    }
}

fn window_ms(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl LimiterStore for InMemoryLimiterStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.guard()?;
        let now = Instant::now();
        let mut keys = self.keys.lock();
        if keys
            .tokens
            .get(key)
            .is_some_and(|(_, expires)| *expires > now)
        {
            return Ok(false);
        }
        keys.tokens
            .insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.guard()?;
        let now = Instant::now();
        Ok(self
            .keys
            .lock()
            .tokens
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(_, expires)| *expires - now))
    }

    async fn window_count(&self, key: &str, now_ms: i64, window: Duration) -> Result<u64, StoreError> {
        self.guard()?;
        let cutoff = now_ms.saturating_sub(window_ms(window));
        let mut keys = self.keys.lock();
        let Some(entries) = keys.windows.get_mut(key) else {
            return Ok(0);
        };
        entries.retain(|(at, _)| *at > cutoff);
        Ok(entries.len() as u64)
    }

    async fn window_record(
        &self,
        key: &str,
        now_ms: i64,
        member: &str,
        window: Duration,
    ) -> Result<(), StoreError> {
        self.guard()?;
        let cutoff = now_ms.saturating_sub(window_ms(window));
        let mut keys = self.keys.lock();
        let entries = keys.windows.entry(key.to_string()).or_default();
        entries.retain(|(at, _)| *at > cutoff);
        entries.push((now_ms, member.to_string()));
        Ok(())
    }

    async fn window_record_if_below(
        &self,
        key: &str,
        now_ms: i64,
        member: &str,
        window: Duration,
        max: u64,
    ) -> Result<bool, StoreError> {
        self.guard()?;
        let cutoff = now_ms.saturating_sub(window_ms(window));
        let mut keys = self.keys.lock();
        let entries = keys.windows.entry(key.to_string()).or_default();
        entries.retain(|(at, _)| *at > cutoff);
        if entries.len() as u64 >= max {
            return Ok(false);
        }
        entries.push((now_ms, member.to_string()));
        Ok(true)
    }

    async fn window_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.guard()?;
        if let Some(entries) = self.keys.lock().windows.get_mut(key) {
            entries.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn counter_get(&self, key: &str) -> Result<u64, StoreError> {
        self.guard()?;
        let now = self.clock.now_utc();
        Ok(self
            .keys
            .lock()
            .counters
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map_or(0, |(count, _)| *count))
    }

    async fn counter_incr(&self, key: &str, expire_at: DateTime<Utc>) -> Result<u64, StoreError> {
        self.guard()?;
        let now = self.clock.now_utc();
        let mut keys = self.keys.lock();
        let entry = keys
            .counters
            .entry(key.to_string())
            .or_insert((0, expire_at));
        if entry.1 <= now {
            *entry = (0, expire_at);
        }
        entry.0 += 1;
        entry.1 = expire_at;
        Ok(entry.0)
    }

    async fn counter_incr_if_below(
        &self,
        key: &str,
        max: u64,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.guard()?;
        let now = self.clock.now_utc();
        let mut keys = self.keys.lock();
        let entry = keys
            .counters
            .entry(key.to_string())
            .or_insert((0, expire_at));
        if entry.1 <= now {
            *entry = (0, expire_at);
        }
        if entry.0 >= max {
            return Ok(false);
        }
        entry.0 += 1;
        entry.1 = expire_at;
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.guard()
    }
}
