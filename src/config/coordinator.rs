//! Coordinator configuration structures.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV: &str = "SLOTKEEPER_CONFIG";

/// Store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// In-process store for development/testing.
    #[default]
    InMemory,
    /// Postgres via sqlx.
    Postgres,
    /// Redis (limiter only).
    Redis,
}

/// Backend per concern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Appointments, claims, messages.
    pub appointments: StoreBackendConfig,
    /// Pacing locks and quota windows.
    pub limiter: StoreBackendConfig,
    /// Connection string for the Postgres backend.
    pub database_url: Option<String>,
    /// Connection string for the Redis backend.
    pub redis_url: Option<String>,
}

/// Slot search configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Calendar days scanned by next-available, today included.
    pub lookahead_days: u32,
    /// Largest hour offset tried when suggesting an alternative slot.
    pub max_alternative_offset: u8,
    /// Work window start for providers without a schedule.
    pub default_work_start: NaiveTime,
    /// Work window end for providers without a schedule.
    pub default_work_end: NaiveTime,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            lookahead_days: 8,
            max_alternative_offset: 12,
            default_work_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            default_work_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

/// Limits for one metered dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLimits {
    /// Minimum gap between calls in milliseconds; 0 disables pacing.
    #[serde(default)]
    pub min_interval_ms: u64,
    /// Extra lifetime of the pacing token beyond `min_interval_ms`.
    #[serde(default = "default_lock_margin_ms")]
    pub lock_margin_ms: u64,
    /// Ceiling over any trailing 60 seconds.
    #[serde(default)]
    pub per_minute: Option<u64>,
    /// Ceiling per UTC day.
    #[serde(default)]
    pub per_day: Option<u64>,
}

const fn default_lock_margin_ms() -> u64 {
    100
}

/// Root coordinator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Slot search settings.
    pub scheduling: SchedulingConfig,
    /// Map of dependency name to limits.
    pub dependencies: HashMap<String, DependencyLimits>,
    /// Backend selection.
    pub backends: BackendConfig,
    /// Namespace for limiter keys.
    pub key_prefix: Option<String>,
}

impl SchedulingConfig {
    /// Validate scheduling values.
    pub fn validate(&self) -> Result<(), String> {
        if self.lookahead_days == 0 {
            return Err("lookahead_days must be greater than 0".into());
        }
        if self.max_alternative_offset == 0 {
            return Err("max_alternative_offset must be greater than 0".into());
        }
        if self.default_work_start >= self.default_work_end {
            return Err("default_work_start must be before default_work_end".into());
        }
        Ok(())
    }
}

impl DependencyLimits {
    /// Validate dependency limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.per_minute == Some(0) {
            return Err("per_minute must be greater than 0 when set".into());
        }
        if self.per_day == Some(0) {
            return Err("per_day must be greater than 0 when set".into());
        }
        if let (Some(minute), Some(day)) = (self.per_minute, self.per_day) {
            if minute > day {
                return Err("per_minute cannot exceed per_day".into());
            }
        }
        Ok(())
    }
}

impl BackendConfig {
    /// Validate that selected backends are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.appointments == StoreBackendConfig::Redis {
            return Err("redis can only back the limiter".into());
        }
        let wants_postgres = self.appointments == StoreBackendConfig::Postgres
            || self.limiter == StoreBackendConfig::Postgres;
        if wants_postgres && self.database_url.is_none() {
            return Err("database_url is required for the postgres backend".into());
        }
        if self.limiter == StoreBackendConfig::Redis && self.redis_url.is_none() {
            return Err("redis_url is required for the redis backend".into());
        }
        if self.limiter == StoreBackendConfig::Postgres {
            return Err("the limiter needs an expiring key-value store (in_memory or redis)".into());
        }
        Ok(())
    }
}

impl CoordinatorConfig {
    /// Validate all sections.
    pub fn validate(&self) -> Result<(), String> {
        self.scheduling
            .validate()
            .map_err(|e| format!("scheduling invalid: {e}"))?;
        for (name, limits) in &self.dependencies {
            if name.is_empty() {
                return Err("dependency names must not be empty".into());
            }
            limits
                .validate()
                .map_err(|e| format!("dependency `{name}` invalid: {e}"))?;
        }
        self.backends
            .validate()
            .map_err(|e| format!("backends invalid: {e}"))?;
        Ok(())
    }

    /// Parse coordinator configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&raw).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
    }

    /// Load `.env`, then the file named by `SLOTKEEPER_CONFIG`, or defaults.
    ///
    /// `DATABASE_URL` and `REDIS_URL` fill in missing connection strings.
    ///
    /// # Errors
    ///
    /// Fails when the named file cannot be read or is invalid.
    pub fn load() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        if cfg.backends.database_url.is_none() {
            cfg.backends.database_url = std::env::var("DATABASE_URL").ok();
        }
        if cfg.backends.redis_url.is_none() {
            cfg.backends.redis_url = std::env::var("REDIS_URL").ok();
        }
        cfg.validate().map_err(|e| anyhow::anyhow!(e))?;
        tracing::debug!(dependencies = cfg.dependencies.len(), "configuration loaded");
        Ok(cfg)
    }

    /// Key namespace for the limiter.
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        self.key_prefix.as_deref().unwrap_or("slotkeeper")
    }
}
