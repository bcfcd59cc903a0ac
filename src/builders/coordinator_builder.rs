//! Builders to construct a [`Coordinator`] from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CoordinatorConfig, DependencyLimits, SchedulingConfig, StoreBackendConfig};
use crate::core::{
    AppointmentCards, AppointmentEngine, AppointmentStore, AuditSink, CallLimiter, CallLimits,
    ClaimCascade, ClaimStore, Claims, CoordError, Dispatcher, EngineSettings, FanoutStores,
    LimiterStore, PushGateway, ScheduleSource, Spawn, TracingAuditSink, WorkSchedule,
};
use crate::infra::{InMemoryLimiterStore, MemoryHub, MemoryStore};
use crate::runtime::Coordinator;
use crate::util::clock::Clock;

/// Connections opened for a Postgres-backed deployment.
#[cfg(feature = "postgres")]
const POSTGRES_MAX_CONNECTIONS: u32 = 10;

/// Every store a coordinator talks to.
#[derive(Clone)]
pub struct StoreSet {
    /// Appointment records.
    pub appointments: Arc<dyn AppointmentStore>,
    /// Providers' work windows.
    pub schedules: Arc<dyn ScheduleSource>,
    /// Claimable resources.
    pub claims: Arc<dyn ClaimStore>,
    /// Pacing locks and quota windows.
    pub limiter: Arc<dyn LimiterStore>,
    /// Message delivery collaborators.
    pub fanout: FanoutStores,
}

impl StoreSet {
    /// All stores in process memory.
    pub fn in_memory(
        store: &Arc<MemoryStore>,
        limiter: Arc<InMemoryLimiterStore>,
        hub: Arc<MemoryHub>,
        push: Arc<dyn PushGateway>,
    ) -> Self {
        Self {
            appointments: store.clone(),
            schedules: store.clone(),
            claims: store.clone(),
            limiter,
            fanout: FanoutStores {
                messages: store.clone(),
                broadcaster: hub,
                mutes: store.clone(),
                tokens: store.clone(),
                push,
            },
        }
    }

    /// Open the backends selected by `cfg`.
    ///
    /// The broadcaster and push gateway are always supplied by the caller.
    ///
    /// # Errors
    ///
    /// `Config` for invalid configuration or a backend compiled out;
    /// `StoreUnavailable` when a backend cannot be reached.
    pub async fn from_config(
        cfg: &CoordinatorConfig,
        clock: Arc<dyn Clock>,
        hub: Arc<MemoryHub>,
        push: Arc<dyn PushGateway>,
    ) -> Result<Self, CoordError> {
        cfg.validate().map_err(CoordError::Config)?;

        let limiter: Arc<dyn LimiterStore> = match cfg.backends.limiter {
            StoreBackendConfig::Redis => connect_redis(cfg).await?,
            StoreBackendConfig::InMemory | StoreBackendConfig::Postgres => {
                Arc::new(InMemoryLimiterStore::new(clock.clone()))
            }
        };

        match cfg.backends.appointments {
            StoreBackendConfig::Postgres => connect_postgres(cfg, limiter, hub, push).await,
            StoreBackendConfig::InMemory | StoreBackendConfig::Redis => {
                let store = Arc::new(MemoryStore::new(clock));
                Ok(Self {
                    appointments: store.clone(),
                    schedules: store.clone(),
                    claims: store.clone(),
                    limiter,
                    fanout: FanoutStores {
                        messages: store.clone(),
                        broadcaster: hub,
                        mutes: store.clone(),
                        tokens: store,
                        push,
                    },
                })
            }
        }
    }
}

#[cfg(feature = "redis-store")]
async fn connect_redis(cfg: &CoordinatorConfig) -> Result<Arc<dyn LimiterStore>, CoordError> {
    let url = cfg
        .backends
        .redis_url
        .as_deref()
        .ok_or_else(|| CoordError::Config("redis_url missing".into()))?;
    Ok(Arc::new(crate::infra::RedisLimiterStore::connect(url).await?))
}

#[cfg(not(feature = "redis-store"))]
async fn connect_redis(_cfg: &CoordinatorConfig) -> Result<Arc<dyn LimiterStore>, CoordError> {
    Err(CoordError::Config(
        "redis limiter selected but the `redis-store` feature is disabled".into(),
    ))
}

#[cfg(feature = "postgres")]
async fn connect_postgres(
    cfg: &CoordinatorConfig,
    limiter: Arc<dyn LimiterStore>,
    hub: Arc<MemoryHub>,
    push: Arc<dyn PushGateway>,
) -> Result<StoreSet, CoordError> {
    let url = cfg
        .backends
        .database_url
        .as_deref()
        .ok_or_else(|| CoordError::Config("database_url missing".into()))?;
    let store = Arc::new(crate::infra::PostgresStore::connect(url, POSTGRES_MAX_CONNECTIONS).await?);
    store.migrate().await?;
    Ok(StoreSet {
        appointments: store.clone(),
        schedules: store.clone(),
        claims: store.clone(),
        limiter,
        fanout: FanoutStores {
            messages: store.clone(),
            broadcaster: hub,
            mutes: store.clone(),
            tokens: store,
            push,
        },
    })
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(
    _cfg: &CoordinatorConfig,
    _limiter: Arc<dyn LimiterStore>,
    _hub: Arc<MemoryHub>,
    _push: Arc<dyn PushGateway>,
) -> Result<StoreSet, CoordError> {
    Err(CoordError::Config(
        "postgres store selected but the `postgres` feature is disabled".into(),
    ))
}

/// Optional hooks wired into the coordinator.
pub struct Hooks {
    /// Receives every stored appointment transition.
    pub audit: Box<dyn AuditSink>,
    /// Runs after each winning claim.
    pub cascade: Option<Arc<dyn ClaimCascade>>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            audit: Box::new(TracingAuditSink),
            cascade: None,
        }
    }
}

/// Engine settings from the scheduling section.
///
/// # Errors
///
/// `Config` when the default window is empty.
pub fn engine_settings(cfg: &SchedulingConfig) -> Result<EngineSettings, CoordError> {
    let default_schedule = WorkSchedule::new(cfg.default_work_start, cfg.default_work_end)
        .map_err(CoordError::Config)?;
    Ok(EngineSettings {
        lookahead_days: cfg.lookahead_days,
        max_alternative_offset: cfg.max_alternative_offset,
        default_schedule,
    })
}

/// Limiter limits for one dependency.
#[must_use]
pub fn call_limits(cfg: &DependencyLimits) -> CallLimits {
    CallLimits::paced(
        Duration::from_millis(cfg.min_interval_ms),
        Duration::from_millis(cfg.lock_margin_ms),
    )
    .with_quota(cfg.per_minute, cfg.per_day)
}

/// Build a coordinator with default hooks.
///
/// # Errors
///
/// `Config` when the configuration is invalid.
pub fn build_coordinator<S>(
    cfg: &CoordinatorConfig,
    stores: StoreSet,
    spawner: S,
    clock: Arc<dyn Clock>,
) -> Result<Coordinator<S>, CoordError>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    build_coordinator_with(cfg, stores, spawner, clock, Hooks::default())
}

/// Build a coordinator, wiring appointment transitions into card messages.
///
/// # Errors
///
/// `Config` when the configuration is invalid.
pub fn build_coordinator_with<S>(
    cfg: &CoordinatorConfig,
    stores: StoreSet,
    spawner: S,
    clock: Arc<dyn Clock>,
    hooks: Hooks,
) -> Result<Coordinator<S>, CoordError>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    cfg.validate().map_err(CoordError::Config)?;

    let dispatcher = Arc::new(Dispatcher::new(stores.fanout, clock.clone(), spawner));
    let engine = AppointmentEngine::new(
        stores.appointments,
        stores.schedules,
        clock.clone(),
        engine_settings(&cfg.scheduling)?,
    )
    .with_events(Arc::new(AppointmentCards::new(dispatcher.clone())))
    .with_audit(hooks.audit);

    let mut claims = Claims::new(stores.claims);
    if let Some(cascade) = hooks.cascade {
        claims = claims.with_cascade(cascade);
    }

    let limits: HashMap<String, CallLimits> = cfg
        .dependencies
        .iter()
        .map(|(name, deps)| (name.clone(), call_limits(deps)))
        .collect();
    tracing::info!(
        dependencies = limits.len(),
        lookahead_days = cfg.scheduling.lookahead_days,
        "coordinator built"
    );
    let limiter = CallLimiter::new(stores.limiter, clock, limits, cfg.key_prefix());

    Ok(Coordinator::new(engine, claims, limiter, dispatcher))
}
