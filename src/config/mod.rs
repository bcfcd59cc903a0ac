//! Configuration models for scheduling, metered dependencies and backends.

pub mod coordinator;

pub use coordinator::{
    BackendConfig, CoordinatorConfig, DependencyLimits, SchedulingConfig, StoreBackendConfig,
    CONFIG_ENV,
};
