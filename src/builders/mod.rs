//! Builders wiring stores and configuration into a coordinator.

pub mod coordinator_builder;

pub use coordinator_builder::{
    build_coordinator, build_coordinator_with, call_limits, engine_settings, Hooks, StoreSet,
};
