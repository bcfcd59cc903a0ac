//! Runtime adapters and API surface.

pub mod api;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_spawner;

pub use api::{ComponentHealth, Coordinator, ErrorResponse, Health, RescheduleRequest};
#[cfg(feature = "tokio-runtime")]
pub use tokio_spawner::TokioSpawner;
