//! Infrastructure adapters for stores, limiter backends and delivery channels.

pub mod delivery;
pub mod limiter;
pub mod store;

pub use delivery::{MemoryHub, RecordingPushGateway};
pub use limiter::InMemoryLimiterStore;
#[cfg(feature = "redis-store")]
pub use limiter::RedisLimiterStore;
pub use store::MemoryStore;
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
