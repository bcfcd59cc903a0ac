//! Limiter store backends.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::InMemoryLimiterStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisLimiterStore;
