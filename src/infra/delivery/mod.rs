//! Real-time broadcast and push gateway adapters.

pub mod memory;

pub use memory::{MemoryHub, RecordingPushGateway};
