//! Runtime-agnostic task spawning.

use std::future::Future;

/// Abstraction for spawning background work on a runtime.
///
/// Used for side effects that must never hold up the caller, such as push
/// notification fan-out and dead-token cleanup.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
