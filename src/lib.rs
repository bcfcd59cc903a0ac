//! # Slotkeeper
//!
//! Conflict-free coordination for a marketplace backend whose workers run in
//! many processes against one shared store.
//!
//! The crate owns four concerns:
//!
//! - **Appointment engine**: a requester and a provider negotiate an hourly
//!   slot through a small state machine (`pending → confirmed → completed`,
//!   with cancel and reschedule). Double booking is impossible because every
//!   slot mutation is one conditional write.
//! - **Claim primitive**: first-writer-wins ownership of a shared resource,
//!   written once and only changed by an administrative override.
//! - **Pacing and quota limiter**: a minimum gap between calls to a metered
//!   dependency, plus per-minute and per-day ceilings. Fails open.
//! - **Message fan-out**: persist a message, broadcast it to both participants
//!   in order, then push to the receiver's devices unless muted.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use slotkeeper::builders::{build_coordinator, StoreSet};
//! use slotkeeper::config::CoordinatorConfig;
//! use slotkeeper::infra::{InMemoryLimiterStore, MemoryHub, MemoryStore, RecordingPushGateway};
//! use slotkeeper::runtime::TokioSpawner;
//! use slotkeeper::util::{init_tracing, SystemClock};
//!
//! init_tracing();
//! let cfg = CoordinatorConfig::load()?;
//! let clock = Arc::new(SystemClock);
//! let store = Arc::new(MemoryStore::new(clock.clone()));
//! let stores = StoreSet::in_memory(
//!     &store,
//!     Arc::new(InMemoryLimiterStore::new(clock.clone())),
//!     Arc::new(MemoryHub::new()),
//!     Arc::new(RecordingPushGateway::new()),
//! );
//! let coordinator = build_coordinator(&cfg, stores, TokioSpawner::current()?, clock)?;
//!
//! let slot = coordinator.next_available_slot(provider).await?;
//! ```
//!
//! ## Errors
//!
//! Operations return [`core::CoordError`]. Conflicts and state errors are
//! permanent for the request; `QuotaExceeded` and `StoreUnavailable` are
//! transient (`is_transient()`). `StoreCorrupt` marks an unreadable record and
//! is not. `OutOfHours` and `SlotTaken` carry a suggested slot.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Coordination primitives: appointments, claims, call limits and message fan-out.
pub mod core;
/// Configuration models for scheduling, dependencies and backends.
pub mod config;
/// Builders to construct a coordinator from configuration.
pub mod builders;
/// Infrastructure adapters for stores, limiter backends and delivery channels.
pub mod infra;
/// Runtime adapters and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
