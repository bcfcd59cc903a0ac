//! Shared fixtures: a fully wired in-memory coordinator on a manual clock.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use slotkeeper::builders::{build_coordinator_with, Hooks, StoreSet};
use slotkeeper::config::CoordinatorConfig;
use slotkeeper::core::{AppointmentRequest, WorkSchedule};
use slotkeeper::infra::{InMemoryLimiterStore, MemoryHub, MemoryStore, RecordingPushGateway};
use slotkeeper::runtime::{Coordinator, TokioSpawner};
use slotkeeper::util::clock::{Clock, ManualClock};
use slotkeeper::util::serde::{ResourceId, Slot, UserId};
use uuid::Uuid;

pub struct Harness {
    pub coordinator: Arc<Coordinator<TokioSpawner>>,
    pub store: Arc<MemoryStore>,
    pub limiter_store: Arc<InMemoryLimiterStore>,
    pub hub: Arc<MemoryHub>,
    pub push: Arc<RecordingPushGateway>,
    pub clock: Arc<ManualClock>,
}

/// Monday 2030-01-07.
pub fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
}

pub fn tuesday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 8).unwrap()
}

pub fn at(date: NaiveDate, hour: u32, minute: u32) -> NaiveDateTime {
    date.and_hms_opt(hour, minute, 0).unwrap()
}

pub fn harness() -> Harness {
    harness_with(CoordinatorConfig::default(), Hooks::default())
}

/// Coordinator whose clock reads Monday 08:30.
pub fn harness_with(cfg: CoordinatorConfig, hooks: Hooks) -> Harness {
    let clock = Arc::new(ManualClock::at_local(at(monday(), 8, 30)));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let store = Arc::new(MemoryStore::new(dyn_clock.clone()));
    let limiter_store = Arc::new(InMemoryLimiterStore::new(dyn_clock.clone()));
    let hub = Arc::new(MemoryHub::new());
    let push = Arc::new(RecordingPushGateway::new());
    let stores = StoreSet::in_memory(&store, limiter_store.clone(), hub.clone(), push.clone());
    let spawner = TokioSpawner::current().expect("inside a tokio runtime");
    let coordinator = build_coordinator_with(&cfg, stores, spawner, dyn_clock, hooks)
        .expect("valid configuration");
    Harness {
        coordinator: Arc::new(coordinator),
        store,
        limiter_store,
        hub,
        push,
        clock,
    }
}

pub struct Parties {
    pub resource: ResourceId,
    pub requester: UserId,
    pub provider: UserId,
}

impl Parties {
    pub fn new() -> Self {
        Self {
            resource: Uuid::new_v4(),
            requester: Uuid::new_v4(),
            provider: Uuid::new_v4(),
        }
    }

    pub fn request(&self, slot: Slot) -> AppointmentRequest {
        AppointmentRequest {
            resource_id: self.resource,
            requester_id: self.requester,
            provider_id: self.provider,
            slot,
            notes: None,
        }
    }
}

pub fn nine_to_five() -> WorkSchedule {
    WorkSchedule::from_hours(9, 17).unwrap()
}
