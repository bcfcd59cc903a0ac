//! Appointment engine: lifecycle transitions, availability and quick-assign.
//!
//! Every slot mutation is a single conditional write against the
//! [`AppointmentStore`]; the engine never reads a slot and then writes it as two
//! separate steps. A writer that loses the race receives
//! [`CoordError::Conflict`] and the engine does not retry on its behalf.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::appointment::{
    Action, Appointment, AppointmentStatus, NewAppointment, Party, SlotMove, StatusChange,
    UpdateOutcome,
};
use crate::core::audit::{build_audit_event, AuditSink};
use crate::core::claim::ClaimOutcome;
use crate::core::error::{ConflictKind, CoordError, StoreError};
use crate::core::schedule::{self, SlotAvailability, WorkSchedule};
use crate::util::clock::Clock;
use crate::util::serde::{AppointmentId, ResourceId, Slot, UserId};

/// Reason stored on pending appointments replaced by a quick-assign proposal.
pub const SUPERSEDED_REASON: &str = "superseded by a new proposal";

/// Store seam for appointment records.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Insert a pending appointment only if neither the provider's slot nor the
    /// requester's slot is held by an active appointment.
    ///
    /// `Held` carries the active appointment that blocked the insert.
    async fn reserve(&self, new: NewAppointment) -> Result<ClaimOutcome<Appointment>, StoreError>;

    /// Fetch one appointment.
    async fn get(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError>;

    /// Apply `change` only if the current status equals `change.from`.
    ///
    /// Moving to confirmed must also fail with `ConfirmedExists` when another
    /// confirmed appointment exists for the same resource, requester and provider.
    async fn change_status(
        &self,
        id: AppointmentId,
        change: StatusChange,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Move to another slot only if the status still equals `mv.from` and the
    /// target slot is free for both parties, ignoring the appointment itself.
    async fn move_slot(&self, id: AppointmentId, mv: SlotMove) -> Result<UpdateOutcome, StoreError>;

    /// Cancel every pending appointment of the triple in one conditional update.
    async fn cancel_pending_for(
        &self,
        resource: ResourceId,
        requester: UserId,
        provider: UserId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AppointmentId>, StoreError>;

    /// Active (pending or confirmed) appointments on a provider's day.
    async fn active_for_provider_on(
        &self,
        provider: UserId,
        date: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// The confirmed appointment of the triple, if any.
    async fn confirmed_for(
        &self,
        resource: ResourceId,
        requester: UserId,
        provider: UserId,
    ) -> Result<Option<Appointment>, StoreError>;

    /// All appointments in which `user` is a party, newest slot first.
    async fn list_for_user(&self, user: UserId) -> Result<Vec<Appointment>, StoreError>;

    /// Health probe.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Read-only access to providers' work windows.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// The provider's window, `None` if they never configured one.
    async fn work_schedule(&self, provider: UserId) -> Result<Option<WorkSchedule>, StoreError>;
}

/// Kind of appointment transition announced to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentEventKind {
    /// A new pending appointment was created.
    Created,
    /// The provider confirmed.
    Confirmed,
    /// The requester accepted.
    Accepted,
    /// A party cancelled.
    Cancelled,
    /// The provider completed.
    Completed,
    /// A party moved it to another slot.
    Rescheduled,
    /// Cancelled because the provider quick-assigned a new slot.
    Superseded,
}

impl AppointmentEventKind {
    const fn for_action(action: Action) -> Self {
        match action {
            Action::Confirm => Self::Confirmed,
            Action::Accept => Self::Accepted,
            Action::Cancel => Self::Cancelled,
            Action::Complete => Self::Completed,
            Action::Reschedule => Self::Rescheduled,
        }
    }
}

/// Domain event emitted after a transition is durably stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentEvent {
    /// What happened.
    pub kind: AppointmentEventKind,
    /// Appointment state after the transition.
    pub appointment: Appointment,
    /// User who caused it.
    pub actor: UserId,
}

/// Consumer of appointment events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    async fn publish(&self, event: AppointmentEvent) -> Result<(), CoordError>;
}

/// Tunables for slot search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Calendar days scanned by next-available, today included.
    pub lookahead_days: u32,
    /// Largest hour offset tried when looking for an alternative slot.
    pub max_alternative_offset: u8,
    /// Window used for providers without a configured schedule.
    pub default_schedule: WorkSchedule,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lookahead_days: 8,
            max_alternative_offset: 12,
            default_schedule: WorkSchedule {
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
                end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
            },
        }
    }
}

/// Input for a new appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentRequest {
    /// Listing the meeting is about.
    pub resource_id: ResourceId,
    /// User asking for the meeting.
    pub requester_id: UserId,
    /// User whose calendar the slot belongs to.
    pub provider_id: UserId,
    /// Requested slot.
    pub slot: Slot,
    /// Free-form notes.
    pub notes: Option<String>,
}

/// Successful quick-assign result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickAssignment {
    /// The new pending appointment.
    pub appointment: Appointment,
    /// Pending appointments of the same triple that were superseded.
    pub superseded: Vec<AppointmentId>,
}

/// Appointment lifecycle and slot search over a shared store.
pub struct AppointmentEngine {
    store: Arc<dyn AppointmentStore>,
    schedules: Arc<dyn ScheduleSource>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    events: Option<Arc<dyn EventSink>>,
    audit: Option<Arc<Mutex<Box<dyn AuditSink>>>>,
}

impl AppointmentEngine {
    /// Create an engine.
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        schedules: Arc<dyn ScheduleSource>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            schedules,
            clock,
            settings,
            events: None,
            audit: None,
        }
    }

    /// Attach an event sink notified after each stored transition.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Box<dyn AuditSink>) -> Self {
        self.audit = Some(Arc::new(Mutex::new(audit)));
        self
    }

    /// Settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Health probe of the underlying store.
    ///
    /// # Errors
    ///
    /// Propagates the store failure.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    /// Create a pending appointment proposed by `actor`, who must be one of the parties.
    ///
    /// # Errors
    ///
    /// `Conflict` when the slot is held, the requester is busy at that slot, the
    /// parties coincide or the slot is in the past; `NotAuthorized` when `actor`
    /// is neither party; `StoreUnavailable` on store failure.
    pub async fn create(&self, actor: UserId, req: AppointmentRequest) -> Result<Appointment, CoordError> {
        let proposed_by = if actor == req.provider_id {
            Party::Provider
        } else if actor == req.requester_id {
            Party::Requester
        } else {
            return Err(CoordError::NotAuthorized {
                actor,
                action: "create",
            });
        };
        self.validate_new(&req)?;
        self.reserve(actor, req, proposed_by).await
    }

    /// Provider confirms a pending appointment proposed by the requester.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` unless `actor` is the provider and the requester proposed
    /// the current slot; `InvalidState` unless pending;
    /// `Conflict(ConfirmedExists)` if the triple already has a confirmed appointment.
    pub async fn confirm(&self, id: AppointmentId, actor: UserId) -> Result<Appointment, CoordError> {
        self.apply(id, actor, Action::Confirm, None).await
    }

    /// Requester accepts a pending appointment proposed by the provider.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` unless `actor` is the requester and the provider proposed
    /// the current slot; `InvalidState` unless pending;
    /// `Conflict(ConfirmedExists)` if the triple already has a confirmed appointment.
    pub async fn accept(&self, id: AppointmentId, actor: UserId) -> Result<Appointment, CoordError> {
        self.apply(id, actor, Action::Accept, None).await
    }

    /// Either party cancels a pending or confirmed appointment.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` unless `actor` is a party; `InvalidState` from terminal states.
    pub async fn cancel(
        &self,
        id: AppointmentId,
        actor: UserId,
        reason: Option<String>,
    ) -> Result<Appointment, CoordError> {
        self.apply(id, actor, Action::Cancel, reason).await
    }

    /// Provider marks a confirmed appointment as held.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` unless `actor` is the provider; `InvalidState` unless confirmed.
    pub async fn complete(&self, id: AppointmentId, actor: UserId) -> Result<Appointment, CoordError> {
        self.apply(id, actor, Action::Complete, None).await
    }

    /// Move an appointment to `slot`. A confirmed appointment drops back to pending
    /// and the mover becomes the proposer, so the counterpart agrees next.
    ///
    /// # Errors
    ///
    /// `NotAuthorized` unless `actor` is a party; `InvalidState` from terminal states;
    /// `OutOfHours` when `slot` lies outside the work window (with the first free
    /// hour of that day as suggestion); `Conflict` when the target slot is held or
    /// in the past.
    pub async fn reschedule(
        &self,
        id: AppointmentId,
        actor: UserId,
        slot: Slot,
        notes: Option<String>,
    ) -> Result<Appointment, CoordError> {
        let current = self.load(id).await?;
        Self::authorize(&current, actor, Action::Reschedule)?;
        let next = Self::next_status(&current, Action::Reschedule)?;
        if slot.is_past(self.clock.now_local()) {
            return Err(CoordError::Conflict(ConflictKind::PastSlot { slot }));
        }

        let schedule = self.schedule_for(current.provider_id).await?;
        if !schedule.contains(slot.hour) {
            let occupied = self
                .occupied_hours(current.provider_id, slot.date, Some(id))
                .await?;
            let blocked = self.without_started_hours(slot.date, occupied);
            let suggestion = schedule::first_free_from(&schedule, &blocked, schedule.start_hour())
                .map(|hour| Slot::new(slot.date, hour));
            return Err(CoordError::OutOfHours {
                suggestion,
                cancelled: Vec::new(),
            });
        }

        let proposed_by = current.party_of(actor).unwrap_or(current.proposed_by);
        let mv = SlotMove {
            from: current.status,
            to: next,
            slot,
            notes,
            proposed_by,
            at: self.clock.now_utc(),
        };
        let updated = Self::settle(id, Action::Reschedule, self.store.move_slot(id, mv).await?)?;
        tracing::info!(
            appointment = id,
            from = %current.slot,
            to = %updated.slot,
            status = %updated.status,
            "appointment rescheduled"
        );
        self.record_audit(id, actor, Action::Reschedule.as_str(), Some(current.status), updated.status);
        self.emit(AppointmentEventKind::Rescheduled, &updated, actor).await;
        Ok(updated)
    }

    /// Provider proposes `slot` to `requester`, superseding the requester's pending
    /// proposals for the same resource and provider.
    ///
    /// Superseded appointments stay cancelled even when the new proposal is
    /// refused; their ids travel inside `OutOfHours` / `SlotTaken`.
    ///
    /// # Errors
    ///
    /// `Conflict(ConfirmedExists)` when the triple already has a confirmed
    /// appointment; `OutOfHours` / `SlotTaken` with a suggested slot; `Conflict`
    /// when the final conditional insert loses a race.
    pub async fn quick_assign(&self, provider: UserId, req: AppointmentRequest) -> Result<QuickAssignment, CoordError> {
        if provider != req.provider_id {
            return Err(CoordError::NotAuthorized {
                actor: provider,
                action: "quick-assign",
            });
        }
        self.validate_new(&req)?;

        if let Some(existing) = self
            .store
            .confirmed_for(req.resource_id, req.requester_id, req.provider_id)
            .await?
        {
            return Err(CoordError::Conflict(ConflictKind::ConfirmedExists {
                existing: existing.id,
            }));
        }

        let cancelled = self
            .store
            .cancel_pending_for(
                req.resource_id,
                req.requester_id,
                req.provider_id,
                SUPERSEDED_REASON,
                self.clock.now_utc(),
            )
            .await?;
        if !cancelled.is_empty() {
            tracing::info!(?cancelled, requester = %req.requester_id, "pending appointments superseded");
            for id in &cancelled {
                self.record_audit(
                    *id,
                    provider,
                    "supersede",
                    Some(AppointmentStatus::Pending),
                    AppointmentStatus::Cancelled,
                );
                match self.store.get(*id).await {
                    Ok(Some(superseded)) => {
                        self.emit(AppointmentEventKind::Superseded, &superseded, provider)
                            .await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(appointment = id, error = %err, "superseded appointment not reloaded");
                    }
                }
            }
        }

        let schedule = self.schedule_for(req.provider_id).await?;
        let active = self
            .store
            .active_for_provider_on(req.provider_id, req.slot.date)
            .await?;
        let occupied: HashSet<u8> = active.iter().map(|a| a.slot.hour).collect();
        let blocked = self.without_started_hours(req.slot.date, occupied);

        if !schedule.contains(req.slot.hour) {
            let suggestion = schedule::first_free_from(&schedule, &blocked, schedule.start_hour())
                .map(|hour| Slot::new(req.slot.date, hour));
            tracing::debug!(slot = %req.slot, ?suggestion, "quick-assign outside working hours");
            return Err(CoordError::OutOfHours {
                suggestion,
                cancelled,
            });
        }

        let taken_by_other = active
            .iter()
            .any(|a| a.slot.hour == req.slot.hour && a.requester_id != req.requester_id);
        if taken_by_other {
            let suggestion = schedule::nearest_free(
                &schedule,
                &blocked,
                req.slot.hour,
                self.settings.max_alternative_offset,
            )
            .map(|hour| Slot::new(req.slot.date, hour));
            tracing::debug!(slot = %req.slot, ?suggestion, "quick-assign slot taken");
            return Err(CoordError::SlotTaken {
                suggestion,
                cancelled,
            });
        }

        let appointment = self.reserve(provider, req, Party::Provider).await?;
        Ok(QuickAssignment {
            appointment,
            superseded: cancelled,
        })
    }

    /// Hourly availability of a provider on `date`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn available_slots(
        &self,
        provider: UserId,
        date: NaiveDate,
    ) -> Result<Vec<SlotAvailability>, CoordError> {
        let schedule = self.schedule_for(provider).await?;
        let occupied = self.occupied_hours(provider, date, None).await?;
        Ok(schedule::availability(&schedule, &occupied))
    }

    /// First free slot of a provider within the lookahead window, today included.
    ///
    /// Today's search starts after the current hour.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn next_available(&self, provider: UserId) -> Result<Option<Slot>, CoordError> {
        let schedule = self.schedule_for(provider).await?;
        let now = self.clock.now_local();
        let today = now.date();

        for offset in 0..self.settings.lookahead_days {
            let Some(date) = today.checked_add_days(Days::new(u64::from(offset))) else {
                break;
            };
            let from_hour = if offset == 0 {
                let next_hour = now.hour() + 1;
                if next_hour > 23 {
                    continue;
                }
                schedule
                    .start_hour()
                    .max(u8::try_from(next_hour).unwrap_or(u8::MAX))
            } else {
                schedule.start_hour()
            };
            let occupied = self.occupied_hours(provider, date, None).await?;
            if let Some(hour) = schedule::first_free_from(&schedule, &occupied, from_hour) {
                return Ok(Some(Slot::new(date, hour)));
            }
        }
        Ok(None)
    }

    /// Fetch an appointment visible to `actor`.
    ///
    /// # Errors
    ///
    /// `NotFound` if missing, `NotAuthorized` if `actor` is not a party.
    pub async fn get(&self, id: AppointmentId, actor: UserId) -> Result<Appointment, CoordError> {
        let appointment = self.load(id).await?;
        if appointment.party_of(actor).is_none() {
            return Err(CoordError::NotAuthorized { actor, action: "view" });
        }
        Ok(appointment)
    }

    /// All appointments in which `user` is a party.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn appointments_for(&self, user: UserId) -> Result<Vec<Appointment>, CoordError> {
        Ok(self.store.list_for_user(user).await?)
    }

    fn validate_new(&self, req: &AppointmentRequest) -> Result<(), CoordError> {
        if req.requester_id == req.provider_id {
            return Err(CoordError::Conflict(ConflictKind::SelfBooking));
        }
        if req.slot.is_past(self.clock.now_local()) {
            return Err(CoordError::Conflict(ConflictKind::PastSlot { slot: req.slot }));
        }
        Ok(())
    }

    async fn reserve(
        &self,
        actor: UserId,
        req: AppointmentRequest,
        proposed_by: Party,
    ) -> Result<Appointment, CoordError> {
        let new = NewAppointment {
            resource_id: req.resource_id,
            requester_id: req.requester_id,
            provider_id: req.provider_id,
            slot: req.slot,
            proposed_by,
            notes: req.notes,
            created_at: self.clock.now_utc(),
        };
        match self.store.reserve(new).await? {
            ClaimOutcome::Won(appointment) => {
                tracing::info!(
                    appointment = appointment.id,
                    provider = %appointment.provider_id,
                    slot = %appointment.slot,
                    "appointment created"
                );
                self.record_audit(appointment.id, actor, "create", None, appointment.status);
                self.emit(AppointmentEventKind::Created, &appointment, actor).await;
                Ok(appointment)
            }
            ClaimOutcome::Held(holder) => {
                let kind = if holder.provider_id == req.provider_id && holder.slot == req.slot {
                    ConflictKind::SlotOccupied {
                        slot: req.slot,
                        holder: Some(holder.id),
                    }
                } else {
                    ConflictKind::RequesterBusy { slot: req.slot }
                };
                tracing::debug!(slot = %req.slot, holder = holder.id, "slot reservation lost");
                Err(CoordError::Conflict(kind))
            }
        }
    }

    async fn apply(
        &self,
        id: AppointmentId,
        actor: UserId,
        action: Action,
        reason: Option<String>,
    ) -> Result<Appointment, CoordError> {
        let current = self.load(id).await?;
        Self::authorize(&current, actor, action)?;
        let next = Self::next_status(&current, action)?;
        let change = StatusChange {
            from: current.status,
            to: next,
            cancellation_reason: reason,
            at: self.clock.now_utc(),
        };
        let updated = Self::settle(id, action, self.store.change_status(id, change).await?)?;
        tracing::info!(
            appointment = id,
            %actor,
            from = %current.status,
            to = %updated.status,
            "appointment {}",
            action.as_str()
        );
        self.record_audit(id, actor, action.as_str(), Some(current.status), updated.status);
        self.emit(AppointmentEventKind::for_action(action), &updated, actor)
            .await;
        Ok(updated)
    }

    fn settle(id: AppointmentId, action: Action, outcome: UpdateOutcome) -> Result<Appointment, CoordError> {
        match outcome {
            UpdateOutcome::Updated(appointment) => Ok(appointment),
            UpdateOutcome::StatusMismatch(status) => Err(CoordError::InvalidState {
                id,
                status: status.to_string(),
                action: action.as_str(),
            }),
            UpdateOutcome::Conflict(kind) => Err(CoordError::Conflict(kind)),
            UpdateOutcome::NotFound => Err(CoordError::NotFound(format!("appointment {id}"))),
        }
    }

    fn authorize(appointment: &Appointment, actor: UserId, action: Action) -> Result<(), CoordError> {
        let party = appointment.party_of(actor);
        let role_ok = match (action.required_party(), party) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(required), Some(actual)) => required == actual,
        };
        let proposer_ok = action
            .required_proposer()
            .is_none_or(|proposer| proposer == appointment.proposed_by);
        if !proposer_ok {
            tracing::debug!(
                appointment = appointment.id,
                %actor,
                proposed_by = appointment.proposed_by.as_str(),
                "{} refused: proposer cannot agree to its own proposal",
                action.as_str()
            );
        }
        if role_ok && proposer_ok {
            Ok(())
        } else {
            Err(CoordError::NotAuthorized {
                actor,
                action: action.as_str(),
            })
        }
    }

    fn next_status(appointment: &Appointment, action: Action) -> Result<AppointmentStatus, CoordError> {
        action
            .next_status(appointment.status)
            .ok_or_else(|| CoordError::InvalidState {
                id: appointment.id,
                status: appointment.status.to_string(),
                action: action.as_str(),
            })
    }

    async fn load(&self, id: AppointmentId) -> Result<Appointment, CoordError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CoordError::NotFound(format!("appointment {id}")))
    }

    async fn schedule_for(&self, provider: UserId) -> Result<WorkSchedule, CoordError> {
        Ok(self
            .schedules
            .work_schedule(provider)
            .await?
            .unwrap_or(self.settings.default_schedule))
    }

    /// `occupied` plus, when `date` is today, every hour that has already started.
    fn without_started_hours(&self, date: NaiveDate, mut occupied: HashSet<u8>) -> HashSet<u8> {
        let now = self.clock.now_local();
        if date == now.date() {
            occupied.extend((0..24u8).filter(|hour| Slot::new(date, *hour).is_past(now)));
        }
        occupied
    }

    async fn occupied_hours(
        &self,
        provider: UserId,
        date: NaiveDate,
        except: Option<AppointmentId>,
    ) -> Result<HashSet<u8>, CoordError> {
        Ok(self
            .store
            .active_for_provider_on(provider, date)
            .await?
            .into_iter()
            .filter(|a| Some(a.id) != except)
            .map(|a| a.slot.hour)
            .collect())
    }

    fn record_audit(
        &self,
        id: AppointmentId,
        actor: UserId,
        action: &str,
        from: Option<AppointmentStatus>,
        to: AppointmentStatus,
    ) {
        if let Some(audit) = &self.audit {
            audit
                .lock()
                .record(build_audit_event(id, actor, action, from, to, None));
        }
    }

    async fn emit(&self, kind: AppointmentEventKind, appointment: &Appointment, actor: UserId) {
        let Some(events) = &self.events else {
            return;
        };
        let event = AppointmentEvent {
            kind,
            appointment: appointment.clone(),
            actor,
        };
        if let Err(err) = events.publish(event).await {
            tracing::warn!(appointment = appointment.id, ?kind, error = %err, "appointment event not delivered");
        }
    }
}
