//! API-facing request/response models and the [`Coordinator`] facade.
//!
//! An HTTP layer maps its routes one-to-one onto the `Coordinator` methods and
//! turns [`CoordError`] into [`ErrorResponse`].

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    Appointment, AppointmentEngine, AppointmentRequest, CallLimiter, Claim, Claims, CoordError,
    DeliveryReport, Dispatcher, Message, NewMessage, PacingPermit, QuickAssignment, QuotaUsage,
    SlotAvailability, Spawn, StoreError,
};
use crate::util::serde::{AppointmentId, MessageId, ResourceId, Slot, UserId};

/// Reschedule payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleRequest {
    /// Target slot.
    pub slot: Slot,
    /// Replacement notes; omitted keeps the current ones.
    #[serde(default)]
    pub notes: Option<String>,
}

/// Error body returned to API callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error code.
    pub code: String,
    /// Actionable message.
    pub message: String,
    /// Whether retrying later may succeed.
    pub transient: bool,
    /// Alternative slot, when one was found.
    pub suggestion: Option<Slot>,
    /// Appointments cancelled as a side effect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancelled: Vec<AppointmentId>,
}

impl From<&CoordError> for ErrorResponse {
    fn from(err: &CoordError) -> Self {
        let code = match err {
            CoordError::Conflict(_) => "conflict",
            CoordError::InvalidState { .. } => "invalid_state",
            CoordError::NotAuthorized { .. } => "not_authorized",
            CoordError::NotFound(_) => "not_found",
            CoordError::OutOfHours { .. } => "out_of_hours",
            CoordError::SlotTaken { .. } => "slot_taken",
            CoordError::QuotaExceeded { .. } => "quota_exceeded",
            CoordError::StoreUnavailable(_) => "store_unavailable",
            CoordError::StoreCorrupt(_) => "store_corrupt",
            CoordError::Config(_) => "config",
        };
        Self {
            code: code.to_string(),
            message: err.user_message(),
            transient: err.is_transient(),
            suggestion: err.suggestion(),
            cancelled: err.cancelled().to_vec(),
        }
    }
}

/// Status of one backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Whether the store answered.
    pub ok: bool,
    /// Failure description.
    pub error: Option<String>,
}

impl From<Result<(), StoreError>> for ComponentHealth {
    fn from(result: Result<(), StoreError>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(err) => Self {
                ok: false,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag: appointments must answer. The limiter fails open, so it
    /// degrades the report without failing it.
    pub ok: bool,
    /// Appointment store.
    pub appointments: ComponentHealth,
    /// Limiter store.
    pub limiter: ComponentHealth,
}

/// Single entry point over the appointment engine, claims, limiter and dispatcher.
pub struct Coordinator<S> {
    engine: AppointmentEngine,
    claims: Claims,
    limiter: CallLimiter,
    dispatcher: Arc<Dispatcher<S>>,
}

impl<S> Coordinator<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Assemble a coordinator from wired parts.
    pub const fn new(
        engine: AppointmentEngine,
        claims: Claims,
        limiter: CallLimiter,
        dispatcher: Arc<Dispatcher<S>>,
    ) -> Self {
        Self {
            engine,
            claims,
            limiter,
            dispatcher,
        }
    }

    /// Appointment engine.
    pub const fn engine(&self) -> &AppointmentEngine {
        &self.engine
    }

    /// Call limiter.
    pub const fn limiter(&self) -> &CallLimiter {
        &self.limiter
    }

    /// Message dispatcher.
    pub const fn dispatcher(&self) -> &Arc<Dispatcher<S>> {
        &self.dispatcher
    }

    /// Propose a new appointment.
    ///
    /// # Errors
    ///
    /// See [`AppointmentEngine::create`].
    pub async fn create_appointment(
        &self,
        actor: UserId,
        req: AppointmentRequest,
    ) -> Result<Appointment, CoordError> {
        self.engine.create(actor, req).await
    }

    /// Provider confirms.
    ///
    /// # Errors
    ///
    /// See [`AppointmentEngine::confirm`].
    pub async fn confirm_appointment(&self, id: AppointmentId, actor: UserId) -> Result<Appointment, CoordError> {
        self.engine.confirm(id, actor).await
    }

    /// Requester accepts.
    ///
    /// # Errors
    ///
    /// See [`AppointmentEngine::accept`].
    pub async fn accept_appointment(&self, id: AppointmentId, actor: UserId) -> Result<Appointment, CoordError> {
        self.engine.accept(id, actor).await
    }

    /// Either party cancels.
    ///
    /// # Errors
    ///
    /// See [`AppointmentEngine::cancel`].
    pub async fn cancel_appointment(
        &self,
        id: AppointmentId,
        actor: UserId,
        reason: Option<String>,
    ) -> Result<Appointment, CoordError> {
        self.engine.cancel(id, actor, reason).await
    }

    /// Provider completes.
    ///
    /// # Errors
    ///
    /// See [`AppointmentEngine::complete`].
    pub async fn complete_appointment(&self, id: AppointmentId, actor: UserId) -> Result<Appointment, CoordError> {
        self.engine.complete(id, actor).await
    }

    /// Move to another slot.
    ///
    /// # Errors
    ///
    /// See [`AppointmentEngine::reschedule`].
    pub async fn reschedule_appointment(
        &self,
        id: AppointmentId,
        actor: UserId,
        req: RescheduleRequest,
    ) -> Result<Appointment, CoordError> {
        self.engine.reschedule(id, actor, req.slot, req.notes).await
    }

    /// Provider proposes a slot, superseding pending proposals of the triple.
    ///
    /// # Errors
    ///
    /// See [`AppointmentEngine::quick_assign`].
    pub async fn quick_assign(
        &self,
        provider: UserId,
        req: AppointmentRequest,
    ) -> Result<QuickAssignment, CoordError> {
        self.engine.quick_assign(provider, req).await
    }

    /// First free slot of `provider`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn next_available_slot(&self, provider: UserId) -> Result<Option<Slot>, CoordError> {
        self.engine.next_available(provider).await
    }

    /// Hourly availability of `provider` on `date`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn available_slots(
        &self,
        provider: UserId,
        date: NaiveDate,
    ) -> Result<Vec<SlotAvailability>, CoordError> {
        self.engine.available_slots(provider, date).await
    }

    /// One appointment, visible to its parties.
    ///
    /// # Errors
    ///
    /// `NotFound` or `NotAuthorized`.
    pub async fn get_appointment(&self, id: AppointmentId, actor: UserId) -> Result<Appointment, CoordError> {
        self.engine.get(id, actor).await
    }

    /// Appointments in which `user` is a party.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn appointments_for(&self, user: UserId) -> Result<Vec<Appointment>, CoordError> {
        self.engine.appointments_for(user).await
    }

    /// Claim `resource` for `claimant`.
    ///
    /// # Errors
    ///
    /// See [`Claims::try_claim`].
    pub async fn try_claim(&self, resource: ResourceId, claimant: UserId) -> Result<Claim, CoordError> {
        self.claims.try_claim(resource, claimant).await
    }

    /// Current owner of `resource`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn claim_owner(&self, resource: ResourceId) -> Result<Option<UserId>, CoordError> {
        self.claims.owner(resource).await
    }

    /// Administrative override of a claim.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn override_claim(&self, resource: ResourceId, owner: Option<UserId>) -> Result<(), CoordError> {
        self.claims.override_owner(resource, owner).await
    }

    /// Refuse if a quota ceiling of `dependency` is reached.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` or `NotFound`.
    pub async fn check_quota(&self, dependency: &str) -> Result<(), CoordError> {
        self.limiter.check_quota(dependency).await
    }

    /// Count one call against `dependency`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown dependencies.
    pub async fn record_call(&self, dependency: &str) -> Result<(), CoordError> {
        self.limiter.record_call(dependency).await
    }

    /// Wait for the pacing token of `dependency`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown dependencies.
    pub async fn acquire_pacing_slot(&self, dependency: &str) -> Result<PacingPermit, CoordError> {
        self.limiter.acquire_pacing_slot(dependency).await
    }

    /// Quota check, pacing and accounting in one step.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` or `NotFound`.
    pub async fn admit(&self, dependency: &str) -> Result<PacingPermit, CoordError> {
        self.limiter.admit(dependency).await
    }

    /// Quota usage of `dependency`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown dependencies.
    pub async fn quota_usage(&self, dependency: &str) -> Result<QuotaUsage, CoordError> {
        self.limiter.usage(dependency).await
    }

    /// Persist and fan out a message.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` when the message could not be persisted.
    pub async fn deliver_message(&self, message: NewMessage) -> Result<DeliveryReport, CoordError> {
        self.dispatcher.deliver(message).await
    }

    /// Visible messages of a conversation.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<Vec<Message>, CoordError> {
        self.dispatcher.conversation(user, other, resource).await
    }

    /// Mark messages from `other` as read by `reader`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn mark_read(
        &self,
        reader: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<u64, CoordError> {
        self.dispatcher.mark_read(reader, other, resource).await
    }

    /// Soft-delete a message authored by `actor`.
    ///
    /// # Errors
    ///
    /// `NotFound` when there is nothing to delete.
    pub async fn delete_message(&self, id: MessageId, actor: UserId) -> Result<(), CoordError> {
        self.dispatcher.delete_message(id, actor).await
    }

    /// Hide a conversation for `user`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn hide_conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), CoordError> {
        self.dispatcher.hide_conversation(user, other, resource).await
    }

    /// Mute pushes from `other`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn mute(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), CoordError> {
        self.dispatcher.mute(user, other, resource, until).await
    }

    /// Remove a mute rule.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn unmute(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), CoordError> {
        self.dispatcher.unmute(user, other, resource).await
    }

    /// Register a push token.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn register_device(&self, user: UserId, token: &str) -> Result<(), CoordError> {
        self.dispatcher.register_device(user, token).await
    }

    /// Ping the appointment and limiter stores.
    pub async fn health(&self) -> Health {
        let appointments = ComponentHealth::from(self.engine.ping().await);
        let limiter = ComponentHealth::from(self.limiter.ping().await);
        if !limiter.ok {
            tracing::warn!(error = ?limiter.error, "limiter store unhealthy, guards fail open");
        }
        Health {
            ok: appointments.ok,
            appointments,
            limiter,
        }
    }
}
