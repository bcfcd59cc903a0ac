//! Audit sink implementations.
//!
//! Every successful appointment transition is offered to an [`AuditSink`].
//! Sinks are synchronous and infallible from the engine's point of view.

use std::collections::VecDeque;

use crate::core::appointment::AppointmentStatus;
use crate::util::clock::now_ms;
use crate::util::serde::{AppointmentId, UserId};

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Appointment the event is about.
    pub appointment_id: AppointmentId,
    /// User who caused the transition.
    pub actor: UserId,
    /// Action taken (create, confirm, accept, cancel, complete, reschedule, supersede).
    pub action: String,
    /// Status before the action, `None` on creation.
    pub from_status: Option<AppointmentStatus>,
    /// Status after the action.
    pub to_status: AppointmentStatus,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub payload: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Sink that writes each event to the `slotkeeper::audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&mut self, event: AuditEvent) {
        tracing::info!(
            target: "slotkeeper::audit",
            event_id = %event.event_id,
            appointment = event.appointment_id,
            actor = %event.actor,
            action = %event.action,
            from = ?event.from_status,
            to = %event.to_status,
            payload = ?event.payload,
        );
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    appointment_id: AppointmentId,
    actor: UserId,
    action: impl Into<String>,
    from_status: Option<AppointmentStatus>,
    to_status: AppointmentStatus,
    payload: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        appointment_id,
        actor,
        action: action.into(),
        from_status,
        to_status,
        created_at_ms: now_ms(),
        payload,
    }
}
