//! Coordination primitives: appointments, claims, call limits and message fan-out.

pub mod appointment;
pub mod audit;
pub mod claim;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod limiter;
pub mod schedule;
pub mod spawn;

pub use appointment::{
    Action, Appointment, AppointmentStatus, NewAppointment, Party, SlotMove, StatusChange,
    UpdateOutcome,
};
pub use audit::{build_audit_event, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use claim::{Claim, ClaimCascade, ClaimOutcome, ClaimStore, Claims};
pub use engine::{
    AppointmentEngine, AppointmentEvent, AppointmentEventKind, AppointmentRequest,
    AppointmentStore, EngineSettings, EventSink, QuickAssignment, ScheduleSource,
    SUPERSEDED_REASON,
};
pub use error::{AppResult, ConflictKind, CoordError, QuotaWindowKind, StoreError};
pub use fanout::{
    AppointmentCards, Broadcaster, CardRef, ConversationKey, DeliveryReport, DeviceToken,
    DeviceTokenStore, Dispatcher, FanoutStores, Message, MessageKind, MessageStore, MuteRule,
    MuteStore, NewMessage, PushDecision, PushGateway, PushNotification, PushStatus,
};
pub use limiter::{
    next_utc_midnight, CallLimiter, CallLimits, LimiterStore, PacingPermit, QuotaUsage,
    MINUTE_WINDOW,
};
pub use schedule::{SlotAvailability, WorkSchedule};
pub use spawn::Spawn;
