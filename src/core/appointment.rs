//! Appointment records and the status state machine.
//!
//! ```text
//!            confirm / accept             complete
//!  pending ───────────────────▶ confirmed ─────────▶ completed
//!     │  ▲                          │
//!     │  └──────── reschedule ──────┘
//!     │                             │
//!     └──────── cancel ─────────────┴──────────────▶ cancelled
//! ```
//!
//! `cancelled` and `completed` are terminal; nothing leaves them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::ConflictKind;
use crate::util::serde::{AppointmentId, ResourceId, Slot, UserId};

/// Lifecycle status of an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    /// Proposed, awaiting the counterpart.
    Pending,
    /// Agreed by both parties.
    Confirmed,
    /// Withdrawn by either party or superseded.
    Cancelled,
    /// Took place.
    Completed,
}

impl AppointmentStatus {
    /// Whether the appointment occupies its slot.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    /// Stable lowercase name, as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown appointment status `{other}`")),
        }
    }
}

/// Side of an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// The user asking for the service.
    Requester,
    /// The user providing the service and owning the calendar.
    Provider,
}

impl Party {
    /// Stable lowercase name, as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Provider => "provider",
        }
    }
}

impl FromStr for Party {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requester" => Ok(Self::Requester),
            "provider" => Ok(Self::Provider),
            other => Err(format!("unknown party `{other}`")),
        }
    }
}

/// One proposed or agreed meeting over a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    /// Immutable identifier.
    pub id: AppointmentId,
    /// Listing the meeting is about.
    pub resource_id: ResourceId,
    /// User asking for the meeting.
    pub requester_id: UserId,
    /// User whose calendar the slot belongs to.
    pub provider_id: UserId,
    /// Provider-local day and hour.
    pub slot: Slot,
    /// Current status.
    pub status: AppointmentStatus,
    /// Which side proposed it.
    pub proposed_by: Party,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Reason given on cancellation.
    pub cancellation_reason: Option<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// Which side `user` is on, if any.
    #[must_use]
    pub fn party_of(&self, user: UserId) -> Option<Party> {
        if user == self.provider_id {
            Some(Party::Provider)
        } else if user == self.requester_id {
            Some(Party::Requester)
        } else {
            None
        }
    }

    /// The other participant relative to `user`.
    #[must_use]
    pub fn counterpart_of(&self, user: UserId) -> UserId {
        if user == self.provider_id {
            self.requester_id
        } else {
            self.provider_id
        }
    }
}

/// Insert request for a new pending appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    /// Listing the meeting is about.
    pub resource_id: ResourceId,
    /// User asking for the meeting.
    pub requester_id: UserId,
    /// User whose calendar the slot belongs to.
    pub provider_id: UserId,
    /// Slot to reserve.
    pub slot: Slot,
    /// Which side is proposing.
    pub proposed_by: Party,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

/// Conditional status change applied by the store only if the current status is `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Status the caller observed.
    pub from: AppointmentStatus,
    /// Status to move to.
    pub to: AppointmentStatus,
    /// Stored when moving to cancelled.
    pub cancellation_reason: Option<String>,
    /// Mutation instant.
    pub at: DateTime<Utc>,
}

/// Conditional move to another slot, applied only if the status is still `from`
/// and the target slot is free (ignoring the appointment itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMove {
    /// Status the caller observed.
    pub from: AppointmentStatus,
    /// Status after the move.
    pub to: AppointmentStatus,
    /// Target slot.
    pub slot: Slot,
    /// Replacement notes; `None` keeps the existing ones.
    pub notes: Option<String>,
    /// Party proposing the new slot; the counterpart has to agree to it.
    pub proposed_by: Party,
    /// Mutation instant.
    pub at: DateTime<Utc>,
}

/// Result of a conditional appointment update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update applied.
    Updated(Appointment),
    /// The status changed underneath the caller.
    StatusMismatch(AppointmentStatus),
    /// A uniqueness rule refused the update.
    Conflict(ConflictKind),
    /// No appointment with that id.
    NotFound,
}

/// Actions that move an appointment through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Provider agrees to a requester's proposal.
    Confirm,
    /// Requester agrees to a provider's proposal.
    Accept,
    /// Either party withdraws.
    Cancel,
    /// Provider marks the meeting as held.
    Complete,
    /// Either party moves the meeting to another slot.
    Reschedule,
}

impl Action {
    /// Verb used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Accept => "accept",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
            Self::Reschedule => "reschedule",
        }
    }

    /// Party allowed to perform the action; `None` means either party.
    #[must_use]
    pub const fn required_party(self) -> Option<Party> {
        match self {
            Self::Confirm | Self::Complete => Some(Party::Provider),
            Self::Accept => Some(Party::Requester),
            Self::Cancel | Self::Reschedule => None,
        }
    }

    /// Party whose proposal the action agrees to.
    ///
    /// A proposer never agrees to its own proposal: the provider confirms what
    /// the requester proposed and the requester accepts what the provider proposed.
    #[must_use]
    pub const fn required_proposer(self) -> Option<Party> {
        match self {
            Self::Confirm => Some(Party::Requester),
            Self::Accept => Some(Party::Provider),
            Self::Cancel | Self::Complete | Self::Reschedule => None,
        }
    }

    /// Status reached by applying the action from `current`, or `None` if illegal.
    #[must_use]
    pub const fn next_status(self, current: AppointmentStatus) -> Option<AppointmentStatus> {
        use AppointmentStatus::{Cancelled, Completed, Confirmed, Pending};
        match (self, current) {
            (Self::Confirm | Self::Accept, Pending) => Some(Confirmed),
            (Self::Cancel, Pending | Confirmed) => Some(Cancelled),
            (Self::Complete, Confirmed) => Some(Completed),
            (Self::Reschedule, Pending | Confirmed) => Some(Pending),
            _ => None,
        }
    }
}
