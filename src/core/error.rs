//! Error types for coordination operations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::serde::{AppointmentId, Slot, UserId};

/// Failures reported by store adapters.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, pool exhausted, timeout).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with an error.
    #[error("backend error: {0}")]
    Backend(String),
    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Why a conditional write lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConflictKind {
    /// The provider already has an active appointment in the slot.
    SlotOccupied {
        /// Slot that was contested.
        slot: Slot,
        /// Appointment currently holding it, when known.
        holder: Option<AppointmentId>,
    },
    /// The requester already holds an active appointment in the slot.
    RequesterBusy {
        /// Slot that was contested.
        slot: Slot,
    },
    /// Requester and provider are the same user.
    SelfBooking,
    /// The slot has already started.
    PastSlot {
        /// Slot that was requested.
        slot: Slot,
    },
    /// A confirmed appointment already exists for the resource, requester and provider.
    ConfirmedExists {
        /// The confirmed appointment.
        existing: AppointmentId,
    },
    /// The resource is owned by someone else.
    AlreadyClaimed {
        /// Current owner.
        owner: UserId,
    },
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlotOccupied { slot, .. } => write!(f, "slot {slot} is already booked"),
            Self::RequesterBusy { slot } => {
                write!(f, "requester already has an appointment at {slot}")
            }
            Self::SelfBooking => f.write_str("requester and provider must differ"),
            Self::PastSlot { slot } => write!(f, "slot {slot} is in the past"),
            Self::ConfirmedExists { existing } => {
                write!(f, "appointment {existing} is already confirmed")
            }
            Self::AlreadyClaimed { owner } => write!(f, "already claimed by {owner}"),
        }
    }
}

/// Which quota ceiling refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindowKind {
    /// Trailing 60 second window.
    Minute,
    /// UTC calendar day.
    Day,
}

impl fmt::Display for QuotaWindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Minute => "per-minute",
            Self::Day => "per-day",
        })
    }
}

/// Errors produced by the coordination core.
#[derive(Debug, Clone, Error)]
pub enum CoordError {
    /// A slot or claim is already taken. Never retried by the core.
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    /// The transition is not legal from the current status.
    #[error("cannot {action} appointment {id} while {status}")]
    InvalidState {
        /// Appointment identifier.
        id: AppointmentId,
        /// Status observed at the time of the attempt.
        status: String,
        /// Attempted action.
        action: &'static str,
    },
    /// The actor is not a legitimate party for the action.
    #[error("user {actor} may not {action}")]
    NotAuthorized {
        /// Acting user.
        actor: UserId,
        /// Attempted action.
        action: &'static str,
    },
    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Requested hour lies outside the provider's work window.
    #[error("requested time is outside working hours")]
    OutOfHours {
        /// First free hour inside the window, if any.
        suggestion: Option<Slot>,
        /// Pending appointments superseded before the check.
        cancelled: Vec<AppointmentId>,
    },
    /// Requested slot is held by another requester.
    #[error("requested slot is taken")]
    SlotTaken {
        /// Nearest free hour, if any.
        suggestion: Option<Slot>,
        /// Pending appointments superseded before the check.
        cancelled: Vec<AppointmentId>,
    },
    /// A call ceiling for a metered dependency has been reached.
    #[error("{window} quota exceeded for {dependency}")]
    QuotaExceeded {
        /// Dependency name.
        dependency: String,
        /// Ceiling that refused the call.
        window: QuotaWindowKind,
    },
    /// The shared store could not be used; claims and appointments fail closed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// A stored record could not be decoded; retrying will not help.
    #[error("store data corrupt: {0}")]
    StoreCorrupt(String),
    /// Invalid configuration.
    #[error("config invalid: {0}")]
    Config(String),
}

impl From<StoreError> for CoordError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt(detail) => Self::StoreCorrupt(detail),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl CoordError {
    /// Whether the failure is transient and worth retrying later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. } | Self::StoreUnavailable(_))
    }

    /// Suggested alternative slot carried by `OutOfHours` / `SlotTaken`.
    #[must_use]
    pub const fn suggestion(&self) -> Option<Slot> {
        match self {
            Self::OutOfHours { suggestion, .. } | Self::SlotTaken { suggestion, .. } => {
                *suggestion
            }
            _ => None,
        }
    }

    /// Appointment ids cancelled as a side effect before the error was raised.
    #[must_use]
    pub fn cancelled(&self) -> &[AppointmentId] {
        match self {
            Self::OutOfHours { cancelled, .. } | Self::SlotTaken { cancelled, .. } => cancelled,
            _ => &[],
        }
    }

    /// Message suitable for showing to the acting user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::OutOfHours { suggestion, .. } => match suggestion {
                Some(slot) => format!("outside working hours, try {slot} instead"),
                None => "outside working hours and no free hour that day".to_string(),
            },
            Self::SlotTaken { suggestion, .. } => match suggestion {
                Some(slot) => format!("slot taken, try {slot} instead"),
                None => "slot taken and no nearby hour is free".to_string(),
            },
            Self::QuotaExceeded { .. } | Self::StoreUnavailable(_) => {
                "service temporarily unavailable, please retry later".to_string()
            }
            Self::StoreCorrupt(_) => "stored data could not be read".to_string(),
            Self::Conflict(kind) => kind.to_string(),
            other => other.to_string(),
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
