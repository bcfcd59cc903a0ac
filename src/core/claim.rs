//! First-writer-wins ownership over shared resources.
//!
//! A claim is a nullable owner field plus one rule: it is written at most once,
//! by a single conditional update (`owner := claimant WHERE owner IS NULL`).
//! Only an administrative override may change it afterwards. Appointment slot
//! reservation follows the same discipline: [`ClaimOutcome`] is also what
//! [`crate::core::AppointmentStore::reserve`] returns.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::{ConflictKind, CoordError, StoreError};
use crate::util::serde::{ResourceId, UserId};

/// Result of a single conditional write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome<O> {
    /// The write applied; the caller now owns the resource.
    Won(O),
    /// Someone already owned it; carries the current owner.
    Held(O),
}

impl<O> ClaimOutcome<O> {
    /// Whether this caller's write applied.
    pub const fn is_won(&self) -> bool {
        matches!(self, Self::Won(_))
    }

    /// The owner after the attempt, whoever it is.
    pub fn into_owner(self) -> O {
        match self {
            Self::Won(o) | Self::Held(o) => o,
        }
    }
}

/// Store seam for claimable resources.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Set the owner to `claimant` only if it is currently unset.
    ///
    /// Must be a single atomic conditional write; never partially applies.
    async fn try_claim(
        &self,
        resource: ResourceId,
        claimant: UserId,
    ) -> Result<ClaimOutcome<UserId>, StoreError>;

    /// Current owner, `None` when unclaimed.
    async fn owner(&self, resource: ResourceId) -> Result<Option<UserId>, StoreError>;

    /// Administrative override: replace or clear the owner unconditionally.
    async fn override_owner(
        &self,
        resource: ResourceId,
        owner: Option<UserId>,
    ) -> Result<(), StoreError>;
}

/// Follow-up work run once after a winning claim.
#[async_trait]
pub trait ClaimCascade: Send + Sync {
    /// Called with the resource and its new owner.
    async fn on_claimed(&self, resource: ResourceId, owner: UserId) -> Result<(), CoordError>;
}

/// Ownership report returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Claimed resource.
    pub resource_id: ResourceId,
    /// Current owner.
    pub owner: UserId,
    /// `true` if this call made the claimant the owner, `false` if it already was.
    pub newly_claimed: bool,
}

/// Claim service over a [`ClaimStore`].
pub struct Claims {
    store: Arc<dyn ClaimStore>,
    cascade: Option<Arc<dyn ClaimCascade>>,
}

impl Claims {
    /// Create a claim service over `store`.
    pub fn new(store: Arc<dyn ClaimStore>) -> Self {
        Self {
            store,
            cascade: None,
        }
    }

    /// Attach a cascade run after each winning claim.
    #[must_use]
    pub fn with_cascade(mut self, cascade: Arc<dyn ClaimCascade>) -> Self {
        self.cascade = Some(cascade);
        self
    }

    /// Try to become the owner of `resource`.
    ///
    /// Repeating a successful claim reports the existing ownership without error.
    ///
    /// # Errors
    ///
    /// `Conflict(AlreadyClaimed)` if another user owns the resource;
    /// `StoreUnavailable` if the store fails (claims fail closed).
    pub async fn try_claim(&self, resource: ResourceId, claimant: UserId) -> Result<Claim, CoordError> {
        match self.store.try_claim(resource, claimant).await? {
            ClaimOutcome::Won(owner) => {
                tracing::info!(%resource, %owner, "resource claimed");
                if let Some(cascade) = &self.cascade {
                    if let Err(err) = cascade.on_claimed(resource, owner).await {
                        tracing::warn!(%resource, %owner, error = %err, "claim cascade failed");
                    }
                }
                Ok(Claim {
                    resource_id: resource,
                    owner,
                    newly_claimed: true,
                })
            }
            ClaimOutcome::Held(owner) if owner == claimant => Ok(Claim {
                resource_id: resource,
                owner,
                newly_claimed: false,
            }),
            ClaimOutcome::Held(owner) => {
                tracing::debug!(%resource, %owner, %claimant, "claim lost");
                Err(CoordError::Conflict(ConflictKind::AlreadyClaimed { owner }))
            }
        }
    }

    /// Current owner of `resource`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the store fails.
    pub async fn owner(&self, resource: ResourceId) -> Result<Option<UserId>, CoordError> {
        Ok(self.store.owner(resource).await?)
    }

    /// Administrative override of the owner.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the store fails.
    pub async fn override_owner(
        &self,
        resource: ResourceId,
        owner: Option<UserId>,
    ) -> Result<(), CoordError> {
        self.store.override_owner(resource, owner).await?;
        tracing::warn!(%resource, ?owner, "claim overridden");
        Ok(())
    }
}
