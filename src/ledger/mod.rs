//! Ledger collaborator: signed, confirmed transactions plus event queries.
//!
//! Every submitting method returns only after the transaction's receipt is
//! observed, so events it emitted are visible to the next call.

pub mod evm;
pub mod memory;

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use ethers::{signers::LocalWallet, types::Address};
use serde::{Deserialize, Serialize};

use crate::{
    calldata::Calldata, error::LedgerError, toolchain::VerifierContract,
    utils::EncryptedCoordinates,
};

pub use evm::EvmLedger;
pub use memory::MemoryLedger;

/// Ledger-assigned contribution identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContributionId(pub u64);

impl fmt::Display for ContributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContributionStatus {
    Created,
    Assigned,
    CoordinatesUpdated,
    Reviewed,
    VerifierLinked,
    Verified,
}

impl fmt::Display for ContributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// On-chain review outcome, stored as `uint8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReviewResult {
    Rejected = 0,
    Approved = 1,
    Inconclusive = 2,
}

impl TryFrom<u8> for ReviewResult {
    type Error = LedgerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Rejected),
            1 => Ok(Self::Approved),
            2 => Ok(Self::Inconclusive),
            other => Err(LedgerError::Decode(format!("review result {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub id: ContributionId,
    pub participant: Address,
    pub image_url: String,
    pub reviewer: Option<Address>,
    pub coordinates: Option<EncryptedCoordinates>,
    pub review: Option<ReviewResult>,
    pub verifier: Option<Address>,
    pub status: ContributionStatus,
}

/// A contribution's link to its deployed verifier, as read from `VerifierUpdated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierBinding {
    pub contribution_id: ContributionId,
    pub participant: Address,
    pub reviewer: Address,
    pub image_url: String,
    pub verifier: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ContributionCreated,
    ContributionAssigned,
    CoordinateUpdated,
    ContributionReviewed,
    VerifierUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::ContributionCreated,
        EventKind::ContributionAssigned,
        EventKind::CoordinateUpdated,
        EventKind::ContributionReviewed,
        EventKind::VerifierUpdated,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    ContributionCreated {
        participant: Address,
        image_url: String,
        id: ContributionId,
    },
    ContributionAssigned {
        id: ContributionId,
        participant: Address,
        image_url: String,
        reviewer: Address,
    },
    CoordinateUpdated {
        id: ContributionId,
        participant: Address,
        coordinates: EncryptedCoordinates,
    },
    ContributionReviewed {
        id: ContributionId,
        participant: Address,
        reviewer: Address,
        image_url: String,
        result: ReviewResult,
    },
    VerifierUpdated {
        id: ContributionId,
        participant: Address,
        reviewer: Address,
        image_url: String,
        verifier: Address,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ContributionCreated { .. } => EventKind::ContributionCreated,
            Self::ContributionAssigned { .. } => EventKind::ContributionAssigned,
            Self::CoordinateUpdated { .. } => EventKind::CoordinateUpdated,
            Self::ContributionReviewed { .. } => EventKind::ContributionReviewed,
            Self::VerifierUpdated { .. } => EventKind::VerifierUpdated,
        }
    }

    pub fn contribution_id(&self) -> ContributionId {
        match self {
            Self::ContributionCreated { id, .. }
            | Self::ContributionAssigned { id, .. }
            | Self::CoordinateUpdated { id, .. }
            | Self::ContributionReviewed { id, .. }
            | Self::VerifierUpdated { id, .. } => *id,
        }
    }

    pub fn binding(&self) -> Option<VerifierBinding> {
        match self {
            Self::VerifierUpdated {
                id,
                participant,
                reviewer,
                image_url,
                verifier,
            } => Some(VerifierBinding {
                contribution_id: *id,
                participant: *participant,
                reviewer: *reviewer,
                image_url: image_url.clone(),
                verifier: *verifier,
            }),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_contribution(
        &self,
        participant: &LocalWallet,
        image_url: &str,
    ) -> Result<ContributionId, LedgerError>;

    /// Assign the next unassigned contribution to `reviewer`.
    async fn assign_contribution(&self, reviewer: &LocalWallet) -> Result<ContributionId, LedgerError>;

    async fn update_coordinates(
        &self,
        participant: &LocalWallet,
        id: ContributionId,
        coordinates: &EncryptedCoordinates,
    ) -> Result<(), LedgerError>;

    async fn review_contribution(
        &self,
        reviewer: &LocalWallet,
        id: ContributionId,
        result: ReviewResult,
    ) -> Result<(), LedgerError>;

    /// Bind `verifier` to the contribution. Only its participant may do this, once.
    async fn update_verifier(
        &self,
        participant: &LocalWallet,
        id: ContributionId,
        verifier: Address,
    ) -> Result<(), LedgerError>;

    async fn deploy_verifier(
        &self,
        deployer: &LocalWallet,
        contract: &VerifierContract,
    ) -> Result<Address, LedgerError>;

    /// Call `verifyProof` on a deployed verifier.
    async fn verify_proof(
        &self,
        caller: &LocalWallet,
        verifier: Address,
        calldata: &Calldata,
    ) -> Result<bool, LedgerError>;

    /// All events of one kind, in emission order.
    async fn events(&self, kind: EventKind) -> Result<Vec<LedgerEvent>, LedgerError>;
}

/// Every event the ledger emitted, ordered by contribution then kind order.
pub async fn all_events(ledger: &dyn Ledger) -> Result<Vec<LedgerEvent>, LedgerError> {
    let mut events = Vec::new();
    for kind in EventKind::ALL {
        events.extend(ledger.events(kind).await?);
    }
    Ok(events)
}

/// Fold events into contribution records with their lifecycle status.
///
/// Events may arrive grouped by kind; they are applied in lifecycle order so
/// the result does not depend on query order. Events for ids never created
/// are ignored.
pub fn replay_contributions(events: &[LedgerEvent]) -> BTreeMap<ContributionId, Contribution> {
    let mut sorted: Vec<&LedgerEvent> = events.iter().collect();
    sorted.sort_by_key(|event| {
        let stage = EventKind::ALL
            .iter()
            .position(|kind| *kind == event.kind())
            .unwrap_or(EventKind::ALL.len());
        (event.contribution_id(), stage)
    });

    let mut contributions = BTreeMap::new();
    for event in sorted {
        match event {
            LedgerEvent::ContributionCreated {
                participant,
                image_url,
                id,
            } => {
                contributions.insert(
                    *id,
                    Contribution {
                        id: *id,
                        participant: *participant,
                        image_url: image_url.clone(),
                        reviewer: None,
                        coordinates: None,
                        review: None,
                        verifier: None,
                        status: ContributionStatus::Created,
                    },
                );
            }
            LedgerEvent::ContributionAssigned { id, reviewer, .. } => {
                if let Some(c) = contributions.get_mut(id) {
                    c.reviewer = Some(*reviewer);
                    c.status = ContributionStatus::Assigned;
                }
            }
            LedgerEvent::CoordinateUpdated { id, coordinates, .. } => {
                if let Some(c) = contributions.get_mut(id) {
                    c.coordinates = Some(coordinates.clone());
                    c.status = c.status.max(ContributionStatus::CoordinatesUpdated);
                }
            }
            LedgerEvent::ContributionReviewed { id, result, .. } => {
                if let Some(c) = contributions.get_mut(id) {
                    c.review = Some(*result);
                    c.status = c.status.max(ContributionStatus::Reviewed);
                }
            }
            LedgerEvent::VerifierUpdated { id, verifier, .. } => {
                if let Some(c) = contributions.get_mut(id) {
                    c.verifier = Some(*verifier);
                    c.status = c.status.max(ContributionStatus::VerifierLinked);
                }
            }
        }
    }
    contributions
}

/// `ContributionReviewed` events with the given result.
pub fn reviewed_with(events: &[LedgerEvent], wanted: ReviewResult) -> Vec<LedgerEvent> {
    events
        .iter()
        .filter(|event| {
            matches!(event, LedgerEvent::ContributionReviewed { result, .. } if *result == wanted)
        })
        .cloned()
        .collect()
}
