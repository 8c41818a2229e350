//! In-process ledger with the platform contract's rules.
//!
//! Transactions apply atomically and are "confirmed" when the call returns.
//! Deployed verifiers check proofs the way [`crate::toolchain::SimulatedToolchain`]
//! produces them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use ethers::{
    signers::{LocalWallet, Signer},
    types::{Address, U256},
    utils::get_contract_address,
};
use tracing::{debug, info};

use super::{
    Contribution, ContributionId, ContributionStatus, EventKind, Ledger, LedgerEvent, ReviewResult,
};
use crate::{
    calldata::Calldata,
    circuits::CircuitId,
    error::LedgerError,
    toolchain::{
        simulated::{simulated_bytecode, simulated_proof},
        VerifierContract,
    },
    utils::EncryptedCoordinates,
};

#[derive(Debug, Clone)]
struct DeployedVerifier {
    circuit_id: CircuitId,
    key_digest: [u8; 32],
}

#[derive(Debug, Default)]
struct ChainState {
    next_id: u64,
    contributions: BTreeMap<ContributionId, Contribution>,
    events: Vec<LedgerEvent>,
    verifiers: HashMap<Address, DeployedVerifier>,
    nonces: HashMap<Address, u64>,
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<ChainState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contribution(&self, id: ContributionId) -> Result<Contribution, LedgerError> {
        self.lock()?
            .contributions
            .get(&id)
            .cloned()
            .ok_or(LedgerError::UnknownContribution(id))
    }

    /// Circuit a deployed verifier was generated for.
    pub fn verifier_circuit(&self, verifier: Address) -> Result<CircuitId, LedgerError> {
        self.lock()?
            .verifiers
            .get(&verifier)
            .map(|v| v.circuit_id.clone())
            .ok_or(LedgerError::UnknownVerifier(verifier))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChainState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Rpc("ledger state poisoned".into()))
    }
}

impl ChainState {
    fn get_mut(&mut self, id: ContributionId) -> Result<&mut Contribution, LedgerError> {
        self.contributions
            .get_mut(&id)
            .ok_or(LedgerError::UnknownContribution(id))
    }
}

fn require_status(
    contribution: &Contribution,
    action: &'static str,
    required: &'static str,
    allowed: &[ContributionStatus],
) -> Result<(), LedgerError> {
    if allowed.contains(&contribution.status) {
        Ok(())
    } else {
        Err(LedgerError::InvalidStatus {
            id: contribution.id,
            status: contribution.status.to_string(),
            action,
            required,
        })
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_contribution(
        &self,
        participant: &LocalWallet,
        image_url: &str,
    ) -> Result<ContributionId, LedgerError> {
        let mut state = self.lock()?;
        let id = ContributionId(state.next_id);
        state.next_id += 1;
        state.contributions.insert(
            id,
            Contribution {
                id,
                participant: participant.address(),
                image_url: image_url.to_string(),
                reviewer: None,
                coordinates: None,
                review: None,
                verifier: None,
                status: ContributionStatus::Created,
            },
        );
        state.events.push(LedgerEvent::ContributionCreated {
            participant: participant.address(),
            image_url: image_url.to_string(),
            id,
        });
        debug!(id = %id, "Contribution created");
        Ok(id)
    }

    async fn assign_contribution(&self, reviewer: &LocalWallet) -> Result<ContributionId, LedgerError> {
        let mut state = self.lock()?;
        let reviewer = reviewer.address();
        let contribution = state
            .contributions
            .values_mut()
            .find(|c| c.status == ContributionStatus::Created && c.participant != reviewer)
            .ok_or(LedgerError::NothingToAssign)?;
        contribution.reviewer = Some(reviewer);
        contribution.status = ContributionStatus::Assigned;
        let event = LedgerEvent::ContributionAssigned {
            id: contribution.id,
            participant: contribution.participant,
            image_url: contribution.image_url.clone(),
            reviewer,
        };
        let id = contribution.id;
        state.events.push(event);
        Ok(id)
    }

    async fn update_coordinates(
        &self,
        participant: &LocalWallet,
        id: ContributionId,
        coordinates: &EncryptedCoordinates,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let contribution = state.get_mut(id)?;
        if contribution.participant != participant.address() {
            return Err(LedgerError::Unauthorized {
                signer: participant.address(),
                action: "update coordinates of",
                id,
            });
        }
        require_status(
            contribution,
            "update coordinates",
            "Assigned",
            &[ContributionStatus::Assigned, ContributionStatus::CoordinatesUpdated],
        )?;
        contribution.coordinates = Some(coordinates.clone());
        contribution.status = ContributionStatus::CoordinatesUpdated;
        let event = LedgerEvent::CoordinateUpdated {
            id,
            participant: contribution.participant,
            coordinates: coordinates.clone(),
        };
        state.events.push(event);
        Ok(())
    }

    async fn review_contribution(
        &self,
        reviewer: &LocalWallet,
        id: ContributionId,
        result: ReviewResult,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let contribution = state.get_mut(id)?;
        if contribution.reviewer != Some(reviewer.address()) {
            return Err(LedgerError::Unauthorized {
                signer: reviewer.address(),
                action: "review",
                id,
            });
        }
        require_status(
            contribution,
            "review",
            "Assigned or CoordinatesUpdated",
            &[ContributionStatus::Assigned, ContributionStatus::CoordinatesUpdated],
        )?;
        contribution.review = Some(result);
        contribution.status = ContributionStatus::Reviewed;
        let event = LedgerEvent::ContributionReviewed {
            id,
            participant: contribution.participant,
            reviewer: reviewer.address(),
            image_url: contribution.image_url.clone(),
            result,
        };
        state.events.push(event);
        Ok(())
    }

    async fn update_verifier(
        &self,
        participant: &LocalWallet,
        id: ContributionId,
        verifier: Address,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        if !state.verifiers.contains_key(&verifier) {
            return Err(LedgerError::UnknownVerifier(verifier));
        }
        let contribution = state.get_mut(id)?;
        if contribution.participant != participant.address() {
            return Err(LedgerError::Unauthorized {
                signer: participant.address(),
                action: "link a verifier to",
                id,
            });
        }
        if let Some(existing) = contribution.verifier {
            return Err(LedgerError::AlreadyLinked {
                id,
                verifier: existing,
            });
        }
        require_status(contribution, "link verifier", "Reviewed", &[ContributionStatus::Reviewed])?;

        contribution.verifier = Some(verifier);
        contribution.status = ContributionStatus::VerifierLinked;
        let event = LedgerEvent::VerifierUpdated {
            id,
            participant: contribution.participant,
            reviewer: contribution.reviewer.unwrap_or_default(),
            image_url: contribution.image_url.clone(),
            verifier,
        };
        state.events.push(event);
        info!(id = %id, verifier = ?verifier, "Verifier linked");
        Ok(())
    }

    async fn deploy_verifier(
        &self,
        deployer: &LocalWallet,
        contract: &VerifierContract,
    ) -> Result<Address, LedgerError> {
        // Only simulated verifiers can execute here; anything else would reject every proof.
        if contract.bytecode != simulated_bytecode(&contract.key_digest) {
            return Err(LedgerError::Reverted(format!(
                "verifier for circuit {} is not simulated verifier bytecode",
                contract.circuit_id
            )));
        }
        let mut state = self.lock()?;
        let nonce = state.nonces.entry(deployer.address()).or_insert(0);
        let address = get_contract_address(deployer.address(), *nonce);
        *nonce += 1;
        state.verifiers.insert(
            address,
            DeployedVerifier {
                circuit_id: contract.circuit_id.clone(),
                key_digest: contract.key_digest,
            },
        );
        debug!(circuit = %contract.circuit_id, verifier = ?address, "Verifier deployed");
        Ok(address)
    }

    async fn verify_proof(
        &self,
        _caller: &LocalWallet,
        verifier: Address,
        calldata: &Calldata,
    ) -> Result<bool, LedgerError> {
        let mut state = self.lock()?;
        let deployed = state
            .verifiers
            .get(&verifier)
            .cloned()
            .ok_or(LedgerError::UnknownVerifier(verifier))?;

        let input = calldata.public_signal();
        let accepted = input <= U256::one() && {
            let expected = simulated_proof(&deployed.key_digest, input.low_u32() as u8);
            expected.a == calldata.a && expected.b == calldata.b && expected.c == calldata.c
        };

        if accepted {
            if let Some(contribution) = state.contributions.values_mut().find(|c| {
                c.verifier == Some(verifier) && c.status == ContributionStatus::VerifierLinked
            }) {
                contribution.status = ContributionStatus::Verified;
            }
        }
        Ok(accepted)
    }

    async fn events(&self, kind: EventKind) -> Result<Vec<LedgerEvent>, LedgerError> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|event| event.kind() == kind)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> LocalWallet {
        LocalWallet::new(&mut rand::thread_rng())
    }

    fn contract() -> VerifierContract {
        VerifierContract {
            circuit_id: CircuitId::new("img").unwrap(),
            source: String::new(),
            bytecode: simulated_bytecode(&[3u8; 32]),
            key_digest: [3u8; 32],
        }
    }

    fn coordinates() -> EncryptedCoordinates {
        EncryptedCoordinates {
            iv: [1; 16],
            ephemeral_public_key: [4; 65],
            ciphertext: vec![9; 32],
            mac: [2; 32],
        }
    }

    async fn reviewed(ledger: &MemoryLedger, participant: &LocalWallet, reviewer: &LocalWallet) -> ContributionId {
        let id = ledger
            .create_contribution(participant, "https://arweave.net/img")
            .await
            .unwrap();
        assert_eq!(ledger.assign_contribution(reviewer).await.unwrap(), id);
        ledger
            .update_coordinates(participant, id, &coordinates())
            .await
            .unwrap();
        ledger
            .review_contribution(reviewer, id, ReviewResult::Approved)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_lifecycle_statuses() {
        let ledger = MemoryLedger::new();
        let (participant, reviewer, deployer) = (wallet(), wallet(), wallet());
        let id = reviewed(&ledger, &participant, &reviewer).await;
        assert_eq!(ledger.contribution(id).unwrap().status, ContributionStatus::Reviewed);

        let verifier = ledger.deploy_verifier(&deployer, &contract()).await.unwrap();
        ledger.update_verifier(&participant, id, verifier).await.unwrap();
        assert_eq!(
            ledger.contribution(id).unwrap().status,
            ContributionStatus::VerifierLinked
        );

        let proof = simulated_proof(&[3u8; 32], 1);
        assert!(ledger.verify_proof(&reviewer, verifier, &proof).await.unwrap());
        assert_eq!(ledger.contribution(id).unwrap().status, ContributionStatus::Verified);
        assert_eq!(ledger.verifier_circuit(verifier).unwrap().as_str(), "img");
    }

    #[tokio::test]
    async fn test_zero_signal_proof_fails_in_grid_claim() {
        let ledger = MemoryLedger::new();
        let verifier = ledger.deploy_verifier(&wallet(), &contract()).await.unwrap();
        let claim = simulated_proof(&[3u8; 32], 0).claiming_in_grid();
        assert!(!ledger.verify_proof(&wallet(), verifier, &claim).await.unwrap());
        let honest = simulated_proof(&[3u8; 32], 0);
        assert!(ledger.verify_proof(&wallet(), verifier, &honest).await.unwrap());
    }

    #[tokio::test]
    async fn test_only_participant_links_once() {
        let ledger = MemoryLedger::new();
        let (participant, reviewer, deployer) = (wallet(), wallet(), wallet());
        let id = reviewed(&ledger, &participant, &reviewer).await;
        let first = ledger.deploy_verifier(&deployer, &contract()).await.unwrap();
        let second = ledger.deploy_verifier(&deployer, &contract()).await.unwrap();
        assert_ne!(first, second);

        let err = ledger.update_verifier(&reviewer, id, first).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized { .. }));

        ledger.update_verifier(&participant, id, first).await.unwrap();
        let err = ledger.update_verifier(&participant, id, second).await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyLinked { id, verifier: first });
        assert_eq!(ledger.contribution(id).unwrap().verifier, Some(first));
    }

    #[tokio::test]
    async fn test_link_requires_review() {
        let ledger = MemoryLedger::new();
        let participant = wallet();
        let id = ledger
            .create_contribution(&participant, "https://arweave.net/x")
            .await
            .unwrap();
        let verifier = ledger.deploy_verifier(&wallet(), &contract()).await.unwrap();
        let err = ledger.update_verifier(&participant, id, verifier).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidStatus { .. }));
    }

    #[tokio::test]
    async fn test_foreign_bytecode_deploy_reverts() {
        let ledger = MemoryLedger::new();
        for bytecode in [Vec::new(), b"\x60\x80\x60\x40".to_vec(), simulated_bytecode(&[4u8; 32])] {
            let contract = VerifierContract {
                bytecode,
                ..contract()
            };
            let err = ledger.deploy_verifier(&wallet(), &contract).await.unwrap_err();
            assert!(matches!(err, LedgerError::Reverted(_)));
        }
        assert!(ledger.deploy_verifier(&wallet(), &contract()).await.is_ok());
    }

    #[tokio::test]
    async fn test_assignment_skips_own_and_taken_contributions() {
        let ledger = MemoryLedger::new();
        let (a, b) = (wallet(), wallet());
        ledger.create_contribution(&a, "https://arweave.net/1").await.unwrap();
        assert_eq!(ledger.assign_contribution(&a).await, Err(LedgerError::NothingToAssign));
        ledger.assign_contribution(&b).await.unwrap();
        assert_eq!(ledger.assign_contribution(&b).await, Err(LedgerError::NothingToAssign));
        assert_eq!(ledger.events(EventKind::ContributionAssigned).await.unwrap().len(), 1);
    }
}
