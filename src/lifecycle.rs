//! Deployment of per-contribution verifiers and their binding on the ledger.

use std::{sync::Arc, time::Instant};

use ethers::signers::{LocalWallet, Signer};
use tracing::{info, warn};

use crate::{
    error::{LedgerError, LifecycleError, LinkError},
    ledger::{Contribution, EventKind, Ledger, VerifierBinding},
    setup::ArtifactStore,
    toolchain::CircuitKeys,
};

pub struct VerifierLifecycleManager {
    ledger: Arc<dyn Ledger>,
    store: Arc<ArtifactStore>,
    deployer: LocalWallet,
}

impl VerifierLifecycleManager {
    pub fn new(ledger: Arc<dyn Ledger>, store: Arc<ArtifactStore>, deployer: LocalWallet) -> Self {
        Self {
            ledger,
            store,
            deployer,
        }
    }

    /// Verifier already bound to the contribution, if any.
    pub async fn existing_binding(
        &self,
        contribution: &Contribution,
    ) -> Result<Option<VerifierBinding>, LedgerError> {
        Ok(self
            .ledger
            .events(EventKind::VerifierUpdated)
            .await?
            .iter()
            .filter_map(|event| event.binding())
            .find(|binding| binding.contribution_id == contribution.id))
    }

    /// Deploy the circuit's verifier, then bind it to the contribution as its participant.
    ///
    /// Ownership and existing bindings are checked before anything is deployed.
    /// A link failure after deployment leaves the verifier orphaned on-chain and
    /// reports its address.
    pub async fn deploy_and_link(
        &self,
        keys: &CircuitKeys,
        contribution: &Contribution,
        participant: &LocalWallet,
    ) -> Result<VerifierBinding, LifecycleError> {
        let id = contribution.id;
        if participant.address() != contribution.participant {
            return Err(LifecycleError::Link {
                orphaned: None,
                source: LinkError::NotOwner {
                    id,
                    signer: participant.address(),
                    participant: contribution.participant,
                },
            });
        }

        match self.existing_binding(contribution).await {
            Ok(Some(existing)) => {
                return Err(LifecycleError::Link {
                    orphaned: None,
                    source: LinkError::AlreadyBound {
                        id,
                        existing: existing.verifier,
                    },
                })
            }
            Ok(None) => {}
            Err(source) => {
                return Err(LifecycleError::Link {
                    orphaned: None,
                    source: LinkError::Rejected { id, source },
                })
            }
        }

        let t0 = Instant::now();
        let verifier = self
            .ledger
            .deploy_verifier(&self.deployer, &keys.verifier)
            .await
            .map_err(|source| LifecycleError::Deploy { id, source })?;
        info!(
            id = %id,
            circuit = %keys.id,
            verifier = ?verifier,
            elapsed_ms = t0.elapsed().as_millis(),
            "Verifier deployed"
        );

        let t0 = Instant::now();
        if let Err(e) = self.ledger.update_verifier(participant, id, verifier).await {
            warn!(id = %id, verifier = ?verifier, error = %e, "Verifier left orphaned");
            let source = match e {
                LedgerError::AlreadyLinked { verifier: existing, .. } => {
                    LinkError::AlreadyBound { id, existing }
                }
                source => LinkError::Rejected { id, source },
            };
            return Err(LifecycleError::Link {
                orphaned: Some(verifier),
                source,
            });
        }
        info!(id = %id, elapsed_ms = t0.elapsed().as_millis(), "Verifier linked");

        let recorded = self
            .store
            .update(&keys.id, |r| r.deployed_at = Some(verifier.0))
            .and_then(|_| self.store.archive_source(&keys.id));
        if let Err(e) = recorded {
            warn!(circuit = %keys.id, error = %e, "Could not record deployment");
        }

        Ok(VerifierBinding {
            contribution_id: id,
            participant: contribution.participant,
            reviewer: contribution.reviewer.unwrap_or_default(),
            image_url: contribution.image_url.clone(),
            verifier,
        })
    }
}
