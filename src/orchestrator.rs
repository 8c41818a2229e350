//! Proof verification against deployed verifiers.
//!
//! Failures never propagate out of [`ProofOrchestrator::verify`]; they become
//! [`VerificationOutcome::Failed`] so a batch keeps going.

use std::{fmt, sync::Arc, time::Instant};

use ethers::{signers::LocalWallet, types::Address};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    calldata::Calldata,
    circuits::CircuitId,
    coordinate::GridCoordinate,
    error::{LedgerError, VerificationError},
    ledger::{EventKind, Ledger, VerifierBinding},
    prover::CircuitProver,
};

/// Input/output tuple of one verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProofRecord {
    pub image_ref: String,
    pub verifier: Address,
    pub queried: GridCoordinate,
    pub public_signal: u8,
    pub accepted: bool,
}

impl ProofRecord {
    /// The verifier accepts the in-grid claim exactly when the circuit output is 1.
    pub fn is_consistent(&self) -> bool {
        (self.public_signal == 1) == self.accepted
    }
}

#[derive(Debug)]
pub enum VerificationOutcome {
    Completed(ProofRecord),
    Failed {
        image_ref: String,
        verifier: Address,
        queried: GridCoordinate,
        error: VerificationError,
    },
}

impl VerificationOutcome {
    /// Public signal, or -1 when verification did not complete.
    pub fn public_signal(&self) -> i8 {
        match self {
            Self::Completed(record) => record.public_signal as i8,
            Self::Failed { .. } => -1,
        }
    }

    pub fn accepted(&self) -> bool {
        matches!(self, Self::Completed(record) if record.accepted)
    }

    pub fn record(&self) -> Option<&ProofRecord> {
        match self {
            Self::Completed(record) => Some(record),
            Self::Failed { .. } => None,
        }
    }

    pub fn queried(&self) -> &GridCoordinate {
        match self {
            Self::Completed(record) => &record.queried,
            Self::Failed { queried, .. } => queried,
        }
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(r) => write!(
                f,
                "{} @ {:?}: query ({}, {}) signal={} accepted={}",
                r.image_ref,
                r.verifier,
                r.queried.lat_deg,
                r.queried.lon_deg,
                r.public_signal,
                r.accepted
            ),
            Self::Failed {
                image_ref,
                verifier,
                error,
                ..
            } => write!(f, "{image_ref} @ {verifier:?}: failed ({error})"),
        }
    }
}

pub struct ProofOrchestrator {
    prover: Arc<CircuitProver>,
    ledger: Arc<dyn Ledger>,
    reviewer: LocalWallet,
}

impl ProofOrchestrator {
    pub fn new(prover: Arc<CircuitProver>, ledger: Arc<dyn Ledger>, reviewer: LocalWallet) -> Self {
        Self {
            prover,
            ledger,
            reviewer,
        }
    }

    /// Prove `query` against the binding's circuit and submit it to the bound verifier.
    pub async fn verify(&self, binding: &VerifierBinding, query: &GridCoordinate) -> VerificationOutcome {
        match self.try_verify(binding, query).await {
            Ok(record) => VerificationOutcome::Completed(record),
            Err(error) => {
                warn!(
                    id = %binding.contribution_id,
                    verifier = ?binding.verifier,
                    error = %error,
                    "Verification failed"
                );
                VerificationOutcome::Failed {
                    image_ref: binding.image_url.clone(),
                    verifier: binding.verifier,
                    queried: *query,
                    error,
                }
            }
        }
    }

    async fn try_verify(
        &self,
        binding: &VerifierBinding,
        query: &GridCoordinate,
    ) -> Result<ProofRecord, VerificationError> {
        let t0 = Instant::now();
        let circuit = CircuitId::from_content_url(&binding.image_url)?;
        let keys = self
            .prover
            .keys(&circuit)?
            .ok_or_else(|| VerificationError::MissingCircuit {
                id: binding.contribution_id,
                circuit: circuit.to_string(),
            })?;

        let witness_cid = self
            .prover
            .store()
            .record(&circuit)?
            .and_then(|r| r.witness_cid)
            .ok_or_else(|| VerificationError::ContentUnavailable(format!("witness generator of {circuit}")))?;
        self.prover
            .content()
            .cat(&witness_cid)
            .await
            .map_err(|_| VerificationError::ContentUnavailable(witness_cid.clone()))?;

        let bundle = self.prover.prove(&keys, query).await?;
        let exported = self.prover.export_calldata(&bundle).await;
        self.prover.discard(&bundle);
        let public_signal = bundle
            .public_signal()
            .map_err(|_| VerificationError::PublicSignal(bundle.public_signals.join(",")))?;
        let calldata = Calldata::parse(&exported?)?;
        if calldata.public_signal() != public_signal.into() {
            return Err(VerificationError::PublicSignal(calldata.public_signal().to_string()));
        }

        let accepted = self
            .ledger
            .verify_proof(&self.reviewer, binding.verifier, &calldata.claiming_in_grid())
            .await?;

        let record = ProofRecord {
            image_ref: binding.image_url.clone(),
            verifier: binding.verifier,
            queried: *query,
            public_signal,
            accepted,
        };
        if !record.is_consistent() {
            warn!(
                id = %binding.contribution_id,
                public_signal,
                accepted,
                "Verifier disagrees with circuit output"
            );
        }
        info!(
            id = %binding.contribution_id,
            public_signal,
            accepted,
            elapsed_ms = t0.elapsed().as_millis(),
            "Verified query"
        );
        Ok(record)
    }

    /// Verify `query` against every binding on the ledger.
    pub async fn verify_all(
        &self,
        query: &GridCoordinate,
    ) -> Result<Vec<(VerifierBinding, VerificationOutcome)>, LedgerError> {
        let bindings: Vec<VerifierBinding> = self
            .ledger
            .events(EventKind::VerifierUpdated)
            .await?
            .iter()
            .filter_map(|event| event.binding())
            .collect();

        let mut outcomes = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let outcome = self.verify(&binding, query).await;
            outcomes.push((binding, outcome));
        }
        Ok(outcomes)
    }
}
