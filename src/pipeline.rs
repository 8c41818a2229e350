//! Batch driver: approved reviews → circuits → verifiers → verification.
//!
//! Partial completion is the normal result. Every contribution gets its own
//! outcome in the [`PipelineReport`] and one failure never stops the others.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Instant,
};

use ethers::{
    signers::{LocalWallet, Signer},
    types::Address,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::{
    circuits::{CircuitArtifact, CircuitId},
    coordinate::GridCoordinate,
    error::{CoordinateError, LedgerError, LifecycleError, ToolchainError},
    ledger::{
        all_events, replay_contributions, reviewed_with, ContributionId, Ledger, ReviewResult,
        VerifierBinding,
    },
    lifecycle::VerifierLifecycleManager,
    orchestrator::{ProofOrchestrator, VerificationOutcome},
    prover::CircuitProver,
    toolchain::CircuitKeys,
};

/// True coordinates known to the operator, keyed by contribution content URL.
#[derive(Debug, Clone, Default)]
pub struct CoordinateBook {
    entries: HashMap<String, GridCoordinate>,
}

impl CoordinateBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image_url: impl Into<String>, coordinate: GridCoordinate) {
        self.entries.insert(image_url.into(), coordinate);
    }

    /// Parse `url → "D° M' S.F\" H, D° M' S.F\" H"` pairs.
    pub fn parse<'a, I>(pairs: I) -> Result<Self, CoordinateError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut book = Self::new();
        for (url, text) in pairs {
            book.insert(url, GridCoordinate::parse(text)?);
        }
        Ok(book)
    }

    pub fn get(&self, image_url: &str) -> Option<&GridCoordinate> {
        self.entries.get(image_url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How far one approved contribution got.
#[derive(Debug)]
pub enum ContributionOutcome {
    Skipped(String),
    PrepareFailed(ToolchainError),
    LinkFailed(LifecycleError),
    Bound(VerifierBinding),
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub contributions: BTreeMap<ContributionId, ContributionOutcome>,
    pub verifications: Vec<(VerifierBinding, VerificationOutcome)>,
    pub elapsed_ms: u128,
}

impl PipelineReport {
    pub fn bound(&self) -> usize {
        self.contributions
            .values()
            .filter(|o| matches!(o, ContributionOutcome::Bound(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.contributions
            .values()
            .filter(|o| {
                matches!(
                    o,
                    ContributionOutcome::PrepareFailed(_) | ContributionOutcome::LinkFailed(_)
                )
            })
            .count()
    }

    pub fn accepted(&self) -> usize {
        self.verifications.iter().filter(|(_, o)| o.accepted()).count()
    }
}

pub struct Pipeline {
    prover: Arc<CircuitProver>,
    ledger: Arc<dyn Ledger>,
    lifecycle: VerifierLifecycleManager,
    orchestrator: ProofOrchestrator,
    circomlib: String,
}

impl Pipeline {
    pub fn new(
        prover: Arc<CircuitProver>,
        ledger: Arc<dyn Ledger>,
        lifecycle: VerifierLifecycleManager,
        orchestrator: ProofOrchestrator,
        circomlib: impl Into<String>,
    ) -> Self {
        Self {
            prover,
            ledger,
            lifecycle,
            orchestrator,
            circomlib: circomlib.into(),
        }
    }

    pub fn orchestrator(&self) -> &ProofOrchestrator {
        &self.orchestrator
    }

    /// Build and key circuits for every approved contribution found in `book`.
    ///
    /// Preparation runs concurrently; the prover bounds toolchain parallelism.
    pub async fn prepare(
        &self,
        book: &CoordinateBook,
    ) -> Result<(BTreeMap<ContributionId, ContributionOutcome>, BTreeMap<ContributionId, CircuitKeys>), LedgerError>
    {
        let events = all_events(self.ledger.as_ref()).await?;
        let contributions = replay_contributions(&events);
        let approved = reviewed_with(&events, ReviewResult::Approved);

        let mut outcomes = BTreeMap::new();
        let mut tasks = JoinSet::new();
        for event in &approved {
            let id = event.contribution_id();
            let Some(contribution) = contributions.get(&id) else {
                continue;
            };
            let Some(coordinate) = book.get(&contribution.image_url) else {
                outcomes.insert(
                    id,
                    ContributionOutcome::Skipped(format!("no coordinate for {}", contribution.image_url)),
                );
                continue;
            };
            let circuit_id = match CircuitId::from_content_url(&contribution.image_url) {
                Ok(circuit_id) => circuit_id,
                Err(e) => {
                    outcomes.insert(id, ContributionOutcome::PrepareFailed(e));
                    continue;
                }
            };

            let artifact = CircuitArtifact::synthesize(circuit_id, coordinate, &self.circomlib);
            let prover = Arc::clone(&self.prover);
            tasks.spawn(async move { (id, prover.prepare(&artifact).await) });
        }

        let mut keys = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(k))) => {
                    keys.insert(id, k);
                }
                Ok((id, Err(e))) => {
                    warn!(id = %id, error = %e, "Circuit preparation failed");
                    outcomes.insert(id, ContributionOutcome::PrepareFailed(e));
                }
                Err(e) => error!(error = %e, "Preparation task aborted"),
            }
        }
        for event in &approved {
            let id = event.contribution_id();
            if contributions.contains_key(&id) && !keys.contains_key(&id) && !outcomes.contains_key(&id) {
                outcomes.insert(
                    id,
                    ContributionOutcome::PrepareFailed(ToolchainError::Stage {
                        stage: "prepare",
                        circuit: id.to_string(),
                        reason: "task aborted".into(),
                    }),
                );
            }
        }
        Ok((outcomes, keys))
    }

    /// Full batch: prepare, deploy and link one contribution at a time, then
    /// verify `query` against every binding on the ledger.
    pub async fn run(
        &self,
        book: &CoordinateBook,
        participants: &[LocalWallet],
        query: &GridCoordinate,
    ) -> Result<PipelineReport, LedgerError> {
        let t0 = Instant::now();
        let (mut outcomes, keys) = self.prepare(book).await?;
        let contributions = replay_contributions(&all_events(self.ledger.as_ref()).await?);
        let wallets: HashMap<Address, &LocalWallet> =
            participants.iter().map(|w| (w.address(), w)).collect();

        for (id, circuit_keys) in &keys {
            let Some(contribution) = contributions.get(id) else {
                continue;
            };
            let Some(wallet) = wallets.get(&contribution.participant) else {
                outcomes.insert(
                    *id,
                    ContributionOutcome::Skipped(format!(
                        "no signing identity for participant {:?}",
                        contribution.participant
                    )),
                );
                continue;
            };
            let outcome = match self
                .lifecycle
                .deploy_and_link(circuit_keys, contribution, wallet)
                .await
            {
                Ok(binding) => ContributionOutcome::Bound(binding),
                Err(e) => {
                    warn!(id = %id, error = %e, "Deploy and link failed");
                    ContributionOutcome::LinkFailed(e)
                }
            };
            outcomes.insert(*id, outcome);
        }

        let verifications = self.orchestrator.verify_all(query).await?;
        let report = PipelineReport {
            contributions: outcomes,
            verifications,
            elapsed_ms: t0.elapsed().as_millis(),
        };
        info!(
            elapsed_ms = report.elapsed_ms,
            bound = report.bound(),
            failed = report.failed(),
            verified = report.verifications.len(),
            accepted = report.accepted(),
            "Pipeline finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_book_parse() {
        let book = CoordinateBook::parse([
            ("https://arweave.net/a", "23° 11' 6\" S, 18° 22' 36\" E"),
            ("https://arweave.net/b", "51° 30' 0\" N, 0° 7' 0\" W"),
        ])
        .unwrap();
        assert_eq!(book.len(), 2);
        assert_eq!(
            book.get("https://arweave.net/a"),
            Some(&GridCoordinate::new(-23, 11, 18, 22))
        );
        assert!(book.get("https://arweave.net/c").is_none());
    }

    #[test]
    fn test_coordinate_book_rejects_bad_entry() {
        assert!(CoordinateBook::parse([("https://arweave.net/a", "nowhere")]).is_err());
    }
}
