//! Shared fixtures: in-memory ledger and content, simulated toolchain, temp artifact root.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use ethers::signers::LocalWallet;
use geogrid_zkp::{
    circuits::grid_circuit::DEFAULT_CIRCOMLIB, ArtifactStore, CircuitArtifact, CircuitId,
    CircuitProver, Contribution, ContentStore, GridCoordinate, Ledger, MemoryContentStore,
    MemoryLedger, Pipeline, ProofOrchestrator, ReviewResult, SimulatedToolchain, TrustedSetup,
    VerifierLifecycleManager,
};
use geogrid_zkp::{toolchain::CircuitKeys, EncryptedCoordinates};
use rand::RngCore;
use tempfile::TempDir;

pub const SCENARIO: &str = "23° 11' 6\" S, 18° 22' 36\" E";

pub fn wallet() -> LocalWallet {
    LocalWallet::new(&mut rand::thread_rng())
}

pub fn ciphertext() -> EncryptedCoordinates {
    EncryptedCoordinates::from_bytes(&[7u8; EncryptedCoordinates::MIN_LEN + 16])
        .expect("Failed to build ciphertext")
}

pub struct Fixture {
    pub dir: TempDir,
    pub ledger: Arc<MemoryLedger>,
    pub content: Arc<MemoryContentStore>,
    pub store: Arc<ArtifactStore>,
    pub prover: Arc<CircuitProver>,
    pub reviewer: LocalWallet,
    pub deployer: LocalWallet,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(ArtifactStore::open(dir.path().join("artifacts")).expect("Failed to open store"));
        let content = Arc::new(MemoryContentStore::new());
        let prover = Arc::new(CircuitProver::new(
            Arc::new(SimulatedToolchain::new()),
            Arc::clone(&store),
            content.clone() as Arc<dyn ContentStore>,
            Arc::new(TrustedSetup::from_bytes("test-ptau", b"test powers of tau")),
            2,
            Duration::from_secs(30),
        ));
        Self {
            dir,
            ledger: Arc::new(MemoryLedger::new()),
            content,
            store,
            prover,
            reviewer: wallet(),
            deployer: wallet(),
        }
    }

    fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    /// Created, assigned to the fixture reviewer and given coordinates.
    pub async fn submitted(&self, participant: &LocalWallet) -> Contribution {
        let mut image = vec![0u8; 48];
        rand::thread_rng().fill_bytes(&mut image);
        let cid = self.content.put(image).await.expect("Failed to store image");
        let url = self.content.url(&cid);

        let id = self
            .ledger
            .create_contribution(participant, &url)
            .await
            .expect("Failed to create contribution");
        self.ledger
            .assign_contribution(&self.reviewer)
            .await
            .expect("Failed to assign contribution");
        self.ledger
            .update_coordinates(participant, id, &ciphertext())
            .await
            .expect("Failed to update coordinates");
        self.ledger.contribution(id).expect("Contribution missing")
    }

    pub async fn reviewed(&self, participant: &LocalWallet, result: ReviewResult) -> Contribution {
        let contribution = self.submitted(participant).await;
        self.ledger
            .review_contribution(&self.reviewer, contribution.id, result)
            .await
            .expect("Failed to review contribution");
        self.ledger.contribution(contribution.id).expect("Contribution missing")
    }

    pub async fn keys_for(&self, contribution: &Contribution, truth: &GridCoordinate) -> CircuitKeys {
        let id = CircuitId::from_content_url(&contribution.image_url).expect("Invalid content url");
        let artifact = CircuitArtifact::synthesize(id, truth, DEFAULT_CIRCOMLIB);
        self.prover.prepare(&artifact).await.expect("Failed to prepare circuit")
    }

    pub fn lifecycle(&self) -> VerifierLifecycleManager {
        VerifierLifecycleManager::new(self.ledger(), Arc::clone(&self.store), self.deployer.clone())
    }

    pub fn orchestrator(&self) -> ProofOrchestrator {
        ProofOrchestrator::new(Arc::clone(&self.prover), self.ledger(), self.reviewer.clone())
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            Arc::clone(&self.prover),
            self.ledger(),
            self.lifecycle(),
            self.orchestrator(),
            DEFAULT_CIRCOMLIB,
        )
    }
}
