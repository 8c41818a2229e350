//! Zero-knowledge grid-cell proofs for crowd-sourced geotagged contributions
//!
//! This library provides:
//! - A coordinate codec for `D° M' S.F" H` strings and a 6-minute grid
//! - Per-contribution circom circuits proving a queried coordinate lies in the
//!   same grid cell as the participant's hidden coordinate
//! - A staged driver over the external Groth16 toolchain (circom + snarkjs)
//! - Verifier deployment and binding on the ledger, and proof submission
//!
//! The true coordinate is baked into each circuit and never appears on-chain.

pub mod calldata;
pub mod circuits;
pub mod config;
pub mod content;
pub mod coordinate;
pub mod error;
pub mod fuzz;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod prover;
pub mod setup;
pub mod toolchain;
pub mod utils;

// Re-export commonly used types and functions
pub use calldata::Calldata;
pub use circuits::{grid_circuit::GridCircuit, CircuitArtifact, CircuitId};
pub use config::Config;
pub use content::{ContentStore, LocalContentStore, MemoryContentStore};
pub use coordinate::GridCoordinate;
pub use error::{Error, Result};
pub use fuzz::{FuzzHarness, FuzzReport};
pub use ledger::{
    Contribution, ContributionId, ContributionStatus, EvmLedger, Ledger, MemoryLedger,
    ReviewResult, VerifierBinding,
};
pub use lifecycle::VerifierLifecycleManager;
pub use orchestrator::{ProofOrchestrator, ProofRecord, VerificationOutcome};
pub use pipeline::{CoordinateBook, Pipeline, PipelineReport};
pub use prover::CircuitProver;
pub use setup::{ArtifactStore, TrustedSetup};
pub use toolchain::{CircomToolchain, ProofToolchain, SimulatedToolchain};
pub use utils::EncryptedCoordinates;
