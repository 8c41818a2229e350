//! Error taxonomy for the grid-proof pipeline.
//!
//! Codec and synthesis errors abort the contribution being processed.
//! Toolchain and ledger errors during deployment are terminal for one
//! contribution but never for a batch. Verification errors are converted
//! into [`crate::orchestrator::VerificationOutcome::Failed`] by the orchestrator.

use std::path::PathBuf;

use ethers::types::Address;
use thiserror::Error;

use crate::ledger::ContributionId;

/// Malformed coordinate input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinateError {
    #[error("coordinate does not match `D° M' S.F\" H, D° M' S.F\" H`: {input:?} ({reason})")]
    Format { input: String, reason: String },

    #[error("{axis} value {value} outside {min}..={max}")]
    OutOfRange {
        axis: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

/// Failures of the external compile/setup/prove/export stages.
#[derive(Error, Debug)]
pub enum ToolchainError {
    /// The shared trusted-setup parameter file is absent. Fatal for the process.
    #[error("trusted setup parameters not found at {0}")]
    SetupMissing(PathBuf),

    /// The toolchain failed to produce a proof. A zero public signal is not this error.
    #[error("proof generation failed for circuit {circuit}: {reason}")]
    ProofGeneration { circuit: String, reason: String },

    #[error("{stage} failed for circuit {circuit}: {reason}")]
    Stage {
        stage: &'static str,
        circuit: String,
        reason: String,
    },

    #[error("{stage} for circuit {circuit} exceeded {timeout_secs}s")]
    StageTimeout {
        stage: &'static str,
        circuit: String,
        timeout_secs: u64,
    },

    /// The circuit's verifier is on-chain; its artifacts are frozen.
    #[error("circuit {circuit} already has a deployed verifier; its source cannot change")]
    AlreadyDeployed { circuit: String },

    #[error("artifact {0} is missing; run the earlier stages first")]
    MissingArtifact(PathBuf),

    #[error("invalid circuit identifier {0:?}")]
    InvalidCircuitId(String),

    #[error("artifact manifest error: {0}")]
    Manifest(String),

    #[error("malformed toolchain output: {0}")]
    Output(String),

    #[error("witness generator upload failed: {0}")]
    Content(#[from] ContentError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Calldata export could not be turned into verifier call arguments.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalldataError {
    #[error("expected {expected} calldata tokens, got {actual}")]
    TokenCount { expected: usize, actual: usize },

    #[error("invalid calldata integer {0:?}")]
    InvalidInteger(String),
}

/// Failures reported by a ledger collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("contribution {0} does not exist")]
    UnknownContribution(ContributionId),

    #[error("no contribution is available for assignment")]
    NothingToAssign,

    #[error("{signer:?} is not allowed to {action} contribution {id}")]
    Unauthorized {
        signer: Address,
        action: &'static str,
        id: ContributionId,
    },

    #[error("contribution {id} is {status}; {action} requires {required}")]
    InvalidStatus {
        id: ContributionId,
        status: String,
        action: &'static str,
        required: &'static str,
    },

    #[error("contribution {id} is already linked to verifier {verifier:?}")]
    AlreadyLinked { id: ContributionId, verifier: Address },

    #[error("no verifier contract deployed at {0:?}")]
    UnknownVerifier(Address),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("transaction dropped before confirmation")]
    Dropped,

    #[error("ledger rpc error: {0}")]
    Rpc(String),

    #[error("malformed ledger data: {0}")]
    Decode(String),
}

/// A verifier binding was rejected. The deployed verifier is left on-chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("{signer:?} does not own contribution {id} (participant {participant:?})")]
    NotOwner {
        id: ContributionId,
        signer: Address,
        participant: Address,
    },

    #[error("contribution {id} is already bound to verifier {existing:?}")]
    AlreadyBound { id: ContributionId, existing: Address },

    #[error("ledger rejected binding for contribution {id}: {source}")]
    Rejected {
        id: ContributionId,
        #[source]
        source: LedgerError,
    },
}

/// Failure of [`crate::lifecycle::VerifierLifecycleManager::deploy_and_link`].
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Nothing was deployed. Not retried.
    #[error("verifier deployment failed for contribution {id}: {source}")]
    Deploy {
        id: ContributionId,
        #[source]
        source: LedgerError,
    },

    /// The verifier was deployed but could not be linked; it stays orphaned.
    #[error("verifier {orphaned:?} deployed but not linked: {source}")]
    Link {
        orphaned: Option<Address>,
        #[source]
        source: LinkError,
    },
}

/// Anything that goes wrong while checking a queried coordinate.
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("no circuit artifacts for contribution {id} ({circuit})")]
    MissingCircuit { id: ContributionId, circuit: String },

    #[error("content {0} is not retrievable from the content store")]
    ContentUnavailable(String),

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Calldata(#[from] CalldataError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("public signal {0:?} is not 0 or 1")]
    PublicSignal(String),
}

/// Content-store collaborator failures.
#[derive(Error, Debug)]
pub enum ContentError {
    #[error("content {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-level error for callers that do not need to match on a stage.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Calldata(#[from] CalldataError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
