//! Stage interface over the external circuit compiler and prover.
//!
//! A toolchain turns a [`CircuitArtifact`] into proving material in four
//! stages: compile, setup, prove and calldata export. Artifacts are exchanged
//! through the [`ArtifactStore`] so implementations stay stateless.

pub mod circom;
pub mod simulated;

use std::{fs, path::PathBuf};

use async_trait::async_trait;
use ethers::types::U256;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    calldata::Calldata,
    circuits::{CircuitArtifact, CircuitId},
    error::ToolchainError,
    setup::{require, ArtifactStore, ProofPaths, TrustedSetup},
};

pub use circom::{CircomToolchain, CircomToolchainConfig};
pub use simulated::SimulatedToolchain;

/// Output of the compile stage: constraint system plus witness generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCircuit {
    pub id: CircuitId,
    pub r1cs: PathBuf,
    pub witness_generator: PathBuf,
}

/// Verifier contract emitted by setup, one per circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierContract {
    pub circuit_id: CircuitId,
    pub source: String,
    /// Creation bytecode; empty when no Solidity compiler was configured.
    pub bytecode: Vec<u8>,
    /// SHA-256 of the proving key the contract was generated from.
    pub key_digest: [u8; 32],
}

/// Output of the setup stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitKeys {
    pub id: CircuitId,
    pub proving_key: PathBuf,
    pub witness_generator: PathBuf,
    pub verifier: VerifierContract,
}

/// Proof object and public signals from one witness/proof run.
#[derive(Debug, Clone)]
pub struct ProofBundle {
    pub id: CircuitId,
    pub proof: Value,
    pub public_signals: Vec<String>,
    pub paths: ProofPaths,
}

impl ProofBundle {
    /// The circuit's single boolean output.
    pub fn public_signal(&self) -> Result<u8, ToolchainError> {
        match self.public_signals.as_slice() {
            [signal] => match signal.trim() {
                "0" => Ok(0),
                "1" => Ok(1),
                other => Err(ToolchainError::Output(format!(
                    "public signal {other:?} is not boolean"
                ))),
            },
            other => Err(ToolchainError::Output(format!(
                "expected one public signal, got {}",
                other.len()
            ))),
        }
    }
}

#[async_trait]
pub trait ProofToolchain: Send + Sync {
    fn name(&self) -> &'static str;

    /// Circuit source → constraint system + witness generator.
    async fn compile(
        &self,
        store: &ArtifactStore,
        artifact: &CircuitArtifact,
    ) -> Result<CompiledCircuit, ToolchainError>;

    /// Constraint system + shared parameters → proving key + verifier contract.
    async fn setup(
        &self,
        store: &ArtifactStore,
        compiled: &CompiledCircuit,
        params: &TrustedSetup,
    ) -> Result<CircuitKeys, ToolchainError>;

    /// Proving key + named inputs → proof + public signals.
    ///
    /// Missing inputs or inputs outside the declared signal range are
    /// [`ToolchainError::ProofGeneration`]; a zero output is a valid proof.
    ///
    /// Every file of the attempt is written under `paths`.
    async fn prove(
        &self,
        keys: &CircuitKeys,
        inputs: &Value,
        paths: ProofPaths,
    ) -> Result<ProofBundle, ToolchainError>;

    /// Proof + public signals → flat calldata export.
    async fn export_calldata(&self, bundle: &ProofBundle) -> Result<String, ToolchainError>;
}

/// Handles to the compile outputs already on disk.
pub fn compiled_circuit(
    store: &ArtifactStore,
    id: &CircuitId,
) -> Result<CompiledCircuit, ToolchainError> {
    let r1cs = store.r1cs_path(id);
    let witness_generator = store.wasm_path(id);
    require(&r1cs)?;
    require(&witness_generator)?;
    Ok(CompiledCircuit {
        id: id.clone(),
        r1cs,
        witness_generator,
    })
}

/// Rebuild [`CircuitKeys`] from setup outputs already on disk.
pub fn load_keys(store: &ArtifactStore, id: &CircuitId) -> Result<CircuitKeys, ToolchainError> {
    let proving_key = store.zkey_path(id);
    let witness_generator = store.wasm_path(id);
    let source_path = store.verifier_source_path(id);
    let bytecode_path = store.verifier_bytecode_path(id);
    for path in [&proving_key, &witness_generator, &source_path, &bytecode_path] {
        require(path)?;
    }

    let key_digest = Sha256::digest(fs::read(&proving_key)?).into();
    let source = fs::read_to_string(&source_path)?;
    let bytecode_hex = fs::read_to_string(&bytecode_path)?;
    let bytecode = hex::decode(bytecode_hex.trim().trim_start_matches("0x"))
        .map_err(|e| ToolchainError::Output(format!("verifier bytecode: {e}")))?;

    Ok(CircuitKeys {
        id: id.clone(),
        proving_key,
        witness_generator,
        verifier: VerifierContract {
            circuit_id: id.clone(),
            source,
            bytecode,
            key_digest,
        },
    })
}

/// Calldata for a Groth16 proof object in snarkjs JSON form.
///
/// The G2 point `pi_b` is emitted with its two coordinates swapped per row,
/// which is what the generated Solidity verifier expects.
pub fn groth16_calldata(proof: &Value, public_signals: &[String]) -> Result<Calldata, ToolchainError> {
    let field = |path: &[usize], key: &str| -> Result<U256, ToolchainError> {
        let mut node = proof
            .get(key)
            .ok_or_else(|| ToolchainError::Output(format!("proof is missing {key}")))?;
        for index in path {
            node = node
                .get(*index)
                .ok_or_else(|| ToolchainError::Output(format!("proof {key}{path:?} missing")))?;
        }
        let text = node
            .as_str()
            .ok_or_else(|| ToolchainError::Output(format!("proof {key}{path:?} is not a string")))?;
        U256::from_dec_str(text)
            .map_err(|_| ToolchainError::Output(format!("proof {key}{path:?} = {text:?}")))
    };

    let input = match public_signals {
        [signal] => U256::from_dec_str(signal.trim())
            .map_err(|_| ToolchainError::Output(format!("public signal {signal:?}")))?,
        other => {
            return Err(ToolchainError::Output(format!(
                "expected one public signal, got {}",
                other.len()
            )))
        }
    };

    Ok(Calldata {
        a: [field(&[0], "pi_a")?, field(&[1], "pi_a")?],
        b: [
            [field(&[0, 1], "pi_b")?, field(&[0, 0], "pi_b")?],
            [field(&[1, 1], "pi_b")?, field(&[1, 0], "pi_b")?],
        ],
        c: [field(&[0], "pi_c")?, field(&[1], "pi_c")?],
        input: [input],
    })
}
