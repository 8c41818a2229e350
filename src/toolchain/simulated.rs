//! In-process toolchain that evaluates the circuit natively.
//!
//! Artifacts have the same names and lifecycle as the external toolchain's, but
//! the constraint system is stored as JSON and proofs are deterministic points
//! derived from the proving-key digest and the output signal. The in-memory
//! ledger checks proofs with [`simulated_proof`].

use std::fs;

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{
    groth16_calldata, CircuitKeys, CompiledCircuit, ProofBundle, ProofToolchain, VerifierContract,
};
use crate::{
    calldata::Calldata,
    circuits::{grid_circuit::GridCircuit, inputs::parse_verify_inputs, CircuitArtifact},
    error::ToolchainError,
    setup::{require, write_file, ArtifactStore, ProofPaths, TrustedSetup},
};

const GENERATOR: &str = "geogrid-simulated";

#[derive(Debug, Serialize, Deserialize)]
struct ConstraintSystem {
    generator: String,
    circuit: GridCircuit,
    source_digest: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProvingKey {
    protocol: String,
    circuit: GridCircuit,
    ptau_digest: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedToolchain;

impl SimulatedToolchain {
    pub fn new() -> Self {
        Self
    }
}

/// Proof points for `signal` under the proving key with digest `key_digest`.
///
/// Values are kept below 2^253 so every coordinate is a canonical BN254 scalar.
pub fn simulated_proof(key_digest: &[u8; 32], signal: u8) -> Calldata {
    let point = |label: &str| {
        let mut hasher = Sha256::new();
        hasher.update(key_digest);
        hasher.update(label.as_bytes());
        hasher.update([signal]);
        U256::from_big_endian(&hasher.finalize()) >> 3
    };
    Calldata {
        a: [point("a0"), point("a1")],
        b: [[point("b00"), point("b01")], [point("b10"), point("b11")]],
        c: [point("c0"), point("c1")],
        input: [U256::from(signal)],
    }
}

/// Deployable bytecode of the simulated verifier for `key_digest`.
pub fn simulated_bytecode(key_digest: &[u8; 32]) -> Vec<u8> {
    let mut bytecode = GENERATOR.as_bytes().to_vec();
    bytecode.extend_from_slice(key_digest);
    bytecode
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &std::path::Path) -> Result<T, ToolchainError> {
    require(path)?;
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ToolchainError::Output(format!("{}: {e}", path.display())))
}

fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ToolchainError> {
    serde_json::to_vec_pretty(value).map_err(|e| ToolchainError::Output(e.to_string()))
}

#[async_trait]
impl ProofToolchain for SimulatedToolchain {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn compile(
        &self,
        store: &ArtifactStore,
        artifact: &CircuitArtifact,
    ) -> Result<CompiledCircuit, ToolchainError> {
        let id = &artifact.id;
        store.existing_source(id)?;

        let system = ConstraintSystem {
            generator: GENERATOR.to_string(),
            circuit: artifact.circuit,
            source_digest: hex::encode(artifact.source_digest),
        };
        let bytes = to_json_bytes(&system)?;
        let r1cs = store.r1cs_path(id);
        let witness_generator = store.wasm_path(id);
        write_file(&r1cs, &bytes)?;
        write_file(&witness_generator, &bytes)?;
        debug!(circuit = %id, "Wrote simulated constraint system");

        Ok(CompiledCircuit {
            id: id.clone(),
            r1cs,
            witness_generator,
        })
    }

    async fn setup(
        &self,
        store: &ArtifactStore,
        compiled: &CompiledCircuit,
        params: &TrustedSetup,
    ) -> Result<CircuitKeys, ToolchainError> {
        let id = &compiled.id;
        let system: ConstraintSystem = read_json(&compiled.r1cs)?;

        let key = ProvingKey {
            protocol: "groth16".to_string(),
            circuit: system.circuit,
            ptau_digest: hex::encode(params.digest()),
        };
        let key_bytes = to_json_bytes(&key)?;
        let key_digest: [u8; 32] = Sha256::digest(&key_bytes).into();
        let proving_key = store.zkey_path(id);
        write_file(&proving_key, &key_bytes)?;

        let source = format!(
            "// SPDX-License-Identifier: GPL-3.0\npragma solidity ^0.8.0;\n\n\
             // Simulated Groth16 verifier for circuit {id}.\n\
             // Proving key sha256: 0x{}\n\
             contract Groth16Verifier {{}}\n",
            hex::encode(key_digest)
        );
        let bytecode = simulated_bytecode(&key_digest);
        write_file(&store.verifier_source_path(id), source.as_bytes())?;
        write_file(
            &store.verifier_bytecode_path(id),
            hex::encode(&bytecode).as_bytes(),
        )?;

        Ok(CircuitKeys {
            id: id.clone(),
            proving_key,
            witness_generator: compiled.witness_generator.clone(),
            verifier: VerifierContract {
                circuit_id: id.clone(),
                source,
                bytecode,
                key_digest,
            },
        })
    }

    async fn prove(
        &self,
        keys: &CircuitKeys,
        inputs: &Value,
        paths: ProofPaths,
    ) -> Result<ProofBundle, ToolchainError> {
        let id = &keys.id;
        write_file(&paths.input, &to_json_bytes(inputs)?)?;

        require(&keys.witness_generator)?;
        let key: ProvingKey = read_json(&keys.proving_key)?;
        let query = parse_verify_inputs(id.as_str(), inputs)?;
        let signal = key
            .circuit
            .evaluate(&query)
            .map_err(|e| ToolchainError::ProofGeneration {
                circuit: id.to_string(),
                reason: e.to_string(),
            })?;

        let points = simulated_proof(&keys.verifier.key_digest, signal);
        let dec = |v: &U256| v.to_string();
        let proof = json!({
            "pi_a": [dec(&points.a[0]), dec(&points.a[1]), "1"],
            "pi_b": [
                [dec(&points.b[0][1]), dec(&points.b[0][0])],
                [dec(&points.b[1][1]), dec(&points.b[1][0])],
                ["1", "0"]
            ],
            "pi_c": [dec(&points.c[0]), dec(&points.c[1]), "1"],
            "protocol": "groth16",
            "curve": "bn128",
        });
        let public_signals = vec![signal.to_string()];
        write_file(&paths.proof, &to_json_bytes(&proof)?)?;
        write_file(&paths.public, &to_json_bytes(&public_signals)?)?;

        Ok(ProofBundle {
            id: id.clone(),
            proof,
            public_signals,
            paths,
        })
    }

    async fn export_calldata(&self, bundle: &ProofBundle) -> Result<String, ToolchainError> {
        Ok(groth16_calldata(&bundle.proof, &bundle.public_signals)?.to_string())
    }
}
