//! External toolchain: `circom`, `snarkjs` and optionally `solc`.
//!
//! Every stage is a child process. Children are killed when the future driving
//! them is dropped, so a stage timeout never leaves a prover running.

use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::Stdio,
    time::Instant,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info};

use super::{CircuitKeys, CompiledCircuit, ProofBundle, ProofToolchain, VerifierContract};
use crate::{
    circuits::{CircuitArtifact, CircuitId},
    error::ToolchainError,
    setup::{require, write_file, ArtifactStore, ProofPaths, TrustedSetup},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircomToolchainConfig {
    pub circom: PathBuf,
    pub snarkjs: PathBuf,
    /// Without a Solidity compiler the verifier source is produced but has no bytecode.
    pub solc: Option<PathBuf>,
    /// Extra `-l` include root handed to circom.
    pub include: Option<PathBuf>,
}

impl Default for CircomToolchainConfig {
    fn default() -> Self {
        Self {
            circom: PathBuf::from("circom"),
            snarkjs: PathBuf::from("snarkjs"),
            solc: Some(PathBuf::from("solc")),
            include: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircomToolchain {
    config: CircomToolchainConfig,
}

impl CircomToolchain {
    pub fn new(config: CircomToolchainConfig) -> Self {
        Self { config }
    }

    async fn run<I, S>(
        &self,
        stage: &'static str,
        circuit: &CircuitId,
        program: &Path,
        args: I,
    ) -> Result<String, ToolchainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let t0 = Instant::now();
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolchainError::Stage {
                stage,
                circuit: circuit.to_string(),
                reason: format!("cannot run {}: {e}", program.display()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let reason = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(ToolchainError::Stage {
                stage,
                circuit: circuit.to_string(),
                reason: format!("{} exited with {}: {reason}", program.display(), output.status),
            });
        }

        debug!(
            circuit = %circuit,
            elapsed_ms = t0.elapsed().as_millis(),
            "{} {stage} finished",
            program.display()
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Compile the exported verifier with solc and return its creation bytecode.
    async fn compile_verifier(
        &self,
        solc: &Path,
        store: &ArtifactStore,
        id: &CircuitId,
        source: &Path,
    ) -> Result<Vec<u8>, ToolchainError> {
        let out_dir = store.verifier_source_path(id).with_extension("build");
        fs::create_dir_all(&out_dir)?;
        self.run(
            "verifier compile",
            id,
            solc,
            [
                OsStr::new("--bin"),
                OsStr::new("--optimize"),
                OsStr::new("--overwrite"),
                OsStr::new("-o"),
                out_dir.as_os_str(),
                source.as_os_str(),
            ],
        )
        .await?;

        let bin = fs::read_dir(&out_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .find(|path| path.extension().is_some_and(|ext| ext == "bin"))
            .ok_or_else(|| ToolchainError::Output(format!("solc left no .bin in {}", out_dir.display())))?;
        let text = fs::read_to_string(&bin)?;
        hex::decode(text.trim())
            .map_err(|e| ToolchainError::Output(format!("{}: {e}", bin.display())))
    }
}

#[async_trait]
impl ProofToolchain for CircomToolchain {
    fn name(&self) -> &'static str {
        "circom"
    }

    async fn compile(
        &self,
        store: &ArtifactStore,
        artifact: &CircuitArtifact,
    ) -> Result<CompiledCircuit, ToolchainError> {
        let id = &artifact.id;
        let source = store.existing_source(id)?;
        let out_dir = store.circuits_dir();

        let mut args = vec![
            source.into_os_string(),
            "--r1cs".into(),
            "--wasm".into(),
            "--sym".into(),
            "-o".into(),
            out_dir.into_os_string(),
        ];
        if let Some(include) = &self.config.include {
            args.push("-l".into());
            args.push(include.clone().into_os_string());
        }
        self.run("compile", id, &self.config.circom, args).await?;

        let compiled = super::compiled_circuit(store, id)?;
        info!(circuit = %id, "Compiled {}", compiled.r1cs.display());
        Ok(compiled)
    }

    async fn setup(
        &self,
        store: &ArtifactStore,
        compiled: &CompiledCircuit,
        params: &TrustedSetup,
    ) -> Result<CircuitKeys, ToolchainError> {
        let id = &compiled.id;
        let zkey = store.zkey_path(id);
        let verifier_source = store.verifier_source_path(id);

        self.run(
            "setup",
            id,
            &self.config.snarkjs,
            [
                OsStr::new("groth16"),
                OsStr::new("setup"),
                compiled.r1cs.as_os_str(),
                params.path().as_os_str(),
                zkey.as_os_str(),
            ],
        )
        .await?;
        self.run(
            "verifier export",
            id,
            &self.config.snarkjs,
            [
                OsStr::new("zkey"),
                OsStr::new("export"),
                OsStr::new("solidityverifier"),
                zkey.as_os_str(),
                verifier_source.as_os_str(),
            ],
        )
        .await?;
        require(&zkey)?;
        require(&verifier_source)?;

        let bytecode = match &self.config.solc {
            Some(solc) => {
                self.compile_verifier(solc, store, id, &verifier_source)
                    .await?
            }
            None => Vec::new(),
        };
        write_file(
            &store.verifier_bytecode_path(id),
            hex::encode(&bytecode).as_bytes(),
        )?;

        let key_digest = Sha256::digest(fs::read(&zkey)?).into();
        let source = fs::read_to_string(&verifier_source)?;
        Ok(CircuitKeys {
            id: id.clone(),
            proving_key: zkey,
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
        let input_bytes =
            serde_json::to_vec(inputs).map_err(|e| ToolchainError::Output(e.to_string()))?;
        write_file(&paths.input, &input_bytes)?;

        self.run(
            "prove",
            id,
            &self.config.snarkjs,
            [
                OsStr::new("groth16"),
                OsStr::new("fullprove"),
                paths.input.as_os_str(),
                keys.witness_generator.as_os_str(),
                keys.proving_key.as_os_str(),
                paths.proof.as_os_str(),
                paths.public.as_os_str(),
            ],
        )
        .await
        .map_err(|e| match e {
            ToolchainError::Stage { circuit, reason, .. } => {
                ToolchainError::ProofGeneration { circuit, reason }
            }
            other => other,
        })?;

        let proof: Value = serde_json::from_slice(&fs::read(&paths.proof)?)
            .map_err(|e| ToolchainError::Output(format!("{}: {e}", paths.proof.display())))?;
        let public_signals: Vec<String> = serde_json::from_slice(&fs::read(&paths.public)?)
            .map_err(|e| ToolchainError::Output(format!("{}: {e}", paths.public.display())))?;

        Ok(ProofBundle {
            id: id.clone(),
            proof,
            public_signals,
            paths,
        })
    }

    async fn export_calldata(&self, bundle: &ProofBundle) -> Result<String, ToolchainError> {
        let stdout = self
            .run(
                "calldata export",
                &bundle.id,
                &self.config.snarkjs,
                [
                    OsStr::new("zkey"),
                    OsStr::new("export"),
                    OsStr::new("soliditycalldata"),
                    bundle.paths.public.as_os_str(),
                    bundle.paths.proof.as_os_str(),
                ],
            )
            .await?;
        Ok(stdout.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        circuits::grid_circuit::DEFAULT_CIRCOMLIB, coordinate::GridCoordinate,
    };
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_binary_is_stage_error() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let artifact = CircuitArtifact::synthesize(
            CircuitId::new("nobin").unwrap(),
            &GridCoordinate::new(1, 0, 2, 0),
            DEFAULT_CIRCOMLIB,
        );
        store.write_source(&artifact).unwrap();

        let toolchain = CircomToolchain::new(CircomToolchainConfig {
            circom: dir.path().join("no-such-circom"),
            ..CircomToolchainConfig::default()
        });
        let err = toolchain.compile(&store, &artifact).await.unwrap_err();
        assert!(matches!(err, ToolchainError::Stage { stage: "compile", .. }));
    }

    #[tokio::test]
    async fn test_compile_requires_source() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let artifact = CircuitArtifact::synthesize(
            CircuitId::new("nosource").unwrap(),
            &GridCoordinate::new(1, 0, 2, 0),
            DEFAULT_CIRCOMLIB,
        );
        let err = CircomToolchain::default()
            .compile(&store, &artifact)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolchainError::MissingArtifact(_)));
    }

    #[tokio::test]
    async fn test_compile_reads_archived_source() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let artifact = CircuitArtifact::synthesize(
            CircuitId::new("archived").unwrap(),
            &GridCoordinate::new(1, 0, 2, 0),
            DEFAULT_CIRCOMLIB,
        );
        store.write_source(&artifact).unwrap();
        store.archive_source(&artifact.id).unwrap();
        assert!(!store.source_path(&artifact.id).exists());

        let toolchain = CircomToolchain::new(CircomToolchainConfig {
            circom: dir.path().join("no-such-circom"),
            ..CircomToolchainConfig::default()
        });
        // Gets as far as running the compiler.
        let err = toolchain.compile(&store, &artifact).await.unwrap_err();
        assert!(matches!(err, ToolchainError::Stage { stage: "compile", .. }));
    }
}
