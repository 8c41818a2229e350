use std::{future::Future, sync::Arc, time::Duration, time::Instant};

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    circuits::{inputs::verify_inputs, CircuitArtifact, CircuitId},
    content::ContentStore,
    coordinate::GridCoordinate,
    error::ToolchainError,
    setup::{ArtifactStore, TrustedSetup},
    toolchain::{compiled_circuit, load_keys, CircuitKeys, CompiledCircuit, ProofBundle, ProofToolchain},
};

/// Drives circuits through the toolchain stages.
///
/// At most `max_concurrent` stages run at once across all circuits and each
/// stage is bounded by `stage_timeout`. Completed stages are recorded in the
/// artifact manifest and skipped on later runs.
pub struct CircuitProver {
    toolchain: Arc<dyn ProofToolchain>,
    store: Arc<ArtifactStore>,
    content: Arc<dyn ContentStore>,
    params: Arc<TrustedSetup>,
    permits: Semaphore,
    stage_timeout: Duration,
}

impl CircuitProver {
    pub fn new(
        toolchain: Arc<dyn ProofToolchain>,
        store: Arc<ArtifactStore>,
        content: Arc<dyn ContentStore>,
        params: Arc<TrustedSetup>,
        max_concurrent: usize,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            toolchain,
            store,
            content,
            params,
            permits: Semaphore::new(max_concurrent.max(1)),
            stage_timeout,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn content(&self) -> &dyn ContentStore {
        self.content.as_ref()
    }

    pub fn toolchain_name(&self) -> &'static str {
        self.toolchain.name()
    }

    /// Run one stage under the concurrency limit and the stage timeout.
    async fn stage<T, F>(&self, stage: &'static str, id: &CircuitId, fut: F) -> Result<T, ToolchainError>
    where
        F: Future<Output = Result<T, ToolchainError>>,
    {
        let _permit = self.permits.acquire().await.map_err(|_| ToolchainError::Stage {
            stage,
            circuit: id.to_string(),
            reason: "prover is shutting down".into(),
        })?;

        let t0 = Instant::now();
        match tokio::time::timeout(self.stage_timeout, fut).await {
            Ok(result) => {
                info!(
                    circuit = %id,
                    elapsed_ms = t0.elapsed().as_millis(),
                    ok = result.is_ok(),
                    "{} {stage}",
                    self.toolchain.name()
                );
                result
            }
            Err(_) => {
                warn!(circuit = %id, timeout_secs = self.stage_timeout.as_secs(), "{stage} timed out");
                Err(ToolchainError::StageTimeout {
                    stage,
                    circuit: id.to_string(),
                    timeout_secs: self.stage_timeout.as_secs(),
                })
            }
        }
    }

    /// Source → compiled circuit → published witness generator → keys.
    ///
    /// Idempotent: an unchanged circuit whose stages completed earlier is
    /// loaded from disk without invoking the toolchain.
    pub async fn prepare(&self, artifact: &CircuitArtifact) -> Result<CircuitKeys, ToolchainError> {
        let id = &artifact.id;
        let t0 = Instant::now();
        self.store.write_source(artifact)?;
        let record = self.store.record(id)?.unwrap_or_default();

        let (compiled, fresh) = match record.compiled.then(|| compiled_circuit(&self.store, id)) {
            Some(Ok(compiled)) => {
                debug!(circuit = %id, "Reusing compiled circuit");
                (compiled, false)
            }
            _ => {
                let compiled = self
                    .stage("compile", id, self.toolchain.compile(&self.store, artifact))
                    .await?;
                self.store.update(id, |r| r.compiled = true)?;
                (compiled, true)
            }
        };

        if fresh || record.witness_cid.is_none() {
            self.publish_witness_generator(&compiled).await?;
        }

        if !fresh && record.keyed {
            if let Ok(keys) = load_keys(&self.store, id) {
                debug!(circuit = %id, "Reusing proving key");
                return Ok(keys);
            }
        }

        let keys = self
            .stage(
                "setup",
                id,
                self.toolchain.setup(&self.store, &compiled, &self.params),
            )
            .await?;
        self.store.update(id, |r| {
            r.keyed = true;
            r.verifier_digest = Some(keys.verifier.key_digest);
        })?;
        info!(
            circuit = %id,
            elapsed_ms = t0.elapsed().as_millis(),
            bytecode_bytes = keys.verifier.bytecode.len(),
            "Circuit prepared"
        );
        Ok(keys)
    }

    async fn publish_witness_generator(&self, compiled: &CompiledCircuit) -> Result<String, ToolchainError> {
        let bytes = tokio::fs::read(&compiled.witness_generator).await?;
        let cid = self.content.put(bytes).await?;
        self.store
            .update(&compiled.id, |r| r.witness_cid = Some(cid.clone()))?;
        debug!(circuit = %compiled.id, cid = %cid, "Published witness generator");
        Ok(cid)
    }

    /// Keys for a circuit prepared earlier, possibly by another process.
    pub fn keys(&self, id: &CircuitId) -> Result<Option<CircuitKeys>, ToolchainError> {
        match self.store.record(id)? {
            Some(record) if record.keyed => load_keys(&self.store, id).map(Some),
            _ => Ok(None),
        }
    }

    /// Witness + proof for `query`. A zero output is a successful proof.
    ///
    /// A failed attempt leaves no files behind; a successful one keeps them
    /// until [`CircuitProver::discard`].
    pub async fn prove(
        &self,
        keys: &CircuitKeys,
        query: &GridCoordinate,
    ) -> Result<ProofBundle, ToolchainError> {
        let inputs = verify_inputs(query);
        let paths = self.store.proof_paths(&keys.id)?;
        let proved = self
            .stage("prove", &keys.id, self.toolchain.prove(keys, &inputs, paths.clone()))
            .await;
        if proved.is_err() {
            paths.remove();
        }
        proved
    }

    /// Drop the files of a proof whose calldata has been exported.
    pub fn discard(&self, bundle: &ProofBundle) {
        bundle.paths.remove();
        debug!(circuit = %bundle.id, "Removed proof attempt {}", bundle.paths.dir.display());
    }

    pub async fn export_calldata(&self, bundle: &ProofBundle) -> Result<String, ToolchainError> {
        self.stage(
            "calldata export",
            &bundle.id,
            self.toolchain.export_calldata(bundle),
        )
        .await
    }
}
