//! Content-addressed artifact store and the shared trusted-setup parameters.
//!
//! Every file produced for a contribution lives under one root and is keyed by
//! its [`CircuitId`]. Stage completion is tracked in a bincode manifest so that
//! re-running a stage for an unchanged circuit is a no-op.

use std::{
    collections::BTreeMap,
    fs::{self, create_dir_all, File},
    io::{BufReader, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Instant,
};

use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    circuits::{CircuitArtifact, CircuitId},
    error::ToolchainError,
};

pub const CIRCUITS_DIR: &str = "circuits";
pub const CONTRACTS_DIR: &str = "contracts";
pub const ARCHIVE_DIR: &str = "archive";
pub const PROOFS_DIR: &str = "proofs";
pub const MANIFEST_FILE: &str = "manifest.bin";

/// Shared powers-of-tau file. Read-only; loaded once per process.
#[derive(Debug, Clone)]
pub struct TrustedSetup {
    path: PathBuf,
    digest: [u8; 32],
    len: u64,
}

impl TrustedSetup {
    /// Map the file and digest it. A missing file is [`ToolchainError::SetupMissing`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ToolchainError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ToolchainError::SetupMissing(path.to_path_buf()));
        }

        let t0 = Instant::now();
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(ToolchainError::Stage {
                stage: "setup",
                circuit: "*".into(),
                reason: format!("trusted setup file {} is empty", path.display()),
            });
        }
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let digest: [u8; 32] = Sha256::digest(&mmap[..]).into();
        info!(
            elapsed_ms = t0.elapsed().as_millis(),
            bytes = len,
            "Loaded trusted setup from {}",
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            digest,
            len,
        })
    }

    /// In-memory parameters for the simulated toolchain.
    pub fn from_bytes(label: impl Into<PathBuf>, bytes: &[u8]) -> Self {
        Self {
            path: label.into(),
            digest: Sha256::digest(bytes).into(),
            len: bytes.len() as u64,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Stage progress for one circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub source_digest: [u8; 32],
    pub compiled: bool,
    pub keyed: bool,
    pub witness_cid: Option<String>,
    pub verifier_digest: Option<[u8; 32]>,
    pub deployed_at: Option<[u8; 20]>,
    pub archived: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ArtifactManifest {
    entries: BTreeMap<CircuitId, ArtifactRecord>,
}

/// Paths for one proof attempt, all inside a directory of their own.
#[derive(Debug, Clone)]
pub struct ProofPaths {
    pub dir: PathBuf,
    pub input: PathBuf,
    pub proof: PathBuf,
    pub public: PathBuf,
}

impl ProofPaths {
    /// Delete the attempt directory once its outputs have been consumed.
    pub fn remove(&self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Could not remove proof attempt {}", self.dir.display()),
        }
    }
}

/// Filesystem namespace for all circuit artifacts, passed by reference.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    manifest: Mutex<ArtifactManifest>,
    attempts: AtomicU64,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ToolchainError> {
        let root = root.into();
        for dir in [CIRCUITS_DIR, CONTRACTS_DIR, ARCHIVE_DIR, PROOFS_DIR] {
            create_dir_all(root.join(dir))?;
        }

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = if manifest_path.is_file() {
            let file = File::open(&manifest_path)?;
            bincode::deserialize_from(&mut BufReader::new(file))
                .map_err(|e| ToolchainError::Manifest(e.to_string()))?
        } else {
            ArtifactManifest::default()
        };
        debug!(
            root = %root.display(),
            circuits = manifest.entries.len(),
            "Opened artifact store"
        );

        Ok(Self {
            root,
            manifest: Mutex::new(manifest),
            attempts: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stem(id: &CircuitId) -> String {
        format!("coordinate-circuit-{id}")
    }

    pub fn source_path(&self, id: &CircuitId) -> PathBuf {
        self.root
            .join(CIRCUITS_DIR)
            .join(format!("{}.circom", Self::stem(id)))
    }

    pub fn archived_source_path(&self, id: &CircuitId) -> PathBuf {
        self.root
            .join(ARCHIVE_DIR)
            .join(format!("{}.circom", Self::stem(id)))
    }

    /// Live source, or its archived copy once the verifier is deployed.
    pub fn existing_source(&self, id: &CircuitId) -> Result<PathBuf, ToolchainError> {
        let live = self.source_path(id);
        if live.is_file() {
            return Ok(live);
        }
        let archived = self.archived_source_path(id);
        if archived.is_file() {
            Ok(archived)
        } else {
            Err(ToolchainError::MissingArtifact(live))
        }
    }

    pub fn circuits_dir(&self) -> PathBuf {
        self.root.join(CIRCUITS_DIR)
    }

    pub fn r1cs_path(&self, id: &CircuitId) -> PathBuf {
        self.circuits_dir().join(format!("{}.r1cs", Self::stem(id)))
    }

    pub fn wasm_path(&self, id: &CircuitId) -> PathBuf {
        let stem = Self::stem(id);
        self.circuits_dir()
            .join(format!("{stem}_js"))
            .join(format!("{stem}.wasm"))
    }

    pub fn zkey_path(&self, id: &CircuitId) -> PathBuf {
        self.circuits_dir().join(format!("{}.zkey", Self::stem(id)))
    }

    pub fn verifier_source_path(&self, id: &CircuitId) -> PathBuf {
        self.root
            .join(CONTRACTS_DIR)
            .join(format!("coordinate-verifier-{id}.sol"))
    }

    pub fn verifier_bytecode_path(&self, id: &CircuitId) -> PathBuf {
        self.root
            .join(CONTRACTS_DIR)
            .join(format!("coordinate-verifier-{id}.bin"))
    }

    /// Fresh directory for one witness/proof attempt.
    ///
    /// Attempt names include the process id so concurrent runs over the same
    /// root never share files.
    pub fn proof_paths(&self, id: &CircuitId) -> Result<ProofPaths, ToolchainError> {
        let n = self.attempts.fetch_add(1, Ordering::Relaxed);
        let dir = self
            .root
            .join(PROOFS_DIR)
            .join(id.as_str())
            .join(format!("{}-{n}", std::process::id()));
        create_dir_all(&dir)?;
        Ok(ProofPaths {
            input: dir.join("input.json"),
            proof: dir.join("proof.json"),
            public: dir.join("public.json"),
            dir,
        })
    }

    /// Write the circuit source unless an identical one is already recorded.
    ///
    /// Returns `true` when the source changed; earlier stage results are then dropped.
    /// A circuit with a deployed verifier keeps its recorded source; a different
    /// one is [`ToolchainError::AlreadyDeployed`].
    pub fn write_source(&self, artifact: &CircuitArtifact) -> Result<bool, ToolchainError> {
        let path = self.source_path(&artifact.id);
        if let Some(record) = self.record(&artifact.id)? {
            let same = record.source_digest == artifact.source_digest;
            if record.deployed_at.is_some() {
                if !same {
                    return Err(ToolchainError::AlreadyDeployed {
                        circuit: artifact.id.to_string(),
                    });
                }
                return Ok(false);
            }
            if same && (path.is_file() || record.archived) {
                debug!(circuit = %artifact.id, "Circuit source unchanged");
                return Ok(false);
            }
        }

        write_file(&path, artifact.source.as_bytes())?;
        self.update(&artifact.id, |record| {
            *record = ArtifactRecord {
                source_digest: artifact.source_digest,
                ..ArtifactRecord::default()
            };
        })?;
        info!(circuit = %artifact.id, "Wrote circuit source to {}", path.display());
        Ok(true)
    }

    pub fn record(&self, id: &CircuitId) -> Result<Option<ArtifactRecord>, ToolchainError> {
        let manifest = self.lock()?;
        Ok(manifest.entries.get(id).cloned())
    }

    /// Ids of every circuit whose keys were generated.
    pub fn keyed_circuits(&self) -> Result<Vec<CircuitId>, ToolchainError> {
        let manifest = self.lock()?;
        Ok(manifest
            .entries
            .iter()
            .filter(|(_, r)| r.keyed)
            .map(|(id, _)| id.clone())
            .collect())
    }

    /// Mutate a record and persist the manifest.
    pub fn update<F>(&self, id: &CircuitId, f: F) -> Result<ArtifactRecord, ToolchainError>
    where
        F: FnOnce(&mut ArtifactRecord),
    {
        let mut manifest = self.lock()?;
        let record = manifest.entries.entry(id.clone()).or_default();
        f(record);
        let updated = record.clone();
        self.persist(&manifest)?;
        Ok(updated)
    }

    /// Move the circuit source out of the working directory after deployment.
    /// Proving material stays where it is.
    pub fn archive_source(&self, id: &CircuitId) -> Result<(), ToolchainError> {
        let from = self.source_path(id);
        if from.is_file() {
            let to = self.archived_source_path(id);
            fs::rename(&from, &to)?;
            debug!(circuit = %id, "Archived circuit source to {}", to.display());
        }
        self.update(id, |record| record.archived = true)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ArtifactManifest>, ToolchainError> {
        self.manifest
            .lock()
            .map_err(|_| ToolchainError::Manifest("manifest lock poisoned".into()))
    }

    fn persist(&self, manifest: &ArtifactManifest) -> Result<(), ToolchainError> {
        let bytes =
            bincode::serialize(manifest).map_err(|e| ToolchainError::Manifest(e.to_string()))?;
        let path = self.root.join(MANIFEST_FILE);
        let tmp = path.with_extension("bin.tmp");
        write_file(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

pub(crate) fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ToolchainError> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    Ok(())
}

/// Require that an earlier stage left `path` behind.
pub(crate) fn require(path: &Path) -> Result<(), ToolchainError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ToolchainError::MissingArtifact(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::GridCoordinate;
    use tempfile::TempDir;

    fn artifact(id: &str, coordinate: GridCoordinate) -> CircuitArtifact {
        CircuitArtifact::synthesize(CircuitId::new(id).unwrap(), &coordinate, "circomlib")
    }

    #[test]
    fn test_missing_setup_is_fatal_error() {
        let dir = TempDir::new().unwrap();
        let err = TrustedSetup::load(dir.path().join("pot14_final.ptau")).unwrap_err();
        assert!(matches!(err, ToolchainError::SetupMissing(_)));
    }

    #[test]
    fn test_setup_digest_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pot.ptau");
        fs::write(&path, b"powers of tau").unwrap();
        let a = TrustedSetup::load(&path).unwrap();
        let b = TrustedSetup::from_bytes("mem", b"powers of tau");
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.len(), 13);
    }

    #[test]
    fn test_write_source_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let a = artifact("abc", GridCoordinate::new(-23, 11, 18, 22));

        assert!(store.write_source(&a).unwrap());
        store.update(&a.id, |r| r.compiled = true).unwrap();
        assert!(!store.write_source(&a).unwrap());
        assert!(store.record(&a.id).unwrap().unwrap().compiled);

        let changed = artifact("abc", GridCoordinate::new(-23, 30, 18, 22));
        assert!(store.write_source(&changed).unwrap());
        assert!(!store.record(&a.id).unwrap().unwrap().compiled);
    }

    #[test]
    fn test_deployed_source_is_frozen() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let a = artifact("abc", GridCoordinate::new(-23, 11, 18, 22));
        store.write_source(&a).unwrap();
        store
            .update(&a.id, |r| {
                r.compiled = true;
                r.keyed = true;
                r.deployed_at = Some([7u8; 20]);
            })
            .unwrap();
        store.archive_source(&a.id).unwrap();
        let before = store.record(&a.id).unwrap().unwrap();

        let changed = artifact("abc", GridCoordinate::new(-23, 30, 18, 30));
        let err = store.write_source(&changed).unwrap_err();
        assert!(matches!(err, ToolchainError::AlreadyDeployed { .. }));
        assert!(!store.write_source(&a).unwrap());
        assert_eq!(store.record(&a.id).unwrap().unwrap(), before);
        assert!(!store.source_path(&a.id).exists());
    }

    #[test]
    fn test_manifest_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let a = artifact("persisted", GridCoordinate::new(1, 0, 2, 0));
        {
            let store = ArtifactStore::open(dir.path()).unwrap();
            store.write_source(&a).unwrap();
            store.update(&a.id, |r| r.keyed = true).unwrap();
        }
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert_eq!(store.keyed_circuits().unwrap(), vec![a.id.clone()]);
    }

    #[test]
    fn test_archive_moves_source_only() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let a = artifact("arch", GridCoordinate::new(1, 0, 2, 0));
        store.write_source(&a).unwrap();
        write_file(&store.zkey_path(&a.id), b"zkey").unwrap();

        store.archive_source(&a.id).unwrap();
        assert!(!store.source_path(&a.id).exists());
        assert!(store.archived_source_path(&a.id).is_file());
        assert!(store.zkey_path(&a.id).is_file());
        assert!(!store.write_source(&a).unwrap());
    }

    #[test]
    fn test_artifact_names() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let id = CircuitId::new("xyz").unwrap();
        assert!(store
            .wasm_path(&id)
            .ends_with("circuits/coordinate-circuit-xyz_js/coordinate-circuit-xyz.wasm"));
        assert!(store
            .verifier_source_path(&id)
            .ends_with("contracts/coordinate-verifier-xyz.sol"));
        let first = store.proof_paths(&id).unwrap();
        let second = store.proof_paths(&id).unwrap();
        assert_ne!(first.proof, second.proof);
    }
}
