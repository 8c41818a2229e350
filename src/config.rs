//! TOML configuration for the pipeline.
//!
//! Every field has a default so partial files work. A few settings can be
//! overridden from the environment, and the CLI overrides both.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    circuits::grid_circuit::DEFAULT_CIRCOMLIB,
    error::{Error, Result},
    toolchain::CircomToolchainConfig,
};

pub const ENV_RPC_URL: &str = "GEOGRID_RPC_URL";
pub const ENV_PTAU: &str = "GEOGRID_PTAU";
pub const ENV_MAX_CONCURRENT: &str = "GEOGRID_MAX_CONCURRENT";

const DEFAULT_MAX_CONCURRENT: usize = 2;
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_FUZZ_TRIALS: usize = 1000;
const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";
const DEFAULT_QUERY: &str = "23° 6' 0\" S, 18° 18' 0\" E";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub fuzz: FuzzConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_root")]
    pub root: PathBuf,
    #[serde(default = "default_circomlib")]
    pub circomlib: String,
    /// Directory for the local content store.
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default = "default_ptau")]
    pub ptau: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolchainKind {
    #[default]
    Circom,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    #[serde(default)]
    pub kind: ToolchainKind,
    #[serde(default = "default_circom")]
    pub circom: PathBuf,
    #[serde(default = "default_snarkjs")]
    pub snarkjs: PathBuf,
    #[serde(default = "default_solc")]
    pub solc: Option<PathBuf>,
    #[serde(default)]
    pub include: Option<PathBuf>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Address of the platform contract, `0x`-prefixed.
    #[serde(default)]
    pub platform_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Coordinate a reviewer checks every bound verifier against.
    #[serde(default = "default_query")]
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzConfig {
    #[serde(default = "default_fuzz_trials")]
    pub trials: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            root: default_artifacts_root(),
            circomlib: default_circomlib(),
            content_dir: default_content_dir(),
        }
    }
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self { ptau: default_ptau() }
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            kind: ToolchainKind::default(),
            circom: default_circom(),
            snarkjs: default_snarkjs(),
            solc: default_solc(),
            include: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            platform_address: None,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            query: default_query(),
        }
    }
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            trials: DEFAULT_FUZZ_TRIALS,
            seed: None,
        }
    }
}

fn default_artifacts_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_circomlib() -> String {
    DEFAULT_CIRCOMLIB.to_string()
}

fn default_content_dir() -> PathBuf {
    PathBuf::from("artifacts/content")
}

fn default_ptau() -> PathBuf {
    PathBuf::from("data/pot14_final.ptau")
}

fn default_circom() -> PathBuf {
    PathBuf::from("circom")
}

fn default_snarkjs() -> PathBuf {
    PathBuf::from("snarkjs")
}

fn default_solc() -> Option<PathBuf> {
    Some(PathBuf::from("solc"))
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_stage_timeout_secs() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

fn default_rpc_url() -> String {
    DEFAULT_RPC_URL.to_string()
}

fn default_query() -> String {
    DEFAULT_QUERY.to_string()
}

fn default_fuzz_trials() -> usize {
    DEFAULT_FUZZ_TRIALS
}

impl ToolchainConfig {
    pub fn circom_config(&self) -> CircomToolchainConfig {
        CircomToolchainConfig {
            circom: self.circom.clone(),
            snarkjs: self.snarkjs.clone(),
            solc: self.solc.clone(),
            include: self.include.clone(),
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse config file {}: {e}", path.display()))
        })
    }

    pub fn load_from_file_or_default(path: &Path) -> Self {
        Self::load_from_file(path).unwrap_or_default()
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("failed to write {}: {e}", path.display())))
    }

    /// Apply `GEOGRID_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_RPC_URL) {
            self.ledger.rpc_url = url;
        }
        if let Some(ptau) = lookup(ENV_PTAU) {
            self.setup.ptau = PathBuf::from(ptau);
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENT) {
            let parsed: usize = value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_MAX_CONCURRENT}={value:?} is not a number")))?;
            if parsed == 0 {
                return Err(Error::Config(format!("{ENV_MAX_CONCURRENT} must be at least 1")));
            }
            self.toolchain.max_concurrent = parsed;
        }
        Ok(())
    }
}
