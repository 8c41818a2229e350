//! Per-contribution circuit instances.

pub mod grid_circuit;
pub mod inputs;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{coordinate::GridCoordinate, error::ToolchainError, utils::arweave_id_from_url};

use grid_circuit::GridCircuit;

/// Stable per-contribution key for every artifact derived from its circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitId(String);

impl CircuitId {
    pub fn new(id: impl Into<String>) -> Result<Self, ToolchainError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 128
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(id))
        } else {
            Err(ToolchainError::InvalidCircuitId(id))
        }
    }

    /// Derive the id from a content reference such as `https://arweave.net/<id>`.
    pub fn from_content_url(url: &str) -> Result<Self, ToolchainError> {
        let id = arweave_id_from_url(url)
            .ok_or_else(|| ToolchainError::InvalidCircuitId(url.to_string()))?;
        Self::new(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generated circuit source for one contribution. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitArtifact {
    pub id: CircuitId,
    pub circuit: GridCircuit,
    pub source: String,
    pub source_digest: [u8; 32],
}

impl CircuitArtifact {
    pub fn synthesize(id: CircuitId, true_coordinate: &GridCoordinate, circomlib: &str) -> Self {
        let circuit = GridCircuit::new(true_coordinate);
        let source = circuit.synthesize(circomlib);
        let source_digest = GridCircuit::source_digest(&source);
        Self {
            id,
            circuit,
            source,
            source_digest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_id_from_arweave_url() {
        let id = CircuitId::from_content_url("https://arweave.net/bNbA3TEQVL60xlgCcqdz4ZPHFZ711cZ3hmkpGttDt_U")
            .unwrap();
        assert_eq!(id.as_str(), "bNbA3TEQVL60xlgCcqdz4ZPHFZ711cZ3hmkpGttDt_U");
    }

    #[test]
    fn test_circuit_id_rejects_path_tricks() {
        assert!(CircuitId::new("../etc").is_err());
        assert!(CircuitId::new("").is_err());
        assert!(CircuitId::from_content_url("https://arweave.net/").is_err());
    }

    #[test]
    fn test_resynthesis_is_byte_identical() {
        let id = CircuitId::new("abc").unwrap();
        let coordinate = GridCoordinate::new(-23, 11, 18, 22);
        let a = CircuitArtifact::synthesize(id.clone(), &coordinate, grid_circuit::DEFAULT_CIRCOMLIB);
        let b = CircuitArtifact::synthesize(id, &coordinate, grid_circuit::DEFAULT_CIRCOMLIB);
        assert_eq!(a, b);
    }
}
