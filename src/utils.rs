use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::LedgerError;

pub const IV_LEN: usize = 16;
pub const EPHEMERAL_KEY_LEN: usize = 65;
pub const MAC_LEN: usize = 32;

/// Last non-empty path segment of a content URL, without query or fragment.
///
/// `https://arweave.net/<id>` yields `<id>`; a URL with no path yields `None`.
pub fn arweave_id_from_url(url: &str) -> Option<&str> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let path = without_fragment.split('?').next().unwrap_or(without_fragment);
    let path = path
        .split_once("://")
        .map(|(_, rest)| rest.split_once('/').map_or("", |(_, p)| p))
        .unwrap_or(path);
    path.rsplit('/').find(|segment| !segment.is_empty())
}

/// Arweave-style identifier: unpadded URL-safe base64 of the SHA-256 digest.
pub fn content_id(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(bytes))
}

/// On-chain coordinate ciphertext: `iv || ephemeralPublicKey || ciphertext || mac`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedCoordinates {
    pub iv: [u8; IV_LEN],
    pub ephemeral_public_key: [u8; EPHEMERAL_KEY_LEN],
    pub ciphertext: Vec<u8>,
    pub mac: [u8; MAC_LEN],
}

impl EncryptedCoordinates {
    pub const MIN_LEN: usize = IV_LEN + EPHEMERAL_KEY_LEN + MAC_LEN;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::MIN_LEN + self.ciphertext.len());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.ephemeral_public_key);
        bytes.extend_from_slice(&self.ciphertext);
        bytes.extend_from_slice(&self.mac);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LedgerError> {
        if bytes.len() < Self::MIN_LEN {
            return Err(LedgerError::Decode(format!(
                "encrypted coordinates need at least {} bytes, got {}",
                Self::MIN_LEN,
                bytes.len()
            )));
        }

        let (iv, rest) = bytes.split_at(IV_LEN);
        let (ephemeral_public_key, rest) = rest.split_at(EPHEMERAL_KEY_LEN);
        let (ciphertext, mac) = rest.split_at(rest.len() - MAC_LEN);

        Ok(Self {
            iv: iv.try_into().map_err(|_| LedgerError::Decode("iv".into()))?,
            ephemeral_public_key: ephemeral_public_key
                .try_into()
                .map_err(|_| LedgerError::Decode("ephemeral public key".into()))?,
            ciphertext: ciphertext.to_vec(),
            mac: mac.try_into().map_err(|_| LedgerError::Decode("mac".into()))?,
        })
    }

    /// `0x`-prefixed lowercase hex, the form stored by the platform contract.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }

    pub fn from_hex(s: &str) -> Result<Self, LedgerError> {
        let stripped = s
            .strip_prefix("0x")
            .ok_or_else(|| LedgerError::Decode("encrypted coordinates must start with 0x".into()))?;
        let bytes = hex::decode(stripped).map_err(|e| LedgerError::Decode(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedCoordinates {
        let mut ephemeral_public_key = [0u8; EPHEMERAL_KEY_LEN];
        ephemeral_public_key[0] = 0x04;
        ephemeral_public_key[64] = 0xee;
        EncryptedCoordinates {
            iv: [0x11; IV_LEN],
            ephemeral_public_key,
            ciphertext: vec![0xab; 48],
            mac: [0x22; MAC_LEN],
        }
    }

    #[test]
    fn test_wire_layout_offsets() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), 16 + 65 + 48 + 32);
        assert_eq!(&bytes[..16], &[0x11; 16]);
        assert_eq!(bytes[16], 0x04);
        assert_eq!(bytes[80], 0xee);
        assert_eq!(&bytes[81..129], &[0xab; 48][..]);
        assert_eq!(&bytes[129..], &[0x22; 32]);
    }

    #[test]
    fn test_hex_form() {
        let hex = sample().to_hex();
        assert!(hex.starts_with("0x1111"));
        assert_eq!(hex.len(), 2 + 2 * (16 + 65 + 48 + 32));
        assert_eq!(EncryptedCoordinates::from_hex(&hex).unwrap(), sample());
    }

    #[test]
    fn test_empty_ciphertext_is_allowed() {
        let mut value = sample();
        value.ciphertext.clear();
        let decoded = EncryptedCoordinates::from_bytes(&value.to_bytes()).unwrap();
        assert!(decoded.ciphertext.is_empty());
    }

    #[test]
    fn test_short_blob_is_rejected() {
        assert!(EncryptedCoordinates::from_bytes(&[0u8; 112]).is_err());
        assert!(EncryptedCoordinates::from_hex("1234").is_err());
    }

    #[test]
    fn test_arweave_id_from_url() {
        assert_eq!(arweave_id_from_url("https://arweave.net/abc_DEF-1"), Some("abc_DEF-1"));
        assert_eq!(arweave_id_from_url("https://arweave.net/abc/"), Some("abc"));
        assert_eq!(arweave_id_from_url("https://arweave.net/abc?ext=png"), Some("abc"));
        assert_eq!(arweave_id_from_url("ar://xyz"), None);
        assert_eq!(arweave_id_from_url("https://arweave.net"), None);
        assert_eq!(arweave_id_from_url("plain-id"), Some("plain-id"));
    }

    #[test]
    fn test_content_id_shape() {
        let id = content_id(b"witness generator");
        assert_eq!(id.len(), 43);
        assert!(!id.contains('='));
        assert_eq!(id, content_id(b"witness generator"));
    }
}
