// src/models/did.rs
//! Decentralized Identifier (DID) model.
//!
//! Issuer DIDs are self-certifying: the method-specific identifier is a
//! 31-byte ID derived from the identity's genesis state,
//!
//! ```text
//! did:<method>:<network>:<hex(type ‖ genesis ‖ checksum)>
//! ```
//!
//! where `type` is 2 bytes, `genesis` is the last 27 bytes of the
//! little-endian genesis state and `checksum` is the wrapping u16 sum of the
//! preceding 29 bytes, little-endian. Any other syntactically valid DID is
//! accepted as a credential subject.

use crate::models::state::KeyType;
use crate::utils::crypto::{field_from_le_bytes, field_to_le_bytes, hash_data, Hash};
use ark_bn254::Fr;
use ethers_core::utils::hex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ID_LENGTH: usize = 31;
const GENESIS_LENGTH: usize = 27;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DidError {
    #[error("malformed DID '{0}'")]
    Malformed(String),
    #[error("DID '{0}' has an invalid identifier checksum")]
    Checksum(String),
}

/// A syntactically valid DID in canonical string form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

impl Did {
    pub fn parse(text: &str) -> Result<Self, DidError> {
        let malformed = || DidError::Malformed(text.to_string());
        let mut parts = text.splitn(3, ':');
        let (scheme, method, rest) = (parts.next(), parts.next(), parts.next());
        if scheme != Some("did") {
            return Err(malformed());
        }
        let method = method.ok_or_else(malformed)?;
        let rest = rest.ok_or_else(malformed)?;
        if method.is_empty() || !method.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(malformed());
        }
        if rest.is_empty()
            || rest.ends_with(':')
            || !rest.chars().all(|c| c.is_ascii_alphanumeric() || ".-_:%".contains(c))
        {
            return Err(malformed());
        }
        let did = Did(text.to_string());
        // Identifiers that look like ours must carry a valid checksum.
        if let Some(last) = did.last_component() {
            if last.len() == ID_LENGTH * 2 && last.chars().all(|c| c.is_ascii_hexdigit()) && did.id_bytes().is_none() {
                return Err(DidError::Checksum(text.to_string()));
            }
        }
        Ok(did)
    }

    /// Derives an issuer DID from its genesis state.
    pub fn from_genesis(method: &str, network: &str, key_type: KeyType, genesis_state: &Hash) -> Self {
        let mut id = [0u8; ID_LENGTH];
        id[..2].copy_from_slice(&id_type(key_type));
        let state_le = field_to_le_bytes(&genesis_state.to_field());
        id[2..2 + GENESIS_LENGTH].copy_from_slice(&state_le[32 - GENESIS_LENGTH..]);
        let checksum = checksum(&id[..2 + GENESIS_LENGTH]);
        id[2 + GENESIS_LENGTH..].copy_from_slice(&checksum.to_le_bytes());
        Did(format!("did:{}:{}:{}", method, network, hex::encode(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn last_component(&self) -> Option<&str> {
        self.0.rsplit(':').next()
    }

    /// The 31-byte identifier, when this DID was derived from a genesis state.
    pub fn id_bytes(&self) -> Option<[u8; ID_LENGTH]> {
        let last = self.last_component()?;
        let bytes = hex::decode(last).ok()?;
        if bytes.len() != ID_LENGTH {
            return None;
        }
        let expected = checksum(&bytes[..2 + GENESIS_LENGTH]).to_le_bytes();
        if bytes[2 + GENESIS_LENGTH..] != expected {
            return None;
        }
        let mut out = [0u8; ID_LENGTH];
        out.copy_from_slice(&bytes);
        Some(out)
    }

    /// Field element placed in the claim's subject slot.
    ///
    /// Foreign DIDs are mapped to the last 31 bytes of their Keccak-256 hash
    /// so they fit in a field element.
    pub fn subject_id(&self) -> Fr {
        match self.id_bytes() {
            Some(id) => field_from_le_bytes(&id),
            None => {
                let digest = hash_data(self.0.as_bytes());
                field_from_le_bytes(&digest[32 - ID_LENGTH..])
            }
        }
    }
}

fn id_type(key_type: KeyType) -> [u8; 2] {
    match key_type {
        KeyType::BabyJubJub => [0x01, 0x00],
        KeyType::Ethereum => [0x01, 0x01],
    }
}

fn checksum(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.0)
    }
}

impl FromStr for Did {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Did::parse(s)
    }
}

impl TryFrom<String> for Did {
    type Error = DidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Did::parse(&value)
    }
}

impl From<Did> for String {
    fn from(value: Did) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::crypto::poseidon_hashes;

    #[test]
    fn test_genesis_did_round_trip() {
        let state = Hash::from_u64(123456789);
        let did = Did::from_genesis("iden3", "polygon:amoy", KeyType::BabyJubJub, &state);
        assert!(did.as_str().starts_with("did:iden3:polygon:amoy:"));
        let parsed = Did::parse(did.as_str()).unwrap();
        assert_eq!(parsed, did);
        assert!(parsed.id_bytes().is_some());
    }

    #[test]
    fn test_genesis_did_depends_on_state() {
        let first = poseidon_hashes(&[Hash::from_u64(1)]);
        let second = poseidon_hashes(&[Hash::from_u64(2)]);
        let a = Did::from_genesis("iden3", "main", KeyType::BabyJubJub, &first);
        let b = Did::from_genesis("iden3", "main", KeyType::BabyJubJub, &second);
        assert_ne!(a, b);
        assert_ne!(a, Did::from_genesis("iden3", "main", KeyType::Ethereum, &first));
    }

    #[test]
    fn test_genesis_did_keeps_high_bytes_only() {
        // Only the top 27 little-endian bytes survive, so states differing in
        // their low 5 bytes share an identifier.
        let a = Did::from_genesis("iden3", "main", KeyType::BabyJubJub, &Hash::from_u64(1));
        let b = Did::from_genesis("iden3", "main", KeyType::BabyJubJub, &Hash::from_u64(0xff_ffff_ffff));
        assert_eq!(a, b);
        let c = Did::from_genesis("iden3", "main", KeyType::BabyJubJub, &Hash::from_u64(1 << 40));
        assert_ne!(a, c);
    }

    #[test]
    fn test_foreign_did_accepted() {
        let did = Did::parse("did:x:alice").unwrap();
        assert!(did.id_bytes().is_none());
        assert_eq!(did.subject_id(), Did::parse("did:x:alice").unwrap().subject_id());
        assert_ne!(did.subject_id(), Did::parse("did:x:bob").unwrap().subject_id());
    }

    #[test]
    fn test_malformed_dids_rejected() {
        for bad in ["", "did", "did:", "did::x", "did:X:y", "web:x:y", "did:x:", "did:x:a b"] {
            assert!(Did::parse(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let did = Did::from_genesis("iden3", "main", KeyType::Ethereum, &Hash::from_u64(9));
        let mut text = did.as_str().to_string();
        let last = text.pop().unwrap();
        text.push(if last == '0' { '1' } else { '0' });
        assert!(matches!(Did::parse(&text), Err(DidError::Checksum(_))));
    }
}
