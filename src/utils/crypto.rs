// src/utils/crypto.rs
//! Hashing primitives shared by the trees, the claim codec and the DID layer.
//!
//! Two hash functions are in use:
//! - Keccak-256 (Ethereum's standard hash) for byte strings that never enter a
//!   tree as-is: schema hashes, foreign DIDs, deterministic signing nonces.
//! - Poseidon over the BN254 scalar field for everything that is visible
//!   on-chain: tree nodes, claim index/value hashes and identity states.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{
    find_poseidon_ark_and_mds, PoseidonConfig, PoseidonSponge,
};
use ark_crypto_primitives::sponge::{CryptographicSponge, FieldBasedCryptographicSponge};
use ark_ff::{BigInteger, PrimeField};
use ethers::utils::keccak256;
use ethers_core::utils::hex;
use once_cell::sync::Lazy;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const FULL_ROUNDS: usize = 8;
const PARTIAL_ROUNDS: usize = 57;
const ALPHA: u64 = 5;
const RATE: usize = 2;
const CAPACITY: usize = 1;

/// Poseidon parameters for BN254, derived once per process.
///
/// ## Parameters
/// - Full rounds: 8
/// - Partial rounds: 57
/// - Alpha (S-box): 5
/// - Rate: 2
/// - Capacity: 1
static POSEIDON_CONFIG: Lazy<PoseidonConfig<Fr>> = Lazy::new(generate_poseidon_config);

/// Derives the round constants and MDS matrix with the Grain LFSR.
///
/// The output is a pure function of the parameters above, so every node
/// derives the same configuration and therefore the same tree roots.
pub fn generate_poseidon_config() -> PoseidonConfig<Fr> {
    let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
        Fr::MODULUS_BIT_SIZE as u64,
        RATE,
        FULL_ROUNDS as u64,
        PARTIAL_ROUNDS as u64,
        0,
    );
    PoseidonConfig::new(FULL_ROUNDS, PARTIAL_ROUNDS, ALPHA, mds, ark, RATE, CAPACITY)
}

/// Poseidon sponge hash of a sequence of field elements.
pub fn poseidon_hash(inputs: &[Fr]) -> Fr {
    let mut sponge = PoseidonSponge::<Fr>::new(&POSEIDON_CONFIG);
    for input in inputs {
        sponge.absorb(input);
    }
    sponge.squeeze_native_field_elements(1)[0]
}

/// Poseidon over [`Hash`] values, returning a [`Hash`].
pub fn poseidon_hashes(inputs: &[Hash]) -> Hash {
    let elements: Vec<Fr> = inputs.iter().map(Hash::to_field).collect();
    Hash::from_field(poseidon_hash(&elements))
}

/// Computes a Keccak-256 hash of the input data (Ethereum-compatible).
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    keccak256(data)
}

/// Interprets little-endian bytes as a field element, reducing modulo the field order.
pub fn field_from_le_bytes(bytes: &[u8]) -> Fr {
    Fr::from_le_bytes_mod_order(bytes)
}

/// Little-endian 32-byte encoding of a field element.
pub fn field_to_le_bytes(value: &Fr) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = value.into_bigint().to_bytes_le();
    out[..bytes.len()].copy_from_slice(&bytes);
    out
}

/// Canonical big-endian field element, as stored in trees and states.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_field(value: Fr) -> Self {
        let mut out = [0u8; 32];
        let bytes = value.into_bigint().to_bytes_be();
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        Hash(out)
    }

    pub fn to_field(&self) -> Fr {
        Fr::from_be_bytes_mod_order(&self.0)
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_field(Fr::from(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Bit `index` of the value read as an unsigned integer (bit 0 is the
    /// least significant). This is the tree descent order.
    pub fn bit(&self, index: usize) -> bool {
        if index >= 256 {
            return false;
        }
        (self.0[31 - index / 8] >> (index % 8)) & 1 == 1
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Big-endian 64-bit value carried in the low bytes, if it fits.
    pub fn as_u64(&self) -> Option<u64> {
        if self.0[..24].iter().any(|b| *b != 0) {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[24..]);
        Some(u64::from_be_bytes(buf))
    }
}

impl From<Fr> for Hash {
    fn from(value: Fr) -> Self {
        Hash::from_field(value)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

/// Error returned when parsing a [`Hash`] from text.
#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
    #[error("value is not a canonical field element")]
    NotCanonical,
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| HashParseError::Hex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(HashParseError::Length(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        let hash = Hash(out);
        if Hash::from_field(hash.to_field()) != hash {
            return Err(HashParseError::NotCanonical);
        }
        Ok(hash)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poseidon_is_deterministic() {
        let a = poseidon_hash(&[Fr::from(1u64), Fr::from(2u64)]);
        let b = poseidon_hash(&[Fr::from(1u64), Fr::from(2u64)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_poseidon_depends_on_arity() {
        let two = poseidon_hash(&[Fr::from(1u64), Fr::from(2u64)]);
        let three = poseidon_hash(&[Fr::from(1u64), Fr::from(2u64), Fr::from(0u64)]);
        assert_ne!(two, three);
    }

    #[test]
    fn test_hash_hex_round_trip() {
        let hash = Hash::from_field(poseidon_hash(&[Fr::from(7u64)]));
        let parsed: Hash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_hash_rejects_non_canonical() {
        let all_ones = format!("0x{}", "ff".repeat(32));
        assert!(matches!(all_ones.parse::<Hash>(), Err(HashParseError::NotCanonical)));
    }

    #[test]
    fn test_bits_are_lsb_first() {
        let five = Hash::from_u64(0b101);
        assert!(five.bit(0));
        assert!(!five.bit(1));
        assert!(five.bit(2));
        assert!(!five.bit(3));
        assert_eq!(five.as_u64(), Some(5));
    }

    #[test]
    fn test_le_bytes_round_trip() {
        let value = Fr::from(0xdead_beefu64);
        assert_eq!(field_from_le_bytes(&field_to_le_bytes(&value)), value);
    }
}
