// src/wallet/babyjubjub.rs
//! Schnorr signatures over BabyJubJub.
//!
//! BabyJubJub is the twisted Edwards curve whose base field is the BN254
//! scalar field, so public-key coordinates fit directly into claim slots and
//! the challenge can be computed with the same Poseidon instance the trees use:
//!
//! ```text
//! R = r·G,  e = Poseidon(R.x, R.y, A.x, A.y, m),  s = r + e·a
//! verify: s·G == R + e·A
//! ```
//!
//! The nonce `r` is derived deterministically from the secret key and the
//! message, so signing needs no randomness.

use crate::utils::crypto::{field_to_le_bytes, hash_data, poseidon_hash};
use ark_bn254::Fr;
use ark_ec::{AffineRepr, CurveGroup};
use ark_ed_on_bn254::{EdwardsAffine, EdwardsProjective, Fr as Scalar};
use ark_ff::{BigInteger, PrimeField};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::UniformRand;
use rand::rngs::OsRng;

pub const PUBLIC_KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BjjError {
    #[error("invalid BabyJubJub public key")]
    InvalidPublicKey,
    #[error("invalid BabyJubJub signature encoding")]
    InvalidSignature,
    #[error("point serialization failed")]
    Serialization,
}

#[derive(Clone)]
pub struct SecretKey(Scalar);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(EdwardsAffine);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    r: EdwardsAffine,
    s: Scalar,
}

fn to_base_field(value: &ark_ed_on_bn254::Fq) -> Fr {
    Fr::from_le_bytes_mod_order(&value.into_bigint().to_bytes_le())
}

fn challenge(r: &EdwardsAffine, public_key: &EdwardsAffine, message: &Fr) -> Scalar {
    let e = poseidon_hash(&[
        to_base_field(&r.x),
        to_base_field(&r.y),
        to_base_field(&public_key.x),
        to_base_field(&public_key.y),
        *message,
    ]);
    Scalar::from_le_bytes_mod_order(&field_to_le_bytes(&e))
}

impl SecretKey {
    pub fn random() -> Self {
        Self(Scalar::rand(&mut OsRng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey((EdwardsAffine::generator() * self.0).into_affine())
    }

    fn nonce(&self, message: &Fr) -> Scalar {
        let mut seed = Vec::with_capacity(65);
        seed.extend_from_slice(&self.0.into_bigint().to_bytes_le());
        seed.extend_from_slice(&field_to_le_bytes(message));
        let mut wide = Vec::with_capacity(64);
        for domain in [0u8, 1u8] {
            seed.push(domain);
            wide.extend_from_slice(&hash_data(&seed));
            seed.pop();
        }
        Scalar::from_le_bytes_mod_order(&wide)
    }

    pub fn sign(&self, message: &Fr) -> Signature {
        let r = self.nonce(message);
        let big_r = (EdwardsAffine::generator() * r).into_affine();
        let e = challenge(&big_r, &self.public_key().0, message);
        Signature { r: big_r, s: r + e * self.0 }
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BjjError> {
        let point = EdwardsAffine::deserialize_compressed(bytes).map_err(|_| BjjError::InvalidPublicKey)?;
        if point.is_zero() {
            return Err(BjjError::InvalidPublicKey);
        }
        Ok(Self(point))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BjjError> {
        let mut out = Vec::with_capacity(PUBLIC_KEY_BYTES);
        self.0.serialize_compressed(&mut out).map_err(|_| BjjError::Serialization)?;
        Ok(out)
    }

    /// Affine coordinates as BN254 field elements, for the auth claim.
    pub fn coordinates(&self) -> (Fr, Fr) {
        (to_base_field(&self.0.x), to_base_field(&self.0.y))
    }

    pub fn verify(&self, message: &Fr, signature: &Signature) -> bool {
        let e = challenge(&signature.r, &self.0, message);
        let lhs: EdwardsProjective = EdwardsAffine::generator() * signature.s;
        let rhs: EdwardsProjective = EdwardsProjective::from(signature.r) + self.0 * e;
        lhs.into_affine() == rhs.into_affine()
    }
}

impl Signature {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BjjError> {
        let mut out = Vec::with_capacity(SIGNATURE_BYTES);
        self.r.serialize_compressed(&mut out).map_err(|_| BjjError::Serialization)?;
        self.s.serialize_compressed(&mut out).map_err(|_| BjjError::Serialization)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BjjError> {
        if bytes.len() != SIGNATURE_BYTES {
            return Err(BjjError::InvalidSignature);
        }
        let r = EdwardsAffine::deserialize_compressed(&bytes[..32]).map_err(|_| BjjError::InvalidSignature)?;
        let s = Scalar::deserialize_compressed(&bytes[32..]).map_err(|_| BjjError::InvalidSignature)?;
        Ok(Self { r, s })
    }
}

/// Coordinates of a serialized public key.
pub fn public_key_coordinates(bytes: &[u8]) -> Result<(Fr, Fr), BjjError> {
    Ok(PublicKey::from_bytes(bytes)?.coordinates())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let sk = SecretKey::random();
        let pk = sk.public_key();
        let msg = Fr::from(42u64);
        let sig = sk.sign(&msg);
        assert!(pk.verify(&msg, &sig));
        assert!(!pk.verify(&Fr::from(43u64), &sig));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let sk = SecretKey::random();
        let msg = Fr::from(7u64);
        assert_eq!(sk.sign(&msg), sk.sign(&msg));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let msg = Fr::from(1u64);
        let sig = SecretKey::random().sign(&msg);
        assert!(!SecretKey::random().public_key().verify(&msg, &sig));
    }

    #[test]
    fn test_encodings_round_trip() {
        let sk = SecretKey::random();
        let pk = sk.public_key();
        let bytes = pk.to_bytes().unwrap();
        assert_eq!(bytes.len(), PUBLIC_KEY_BYTES);
        assert_eq!(PublicKey::from_bytes(&bytes).unwrap(), pk);

        let sig = sk.sign(&Fr::from(9u64));
        let encoded = sig.to_bytes().unwrap();
        assert_eq!(encoded.len(), SIGNATURE_BYTES);
        assert_eq!(Signature::from_bytes(&encoded).unwrap(), sig);
        assert!(Signature::from_bytes(&encoded[..10]).is_err());
    }
}
