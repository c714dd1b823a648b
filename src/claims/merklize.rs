// src/claims/merklize.rs
//! Merklization of a credential subject.
//!
//! Every attribute becomes one leaf `keccak(name) → field(value)` of a
//! standalone sparse Merkle tree, plus an `@type` leaf carrying the credential
//! type. The root goes into a single claim slot, so any number of attributes
//! fits in a fixed-width claim entry.

use crate::claims::codec::{scalar_to_field, string_to_field, CodecError};
use crate::merkle::proof::MerkleProof;
use crate::merkle::tree::{MemoryNodes, SparseMerkleTree};
use crate::models::credential::CredentialSubject;
use crate::utils::crypto::Hash;

const MERKLIZE_LEVELS: usize = 64;
const TYPE_KEY: &str = "@type";

pub fn attribute_key(name: &str) -> Hash {
    Hash::from_field(string_to_field(name))
}

fn build(credential_type: &str, subject: &CredentialSubject) -> Result<(SparseMerkleTree, MemoryNodes, Hash), CodecError> {
    let tree = SparseMerkleTree::new(MERKLIZE_LEVELS);
    let mut nodes = MemoryNodes::new();
    let mut root = tree
        .insert(&mut nodes, Hash::ZERO, attribute_key(TYPE_KEY), Hash::from_field(string_to_field(credential_type)))
        .map_err(|e| CodecError::ParseClaim(format!("cannot merklize type: {}", e)))?;
    for (name, value) in subject {
        root = tree
            .insert(&mut nodes, root, attribute_key(name), Hash::from_field(scalar_to_field(value)))
            .map_err(|e| CodecError::ParseClaim(format!("cannot merklize '{}': {}", name, e)))?;
    }
    Ok((tree, nodes, root))
}

/// Root of the merklized subject.
pub fn merklize(credential_type: &str, subject: &CredentialSubject) -> Result<Hash, CodecError> {
    build(credential_type, subject).map(|(_, _, root)| root)
}

/// Proof that attribute `name` has its current value under the merklized root,
/// for selective disclosure by the holder.
pub fn prove_attribute(credential_type: &str, subject: &CredentialSubject, name: &str) -> Result<(Hash, MerkleProof), CodecError> {
    let (tree, nodes, root) = build(credential_type, subject)?;
    let proof = tree
        .prove(&nodes, root, &attribute_key(name))
        .map_err(|e| CodecError::ParseClaim(e.to_string()))?;
    Ok((root, proof))
}
