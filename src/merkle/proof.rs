// src/merkle/proof.rs
//! Merkle proofs of inclusion and non-inclusion.
//!
//! A proof lists, for each level from the root down to where the walk
//! stopped, the sibling hash on the branch not taken. A non-inclusion proof
//! ends either on an empty subtree or on an auxiliary leaf whose key differs
//! from the queried key but shares its path prefix.

use crate::merkle::tree::leaf_hash;
use crate::utils::crypto::{poseidon_hashes, Hash};
use serde::{Deserialize, Serialize};

/// The leaf found where a non-inclusion walk terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAux {
    pub key: Hash,
    pub value: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub existence: bool,
    pub siblings: Vec<Hash>,
    /// Value under the key when `existence` holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_aux: Option<NodeAux>,
}

impl MerkleProof {
    pub(crate) fn present(siblings: Vec<Hash>, value: Hash) -> Self {
        Self { existence: true, siblings, value: Some(value), node_aux: None }
    }

    pub(crate) fn absent(siblings: Vec<Hash>, node_aux: Option<NodeAux>) -> Self {
        Self { existence: false, siblings, value: None, node_aux }
    }

    pub fn depth(&self) -> usize {
        self.siblings.len()
    }

    /// Folds the sibling path over `leaf` following `key`'s bits.
    pub fn compute_root(&self, key: &Hash, leaf: Hash) -> Hash {
        let mut hash = leaf;
        for (level, sibling) in self.siblings.iter().enumerate().rev() {
            hash = if key.bit(level) {
                poseidon_hashes(&[*sibling, hash])
            } else {
                poseidon_hashes(&[hash, *sibling])
            };
        }
        hash
    }

    pub fn verify_inclusion(&self, root: &Hash, key: &Hash, value: &Hash) -> bool {
        self.existence && self.compute_root(key, leaf_hash(key, value)) == *root
    }

    pub fn verify_non_inclusion(&self, root: &Hash, key: &Hash) -> bool {
        if self.existence {
            return false;
        }
        match &self.node_aux {
            Some(aux) => {
                if aux.key == *key {
                    return false;
                }
                let same_prefix = (0..self.depth()).all(|level| aux.key.bit(level) == key.bit(level));
                same_prefix && self.compute_root(key, leaf_hash(&aux.key, &aux.value)) == *root
            }
            None => self.compute_root(key, Hash::ZERO) == *root,
        }
    }
}
