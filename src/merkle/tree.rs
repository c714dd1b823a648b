// src/merkle/tree.rs
//! Sparse binary Merkle tree over an edge-compressed, content-addressed node table.
//!
//! Nodes are either leaves `(key, value)` hashed as `H(key, value, 1)` or
//! internal nodes `(left, right)` hashed as `H(left, right)`; an empty subtree
//! is the zero hash and is never stored. Nodes are addressed by their hash, so
//! the table is append-only and every historical root stays readable.
//!
//! Descent is LSB-first: at depth `d` the path follows bit `d` of the key
//! (`0` left, `1` right). This order is visible in every root, so it must
//! never change.

use crate::merkle::proof::{MerkleProof, NodeAux};
use crate::storage::store::StoreError;
use crate::utils::crypto::{poseidon_hashes, Hash};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("key {key} already holds a different value")]
    DuplicateKey { key: Hash },
    #[error("root {0} was never current for this tree")]
    UnknownRoot(Hash),
    #[error("key {key} cannot be placed within the maximum tree depth")]
    MaxLevelsReached { key: Hash },
    #[error("node {0} referenced but missing from the node table")]
    MissingNode(Hash),
    #[error("invalid node encoding")]
    InvalidEncoding,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A stored tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    Leaf { key: Hash, value: Hash },
    Middle { left: Hash, right: Hash },
}

const LEAF_TAG: u8 = 1;
const MIDDLE_TAG: u8 = 2;

/// Fixed width of a persisted node.
pub const NODE_BYTES: usize = 65;

impl Node {
    pub fn hash(&self) -> Hash {
        match self {
            Node::Leaf { key, value } => leaf_hash(key, value),
            Node::Middle { left, right } => poseidon_hashes(&[*left, *right]),
        }
    }

    pub fn to_bytes(&self) -> [u8; NODE_BYTES] {
        let mut out = [0u8; NODE_BYTES];
        let (tag, a, b) = match self {
            Node::Leaf { key, value } => (LEAF_TAG, key, value),
            Node::Middle { left, right } => (MIDDLE_TAG, left, right),
        };
        out[0] = tag;
        out[1..33].copy_from_slice(&a.0);
        out[33..].copy_from_slice(&b.0);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TreeError> {
        if bytes.len() != NODE_BYTES {
            return Err(TreeError::InvalidEncoding);
        }
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a.copy_from_slice(&bytes[1..33]);
        b.copy_from_slice(&bytes[33..]);
        match bytes[0] {
            LEAF_TAG => Ok(Node::Leaf { key: Hash(a), value: Hash(b) }),
            MIDDLE_TAG => Ok(Node::Middle { left: Hash(a), right: Hash(b) }),
            _ => Err(TreeError::InvalidEncoding),
        }
    }
}

pub fn leaf_hash(key: &Hash, value: &Hash) -> Hash {
    poseidon_hashes(&[*key, *value, Hash::from_u64(1)])
}

/// Read access to a node table.
pub trait NodeSource {
    fn node(&self, hash: &Hash) -> Result<Option<Node>, TreeError>;
}

/// Write access to a node table. Writes are idempotent.
pub trait NodeSink: NodeSource {
    fn put_node(&mut self, node: Node) -> Result<Hash, TreeError>;
}

/// Standalone in-memory node table, for trees that never hit the store
/// (credential-subject merklization, tests).
#[derive(Debug, Default, Clone)]
pub struct MemoryNodes {
    nodes: HashMap<Hash, Node>,
}

impl MemoryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeSource for MemoryNodes {
    fn node(&self, hash: &Hash) -> Result<Option<Node>, TreeError> {
        Ok(self.nodes.get(hash).cloned())
    }
}

impl NodeSink for MemoryNodes {
    fn put_node(&mut self, node: Node) -> Result<Hash, TreeError> {
        let hash = node.hash();
        self.nodes.entry(hash).or_insert(node);
        Ok(hash)
    }
}

/// Tree algorithms, parameterised by maximum depth.
#[derive(Debug, Clone, Copy)]
pub struct SparseMerkleTree {
    max_levels: usize,
}

impl SparseMerkleTree {
    pub fn new(max_levels: usize) -> Self {
        Self { max_levels: max_levels.max(2) }
    }

    pub fn max_levels(&self) -> usize {
        self.max_levels
    }

    /// Inserts `key → value` under `root`, returning the new root.
    ///
    /// Re-inserting an identical pair returns `root` unchanged; a different
    /// value for an existing key is [`TreeError::DuplicateKey`].
    pub fn insert<S: NodeSink>(&self, nodes: &mut S, root: Hash, key: Hash, value: Hash) -> Result<Hash, TreeError> {
        let mut path: Vec<(bool, Hash)> = Vec::new();
        let mut current = root;
        let mut level = 0;

        let subtree = loop {
            if level >= self.max_levels {
                return Err(TreeError::MaxLevelsReached { key });
            }
            if current.is_zero() {
                break nodes.put_node(Node::Leaf { key, value })?;
            }
            match nodes.node(&current)?.ok_or(TreeError::MissingNode(current))? {
                Node::Leaf { key: old_key, value: old_value } => {
                    if old_key == key {
                        if old_value == value {
                            return Ok(root);
                        }
                        return Err(TreeError::DuplicateKey { key });
                    }
                    break self.push_leaf(nodes, level, key, value, old_key, current)?;
                }
                Node::Middle { left, right } => {
                    if key.bit(level) {
                        path.push((true, left));
                        current = right;
                    } else {
                        path.push((false, right));
                        current = left;
                    }
                    level += 1;
                }
            }
        };

        let mut hash = subtree;
        for (went_right, sibling) in path.into_iter().rev() {
            let node = if went_right {
                Node::Middle { left: sibling, right: hash }
            } else {
                Node::Middle { left: hash, right: sibling }
            };
            hash = nodes.put_node(node)?;
        }
        Ok(hash)
    }

    /// Splits an occupied slot at `level` until the new key and the resident
    /// key take different branches.
    fn push_leaf<S: NodeSink>(
        &self,
        nodes: &mut S,
        level: usize,
        key: Hash,
        value: Hash,
        old_key: Hash,
        old_hash: Hash,
    ) -> Result<Hash, TreeError> {
        let mut depth = level;
        loop {
            if depth + 2 > self.max_levels {
                return Err(TreeError::MaxLevelsReached { key });
            }
            if key.bit(depth) != old_key.bit(depth) {
                break;
            }
            depth += 1;
        }

        let new_hash = nodes.put_node(Node::Leaf { key, value })?;
        let fork = if key.bit(depth) {
            Node::Middle { left: old_hash, right: new_hash }
        } else {
            Node::Middle { left: new_hash, right: old_hash }
        };
        let mut hash = nodes.put_node(fork)?;
        for d in (level..depth).rev() {
            let node = if key.bit(d) {
                Node::Middle { left: Hash::ZERO, right: hash }
            } else {
                Node::Middle { left: hash, right: Hash::ZERO }
            };
            hash = nodes.put_node(node)?;
        }
        Ok(hash)
    }

    /// Value stored under `key` in the tree rooted at `root`.
    pub fn get<S: NodeSource>(&self, nodes: &S, root: Hash, key: &Hash) -> Result<Option<Hash>, TreeError> {
        let proof = self.prove(nodes, root, key)?;
        Ok(if proof.existence { proof.value } else { None })
    }

    /// Inclusion or non-inclusion proof of `key` against `root`.
    pub fn prove<S: NodeSource>(&self, nodes: &S, root: Hash, key: &Hash) -> Result<MerkleProof, TreeError> {
        let mut siblings = Vec::new();
        let mut current = root;
        let mut level = 0;
        loop {
            if current.is_zero() {
                return Ok(MerkleProof::absent(siblings, None));
            }
            match nodes.node(&current)?.ok_or(TreeError::MissingNode(current))? {
                Node::Leaf { key: leaf_key, value } => {
                    if &leaf_key == key {
                        return Ok(MerkleProof::present(siblings, value));
                    }
                    return Ok(MerkleProof::absent(siblings, Some(NodeAux { key: leaf_key, value })));
                }
                Node::Middle { left, right } => {
                    if level >= self.max_levels {
                        return Err(TreeError::MaxLevelsReached { key: *key });
                    }
                    if key.bit(level) {
                        siblings.push(left);
                        current = right;
                    } else {
                        siblings.push(right);
                        current = left;
                    }
                    level += 1;
                }
            }
        }
    }
}
