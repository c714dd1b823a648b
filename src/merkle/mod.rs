// src/merkle/mod.rs
pub mod engine;
pub mod proof;
pub mod tree;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use engine::{IdentityTx, TreeEngine, TreeHandle};
pub use proof::{MerkleProof, NodeAux};
pub use tree::{SparseMerkleTree, TreeError};

/// The three trees every identity owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    /// `H(index) → H(value)` of every issued claim.
    Claims,
    /// Revoked nonces, mapped to zero.
    Revocation,
    /// Every claims root that has been confirmed, mapped to zero.
    Roots,
}

impl fmt::Display for TreeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeKind::Claims => f.write_str("claims"),
            TreeKind::Revocation => f.write_str("revocation"),
            TreeKind::Roots => f.write_str("roots"),
        }
    }
}
