// src/models/state.rs
//! Identity and identity-state records.
//!
//! Each identity owns a chain of states linked by `previous_state`. Rows are
//! keyed by a per-identity sequence number because an open `created` state has
//! no hash yet; the hash is fixed when the state is sealed.

use crate::claims::codec::ClaimEntry;
use crate::models::did::Did;
use crate::utils::crypto::{poseidon_hashes, Hash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Signature scheme of the issuer's authentication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[serde(rename = "bjj")]
    BabyJubJub,
    #[serde(rename = "eth")]
    Ethereum,
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bjj" | "babyjubjub" => Ok(KeyType::BabyJubJub),
            "eth" | "ethereum" | "secp256k1" => Ok(KeyType::Ethereum),
            other => Err(format!("unsupported key type '{}'", other)),
        }
    }
}

/// How holders learn the revocation status of credentials from this issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialStatusMode {
    Signature,
    OffChain,
    OnChain,
}

/// An issuer identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub did: Did,
    pub key_type: KeyType,
    pub key_id: String,
    pub display_name: Option<String>,
    pub genesis_state: Hash,
    /// Authentication claim inserted at genesis.
    pub auth_claim: ClaimEntry,
    pub auth_credential_id: Uuid,
    pub revocation_mode: CredentialStatusMode,
    /// Set after an invariant violation; all mutations are refused.
    pub quarantined: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of one identity state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum StateStatus {
    Created,
    Pending,
    Publishing,
    Confirmed,
    Failed(String),
}

impl StateStatus {
    /// States that block sealing another state for the same identity.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, StateStatus::Pending | StateStatus::Publishing | StateStatus::Failed(_))
    }
}

impl fmt::Display for StateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateStatus::Created => f.write_str("created"),
            StateStatus::Pending => f.write_str("pending"),
            StateStatus::Publishing => f.write_str("publishing"),
            StateStatus::Confirmed => f.write_str("confirmed"),
            StateStatus::Failed(reason) => write!(f, "failed({})", reason),
        }
    }
}

/// One node of an identity's state chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityState {
    pub did: Did,
    pub seq: u64,
    /// `None` until sealed (genesis is born sealed).
    pub state: Option<Hash>,
    /// Reserved null for genesis.
    pub previous_state: Option<Hash>,
    pub claims_root: Hash,
    pub revocation_root: Hash,
    pub roots_root: Hash,
    pub status: StateStatus,
    /// Claims and revocation mutations accumulated while `created`.
    pub mutations: u32,
    pub tx_id: Option<String>,
    pub block_number: Option<u64>,
    pub block_timestamp: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl IdentityState {
    pub fn is_genesis(&self) -> bool {
        self.seq == 0
    }

    /// `H(claimsRoot, revocationRoot, rootsRoot)` over the current roots.
    pub fn compute_hash(&self) -> Hash {
        state_hash(&self.claims_root, &self.revocation_root, &self.roots_root)
    }
}

pub fn state_hash(claims_root: &Hash, revocation_root: &Hash, roots_root: &Hash) -> Hash {
    poseidon_hashes(&[*claims_root, *revocation_root, *roots_root])
}
