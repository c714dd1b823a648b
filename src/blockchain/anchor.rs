// src/blockchain/anchor.rs
//! On-chain anchoring of identity state transitions.
//!
//! A transition `previousState → newState` for one DID is submitted once and
//! then polled until it lands or fails. Submitting the same transition again
//! returns the transaction already in flight (or landed) instead of creating
//! a second on-chain effect.

use crate::models::did::Did;
use crate::utils::crypto::Hash;
use crate::utils::retry::Transient;
use crate::utils::serialization::hex_bytes;
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorTransition {
    pub did: Did,
    pub previous_state: Hash,
    pub new_state: Hash,
    /// Whether `previous_state` is the identity's genesis state.
    pub is_old_state_genesis: bool,
    /// Opaque attestation that the key holder produced the transition.
    #[serde(with = "hex_bytes")]
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AnchorStatus {
    Pending,
    Confirmed { block: u64, timestamp: i64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AnchorError {
    #[error("anchor unavailable: {0}")]
    Unavailable(String),
    #[error("transition rejected: {0}")]
    Rejected(String),
    #[error("unknown transaction {0}")]
    UnknownTransaction(String),
    #[error("anchor misconfigured: {0}")]
    Config(String),
}

impl Transient for AnchorError {
    fn is_transient(&self) -> bool {
        matches!(self, AnchorError::Unavailable(_))
    }
}

#[async_trait]
pub trait StateAnchor: Send + Sync {
    /// Submits a transition and returns its transaction id.
    async fn submit(&self, transition: &AnchorTransition) -> Result<String, AnchorError>;
    async fn status(&self, tx_id: &str) -> Result<AnchorStatus, AnchorError>;
}

struct LocalTx {
    transition: AnchorTransition,
    status: AnchorStatus,
}

#[derive(Default)]
struct Ledger {
    block: u64,
    txs: HashMap<String, LocalTx>,
    by_transition: HashMap<(Did, Hash, Hash), String>,
    /// Latest anchored state per DID.
    heads: HashMap<Did, Hash>,
}

/// In-process anchor that confirms every valid transition immediately in a
/// new block. Mirrors the contract's `previousState` check.
#[derive(Default)]
pub struct LocalAnchor {
    ledger: Mutex<Ledger>,
}

impl LocalAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest state anchored for `did`.
    pub fn head(&self, did: &Did) -> Option<Hash> {
        self.ledger.lock().ok().and_then(|l| l.heads.get(did).copied())
    }
}

#[async_trait]
impl StateAnchor for LocalAnchor {
    async fn submit(&self, transition: &AnchorTransition) -> Result<String, AnchorError> {
        let mut ledger = self.ledger.lock().map_err(|_| AnchorError::Unavailable("ledger poisoned".into()))?;
        let key = (transition.did.clone(), transition.previous_state, transition.new_state);
        if let Some(existing) = ledger.by_transition.get(&key) {
            let landed = ledger
                .txs
                .get(existing)
                .map_or(false, |tx| !matches!(tx.status, AnchorStatus::Failed { .. }));
            if landed {
                return Ok(existing.clone());
            }
        }

        let expected = ledger.heads.get(&transition.did).copied();
        let status = match expected {
            Some(head) if head != transition.previous_state => AnchorStatus::Failed {
                reason: format!("previous state mismatch: chain has {}", head),
            },
            None if !transition.is_old_state_genesis => AnchorStatus::Failed {
                reason: "first transition must start from genesis".into(),
            },
            _ => {
                ledger.block += 1;
                ledger.heads.insert(transition.did.clone(), transition.new_state);
                AnchorStatus::Confirmed { block: ledger.block, timestamp: Utc::now().timestamp() }
            }
        };

        let tx_id = format!("0x{:064x}", ledger.txs.len() + 1);
        info!("local anchor {} for {}: {:?}", tx_id, transition.did, status);
        ledger.txs.insert(tx_id.clone(), LocalTx { transition: transition.clone(), status });
        ledger.by_transition.insert(key, tx_id.clone());
        Ok(tx_id)
    }

    async fn status(&self, tx_id: &str) -> Result<AnchorStatus, AnchorError> {
        let ledger = self.ledger.lock().map_err(|_| AnchorError::Unavailable("ledger poisoned".into()))?;
        ledger
            .txs
            .get(tx_id)
            .map(|tx| tx.status.clone())
            .ok_or_else(|| AnchorError::UnknownTransaction(tx_id.to_string()))
    }
}

impl LocalAnchor {
    /// Transition recorded under `tx_id`.
    pub fn transition(&self, tx_id: &str) -> Option<AnchorTransition> {
        self.ledger.lock().ok().and_then(|l| l.txs.get(tx_id).map(|tx| tx.transition.clone()))
    }
}
