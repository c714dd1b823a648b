// src/models/link.rs
//! Issuance links: one template redeemed by many holders.

use crate::models::credential::{CredentialSubject, ProofRequest};
use crate::models::did::Did;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: Uuid,
    pub issuer: Did,
    pub schema_url: String,
    pub credential_type: String,
    pub template: CredentialSubject,
    pub max_issuance: Option<u32>,
    pub issued_count: u32,
    pub valid_until: Option<DateTime<Utc>>,
    /// Expiration stamped on credentials issued through this link.
    pub credential_expiration: Option<DateTime<Utc>>,
    pub proofs: ProofRequest,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Why a link cannot be redeemed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRefusal {
    Exhausted,
    Expired,
    Inactive,
}

impl Link {
    pub fn remaining(&self) -> Option<u32> {
        self.max_issuance.map(|max| max.saturating_sub(self.issued_count))
    }

    pub fn check_redeemable(&self, now: DateTime<Utc>) -> Result<(), LinkRefusal> {
        if !self.active {
            return Err(LinkRefusal::Inactive);
        }
        if matches!(self.valid_until, Some(until) if now > until) {
            return Err(LinkRefusal::Expired);
        }
        if self.remaining() == Some(0) {
            return Err(LinkRefusal::Exhausted);
        }
        Ok(())
    }
}
