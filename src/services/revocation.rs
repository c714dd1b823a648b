// src/services/revocation.rs
//! Revocation Registry.
//!
//! A revoked nonce is a key in the issuer's Revocation tree with value zero.
//! Status queries answer against any confirmed state, so a holder can prove
//! non-revocation at the epoch a verifier asks for.

use crate::error::{IssuerError, Result};
use crate::merkle::{MerkleProof, TreeKind};
use crate::models::credential::{Credential, IssuerStateInfo};
use crate::models::did::Did;
use crate::models::state::StateStatus;
use crate::services::events::{Event, EventBus};
use crate::services::identity_state::{self, IdentityStateManager};
use crate::utils::crypto::Hash;
use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const NONCE_ATTEMPTS: usize = 16;

/// Non-zero nonce of `bits` random bits from the OS CSPRNG.
pub fn random_nonce(bits: u32) -> u64 {
    let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits.max(1)) - 1 };
    loop {
        let nonce = OsRng.next_u64() & mask;
        if nonce != 0 {
            return nonce;
        }
    }
}

/// Revocation tree key of a nonce.
pub fn nonce_key(nonce: u64) -> Hash {
    Hash::from_u64(nonce)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationStatus {
    pub issuer: IssuerStateInfo,
    /// Inclusion when revoked, non-inclusion otherwise.
    pub mtp: MerkleProof,
    pub revoked: bool,
}

/// Revokes credentials by nonce and answers status queries per confirmed state.
pub struct RevocationRegistry {
    states: Arc<IdentityStateManager>,
    events: Arc<dyn EventBus>,
}

impl RevocationRegistry {
    pub fn new(states: Arc<IdentityStateManager>, events: Arc<dyn EventBus>) -> Self {
        Self { states, events }
    }

    /// Draws a revocation nonce not yet used by any credential of `did`.
    ///
    /// # Arguments
    /// * `did` - Issuer the nonce is allocated for
    ///
    /// # Returns
    /// A non-zero nonce of `issuer.nonce_bits` random bits
    ///
    /// # Errors
    /// * `Internal` - every draw hit a used nonce
    pub fn allocate(&self, did: &Did) -> Result<u64> {
        let store = self.states.engine().store();
        for _ in 0..NONCE_ATTEMPTS {
            let nonce = random_nonce(self.states.settings().nonce_bits);
            if store.credential_by_nonce(did, nonce)?.is_none() {
                return Ok(nonce);
            }
        }
        Err(IssuerError::Internal(format!("nonce space of {} is exhausted", did)))
    }

    /// Revokes the credential holding `nonce` by adding the nonce to the
    /// Revocation tree of the open state.
    ///
    /// The revocation becomes visible to status queries once that state is
    /// confirmed. Revoking twice is a no-op.
    ///
    /// # Arguments
    /// * `did` - Issuer of the credential
    /// * `nonce` - Revocation nonce of the credential
    ///
    /// # Returns
    /// The credential, marked revoked
    ///
    /// # Errors
    /// * `UnknownCredential` - no live credential of `did` holds `nonce`
    /// * `Quarantined` - the identity refuses mutations
    pub async fn revoke(&self, did: &Did, nonce: u64) -> Result<Credential> {
        let mut tx = self.states.engine().begin_transaction(did).await;
        identity_state::mutable_identity(&tx)?;
        let mut credential = tx
            .credential_by_nonce(nonce)?
            .filter(|c| !c.deleted)
            .ok_or_else(|| IssuerError::UnknownCredential(format!("nonce {} of {}", nonce, did)))?;
        if credential.revoked {
            return Ok(credential);
        }

        let mut state = identity_state::open_state(&mut tx)?;
        tx.insert(TreeKind::Revocation, nonce_key(nonce), Hash::ZERO)?;
        identity_state::record_mutation(&mut tx, &mut state)?;
        credential.revoked = true;
        tx.put_credential(credential.clone());
        tx.commit()?;

        info!("revoked nonce {} of {} in state #{}", nonce, did, state.seq);
        self.events.publish(Event::CredentialRevoked { issuer: did.clone(), nonce });
        Ok(credential)
    }

    /// Revokes credential `id` of `did`. See [`RevocationRegistry::revoke`].
    pub async fn revoke_credential(&self, did: &Did, id: &Uuid) -> Result<Credential> {
        let credential = self
            .states
            .engine()
            .store()
            .credential(id)?
            .filter(|c| &c.issuer == did && !c.deleted)
            .ok_or_else(|| IssuerError::UnknownCredential(id.to_string()))?;
        self.revoke(did, credential.revocation_nonce).await
    }

    /// Revocation status of `nonce` as of a confirmed state.
    ///
    /// # Arguments
    /// * `did` - Issuer
    /// * `nonce` - Revocation nonce to look up
    /// * `state` - Hash of a confirmed state of `did`
    ///
    /// # Returns
    /// The state's root triple with an inclusion proof of the nonce when it
    /// is revoked, a non-inclusion proof otherwise
    ///
    /// # Errors
    /// * `UnknownState` - `state` is unknown or not confirmed
    pub fn status_at(&self, did: &Did, nonce: u64, state: &Hash) -> Result<RevocationStatus> {
        let state = self.states.state_by_hash(did, state)?;
        if state.status != StateStatus::Confirmed {
            return Err(IssuerError::UnknownState(format!("{} is not confirmed", state.state.unwrap_or_default())));
        }
        let issuer = IssuerStateInfo::from_state(&state)
            .ok_or_else(|| IssuerError::Internal("confirmed state without hash".into()))?;
        let handle = self.states.engine().open(did, TreeKind::Revocation);
        let mtp = self.states.engine().proof(&handle, &nonce_key(nonce), &state.revocation_root)?;
        Ok(RevocationStatus { issuer, revoked: mtp.existence, mtp })
    }

    /// Status at the latest confirmed state.
    pub fn status_latest(&self, did: &Did, nonce: u64) -> Result<RevocationStatus> {
        let latest = self.states.current_latest(did)?;
        let hash = latest.state.ok_or_else(|| IssuerError::Internal("confirmed state without hash".into()))?;
        self.status_at(did, nonce, &hash)
    }
}
