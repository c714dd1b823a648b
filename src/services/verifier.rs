// src/services/verifier.rs
//! Credential verification against the issuer's own state.
//!
//! Checks the proofs a credential carries the way a relying party would,
//! using the node's trees and state chain instead of the chain contract.

use crate::claims::codec;
use crate::error::Result;
use crate::models::credential::{Credential, IssuerStateInfo};
use crate::models::state::{state_hash, StateStatus};
use crate::services::identity_state::IdentityStateManager;
use crate::services::revocation::RevocationRegistry;
use crate::services::schema_loader::SchemaLoader;
use crate::wallet::key_management::verify_signature;
use chrono::Utc;
use log::debug;
use serde::Serialize;
use std::sync::Arc;

/// Outcome of verifying one credential. `None` means the proof is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub claim_consistent: bool,
    pub signature_valid: Option<bool>,
    pub inclusion_valid: Option<bool>,
    pub revoked: bool,
    pub expired: bool,
    pub valid: bool,
}

/// Verifies issued credentials.
pub struct Verifier {
    states: Arc<IdentityStateManager>,
    revocation: Arc<RevocationRegistry>,
    schemas: Arc<dyn SchemaLoader>,
}

fn state_is_consistent(info: &IssuerStateInfo) -> bool {
    state_hash(&info.claims_root, &info.revocation_root, &info.roots_root) == info.state
}

impl Verifier {
    pub fn new(states: Arc<IdentityStateManager>, revocation: Arc<RevocationRegistry>, schemas: Arc<dyn SchemaLoader>) -> Self {
        Self { states, revocation, schemas }
    }

    /// The stored subject and metadata must re-encode to the core claim.
    async fn claim_consistent(&self, credential: &Credential) -> Result<bool> {
        let entry = &credential.core_claim;
        if entry.index_hash() != credential.index_hash || entry.value_hash() != credential.value_hash {
            return Ok(false);
        }
        if credential.is_auth_credential() {
            let identity = self.states.identity(&credential.issuer)?;
            return Ok(identity.auth_claim == *entry);
        }
        let schema = self.schemas.load(&credential.schema_url).await?;
        let rebuilt = codec::reconstruct(
            entry,
            &schema,
            &credential.credential_type,
            credential.subject.as_ref(),
            &credential.credential_subject,
        );
        Ok(match rebuilt {
            Ok(claim) => claim.fields.revocation_nonce == credential.revocation_nonce,
            Err(e) => {
                debug!("credential {} does not re-encode: {}", credential.id, e);
                false
            }
        })
    }

    async fn signature_valid(&self, credential: &Credential) -> Result<Option<bool>> {
        let Some(proof) = &credential.signature_proof else {
            return Ok(None);
        };
        let identity = self.states.identity(&credential.issuer)?;
        let public_key = self.states.keys().public_key(&identity.key_id).await?;
        let auth = &proof.issuer_auth_claim;
        let valid = proof.core_claim == credential.core_claim
            && state_is_consistent(&proof.issuer_state)
            && proof
                .auth_claim_proof
                .verify_inclusion(&proof.issuer_state.claims_root, &auth.index_hash(), &auth.value_hash())
            && verify_signature(
                identity.key_type,
                &public_key,
                &credential.core_claim.signing_message().0,
                &proof.signature,
            );
        Ok(Some(valid))
    }

    fn inclusion_valid(&self, credential: &Credential) -> Result<Option<bool>> {
        let Some(proof) = &credential.inclusion_proof else {
            return Ok(None);
        };
        let info = &proof.issuer_state;
        let anchored = self.states.state_by_hash(&credential.issuer, &info.state)?.status == StateStatus::Confirmed;
        let valid = anchored
            && state_is_consistent(info)
            && proof.mtp.verify_inclusion(&info.claims_root, &credential.index_hash, &credential.value_hash);
        Ok(Some(valid))
    }

    /// Checks a credential the way a verifier would, against this node's
    /// records.
    ///
    /// # Arguments
    /// * `credential` - Credential as issued, with whatever proofs it carries
    ///
    /// # Returns
    /// A report with one entry per check. `valid` requires a consistent
    /// claim, every present proof to verify, and the credential to be neither
    /// revoked at the latest confirmed state nor expired
    ///
    /// # Errors
    /// * `UnknownIdentity` / `UnknownState` - the issuer or a referenced state is unknown
    /// * `SchemaUnavailable` - the credential's schema cannot be fetched
    pub async fn verify(&self, credential: &Credential) -> Result<VerificationReport> {
        let claim_consistent = self.claim_consistent(credential).await?;
        let signature_valid = self.signature_valid(credential).await?;
        let inclusion_valid = self.inclusion_valid(credential)?;
        let revoked = self.revocation.status_latest(&credential.issuer, credential.revocation_nonce)?.revoked;
        let expired = matches!(credential.expiration, Some(at) if at <= Utc::now());

        let proofs = [signature_valid, inclusion_valid];
        let valid = claim_consistent
            && proofs.iter().any(Option::is_some)
            && proofs.iter().flatten().all(|ok| *ok)
            && !revoked
            && !expired;
        Ok(VerificationReport { claim_consistent, signature_valid, inclusion_valid, revoked, expired, valid })
    }
}
