// src/services/credential_issuer.rs
//! Credential Issuance Pipeline
//!
//! Turns a credential request into a claim entry in the issuer's Claims tree
//! plus the credential record that describes it. The two are committed in one
//! identity transaction. Proofs arrive in two phases:
//! - the signature proof is computed before the claim is inserted
//! - the Merkle inclusion proof is attached by the identity state manager in
//!   the same commit that confirms a state holding the claim

use crate::claims::codec::{self, ClaimRequest, MerklizedPosition, MerklizedSlot, SubjectPosition};
use crate::claims::merklize;
use crate::error::{IssuerError, Result};
use crate::merkle::{MerkleProof, TreeKind};
use crate::models::credential::{
    Credential, CredentialSubject, IssuerStateInfo, ProofRequest, SignatureProof, IDEN3_CONTEXT,
    VERIFIABLE_CREDENTIAL, W3C_CONTEXT,
};
use crate::models::did::Did;
use crate::models::schema::Schema;
use crate::models::state::Identity;
use crate::services::events::{Event, EventBus};
use crate::services::identity_state::{self, IdentityStateManager};
use crate::services::link_engine;
use crate::services::revocation::RevocationRegistry;
use crate::services::schema_loader::SchemaLoader;
use crate::utils::crypto::Hash;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Attempts to find a free random revocation nonce under the identity lock.
const NONCE_RETRIES: usize = 3;

/// Request payload for issuing a credential
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    pub schema_url: String,
    pub credential_type: String,
    /// Holder DID; absent for a self-claim.
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub credential_subject: CredentialSubject,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub signature: bool,
    #[serde(default)]
    pub merkle_inclusion: bool,
    /// Fixed nonce instead of a random one. Re-issuing an identical claim
    /// needs the nonce of the first issuance.
    #[serde(default)]
    pub revocation_nonce: Option<u64>,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub subject_position: SubjectPosition,
    #[serde(default)]
    pub merklized_position: MerklizedPosition,
    /// Set by the link engine only.
    #[serde(skip)]
    pub link_id: Option<Uuid>,
}

/// Filter for [`CredentialIssuer::list`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialFilter {
    pub revoked: Option<bool>,
    pub subject: Option<String>,
}

/// Inputs validated before any lock is taken.
struct Prepared {
    identity: Identity,
    schema: Arc<Schema>,
    subject: Option<Did>,
    proofs: ProofRequest,
}

/// Issues credentials as claims in the issuer's Claims tree and keeps the
/// credential records that describe them.
pub struct CredentialIssuer {
    states: Arc<IdentityStateManager>,
    revocation: Arc<RevocationRegistry>,
    schemas: Arc<dyn SchemaLoader>,
    events: Arc<dyn EventBus>,
}

impl CredentialIssuer {
    pub fn new(
        states: Arc<IdentityStateManager>,
        revocation: Arc<RevocationRegistry>,
        schemas: Arc<dyn SchemaLoader>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self { states, revocation, schemas, events }
    }

    async fn prepare(&self, did: &Did, request: &IssueRequest) -> Result<Prepared> {
        let identity = self.states.identity(did)?;
        if identity.quarantined {
            return Err(IssuerError::Quarantined(did.to_string()));
        }
        let proofs = ProofRequest::from_flags(request.signature, request.merkle_inclusion)
            .ok_or_else(|| IssuerError::BadRequest("request at least one of signature and merkleInclusion".into()))?;
        if request.schema_url.trim().is_empty() || request.credential_type.trim().is_empty() {
            return Err(IssuerError::BadRequest("schemaUrl and credentialType are required".into()));
        }
        if request.revocation_nonce == Some(0) {
            return Err(IssuerError::BadRequest("revocation nonce must be non-zero".into()));
        }
        if matches!(request.expiration, Some(at) if at <= Utc::now()) {
            return Err(IssuerError::BadRequest("expiration is in the past".into()));
        }
        let subject = request.subject.as_deref().map(Did::parse).transpose()?;
        let schema = self.schemas.load(&request.schema_url).await?;
        Ok(Prepared { identity, schema, subject, proofs })
    }

    /// Signature proof over the claim, anchored at the latest confirmed state.
    async fn sign_claim(&self, identity: &Identity, entry: &codec::ClaimEntry) -> Result<SignatureProof> {
        let latest = self.states.current_latest(&identity.did)?;
        let engine = self.states.engine();
        let handle = engine.open(&identity.did, TreeKind::Claims);
        let auth_claim_proof = engine.proof(&handle, &identity.auth_claim.index_hash(), &latest.claims_root)?;
        let issuer_state = IssuerStateInfo::from_state(&latest)
            .ok_or_else(|| IssuerError::Internal("confirmed state without hash".into()))?;
        let signature = self.states.keys().sign(&identity.key_id, &entry.signing_message().0).await?;
        Ok(SignatureProof {
            issuer: identity.did.clone(),
            issuer_auth_claim: identity.auth_claim,
            auth_claim_proof,
            issuer_state,
            signature,
            core_claim: *entry,
        })
    }

    /// Issues a credential from `did` to the request's subject.
    ///
    /// # Errors
    /// * `BadRequest` / `ParseClaim` - invalid request or subject/schema mismatch
    /// * `DuplicateKey` - a claim with the same index but another value exists
    /// * `LinkExhausted`, `LinkExpired`, `LinkInactive` - link redemption refused
    pub async fn issue(&self, did: &Did, request: IssueRequest) -> Result<Credential> {
        let prepared = self.prepare(did, &request).await?;
        let Prepared { identity, schema, subject, proofs } = prepared;

        for attempt in 0..NONCE_RETRIES {
            let nonce = match request.revocation_nonce {
                Some(nonce) => nonce,
                None => self.revocation.allocate(did)?,
            };
            let claim = codec::build_claim(&ClaimRequest {
                schema: &schema,
                credential_type: &request.credential_type,
                subject: subject.as_ref(),
                credential_subject: &request.credential_subject,
                revocation_nonce: nonce,
                expiration: request.expiration,
                version: request.version,
                subject_position: request.subject_position,
                merklized_position: request.merklized_position,
            })?;
            let signature_proof = if proofs.wants_signature() {
                Some(self.sign_claim(&identity, &claim.entry).await?)
            } else {
                None
            };

            let mut tx = self.states.engine().begin_transaction(did).await;
            identity_state::mutable_identity(&tx)?;

            if let Some(mut existing) = tx.credential_by_index(&claim.index_hash)? {
                if existing.value_hash != claim.value_hash {
                    return Err(IssuerError::DuplicateKey(claim.index_hash));
                }
                if existing.deleted {
                    existing.deleted = false;
                    tx.put_credential(existing.clone());
                    tx.commit()?;
                }
                debug!("claim {} of {} already issued as {}", claim.index_hash, did, existing.id);
                return Ok(existing);
            }
            if tx.credential_by_nonce(nonce)?.is_some() {
                if request.revocation_nonce.is_some() {
                    return Err(IssuerError::BadRequest(format!("revocation nonce {} is already in use", nonce)));
                }
                warn!("nonce {} of {} taken concurrently (attempt {})", nonce, did, attempt + 1);
                continue;
            }

            if let Some(link_id) = request.link_id {
                let mut link = tx.link(&link_id)?.ok_or(IssuerError::UnknownLink(link_id))?;
                link.check_redeemable(Utc::now()).map_err(link_engine::refusal)?;
                link.issued_count += 1;
                tx.put_link(link);
            }

            let mut state = identity_state::open_state(&mut tx)?;
            tx.insert(TreeKind::Claims, claim.index_hash, claim.value_hash)?;
            identity_state::record_mutation(&mut tx, &mut state)?;

            let mut contexts = vec![W3C_CONTEXT.to_string(), IDEN3_CONTEXT.to_string()];
            if let Some(uri) = Schema::context_uri(&schema.json_schema) {
                contexts.push(uri);
            }
            let credential = Credential {
                id: Uuid::new_v4(),
                issuer: did.clone(),
                subject: subject.clone(),
                contexts,
                types: vec![VERIFIABLE_CREDENTIAL.to_string(), request.credential_type.clone()],
                schema_url: request.schema_url.clone(),
                credential_type: request.credential_type.clone(),
                credential_subject: claim.credential_subject,
                expiration: request.expiration,
                credential_status: self.states.credential_status(&identity, nonce),
                revocation_nonce: nonce,
                core_claim: claim.entry,
                index_hash: claim.index_hash,
                value_hash: claim.value_hash,
                proof_request: proofs,
                signature_proof,
                inclusion_proof: None,
                revoked: false,
                deleted: false,
                state_seq: state.seq,
                link_id: request.link_id,
                created_at: Utc::now(),
            };
            tx.put_credential(credential.clone());
            tx.commit()?;

            info!("issued {} ({}) by {} into state #{}", credential.id, credential.credential_type, did, state.seq);
            self.events.publish(Event::CredentialCreated { issuer: did.clone(), credential_id: credential.id });
            return Ok(credential);
        }
        Err(IssuerError::Internal(format!("no free revocation nonce for {} after {} attempts", did, NONCE_RETRIES)))
    }

    /// Looks up a live credential.
    ///
    /// # Errors
    /// * `UnknownCredential` - no such credential, or it was deleted
    pub fn get(&self, id: &Uuid) -> Result<Credential> {
        self.states
            .engine()
            .store()
            .credential(id)?
            .filter(|c| !c.deleted)
            .ok_or_else(|| IssuerError::UnknownCredential(id.to_string()))
    }

    /// Live credentials issued by `did`, optionally narrowed by revocation
    /// status and subject.
    ///
    /// # Arguments
    /// * `did` - Issuer
    /// * `filter` - `revoked` and `subject` constraints; empty matches all
    ///
    /// # Errors
    /// * `UnknownIdentity` - `did` is not managed here
    /// * `BadRequest` - the subject filter is not a DID
    pub fn list(&self, did: &Did, filter: &CredentialFilter) -> Result<Vec<Credential>> {
        self.states.identity(did)?;
        let subject = filter.subject.as_deref().map(Did::parse).transpose()?;
        Ok(self
            .states
            .engine()
            .store()
            .credentials(did)?
            .into_iter()
            .filter(|c| !c.deleted)
            .filter(|c| filter.revoked.map_or(true, |r| c.revoked == r))
            .filter(|c| subject.is_none() || c.subject == subject)
            .collect())
    }

    /// W3C document for the holder. Refused for Merkle-inclusion
    /// credentials until their state is confirmed.
    pub fn deliver(&self, id: &Uuid) -> Result<Value> {
        let credential = self.get(id)?;
        if !credential.is_deliverable() {
            return Err(IssuerError::StateNotYetPublished(credential.id));
        }
        Ok(credential.to_w3c())
    }

    /// Soft delete. The claim entry stays in the Claims tree.
    pub async fn delete(&self, did: &Did, id: &Uuid) -> Result<()> {
        let mut tx = self.states.engine().begin_transaction(did).await;
        let mut credential = tx
            .credential(id)?
            .filter(|c| &c.issuer == did && !c.deleted)
            .ok_or_else(|| IssuerError::UnknownCredential(id.to_string()))?;
        if credential.is_auth_credential() {
            return Err(IssuerError::BadRequest("the authentication credential cannot be deleted".into()));
        }
        credential.deleted = true;
        tx.put_credential(credential);
        tx.commit()?;
        info!("deleted credential {} of {}", id, did);
        Ok(())
    }

    /// Selective-disclosure proof of one attribute under the credential's
    /// merklized root.
    pub fn attribute_proof(&self, id: &Uuid, attribute: &str) -> Result<(Hash, MerkleProof)> {
        let credential = self.get(id)?;
        if codec::decode(&credential.core_claim)?.merklized == MerklizedSlot::None {
            return Err(IssuerError::BadRequest(format!("credential {} is not merklized", id)));
        }
        if !credential.credential_subject.contains_key(attribute) {
            return Err(IssuerError::BadRequest(format!("credential {} has no attribute '{}'", id, attribute)));
        }
        Ok(merklize::prove_attribute(&credential.credential_type, &credential.credential_subject, attribute)?)
    }
}
