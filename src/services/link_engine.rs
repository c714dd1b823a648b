// src/services/link_engine.rs
//! Link Engine: one credential template redeemed by many holders.
//!
//! Capacity is checked and consumed inside the issuer's identity transaction
//! that inserts the claim, so concurrent redemptions of the last slot yield
//! exactly one credential.

use crate::claims::codec;
use crate::error::{IssuerError, Result};
use crate::models::credential::{Credential, CredentialSubject, ProofRequest};
use crate::models::did::Did;
use crate::models::link::{Link, LinkRefusal};
use crate::services::credential_issuer::{CredentialIssuer, IssueRequest};
use crate::services::identity_state::{self, IdentityStateManager};
use crate::services::schema_loader::SchemaLoader;
use chrono::{DateTime, Utc};
use log::info;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkRequest {
    pub schema_url: String,
    pub credential_type: String,
    pub template: CredentialSubject,
    #[serde(default)]
    pub max_issuance: Option<u32>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub credential_expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub signature: bool,
    #[serde(default)]
    pub merkle_inclusion: bool,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Claim links: reusable offers that issue a templated credential to every
/// holder who redeems them, up to an optional capacity.
pub struct LinkEngine {
    states: Arc<IdentityStateManager>,
    issuer: Arc<CredentialIssuer>,
    schemas: Arc<dyn SchemaLoader>,
}

impl LinkEngine {
    pub fn new(states: Arc<IdentityStateManager>, issuer: Arc<CredentialIssuer>, schemas: Arc<dyn SchemaLoader>) -> Self {
        Self { states, issuer, schemas }
    }

    /// Creates a link issuing `request.credential_type` credentials from `did`.
    ///
    /// The template is coerced against the schema up front so redemptions
    /// only add the holder.
    ///
    /// # Arguments
    /// * `did` - Issuing identity
    /// * `request` - Schema, template subject, capacity, validity and proofs
    ///
    /// # Returns
    /// The stored link, with nothing issued yet
    ///
    /// # Errors
    /// * `BadRequest` - no proof requested, zero capacity, or a deadline in the past
    /// * `ParseClaim` - the template does not fit the schema
    /// * `SchemaUnavailable` - the schema cannot be fetched
    pub async fn create_link(&self, did: &Did, request: CreateLinkRequest) -> Result<Link> {
        let proofs = ProofRequest::from_flags(request.signature, request.merkle_inclusion)
            .ok_or_else(|| IssuerError::BadRequest("request at least one of signature and merkleInclusion".into()))?;
        if request.max_issuance == Some(0) {
            return Err(IssuerError::BadRequest("maxIssuance must be positive".into()));
        }
        let now = Utc::now();
        if matches!(request.valid_until, Some(until) if until <= now) {
            return Err(IssuerError::BadRequest("validUntil is in the past".into()));
        }
        if matches!(request.credential_expiration, Some(at) if at <= now) {
            return Err(IssuerError::BadRequest("credentialExpiration is in the past".into()));
        }
        let schema = self.schemas.load(&request.schema_url).await?;
        let template = codec::coerce_subject(&schema, None, &request.template)?;

        let link = Link {
            id: Uuid::new_v4(),
            issuer: did.clone(),
            schema_url: request.schema_url,
            credential_type: request.credential_type,
            template,
            max_issuance: request.max_issuance,
            issued_count: 0,
            valid_until: request.valid_until,
            credential_expiration: request.credential_expiration,
            proofs,
            active: request.active,
            created_at: now,
        };
        let mut tx = self.states.engine().begin_transaction(did).await;
        identity_state::mutable_identity(&tx)?;
        tx.put_link(link.clone());
        tx.commit()?;
        info!("created link {} for {} (max {:?})", link.id, did, link.max_issuance);
        Ok(link)
    }

    pub fn get_link(&self, id: &Uuid) -> Result<Link> {
        self.states.engine().store().link(id)?.ok_or(IssuerError::UnknownLink(*id))
    }

    pub fn list_links(&self, did: &Did) -> Result<Vec<Link>> {
        self.states.identity(did)?;
        Ok(self.states.engine().store().links(did)?)
    }

    /// Issues the link's credential to `holder`.
    ///
    /// The capacity check and the increment commit together with the
    /// credential, so concurrent redemptions never exceed `max_issuance`.
    ///
    /// # Errors
    /// * `UnknownLink` - no such link
    /// * `LinkInactive`, `LinkExpired`, `LinkExhausted` - redemption refused
    /// * any error of [`CredentialIssuer::issue`]
    pub async fn redeem(&self, id: &Uuid, holder: &str) -> Result<Credential> {
        let link = self.get_link(id)?;
        // Fast refusal; the authoritative check runs under the identity lock.
        link.check_redeemable(Utc::now()).map_err(refusal)?;
        let request = IssueRequest {
            schema_url: link.schema_url.clone(),
            credential_type: link.credential_type.clone(),
            subject: Some(holder.to_string()),
            credential_subject: link.template.clone(),
            expiration: link.credential_expiration,
            signature: link.proofs.wants_signature(),
            merkle_inclusion: link.proofs.wants_inclusion(),
            link_id: Some(link.id),
            ..IssueRequest::default()
        };
        self.issuer.issue(&link.issuer, request).await
    }

    /// Turns redemption of a link on or off.
    pub async fn activate(&self, id: &Uuid, active: bool) -> Result<Link> {
        let issuer = self.get_link(id)?.issuer;
        let mut tx = self.states.engine().begin_transaction(&issuer).await;
        let mut link = tx.link(id)?.ok_or(IssuerError::UnknownLink(*id))?;
        link.active = active;
        tx.put_link(link.clone());
        tx.commit()?;
        info!("link {} {}", id, if active { "activated" } else { "deactivated" });
        Ok(link)
    }

    /// Deletes a link nothing was issued through.
    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        let issuer = self.get_link(id)?.issuer;
        let mut tx = self.states.engine().begin_transaction(&issuer).await;
        let link = tx.link(id)?.ok_or(IssuerError::UnknownLink(*id))?;
        let used = link.issued_count > 0 || tx.credentials()?.iter().any(|c| c.link_id == Some(*id));
        if used {
            return Err(IssuerError::LinkInUse(*id));
        }
        tx.delete_link(*id);
        tx.commit()?;
        info!("deleted link {}", id);
        Ok(())
    }
}

pub(crate) fn refusal(refusal: LinkRefusal) -> IssuerError {
    match refusal {
        LinkRefusal::Exhausted => IssuerError::LinkExhausted,
        LinkRefusal::Expired => IssuerError::LinkExpired,
        LinkRefusal::Inactive => IssuerError::LinkInactive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusals_map_to_conflicts() {
        assert!(matches!(refusal(LinkRefusal::Exhausted), IssuerError::LinkExhausted));
        assert!(matches!(refusal(LinkRefusal::Expired), IssuerError::LinkExpired));
        assert!(matches!(refusal(LinkRefusal::Inactive), IssuerError::LinkInactive));
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateLinkRequest = serde_json::from_str(
            r#"{"schemaUrl":"https://s/x.json","credentialType":"X","template":{"age":3},"signature":true}"#,
        )
        .unwrap();
        assert!(request.active);
        assert!(request.max_issuance.is_none());
        assert!(!request.merkle_inclusion);
    }
}
