// src/models/credential.rs
//! Verifiable Credential records.
//!
//! A [`Credential`] is the issuer-side record of one claim entry in the
//! Claims tree plus the W3C-shaped metadata needed to hand it to a holder.
//! Proofs are attached in two phases: the signature proof at issuance, the
//! Merkle inclusion proof once a state containing the claim is confirmed.

use crate::claims::codec::ClaimEntry;
use crate::merkle::proof::MerkleProof;
use crate::models::did::Did;
use crate::models::state::{CredentialStatusMode, IdentityState};
use crate::utils::crypto::Hash;
use crate::utils::serialization::hex_bytes;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const W3C_CONTEXT: &str = "https://www.w3.org/2018/credentials/v1";
pub const IDEN3_CONTEXT: &str = "https://schema.iden3.io/core/jsonld/iden3proofs.jsonld";
pub const VERIFIABLE_CREDENTIAL: &str = "VerifiableCredential";
pub const AUTH_CREDENTIAL_TYPE: &str = "AuthBJJCredential";

/// A credential-subject attribute value.
///
/// Serialized as the bare JSON scalar; `Bytes` travels as base64 text and is
/// only produced by schema-driven coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalarValue {
    String(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl ScalarValue {
    pub fn to_json(&self) -> Value {
        match self {
            ScalarValue::String(s) => Value::String(s.clone()),
            ScalarValue::Int(i) => json!(i),
            ScalarValue::Bool(b) => Value::Bool(*b),
            ScalarValue::Bytes(b) => Value::String(base64::encode(b)),
        }
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(ScalarValue::String(s.clone())),
            Value::Bool(b) => Some(ScalarValue::Bool(*b)),
            Value::Number(n) => n.as_i64().map(ScalarValue::Int),
            _ => None,
        }
    }
}

impl Serialize for ScalarValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ScalarValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ScalarValue::from_json(&value)
            .ok_or_else(|| de::Error::custom(format!("unsupported attribute value {}", value)))
    }
}

pub type CredentialSubject = BTreeMap<String, ScalarValue>;

/// Which proofs the issuer attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProofRequest {
    Signature,
    MerkleInclusion,
    Both,
}

impl ProofRequest {
    pub fn from_flags(signature: bool, merkle_inclusion: bool) -> Option<Self> {
        match (signature, merkle_inclusion) {
            (true, true) => Some(ProofRequest::Both),
            (true, false) => Some(ProofRequest::Signature),
            (false, true) => Some(ProofRequest::MerkleInclusion),
            (false, false) => None,
        }
    }

    pub fn wants_signature(&self) -> bool {
        matches!(self, ProofRequest::Signature | ProofRequest::Both)
    }

    pub fn wants_inclusion(&self) -> bool {
        matches!(self, ProofRequest::MerkleInclusion | ProofRequest::Both)
    }
}

/// Issuer state snapshot embedded in proofs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerStateInfo {
    pub state: Hash,
    pub claims_root: Hash,
    pub revocation_root: Hash,
    pub roots_root: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<i64>,
}

impl IssuerStateInfo {
    /// Snapshot of a sealed state; `None` while the state is still open.
    pub fn from_state(state: &IdentityState) -> Option<Self> {
        Some(Self {
            state: state.state?,
            claims_root: state.claims_root,
            revocation_root: state.revocation_root,
            roots_root: state.roots_root,
            tx_id: state.tx_id.clone(),
            block_number: state.block_number,
            block_timestamp: state.block_timestamp,
        })
    }
}

/// Signature by the issuer's authentication key over `H(indexHash, valueHash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureProof {
    pub issuer: Did,
    pub issuer_auth_claim: ClaimEntry,
    /// Inclusion of the auth claim at `issuer_state`.
    pub auth_claim_proof: MerkleProof,
    pub issuer_state: IssuerStateInfo,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub core_claim: ClaimEntry,
}

/// Inclusion of the claim in the Claims tree of a confirmed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    pub issuer: Did,
    pub issuer_state: IssuerStateInfo,
    pub core_claim: ClaimEntry,
    pub mtp: MerkleProof,
}

/// W3C `credentialStatus` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub status_type: String,
    pub revocation_nonce: u64,
}

impl CredentialStatus {
    pub fn new(mode: CredentialStatusMode, base_url: &str, contract: &str, issuer: &Did, nonce: u64) -> Self {
        let base = base_url.trim_end_matches('/');
        let (status_type, id) = match mode {
            CredentialStatusMode::Signature => (
                "SparseMerkleTreeProof",
                format!("{}/v1/{}/claims/revocation/status/{}", base, issuer, nonce),
            ),
            CredentialStatusMode::OffChain => ("Iden3ReverseSparseMerkleTreeProof", base.to_string()),
            CredentialStatusMode::OnChain => (
                "Iden3OnchainSparseMerkleTreeProof2023",
                format!("{}/credentialStatus?revocationNonce={}&contractAddress={}", issuer, nonce, contract),
            ),
        };
        Self { id, status_type: status_type.to_string(), revocation_nonce: nonce }
    }
}

/// Issuer-side credential record, one-to-one with a claim entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: Uuid,
    pub issuer: Did,
    /// `None` for self-claims.
    pub subject: Option<Did>,
    pub contexts: Vec<String>,
    pub types: Vec<String>,
    pub schema_url: String,
    pub credential_type: String,
    pub credential_subject: CredentialSubject,
    pub expiration: Option<DateTime<Utc>>,
    pub credential_status: CredentialStatus,
    pub revocation_nonce: u64,
    pub core_claim: ClaimEntry,
    pub index_hash: Hash,
    pub value_hash: Hash,
    pub proof_request: ProofRequest,
    pub signature_proof: Option<SignatureProof>,
    pub inclusion_proof: Option<InclusionProof>,
    pub revoked: bool,
    pub deleted: bool,
    /// Sequence number of the state whose Claims tree first held this claim.
    pub state_seq: u64,
    pub link_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_auth_credential(&self) -> bool {
        self.credential_type == AUTH_CREDENTIAL_TYPE
    }

    /// Whether the record may be handed to the holder as-is.
    pub fn is_deliverable(&self) -> bool {
        !self.proof_request.wants_inclusion() || self.inclusion_proof.is_some()
    }

    /// W3C-shaped JSON document.
    pub fn to_w3c(&self) -> Value {
        let mut subject: serde_json::Map<String, Value> =
            self.credential_subject.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        subject.insert("type".into(), Value::String(self.credential_type.clone()));
        if let Some(did) = &self.subject {
            subject.insert("id".into(), Value::String(did.to_string()));
        }

        let mut proofs = Vec::new();
        if let Some(sig) = &self.signature_proof {
            let mut value = serde_json::to_value(sig).unwrap_or(Value::Null);
            value["type"] = json!("BJJSignature2021");
            proofs.push(value);
        }
        if let Some(mtp) = &self.inclusion_proof {
            let mut value = serde_json::to_value(mtp).unwrap_or(Value::Null);
            value["type"] = json!("Iden3SparseMerkleTreeProof");
            proofs.push(value);
        }

        let mut doc = json!({
            "id": format!("urn:uuid:{}", self.id),
            "@context": self.contexts,
            "type": self.types,
            "issuer": self.issuer.to_string(),
            "issuanceDate": self.created_at.to_rfc3339(),
            "credentialSubject": Value::Object(subject),
            "credentialStatus": self.credential_status,
            "credentialSchema": { "id": self.schema_url, "type": "JsonSchema2023" },
        });
        if let Some(exp) = &self.expiration {
            doc["expirationDate"] = json!(exp.to_rfc3339());
        }
        if !proofs.is_empty() {
            doc["proof"] = Value::Array(proofs);
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_values_serialize_bare() {
        let mut subject = CredentialSubject::new();
        subject.insert("birthday".into(), ScalarValue::Int(19900101));
        subject.insert("name".into(), ScalarValue::String("alice".into()));
        subject.insert("adult".into(), ScalarValue::Bool(true));
        let json = serde_json::to_string(&subject).unwrap();
        assert_eq!(json, r#"{"adult":true,"birthday":19900101,"name":"alice"}"#);
        let back: CredentialSubject = serde_json::from_str(&json).unwrap();
        assert_eq!(back, subject);
    }

    #[test]
    fn test_scalar_rejects_floats_and_objects() {
        assert!(serde_json::from_str::<ScalarValue>("1.5").is_err());
        assert!(serde_json::from_str::<ScalarValue>("{}").is_err());
    }

    #[test]
    fn test_proof_request_flags() {
        assert_eq!(ProofRequest::from_flags(true, false), Some(ProofRequest::Signature));
        assert_eq!(ProofRequest::from_flags(true, true), Some(ProofRequest::Both));
        assert_eq!(ProofRequest::from_flags(false, false), None);
        assert!(ProofRequest::MerkleInclusion.wants_inclusion());
        assert!(!ProofRequest::MerkleInclusion.wants_signature());
    }

    #[test]
    fn test_status_block_per_mode() {
        let issuer = Did::parse("did:x:issuer").unwrap();
        let status = CredentialStatus::new(CredentialStatusMode::Signature, "https://issuer.example/", "0x0", &issuer, 42);
        assert_eq!(status.status_type, "SparseMerkleTreeProof");
        assert_eq!(status.id, "https://issuer.example/v1/did:x:issuer/claims/revocation/status/42");
        let status = CredentialStatus::new(CredentialStatusMode::OnChain, "https://issuer.example", "0xabc", &issuer, 7);
        assert!(status.id.contains("contractAddress=0xabc"));
    }
}
