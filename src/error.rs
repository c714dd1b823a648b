// src/error.rs
//! Error taxonomy of the issuer core.
//!
//! Component errors (`TreeError`, `StoreError`, `KeyStoreError`,
//! `AnchorError`, `SchemaError`, `CodecError`, `DidError`) are translated
//! into [`IssuerError`] at the service boundary; the transport maps
//! [`ErrorKind`] to a status code.

use crate::blockchain::anchor::AnchorError;
use crate::claims::codec::CodecError;
use crate::merkle::tree::TreeError;
use crate::models::did::DidError;
use crate::models::schema::SchemaError;
use crate::storage::store::StoreError;
use crate::utils::crypto::Hash;
use crate::wallet::key_management::KeyStoreError;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Upstream,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum IssuerError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("cannot parse claim: {0}")]
    ParseClaim(String),

    #[error("unknown identity {0}")]
    UnknownIdentity(String),
    #[error("unknown credential {0}")]
    UnknownCredential(String),
    #[error("unknown state {0}")]
    UnknownState(String),
    #[error("root {0} was never current")]
    UnknownRoot(Hash),
    #[error("unknown link {0}")]
    UnknownLink(Uuid),

    #[error("claim with index {0} already exists with a different value")]
    DuplicateKey(Hash),
    #[error("display name '{0}' is taken")]
    DisplayNameTaken(String),
    #[error("link is exhausted")]
    LinkExhausted,
    #[error("link has expired")]
    LinkExpired,
    #[error("link is inactive")]
    LinkInactive,
    #[error("credentials were already issued through link {0}")]
    LinkInUse(Uuid),
    #[error("credential {0} awaits publication of its state")]
    StateNotYetPublished(Uuid),
    #[error("identity has no pending mutations to publish")]
    NothingToPublish,
    #[error("a state of this identity is already being published")]
    PublicationInFlight,
    #[error("key '{0}' still authenticates an identity")]
    KeyInUse(String),
    #[error("identity tree is full: {0}")]
    TreeFull(String),

    #[error("key store unavailable: {0}")]
    KeyStoreUnavailable(String),
    #[error("schema unavailable: {0}")]
    SchemaUnavailable(String),
    #[error("state anchor unavailable: {0}")]
    AnchorUnavailable(String),

    #[error("invariant violated: {0}")]
    Internal(String),
    #[error("identity {0} is quarantined")]
    Quarantined(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl IssuerError {
    pub fn kind(&self) -> ErrorKind {
        use IssuerError::*;
        match self {
            BadRequest(_) | ParseClaim(_) => ErrorKind::BadRequest,
            UnknownIdentity(_) | UnknownCredential(_) | UnknownState(_) | UnknownRoot(_) | UnknownLink(_) => {
                ErrorKind::NotFound
            }
            DuplicateKey(_) | DisplayNameTaken(_) | LinkExhausted | LinkExpired | LinkInactive | LinkInUse(_)
            | StateNotYetPublished(_) | NothingToPublish | PublicationInFlight | KeyInUse(_) | TreeFull(_)
            | Quarantined(_) => ErrorKind::Conflict,
            KeyStoreUnavailable(_) | SchemaUnavailable(_) | AnchorUnavailable(_) | Storage(_) => ErrorKind::Upstream,
            Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<TreeError> for IssuerError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::DuplicateKey { key } => IssuerError::DuplicateKey(key),
            TreeError::UnknownRoot(root) => IssuerError::UnknownRoot(root),
            TreeError::MaxLevelsReached { key } => IssuerError::TreeFull(format!("key {} exceeds maximum depth", key)),
            TreeError::MissingNode(hash) => IssuerError::Internal(format!("tree node {} is missing", hash)),
            TreeError::InvalidEncoding => IssuerError::Internal("corrupt tree node".into()),
            TreeError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for IssuerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => IssuerError::Storage(msg),
            StoreError::Constraint(msg) => IssuerError::Internal(msg),
        }
    }
}

impl From<KeyStoreError> for IssuerError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::KeyInUse(id) => IssuerError::KeyInUse(id),
            KeyStoreError::UnknownKey(id) => IssuerError::Internal(format!("signing key '{}' is missing", id)),
            KeyStoreError::InvalidKey(msg) => IssuerError::BadRequest(msg),
            other => IssuerError::KeyStoreUnavailable(other.to_string()),
        }
    }
}

impl From<AnchorError> for IssuerError {
    fn from(e: AnchorError) -> Self {
        IssuerError::AnchorUnavailable(e.to_string())
    }
}

impl From<SchemaError> for IssuerError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::Invalid(msg) | SchemaError::UnsupportedScheme(msg) => IssuerError::BadRequest(msg),
            other => IssuerError::SchemaUnavailable(other.to_string()),
        }
    }
}

impl From<CodecError> for IssuerError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::ParseClaim(msg) => IssuerError::ParseClaim(msg),
            CodecError::Malformed(msg) => IssuerError::Internal(format!("malformed claim entry: {}", msg)),
        }
    }
}

impl From<DidError> for IssuerError {
    fn from(e: DidError) -> Self {
        IssuerError::BadRequest(e.to_string())
    }
}

pub type Result<T, E = IssuerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(IssuerError::ParseClaim("x".into()).kind(), ErrorKind::BadRequest);
        assert_eq!(IssuerError::UnknownRoot(Hash::ZERO).kind(), ErrorKind::NotFound);
        assert_eq!(IssuerError::LinkExhausted.kind(), ErrorKind::Conflict);
        assert_eq!(IssuerError::NothingToPublish.kind(), ErrorKind::Conflict);
        assert_eq!(IssuerError::AnchorUnavailable("x".into()).kind(), ErrorKind::Upstream);
        assert_eq!(IssuerError::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_tree_errors_translate() {
        let dup: IssuerError = TreeError::DuplicateKey { key: Hash::from_u64(1) }.into();
        assert!(matches!(dup, IssuerError::DuplicateKey(_)));
        let root: IssuerError = TreeError::UnknownRoot(Hash::from_u64(2)).into();
        assert!(matches!(root, IssuerError::UnknownRoot(_)));
        let missing: IssuerError = TreeError::MissingNode(Hash::ZERO).into();
        assert_eq!(missing.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_schema_errors_translate() {
        let e: IssuerError = SchemaError::Unavailable("404".into()).into();
        assert!(matches!(e, IssuerError::SchemaUnavailable(_)));
        let e: IssuerError = SchemaError::Invalid("bad".into()).into();
        assert_eq!(e.kind(), ErrorKind::BadRequest);
    }
}
