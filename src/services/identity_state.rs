// src/services/identity_state.rs
//! Identity State Manager.
//!
//! Owns every identity's state chain:
//!
//! ```text
//! created ──seal──▶ pending ──submit──▶ publishing ──confirm──▶ confirmed
//!                                         │
//!                                         └──error──▶ failed ──retry──▶ pending
//! ```
//!
//! Claims and revocation mutations always land in the identity's open
//! `created` state. While an older state is `pending` or `publishing`, a new
//! `created` state opens behind it. Every opened state's Roots tree holds the
//! claims root of the latest confirmed state.

use crate::claims::codec;
use crate::config::IssuerSettings;
use crate::error::{IssuerError, Result};
use crate::merkle::tree::{MemoryNodes, SparseMerkleTree};
use crate::merkle::{IdentityTx, TreeEngine, TreeKind};
use crate::models::credential::{
    Credential, CredentialStatus, CredentialSubject, InclusionProof, IssuerStateInfo, ProofRequest, ScalarValue,
    AUTH_CREDENTIAL_TYPE, IDEN3_CONTEXT, VERIFIABLE_CREDENTIAL, W3C_CONTEXT,
};
use crate::models::did::Did;
use crate::models::state::{state_hash, CredentialStatusMode, Identity, IdentityState, KeyType, StateStatus};
use crate::services::revocation::random_nonce;
use crate::utils::crypto::Hash;
use crate::wallet::key_management::KeyManager;
use chrono::Utc;
use ethers_core::utils::hex;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

pub const AUTH_SCHEMA_URL: &str = "https://schema.iden3.io/core/jsonld/auth.jsonld";

pub struct IdentityStateManager {
    engine: Arc<TreeEngine>,
    keys: Arc<KeyManager>,
    settings: IssuerSettings,
    /// Contract named in on-chain credential status blocks.
    status_contract: String,
    /// Serialises genesis so display names stay unique.
    genesis_lock: AsyncMutex<()>,
}

impl IdentityStateManager {
    pub fn new(engine: Arc<TreeEngine>, keys: Arc<KeyManager>, settings: IssuerSettings, status_contract: impl Into<String>) -> Self {
        Self { engine, keys, settings, status_contract: status_contract.into(), genesis_lock: AsyncMutex::new(()) }
    }

    pub fn engine(&self) -> &Arc<TreeEngine> {
        &self.engine
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn settings(&self) -> &IssuerSettings {
        &self.settings
    }

    pub fn credential_status(&self, identity: &Identity, nonce: u64) -> CredentialStatus {
        CredentialStatus::new(identity.revocation_mode, &self.settings.base_url, &self.status_contract, &identity.did, nonce)
    }

    /// Creates an identity: a fresh key, its authentication claim and the
    /// confirmed genesis state derived from it.
    ///
    /// # Arguments
    /// * `key_type` - Curve of the authentication key
    /// * `display_name` - Optional unique label
    /// * `revocation_mode` - How credentials point holders at revocation status
    ///
    /// # Returns
    /// The identity, whose DID is derived from the genesis state, and that state
    ///
    /// # Errors
    /// * `BadRequest` - blank display name
    /// * `DisplayNameTaken` - the label belongs to another identity
    /// * `KeyStoreUnavailable` - the key could not be created
    pub async fn genesis(
        &self,
        key_type: KeyType,
        display_name: Option<String>,
        revocation_mode: CredentialStatusMode,
    ) -> Result<(Identity, IdentityState)> {
        let display_name = match display_name.map(|n| n.trim().to_string()) {
            Some(name) if name.is_empty() => return Err(IssuerError::BadRequest("display name is empty".into())),
            other => other,
        };

        let _genesis = self.genesis_lock.lock().await;
        if let Some(name) = &display_name {
            let taken = self
                .engine
                .store()
                .identities()?
                .iter()
                .any(|i| i.display_name.as_deref() == Some(name.as_str()));
            if taken {
                return Err(IssuerError::DisplayNameTaken(name.clone()));
            }
        }

        let key_id = self.keys.create(key_type).await?;
        let public_key = self.keys.public_key(&key_id).await?;
        let nonce = random_nonce(self.settings.nonce_bits);
        let auth_claim = codec::auth_claim(key_type, &public_key, nonce)?;

        // The DID depends on the genesis state, so the claims root is
        // computed before the identity's trees exist.
        let scratch = SparseMerkleTree::new(self.engine.max_levels());
        let claims_root =
            scratch.insert(&mut MemoryNodes::new(), Hash::ZERO, auth_claim.index_hash(), auth_claim.value_hash())?;
        let genesis_state = state_hash(&claims_root, &Hash::ZERO, &Hash::ZERO);
        let did = Did::from_genesis(&self.settings.did_method, &self.settings.did_network, key_type, &genesis_state);

        let mut tx = self.engine.begin_transaction(&did).await;
        if tx.identity()?.is_some() {
            return Err(IssuerError::Internal(format!("genesis state of {} collides with an existing identity", did)));
        }
        let root = tx.insert(TreeKind::Claims, auth_claim.index_hash(), auth_claim.value_hash())?;
        if root != claims_root {
            return Err(IssuerError::Internal(format!("genesis claims root mismatch for {}", did)));
        }

        let now = Utc::now();
        let state = IdentityState {
            did: did.clone(),
            seq: 0,
            state: Some(genesis_state),
            previous_state: None,
            claims_root,
            revocation_root: Hash::ZERO,
            roots_root: Hash::ZERO,
            status: StateStatus::Confirmed,
            mutations: 0,
            tx_id: None,
            block_number: None,
            block_timestamp: None,
            created_at: now,
            modified_at: now,
        };
        let identity = Identity {
            did: did.clone(),
            key_type,
            key_id,
            display_name,
            genesis_state,
            auth_claim,
            auth_credential_id: Uuid::new_v4(),
            revocation_mode,
            quarantined: false,
            created_at: now,
        };

        let mtp = tx.prove(TreeKind::Claims, &auth_claim.index_hash(), &claims_root)?;
        let issuer_state = IssuerStateInfo::from_state(&state)
            .ok_or_else(|| IssuerError::Internal("genesis state is unsealed".into()))?;
        let mut subject = CredentialSubject::new();
        subject.insert("publicKey".into(), ScalarValue::String(format!("0x{}", hex::encode(&public_key))));
        let auth_credential = Credential {
            id: identity.auth_credential_id,
            issuer: did.clone(),
            subject: None,
            contexts: vec![W3C_CONTEXT.into(), IDEN3_CONTEXT.into()],
            types: vec![VERIFIABLE_CREDENTIAL.into(), AUTH_CREDENTIAL_TYPE.into()],
            schema_url: AUTH_SCHEMA_URL.into(),
            credential_type: AUTH_CREDENTIAL_TYPE.into(),
            credential_subject: subject,
            expiration: None,
            credential_status: self.credential_status(&identity, nonce),
            revocation_nonce: nonce,
            core_claim: auth_claim,
            index_hash: auth_claim.index_hash(),
            value_hash: auth_claim.value_hash(),
            proof_request: ProofRequest::MerkleInclusion,
            signature_proof: None,
            inclusion_proof: Some(InclusionProof { issuer: did.clone(), issuer_state, core_claim: auth_claim, mtp }),
            revoked: false,
            deleted: false,
            state_seq: 0,
            link_id: None,
            created_at: now,
        };

        tx.put_identity(identity.clone());
        tx.put_state(state.clone());
        tx.put_credential(auth_credential);
        tx.commit()?;
        info!("genesis of {} ({:?}) at state {}", did, key_type, genesis_state);
        Ok((identity, state))
    }

    pub fn identity(&self, did: &Did) -> Result<Identity> {
        self.engine.store().identity(did)?.ok_or_else(|| IssuerError::UnknownIdentity(did.to_string()))
    }

    pub fn identities(&self) -> Result<Vec<Identity>> {
        Ok(self.engine.store().identities()?)
    }

    /// The identity's state chain, oldest first.
    pub fn states(&self, did: &Did) -> Result<Vec<IdentityState>> {
        self.identity(did)?;
        Ok(self.engine.store().states(did)?)
    }

    /// Most recent confirmed state.
    pub fn current_latest(&self, did: &Did) -> Result<IdentityState> {
        latest_confirmed(&self.states(did)?)
            .cloned()
            .ok_or_else(|| IssuerError::Internal(format!("{} has no confirmed state", did)))
    }

    /// The open `created` state or the sealed `pending` one, without creating either.
    pub fn pending_state(&self, did: &Did) -> Result<Option<IdentityState>> {
        Ok(self
            .states(did)?
            .into_iter()
            .rev()
            .find(|s| matches!(s.status, StateStatus::Created | StateStatus::Pending)))
    }

    /// The `created` state accumulating mutations, opened if none exists.
    pub async fn current_pending(&self, did: &Did) -> Result<IdentityState> {
        let mut tx = self.engine.begin_transaction(did).await;
        mutable_identity(&tx)?;
        let state = open_state(&mut tx)?;
        tx.commit()?;
        Ok(state)
    }

    pub fn state_by_hash(&self, did: &Did, hash: &Hash) -> Result<IdentityState> {
        self.states(did)?
            .into_iter()
            .find(|s| s.state.as_ref() == Some(hash))
            .ok_or_else(|| IssuerError::UnknownState(hash.to_string()))
    }

    pub fn state_by_seq(&self, did: &Did, seq: u64) -> Result<IdentityState> {
        self.states(did)?
            .into_iter()
            .find(|s| s.seq == seq)
            .ok_or_else(|| IssuerError::UnknownState(format!("{}#{}", did, seq)))
    }

    /// Freezes the open state's root triple and fixes its hash.
    ///
    /// Refused while another state of the identity is in flight, and when
    /// the open state carries no claims or revocation mutation.
    pub async fn seal_for_publication(&self, did: &Did) -> Result<IdentityState> {
        let mut tx = self.engine.begin_transaction(did).await;
        let identity = mutable_identity(&tx)?;
        let states = tx.states()?;
        if states.iter().any(|s| s.status.is_in_flight()) {
            return Err(IssuerError::PublicationInFlight);
        }
        let mut open = match states.last() {
            Some(s) if s.status == StateStatus::Created && s.mutations > 0 => s.clone(),
            _ => return Err(IssuerError::NothingToPublish),
        };
        let previous = states
            .iter()
            .find(|s| s.seq + 1 == open.seq)
            .and_then(|s| s.state)
            .ok_or_else(|| IssuerError::Internal(format!("state {} of {} has no sealed predecessor", open.seq, did)))?;

        refresh_roots(&mut tx, &mut open)?;
        let hash = open.compute_hash();
        if let Some(existing) = states.iter().find(|s| s.state == Some(hash)) {
            let reason = format!("state hash {} of seq {} repeats seq {}", hash, open.seq, existing.seq);
            return Err(quarantine_in(tx, identity, reason));
        }

        open.state = Some(hash);
        open.previous_state = Some(previous);
        open.status = StateStatus::Pending;
        open.modified_at = Utc::now();
        tx.put_state(open.clone());
        tx.commit()?;
        info!("sealed state {} of {} ({} mutations)", hash, did, open.mutations);
        Ok(open)
    }

    /// Records the anchor transaction of a `pending` state.
    pub async fn mark_publishing(&self, did: &Did, seq: u64, tx_id: &str) -> Result<IdentityState> {
        let mut tx = self.engine.begin_transaction(did).await;
        let mut state = state_in(&tx, seq)?;
        if state.status != StateStatus::Pending {
            return Err(IssuerError::BadRequest(format!("state {} is {}, not pending", seq, state.status)));
        }
        state.status = StateStatus::Publishing;
        state.tx_id = Some(tx_id.to_string());
        state.modified_at = Utc::now();
        tx.put_state(state.clone());
        tx.commit()?;
        info!("state {:?} of {} publishing in {}", state.state, did, tx_id);
        Ok(state)
    }

    /// Promotes a publishing state to the latest confirmed one.
    ///
    /// In the same commit, every credential whose claim the state holds gets
    /// its inclusion proof, and the next state opens with the confirmed claims
    /// root in its Roots tree. Confirming twice returns the state unchanged.
    ///
    /// # Errors
    /// * `BadRequest` - the state is not `publishing`
    /// * `Internal` - the confirmation would fork the chain or a covered claim
    ///   is missing from the claims root; the identity is quarantined
    pub async fn mark_confirmed(&self, did: &Did, seq: u64, block: u64, timestamp: i64) -> Result<IdentityState> {
        let mut tx = self.engine.begin_transaction(did).await;
        let identity = tx.identity()?.ok_or_else(|| IssuerError::UnknownIdentity(did.to_string()))?;
        let states = tx.states()?;
        let mut state = state_in(&tx, seq)?;
        if state.status == StateStatus::Confirmed {
            return Ok(state);
        }
        if state.status != StateStatus::Publishing {
            return Err(IssuerError::BadRequest(format!("state {} is {}, not publishing", seq, state.status)));
        }
        let forked = states
            .iter()
            .any(|s| s.seq != seq && s.status == StateStatus::Confirmed && s.previous_state == state.previous_state);
        let latest = latest_confirmed(&states).and_then(|s| s.state);
        if forked || latest != state.previous_state {
            let reason = format!("confirmation of state {:?} would fork the chain of {}", state.state, did);
            return Err(quarantine_in(tx, identity, reason));
        }

        state.status = StateStatus::Confirmed;
        state.block_number = Some(block);
        state.block_timestamp = Some(timestamp);
        state.modified_at = Utc::now();
        tx.put_state(state.clone());
        let attached = match attach_inclusion_proofs(&mut tx, &state) {
            Ok(attached) => attached,
            Err(IssuerError::Internal(reason)) => return Err(quarantine_in(tx, identity, reason)),
            Err(e) => return Err(e),
        };
        open_state(&mut tx)?;
        tx.commit()?;
        info!("state {:?} of {} confirmed in block {} ({} inclusion proofs attached)", state.state, did, block, attached);
        Ok(state)
    }

    /// Marks a `pending` or `publishing` state failed with the anchor's reason.
    pub async fn mark_failed(&self, did: &Did, seq: u64, reason: &str) -> Result<IdentityState> {
        let mut tx = self.engine.begin_transaction(did).await;
        let mut state = state_in(&tx, seq)?;
        if !matches!(state.status, StateStatus::Pending | StateStatus::Publishing) {
            return Err(IssuerError::BadRequest(format!("state {} is {}, cannot fail", seq, state.status)));
        }
        state.status = StateStatus::Failed(reason.to_string());
        state.modified_at = Utc::now();
        tx.put_state(state.clone());
        tx.commit()?;
        warn!("state {:?} of {} failed: {}", state.state, did, reason);
        Ok(state)
    }

    /// Puts the most recent failed state back to `pending`. Its hash is kept.
    pub async fn retry(&self, did: &Did) -> Result<IdentityState> {
        let mut tx = self.engine.begin_transaction(did).await;
        mutable_identity(&tx)?;
        let mut state = tx
            .states()?
            .into_iter()
            .rev()
            .find(|s| matches!(s.status, StateStatus::Failed(_)))
            .ok_or_else(|| IssuerError::UnknownState(format!("{} has no failed state", did)))?;
        state.status = StateStatus::Pending;
        state.tx_id = None;
        state.modified_at = Utc::now();
        tx.put_state(state.clone());
        tx.commit()?;
        info!("retrying state {:?} of {}", state.state, did);
        Ok(state)
    }

    /// Refuses every further mutation of `did`.
    pub async fn quarantine(&self, did: &Did, reason: &str) -> Result<()> {
        let tx = self.engine.begin_transaction(did).await;
        let identity = tx.identity()?.ok_or_else(|| IssuerError::UnknownIdentity(did.to_string()))?;
        quarantine_in(tx, identity, reason.to_string());
        Ok(())
    }
}

pub(crate) fn latest_confirmed(states: &[IdentityState]) -> Option<&IdentityState> {
    states.iter().rev().find(|s| s.status == StateStatus::Confirmed)
}

/// Identity behind `tx`, refusing quarantined ones.
pub(crate) fn mutable_identity(tx: &IdentityTx) -> Result<Identity> {
    let identity = tx.identity()?.ok_or_else(|| IssuerError::UnknownIdentity(tx.did().to_string()))?;
    if identity.quarantined {
        return Err(IssuerError::Quarantined(identity.did.to_string()));
    }
    Ok(identity)
}

fn state_in(tx: &IdentityTx, seq: u64) -> Result<IdentityState> {
    tx.states()?
        .into_iter()
        .find(|s| s.seq == seq)
        .ok_or_else(|| IssuerError::UnknownState(format!("{}#{}", tx.did(), seq)))
}

fn refresh_roots(tx: &mut IdentityTx, state: &mut IdentityState) -> Result<()> {
    state.claims_root = tx.root(TreeKind::Claims)?;
    state.revocation_root = tx.root(TreeKind::Revocation)?;
    state.roots_root = tx.root(TreeKind::Roots)?;
    state.modified_at = Utc::now();
    Ok(())
}

/// Returns the identity's `created` state, opening one behind the newest
/// state if needed, after recording the latest confirmed claims root in the
/// Roots tree.
pub(crate) fn open_state(tx: &mut IdentityTx) -> Result<IdentityState> {
    let states = tx.states()?;
    let latest = latest_confirmed(&states)
        .cloned()
        .ok_or_else(|| IssuerError::Internal(format!("{} has no confirmed state", tx.did())))?;
    tx.insert(TreeKind::Roots, latest.claims_root, Hash::ZERO)?;

    let mut state = match states.last() {
        Some(last) if last.status == StateStatus::Created => last.clone(),
        Some(last) => {
            let now = Utc::now();
            IdentityState {
                did: tx.did().clone(),
                seq: last.seq + 1,
                state: None,
                previous_state: latest.state,
                claims_root: Hash::ZERO,
                revocation_root: Hash::ZERO,
                roots_root: Hash::ZERO,
                status: StateStatus::Created,
                mutations: 0,
                tx_id: None,
                block_number: None,
                block_timestamp: None,
                created_at: now,
                modified_at: now,
            }
        }
        None => return Err(IssuerError::Internal(format!("{} has no states", tx.did()))),
    };
    refresh_roots(tx, &mut state)?;
    tx.put_state(state.clone());
    Ok(state)
}

/// Records one claims or revocation mutation against the open state.
pub(crate) fn record_mutation(tx: &mut IdentityTx, state: &mut IdentityState) -> Result<()> {
    refresh_roots(tx, state)?;
    state.mutations += 1;
    tx.put_state(state.clone());
    Ok(())
}

/// Drops the transaction's journal, flags the identity and commits only that.
/// Attaches inclusion proofs against `confirmed` to every live credential
/// whose claim entered the Claims tree at or before it. Runs inside the
/// transaction that confirms the state.
fn attach_inclusion_proofs(tx: &mut IdentityTx, confirmed: &IdentityState) -> Result<usize> {
    let issuer_state = IssuerStateInfo::from_state(confirmed)
        .ok_or_else(|| IssuerError::Internal(format!("confirmed state {} has no hash", confirmed.seq)))?;
    let issuer = tx.did().clone();
    let mut attached = 0;
    for mut credential in tx.credentials()? {
        if credential.deleted || credential.inclusion_proof.is_some() || credential.state_seq > confirmed.seq {
            continue;
        }
        let mtp = tx.prove(TreeKind::Claims, &credential.index_hash, &confirmed.claims_root)?;
        if !mtp.verify_inclusion(&confirmed.claims_root, &credential.index_hash, &credential.value_hash) {
            return Err(IssuerError::Internal(format!(
                "claim of {} is missing from confirmed claims root {}",
                credential.id, confirmed.claims_root
            )));
        }
        credential.inclusion_proof = Some(InclusionProof {
            issuer: issuer.clone(),
            issuer_state: issuer_state.clone(),
            core_claim: credential.core_claim,
            mtp,
        });
        tx.put_credential(credential);
        attached += 1;
    }
    Ok(attached)
}

pub(crate) fn quarantine_in(mut tx: IdentityTx, mut identity: Identity, reason: String) -> IssuerError {
    error!("quarantining {}: {}", identity.did, reason);
    tx.discard();
    identity.quarantined = true;
    tx.put_identity(identity);
    if let Err(e) = tx.commit() {
        error!("could not persist quarantine: {}", e);
    }
    IssuerError::Internal(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;
    use crate::utils::retry::RetryPolicy;
    use crate::wallet::key_management::LocalKeyStore;

    fn manager() -> IdentityStateManager {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(TreeEngine::new(store.clone(), 40));
        let keys = Arc::new(KeyManager::new(Arc::new(LocalKeyStore::new()), store, RetryPolicy::immediate()));
        IdentityStateManager::new(engine, keys, IssuerSettings::default(), "0x00")
    }

    async fn mutate(manager: &IdentityStateManager, did: &Did, key: u64) {
        let mut tx = manager.engine().begin_transaction(did).await;
        let mut state = open_state(&mut tx).unwrap();
        tx.insert(TreeKind::Claims, Hash::from_u64(key), Hash::from_u64(key + 1)).unwrap();
        record_mutation(&mut tx, &mut state).unwrap();
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_genesis() {
        let manager = manager();
        let (identity, state) = manager
            .genesis(KeyType::BabyJubJub, Some("acme".into()), CredentialStatusMode::Signature)
            .await
            .unwrap();
        assert!(identity.did.id_bytes().is_some());
        assert_eq!(state.status, StateStatus::Confirmed);
        assert_eq!(state.previous_state, None);
        assert_eq!(Some(identity.genesis_state), state.state);
        assert_eq!(state.compute_hash(), identity.genesis_state);
        assert_eq!(manager.current_latest(&identity.did).unwrap().seq, 0);

        let taken = manager.genesis(KeyType::Ethereum, Some("acme".into()), CredentialStatusMode::Signature).await;
        assert!(matches!(taken, Err(IssuerError::DisplayNameTaken(_))));
    }

    #[tokio::test]
    async fn test_current_pending_opens_state_with_roots() {
        let manager = manager();
        let (identity, genesis) = manager.genesis(KeyType::BabyJubJub, None, CredentialStatusMode::Signature).await.unwrap();
        let open = manager.current_pending(&identity.did).await.unwrap();
        assert_eq!(open.seq, 1);
        assert_eq!(open.status, StateStatus::Created);
        let roots = manager.engine().open(&identity.did, TreeKind::Roots);
        let proof = manager.engine().proof(&roots, &genesis.claims_root, &open.roots_root).unwrap();
        assert!(proof.verify_inclusion(&open.roots_root, &genesis.claims_root, &Hash::ZERO));
        // Opening again returns the same state.
        assert_eq!(manager.current_pending(&identity.did).await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_seal_requires_mutations() {
        let manager = manager();
        let (identity, _) = manager.genesis(KeyType::BabyJubJub, None, CredentialStatusMode::Signature).await.unwrap();
        manager.current_pending(&identity.did).await.unwrap();
        let err = manager.seal_for_publication(&identity.did).await.unwrap_err();
        assert!(matches!(err, IssuerError::NothingToPublish));
    }

    #[tokio::test]
    async fn test_state_machine() {
        let manager = manager();
        let (identity, genesis) = manager.genesis(KeyType::BabyJubJub, None, CredentialStatusMode::Signature).await.unwrap();
        let did = identity.did.clone();
        mutate(&manager, &did, 10).await;

        let sealed = manager.seal_for_publication(&did).await.unwrap();
        assert_eq!(sealed.status, StateStatus::Pending);
        assert_eq!(sealed.previous_state, genesis.state);
        assert_eq!(sealed.state, Some(sealed.compute_hash()));
        assert!(matches!(manager.seal_for_publication(&did).await, Err(IssuerError::PublicationInFlight)));

        // Mutations keep flowing into a new state behind the sealed one.
        mutate(&manager, &did, 20).await;
        let next = manager.pending_state(&did).unwrap().unwrap();
        assert_eq!(next.seq, 2);
        assert_eq!(next.status, StateStatus::Created);
        assert_eq!(manager.state_by_seq(&did, 1).unwrap().status, StateStatus::Pending);

        manager.mark_publishing(&did, sealed.seq, "0xaa").await.unwrap();
        manager.mark_failed(&did, sealed.seq, "gas").await.unwrap();
        let retried = manager.retry(&did).await.unwrap();
        assert_eq!(retried.state, sealed.state);
        manager.mark_publishing(&did, sealed.seq, "0xbb").await.unwrap();
        let confirmed = manager.mark_confirmed(&did, sealed.seq, 100, 1_700_000_000).await.unwrap();
        assert_eq!(confirmed.block_number, Some(100));
        assert_eq!(manager.current_latest(&did).unwrap().state, sealed.state);

        // The next open state carries the confirmed claims root.
        let open = manager.current_pending(&did).await.unwrap();
        let roots = manager.engine().open(&did, TreeKind::Roots);
        let proof = manager.engine().proof(&roots, &confirmed.claims_root, &open.roots_root).unwrap();
        assert!(proof.verify_inclusion(&open.roots_root, &confirmed.claims_root, &Hash::ZERO));

        let second = manager.seal_for_publication(&did).await.unwrap();
        assert_eq!(second.previous_state, sealed.state);
    }

    #[tokio::test]
    async fn test_retry_without_failure() {
        let manager = manager();
        let (identity, _) = manager.genesis(KeyType::BabyJubJub, None, CredentialStatusMode::Signature).await.unwrap();
        assert!(matches!(manager.retry(&identity.did).await, Err(IssuerError::UnknownState(_))));
    }

    #[tokio::test]
    async fn test_quarantine_refuses_mutations() {
        let manager = manager();
        let (identity, _) = manager.genesis(KeyType::BabyJubJub, None, CredentialStatusMode::Signature).await.unwrap();
        manager.quarantine(&identity.did, "test").await.unwrap();
        assert!(manager.identity(&identity.did).unwrap().quarantined);
        let err = manager.current_pending(&identity.did).await.unwrap_err();
        assert!(matches!(err, IssuerError::Quarantined(_)));
    }

    #[tokio::test]
    async fn test_unknown_identity() {
        let manager = manager();
        let did = Did::parse("did:x:nobody").unwrap();
        assert!(matches!(manager.current_latest(&did), Err(IssuerError::UnknownIdentity(_))));
    }
}
