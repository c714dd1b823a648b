// src/merkle/engine.rs
//! Tree Engine: the three trees of every identity over a shared [`Store`].
//!
//! Mutations go through an [`IdentityTx`], which holds the identity's lock and
//! journals node writes, root updates and record upserts into one
//! [`WriteBatch`]. Reads outside a transaction run against committed data and
//! take no identity lock.

use crate::merkle::proof::MerkleProof;
use crate::merkle::tree::{Node, NodeSink, NodeSource, SparseMerkleTree, TreeError};
use crate::merkle::TreeKind;
use crate::models::credential::Credential;
use crate::models::did::Did;
use crate::models::link::Link;
use crate::models::state::{Identity, IdentityState};
use crate::storage::store::{Store, StoreError, WriteBatch};
use crate::utils::crypto::Hash;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// One tree of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeHandle {
    pub did: Did,
    pub kind: TreeKind,
}

/// Committed nodes of one tree.
struct StoreNodes<'a> {
    store: &'a dyn Store,
    did: &'a Did,
    kind: TreeKind,
}

impl NodeSource for StoreNodes<'_> {
    fn node(&self, hash: &Hash) -> Result<Option<Node>, TreeError> {
        match self.store.node(self.did, self.kind, hash)? {
            Some(bytes) => Ok(Some(Node::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Committed nodes overlaid with a transaction's journal.
struct TxNodes<'a> {
    store: &'a dyn Store,
    batch: &'a mut WriteBatch,
    did: &'a Did,
    kind: TreeKind,
}

impl NodeSource for TxNodes<'_> {
    fn node(&self, hash: &Hash) -> Result<Option<Node>, TreeError> {
        if let Some(bytes) = self.batch.node(self.did, self.kind, hash) {
            return Ok(Some(Node::from_bytes(bytes)?));
        }
        StoreNodes { store: self.store, did: self.did, kind: self.kind }.node(hash)
    }
}

impl NodeSink for TxNodes<'_> {
    fn put_node(&mut self, node: Node) -> Result<Hash, TreeError> {
        let hash = node.hash();
        if self.batch.node(self.did, self.kind, &hash).is_none() && self.store.node(self.did, self.kind, &hash)?.is_none() {
            self.batch.put_node(self.did, self.kind, hash, node.to_bytes().to_vec());
        }
        Ok(hash)
    }
}

/// Map size below which idle identity locks are left in place.
const MIN_LOCKS_BEFORE_PRUNE: usize = 64;

/// Per-identity locks. Entries nobody holds or waits on are dropped once the
/// map doubles past the size left by the previous prune.
struct IdentityLocks {
    locks: HashMap<Did, Arc<AsyncMutex<()>>>,
    prune_at: usize,
}

impl IdentityLocks {
    fn new() -> Self {
        Self { locks: HashMap::new(), prune_at: MIN_LOCKS_BEFORE_PRUNE }
    }

    fn get(&mut self, did: &Did) -> Arc<AsyncMutex<()>> {
        if self.locks.len() >= self.prune_at && !self.locks.contains_key(did) {
            // The map holds the only reference to an idle lock.
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            self.prune_at = (self.locks.len() * 2).max(MIN_LOCKS_BEFORE_PRUNE);
        }
        self.locks.entry(did.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

pub struct TreeEngine {
    store: Arc<dyn Store>,
    tree: SparseMerkleTree,
    locks: Mutex<IdentityLocks>,
}

impl TreeEngine {
    pub fn new(store: Arc<dyn Store>, max_levels: usize) -> Self {
        Self { store, tree: SparseMerkleTree::new(max_levels), locks: Mutex::new(IdentityLocks::new()) }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn max_levels(&self) -> usize {
        self.tree.max_levels()
    }

    pub fn open(&self, did: &Did, kind: TreeKind) -> TreeHandle {
        TreeHandle { did: did.clone(), kind }
    }

    /// Current committed root; the empty root for a tree never written.
    pub fn root(&self, handle: &TreeHandle) -> Result<Hash, TreeError> {
        Ok(self.store.latest_root(&handle.did, handle.kind)?.unwrap_or(Hash::ZERO))
    }

    fn is_known_root(&self, handle: &TreeHandle, root: &Hash) -> Result<bool, StoreError> {
        Ok(root.is_zero() || self.store.contains_root(&handle.did, handle.kind, root)?)
    }

    /// Proof for `key` against a root that was current at some point.
    pub fn proof(&self, handle: &TreeHandle, key: &Hash, at_root: &Hash) -> Result<MerkleProof, TreeError> {
        if !self.is_known_root(handle, at_root)? {
            return Err(TreeError::UnknownRoot(*at_root));
        }
        let nodes = StoreNodes { store: self.store.as_ref(), did: &handle.did, kind: handle.kind };
        self.tree.prove(&nodes, *at_root, key)
    }

    pub fn get(&self, handle: &TreeHandle, key: &Hash, at_root: &Hash) -> Result<Option<Hash>, TreeError> {
        let proof = self.proof(handle, key, at_root)?;
        Ok(if proof.existence { proof.value } else { None })
    }

    /// Single insert in its own transaction.
    pub async fn insert(&self, handle: &TreeHandle, key: Hash, value: Hash) -> Result<Hash, TreeError> {
        let mut tx = self.begin_transaction(&handle.did).await;
        let root = tx.insert(handle.kind, key, value)?;
        tx.commit()?;
        Ok(root)
    }

    fn identity_lock(&self, did: &Did) -> Arc<AsyncMutex<()>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).get(did)
    }

    /// Waits for exclusive access to the identity's trees and records.
    pub async fn begin_transaction(&self, did: &Did) -> IdentityTx {
        let guard = self.identity_lock(did).lock_owned().await;
        IdentityTx {
            did: did.clone(),
            store: self.store.clone(),
            tree: self.tree,
            batch: WriteBatch::new(),
            _guard: guard,
        }
    }
}

/// Exclusive, journalled access to one identity.
///
/// Reads see the transaction's own writes first. `commit` applies the
/// journal in one [`Store::apply`]; dropping the transaction discards it.
pub struct IdentityTx {
    did: Did,
    store: Arc<dyn Store>,
    tree: SparseMerkleTree,
    batch: WriteBatch,
    _guard: OwnedMutexGuard<()>,
}

impl IdentityTx {
    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn root(&self, kind: TreeKind) -> Result<Hash, TreeError> {
        if let Some(root) = self.batch.latest_root(&self.did, kind) {
            return Ok(root);
        }
        Ok(self.store.latest_root(&self.did, kind)?.unwrap_or(Hash::ZERO))
    }

    /// Inserts into the identity's `kind` tree and returns the new root.
    pub fn insert(&mut self, kind: TreeKind, key: Hash, value: Hash) -> Result<Hash, TreeError> {
        let root = self.root(kind)?;
        let mut nodes = TxNodes { store: self.store.as_ref(), batch: &mut self.batch, did: &self.did, kind };
        let new_root = self.tree.insert(&mut nodes, root, key, value)?;
        if new_root != root {
            self.batch.push_root(&self.did, kind, new_root);
        }
        Ok(new_root)
    }

    /// Value under `key` at the tree's current (uncommitted) root.
    pub fn get(&mut self, kind: TreeKind, key: &Hash) -> Result<Option<Hash>, TreeError> {
        let root = self.root(kind)?;
        let nodes = TxNodes { store: self.store.as_ref(), batch: &mut self.batch, did: &self.did, kind };
        self.tree.get(&nodes, root, key)
    }

    pub fn prove(&mut self, kind: TreeKind, key: &Hash, at_root: &Hash) -> Result<MerkleProof, TreeError> {
        let known = at_root.is_zero()
            || self.batch.has_root(&self.did, kind, at_root)
            || self.store.contains_root(&self.did, kind, at_root)?;
        if !known {
            return Err(TreeError::UnknownRoot(*at_root));
        }
        let nodes = TxNodes { store: self.store.as_ref(), batch: &mut self.batch, did: &self.did, kind };
        self.tree.prove(&nodes, *at_root, key)
    }

    pub fn identity(&self) -> Result<Option<Identity>, StoreError> {
        if let Some(identity) = self.batch.identity(&self.did) {
            return Ok(Some(identity.clone()));
        }
        self.store.identity(&self.did)
    }

    pub fn put_identity(&mut self, identity: Identity) {
        self.batch.put_identity(identity);
    }

    /// Every state of the identity, ordered by sequence number.
    pub fn states(&self) -> Result<Vec<IdentityState>, StoreError> {
        let mut merged: BTreeMap<u64, IdentityState> =
            self.store.states(&self.did)?.into_iter().map(|s| (s.seq, s)).collect();
        for state in self.batch.states(&self.did) {
            merged.insert(state.seq, state.clone());
        }
        Ok(merged.into_values().collect())
    }

    pub fn put_state(&mut self, state: IdentityState) {
        self.batch.put_state(state);
    }

    pub fn credential(&self, id: &Uuid) -> Result<Option<Credential>, StoreError> {
        if let Some(cred) = self.batch.credential(id) {
            return Ok(Some(cred.clone()));
        }
        self.store.credential(id)
    }

    pub fn credential_by_nonce(&self, nonce: u64) -> Result<Option<Credential>, StoreError> {
        if let Some(cred) = self.batch.credentials().find(|c| c.issuer == self.did && c.revocation_nonce == nonce) {
            return Ok(Some(cred.clone()));
        }
        self.store.credential_by_nonce(&self.did, nonce)
    }

    pub fn credential_by_index(&self, index_hash: &Hash) -> Result<Option<Credential>, StoreError> {
        if let Some(cred) = self.batch.credentials().find(|c| c.issuer == self.did && &c.index_hash == index_hash) {
            return Ok(Some(cred.clone()));
        }
        self.store.credential_by_index(&self.did, index_hash)
    }

    /// Credentials of this identity, including uncommitted ones.
    pub fn credentials(&self) -> Result<Vec<Credential>, StoreError> {
        let mut all = self.store.credentials(&self.did)?;
        for pending in self.batch.credentials().filter(|c| c.issuer == self.did) {
            match all.iter_mut().find(|c| c.id == pending.id) {
                Some(slot) => *slot = pending.clone(),
                None => all.push(pending.clone()),
            }
        }
        Ok(all)
    }

    pub fn put_credential(&mut self, credential: Credential) {
        self.batch.put_credential(credential);
    }

    pub fn link(&self, id: &Uuid) -> Result<Option<Link>, StoreError> {
        if self.batch.is_link_deleted(id) {
            return Ok(None);
        }
        if let Some(link) = self.batch.link(id) {
            return Ok(Some(link.clone()));
        }
        self.store.link(id)
    }

    pub fn put_link(&mut self, link: Link) {
        self.batch.put_link(link);
    }

    pub fn delete_link(&mut self, id: Uuid) {
        self.batch.delete_link(id);
    }

    /// Drops everything journalled so far but keeps the identity lock.
    pub fn discard(&mut self) {
        self.batch = WriteBatch::new();
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.store.apply(self.batch)
    }

    pub fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;

    fn engine() -> TreeEngine {
        TreeEngine::new(Arc::new(MemoryStore::new()), 40)
    }

    fn did(name: &str) -> Did {
        Did::parse(&format!("did:x:{}", name)).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_prove_against_history() {
        let engine = engine();
        let handle = engine.open(&did("a"), TreeKind::Revocation);
        let first = engine.insert(&handle, Hash::from_u64(10), Hash::ZERO).await.unwrap();
        let second = engine.insert(&handle, Hash::from_u64(11), Hash::ZERO).await.unwrap();
        assert_eq!(engine.root(&handle).unwrap(), second);

        let old = engine.proof(&handle, &Hash::from_u64(11), &first).unwrap();
        assert!(old.verify_non_inclusion(&first, &Hash::from_u64(11)));
        let new = engine.proof(&handle, &Hash::from_u64(11), &second).unwrap();
        assert!(new.verify_inclusion(&second, &Hash::from_u64(11), &Hash::ZERO));
        // The empty root is always a valid historical root.
        assert!(engine.proof(&handle, &Hash::from_u64(11), &Hash::ZERO).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_root_rejected() {
        let engine = engine();
        let handle = engine.open(&did("a"), TreeKind::Claims);
        engine.insert(&handle, Hash::from_u64(1), Hash::from_u64(2)).await.unwrap();
        let err = engine.proof(&handle, &Hash::from_u64(1), &Hash::from_u64(999)).unwrap_err();
        assert!(matches!(err, TreeError::UnknownRoot(_)));

        // Roots are tracked per tree.
        let claims_root = engine.root(&handle).unwrap();
        let roots = engine.open(&did("a"), TreeKind::Roots);
        assert!(matches!(engine.proof(&roots, &Hash::ZERO, &claims_root), Err(TreeError::UnknownRoot(_))));
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let engine = engine();
        let a = did("a");
        let mut tx = engine.begin_transaction(&a).await;
        tx.insert(TreeKind::Claims, Hash::from_u64(1), Hash::from_u64(2)).unwrap();
        assert_ne!(tx.root(TreeKind::Claims).unwrap(), Hash::ZERO);
        assert_eq!(tx.get(TreeKind::Claims, &Hash::from_u64(1)).unwrap(), Some(Hash::from_u64(2)));
        tx.rollback();

        let handle = engine.open(&a, TreeKind::Claims);
        assert_eq!(engine.root(&handle).unwrap(), Hash::ZERO);
    }

    #[tokio::test]
    async fn test_transaction_is_atomic_across_trees() {
        let engine = engine();
        let a = did("a");
        let mut tx = engine.begin_transaction(&a).await;
        let claims = tx.insert(TreeKind::Claims, Hash::from_u64(1), Hash::from_u64(2)).unwrap();
        let roots = tx.insert(TreeKind::Roots, claims, Hash::ZERO).unwrap();
        // Not visible before commit.
        assert_eq!(engine.root(&engine.open(&a, TreeKind::Roots)).unwrap(), Hash::ZERO);
        tx.commit().unwrap();
        assert_eq!(engine.root(&engine.open(&a, TreeKind::Claims)).unwrap(), claims);
        assert_eq!(engine.root(&engine.open(&a, TreeKind::Roots)).unwrap(), roots);
    }

    #[tokio::test]
    async fn test_duplicate_key_in_transaction() {
        let engine = engine();
        let mut tx = engine.begin_transaction(&did("a")).await;
        tx.insert(TreeKind::Claims, Hash::from_u64(1), Hash::from_u64(2)).unwrap();
        let err = tx.insert(TreeKind::Claims, Hash::from_u64(1), Hash::from_u64(3)).unwrap_err();
        assert!(matches!(err, TreeError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_distinct_identities_do_not_block() {
        let engine = engine();
        let _held = engine.begin_transaction(&did("a")).await;
        let other = tokio::time::timeout(std::time::Duration::from_secs(1), engine.begin_transaction(&did("b"))).await;
        assert!(other.is_ok());
        let same = tokio::time::timeout(std::time::Duration::from_millis(50), engine.begin_transaction(&did("a"))).await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn test_idle_identity_locks_are_pruned() {
        let engine = engine();
        let held = engine.begin_transaction(&did("held")).await;
        for i in 0..MIN_LOCKS_BEFORE_PRUNE * 4 {
            drop(engine.begin_transaction(&did(&format!("idle{}", i))).await);
        }
        let size = engine.locks.lock().unwrap().locks.len();
        assert!(size <= MIN_LOCKS_BEFORE_PRUNE, "{} locks kept", size);
        assert!(engine.locks.lock().unwrap().locks.contains_key(&did("held")));

        // The held lock survived pruning and still excludes.
        let same = tokio::time::timeout(std::time::Duration::from_millis(50), engine.begin_transaction(&did("held"))).await;
        assert!(same.is_err());
        drop(held);
        assert_eq!(engine.begin_transaction(&did("held")).await.did(), &did("held"));
    }
}
