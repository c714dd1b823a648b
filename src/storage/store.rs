// src/storage/store.rs
//! Transactional record store.
//!
//! All writes go through a [`WriteBatch`] that is applied in one call, so a
//! batch's tree nodes, root updates and identity/state/credential/link rows
//! become visible together or not at all. [`MemoryStore`] is the in-process
//! implementation; a relational backend implements the same trait with one
//! database transaction per `apply`.

use crate::merkle::TreeKind;
use crate::models::credential::Credential;
use crate::models::did::Did;
use crate::models::link::Link;
use crate::models::state::{Identity, IdentityState};
use crate::utils::crypto::Hash;
use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
}

/// Journal of pending writes.
///
/// Later writes to the same row replace earlier ones. Tree nodes are
/// content-addressed per `(identity, tree)` so re-writing one is a no-op.
#[derive(Debug, Default)]
pub struct WriteBatch {
    nodes: HashMap<(Did, TreeKind), HashMap<Hash, Vec<u8>>>,
    roots: Vec<(Did, TreeKind, Hash)>,
    identities: BTreeMap<Did, Identity>,
    states: BTreeMap<(Did, u64), IdentityState>,
    credentials: BTreeMap<Uuid, Credential>,
    links: BTreeMap<Uuid, Link>,
    deleted_links: BTreeSet<Uuid>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.roots.is_empty()
            && self.identities.is_empty()
            && self.states.is_empty()
            && self.credentials.is_empty()
            && self.links.is_empty()
            && self.deleted_links.is_empty()
    }

    pub fn put_node(&mut self, did: &Did, kind: TreeKind, hash: Hash, bytes: Vec<u8>) {
        self.nodes.entry((did.clone(), kind)).or_default().entry(hash).or_insert(bytes);
    }

    pub fn node(&self, did: &Did, kind: TreeKind, hash: &Hash) -> Option<&Vec<u8>> {
        self.nodes.get(&(did.clone(), kind)).and_then(|table| table.get(hash))
    }

    /// Appends `root` to the tree's root history.
    pub fn push_root(&mut self, did: &Did, kind: TreeKind, root: Hash) {
        self.roots.push((did.clone(), kind, root));
    }

    pub fn has_root(&self, did: &Did, kind: TreeKind, root: &Hash) -> bool {
        self.roots.iter().any(|(d, k, r)| d == did && *k == kind && r == root)
    }

    pub fn latest_root(&self, did: &Did, kind: TreeKind) -> Option<Hash> {
        self.roots.iter().rev().find(|(d, k, _)| d == did && *k == kind).map(|(_, _, r)| *r)
    }

    pub fn put_identity(&mut self, identity: Identity) {
        self.identities.insert(identity.did.clone(), identity);
    }

    pub fn identity(&self, did: &Did) -> Option<&Identity> {
        self.identities.get(did)
    }

    pub fn put_state(&mut self, state: IdentityState) {
        self.states.insert((state.did.clone(), state.seq), state);
    }

    pub fn states<'a>(&'a self, did: &'a Did) -> impl Iterator<Item = &'a IdentityState> + 'a {
        self.states.values().filter(move |s| &s.did == did)
    }

    pub fn put_credential(&mut self, credential: Credential) {
        self.credentials.insert(credential.id, credential);
    }

    pub fn credential(&self, id: &Uuid) -> Option<&Credential> {
        self.credentials.get(id)
    }

    pub fn credentials(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.values()
    }

    pub fn put_link(&mut self, link: Link) {
        self.deleted_links.remove(&link.id);
        self.links.insert(link.id, link);
    }

    pub fn delete_link(&mut self, id: Uuid) {
        self.links.remove(&id);
        self.deleted_links.insert(id);
    }

    pub fn link(&self, id: &Uuid) -> Option<&Link> {
        self.links.get(id)
    }

    pub fn is_link_deleted(&self, id: &Uuid) -> bool {
        self.deleted_links.contains(id)
    }
}

/// Persistent tables behind the core services.
pub trait Store: Send + Sync {
    fn node(&self, did: &Did, kind: TreeKind, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError>;
    /// Latest committed root; `None` while the tree has never been written.
    fn latest_root(&self, did: &Did, kind: TreeKind) -> Result<Option<Hash>, StoreError>;
    fn contains_root(&self, did: &Did, kind: TreeKind, root: &Hash) -> Result<bool, StoreError>;

    fn identity(&self, did: &Did) -> Result<Option<Identity>, StoreError>;
    fn identities(&self) -> Result<Vec<Identity>, StoreError>;
    /// All states of `did`, ordered by sequence number.
    fn states(&self, did: &Did) -> Result<Vec<IdentityState>, StoreError>;

    fn credential(&self, id: &Uuid) -> Result<Option<Credential>, StoreError>;
    fn credentials(&self, issuer: &Did) -> Result<Vec<Credential>, StoreError>;
    fn credential_by_nonce(&self, issuer: &Did, nonce: u64) -> Result<Option<Credential>, StoreError>;
    fn credential_by_index(&self, issuer: &Did, index_hash: &Hash) -> Result<Option<Credential>, StoreError>;

    fn link(&self, id: &Uuid) -> Result<Option<Link>, StoreError>;
    fn links(&self, issuer: &Did) -> Result<Vec<Link>, StoreError>;

    /// Applies every write in `batch` atomically.
    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    nodes: HashMap<(Did, TreeKind), HashMap<Hash, Vec<u8>>>,
    root_history: HashMap<(Did, TreeKind), Vec<Hash>>,
    root_sets: HashMap<(Did, TreeKind), HashSet<Hash>>,
    identities: BTreeMap<Did, Identity>,
    states: HashMap<Did, BTreeMap<u64, IdentityState>>,
    credentials: HashMap<Uuid, Credential>,
    by_nonce: HashMap<(Did, u64), Uuid>,
    by_index: HashMap<(Did, Hash), Uuid>,
    links: HashMap<Uuid, Link>,
}

impl Tables {
    fn check(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        for cred in batch.credentials.values() {
            if let Some(existing) = self.by_nonce.get(&(cred.issuer.clone(), cred.revocation_nonce)) {
                if *existing != cred.id {
                    return Err(StoreError::Constraint(format!(
                        "revocation nonce {} already used by {}",
                        cred.revocation_nonce, cred.issuer
                    )));
                }
            }
        }
        for ((did, seq), state) in &batch.states {
            if let Some(current) = self.states.get(did).and_then(|s| s.get(seq)) {
                if current.state.is_some() && current.state != state.state {
                    return Err(StoreError::Constraint(format!("state {} of {} is already sealed", seq, did)));
                }
            }
        }
        Ok(())
    }
}

/// In-memory [`Store`]. One write lock per `apply` makes batches atomic;
/// readers never observe a half-applied batch.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn node(&self, did: &Did, kind: TreeKind, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()?.nodes.get(&(did.clone(), kind)).and_then(|t| t.get(hash)).cloned())
    }

    fn latest_root(&self, did: &Did, kind: TreeKind) -> Result<Option<Hash>, StoreError> {
        Ok(self.read()?.root_history.get(&(did.clone(), kind)).and_then(|h| h.last()).copied())
    }

    fn contains_root(&self, did: &Did, kind: TreeKind, root: &Hash) -> Result<bool, StoreError> {
        Ok(self.read()?.root_sets.get(&(did.clone(), kind)).map_or(false, |s| s.contains(root)))
    }

    fn identity(&self, did: &Did) -> Result<Option<Identity>, StoreError> {
        Ok(self.read()?.identities.get(did).cloned())
    }

    fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.read()?.identities.values().cloned().collect())
    }

    fn states(&self, did: &Did) -> Result<Vec<IdentityState>, StoreError> {
        Ok(self.read()?.states.get(did).map(|s| s.values().cloned().collect()).unwrap_or_default())
    }

    fn credential(&self, id: &Uuid) -> Result<Option<Credential>, StoreError> {
        Ok(self.read()?.credentials.get(id).cloned())
    }

    fn credentials(&self, issuer: &Did) -> Result<Vec<Credential>, StoreError> {
        let tables = self.read()?;
        let mut found: Vec<Credential> =
            tables.credentials.values().filter(|c| &c.issuer == issuer).cloned().collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    fn credential_by_nonce(&self, issuer: &Did, nonce: u64) -> Result<Option<Credential>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .by_nonce
            .get(&(issuer.clone(), nonce))
            .and_then(|id| tables.credentials.get(id))
            .cloned())
    }

    fn credential_by_index(&self, issuer: &Did, index_hash: &Hash) -> Result<Option<Credential>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .by_index
            .get(&(issuer.clone(), *index_hash))
            .and_then(|id| tables.credentials.get(id))
            .cloned())
    }

    fn link(&self, id: &Uuid) -> Result<Option<Link>, StoreError> {
        Ok(self.read()?.links.get(id).cloned())
    }

    fn links(&self, issuer: &Did) -> Result<Vec<Link>, StoreError> {
        let tables = self.read()?;
        let mut found: Vec<Link> = tables.links.values().filter(|l| &l.issuer == issuer).cloned().collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        tables.check(&batch)?;

        let WriteBatch { nodes, roots, identities, states, credentials, links, deleted_links } = batch;
        let node_count: usize = nodes.values().map(HashMap::len).sum();
        for (table, entries) in nodes {
            let target = tables.nodes.entry(table).or_default();
            for (hash, bytes) in entries {
                target.entry(hash).or_insert(bytes);
            }
        }
        for (did, kind, root) in roots {
            tables.root_history.entry((did.clone(), kind)).or_default().push(root);
            tables.root_sets.entry((did, kind)).or_default().insert(root);
        }
        for (did, identity) in identities {
            tables.identities.insert(did, identity);
        }
        for ((did, seq), state) in states {
            tables.states.entry(did).or_default().insert(seq, state);
        }
        for (id, cred) in credentials {
            tables.by_nonce.insert((cred.issuer.clone(), cred.revocation_nonce), id);
            tables.by_index.insert((cred.issuer.clone(), cred.index_hash), id);
            tables.credentials.insert(id, cred);
        }
        for id in deleted_links {
            tables.links.remove(&id);
        }
        for (id, link) in links {
            tables.links.insert(id, link);
        }
        debug!("applied write batch ({} nodes)", node_count);
        Ok(())
    }
}
