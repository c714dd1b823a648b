// src/services/mod.rs
//! Issuer services and their wiring.

pub mod api_server;
pub mod credential_issuer;
pub mod events;
pub mod identity_state;
pub mod link_engine;
pub mod publisher;
pub mod revocation;
pub mod schema_loader;
pub mod verifier;

use crate::blockchain::anchor::StateAnchor;
use crate::config::Settings;
use crate::merkle::TreeEngine;
use crate::storage::store::Store;
use crate::wallet::key_management::{KeyManager, KeyStore};
use credential_issuer::CredentialIssuer;
use events::{BroadcastBus, EventBus};
use identity_state::IdentityStateManager;
use link_engine::LinkEngine;
use publisher::Publisher;
use revocation::RevocationRegistry;
use schema_loader::SchemaLoader;
use std::sync::Arc;
use verifier::Verifier;

/// Every service of one issuer node over shared collaborators.
pub struct IssuerNode {
    pub engine: Arc<TreeEngine>,
    pub keys: Arc<KeyManager>,
    pub events: Arc<BroadcastBus>,
    pub states: Arc<IdentityStateManager>,
    pub revocation: Arc<RevocationRegistry>,
    pub issuer: Arc<CredentialIssuer>,
    pub publisher: Arc<Publisher>,
    pub links: Arc<LinkEngine>,
    pub verifier: Arc<Verifier>,
}

impl IssuerNode {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn Store>,
        key_store: Arc<dyn KeyStore>,
        anchor: Arc<dyn StateAnchor>,
        schemas: Arc<dyn SchemaLoader>,
    ) -> Self {
        let retry = settings.publisher.retry_policy();
        let engine = Arc::new(TreeEngine::new(store.clone(), settings.tree.max_levels));
        let keys = Arc::new(KeyManager::new(key_store, store, retry));
        let events = Arc::new(BroadcastBus::default());
        let bus: Arc<dyn EventBus> = events.clone();

        let states = Arc::new(IdentityStateManager::new(
            engine.clone(),
            keys.clone(),
            settings.issuer.clone(),
            settings.anchor.contract_address.clone(),
        ));
        let revocation = Arc::new(RevocationRegistry::new(states.clone(), bus.clone()));
        let issuer = Arc::new(CredentialIssuer::new(states.clone(), revocation.clone(), schemas.clone(), bus.clone()));
        let publisher = Arc::new(Publisher::new(
            states.clone(),
            anchor,
            bus,
            settings.publisher.clone(),
        ));
        let links = Arc::new(LinkEngine::new(states.clone(), issuer.clone(), schemas.clone()));
        let verifier = Arc::new(Verifier::new(states.clone(), revocation.clone(), schemas));

        Self { engine, keys, events, states, revocation, issuer, publisher, links, verifier }
    }
}
