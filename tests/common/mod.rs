// Shared harness for the end-to-end tests.
#![allow(dead_code)]

use async_trait::async_trait;
use issuer_node::blockchain::{AnchorError, AnchorStatus, AnchorTransition, StateAnchor};
use issuer_node::config::Settings;
use issuer_node::models::credential::{CredentialSubject, ScalarValue};
use issuer_node::models::did::Did;
use issuer_node::models::state::{CredentialStatusMode, IdentityState, KeyType};
use issuer_node::services::credential_issuer::IssueRequest;
use issuer_node::services::publisher::ConfirmOutcome;
use issuer_node::services::schema_loader::StaticSchemaLoader;
use issuer_node::services::IssuerNode;
use issuer_node::storage::store::MemoryStore;
use issuer_node::wallet::key_management::LocalKeyStore;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub const AGE_SCHEMA: &str = "https://schemas.example.com/ageOver18.json";
pub const KYC_SCHEMA: &str = "https://schemas.example.com/kyc.json";

/// What the stub anchor does with the next transitions.
#[derive(Debug, Clone)]
pub enum Script {
    /// Confirmed as soon as it is polled.
    Confirm,
    /// Stays pending until [`ScriptedAnchor::release`].
    Hold,
    /// Reported failed with this reason when polled.
    FailOnPoll(String),
    /// `submit` waits for [`ScriptedAnchor::open_gate`], then confirms.
    Gate,
}

pub struct ScriptedAnchor {
    script: Mutex<Script>,
    gate: Semaphore,
    submitted: Mutex<Vec<AnchorTransition>>,
    statuses: Mutex<HashMap<String, AnchorStatus>>,
}

impl ScriptedAnchor {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            gate: Semaphore::new(0),
            submitted: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(1);
    }

    /// Confirms every held transaction.
    pub fn release(&self) {
        let mut statuses = self.statuses.lock().unwrap();
        let block = 100 + statuses.len() as u64;
        for status in statuses.values_mut() {
            if *status == AnchorStatus::Pending {
                *status = AnchorStatus::Confirmed { block, timestamp: 1_700_000_000 };
            }
        }
    }

    pub fn submitted(&self) -> Vec<AnchorTransition> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateAnchor for ScriptedAnchor {
    async fn submit(&self, transition: &AnchorTransition) -> Result<String, AnchorError> {
        let script = self.script.lock().unwrap().clone();
        if let Script::Gate = script {
            let permit = self.gate.acquire().await.map_err(|e| AnchorError::Unavailable(e.to_string()))?;
            permit.forget();
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(transition.clone());
        let tx_id = format!("0x{:064x}", submitted.len());
        let status = match script {
            Script::Confirm | Script::Gate => {
                AnchorStatus::Confirmed { block: 99 + submitted.len() as u64, timestamp: 1_700_000_000 }
            }
            Script::Hold => AnchorStatus::Pending,
            Script::FailOnPoll(reason) => AnchorStatus::Failed { reason },
        };
        self.statuses.lock().unwrap().insert(tx_id.clone(), status);
        Ok(tx_id)
    }

    async fn status(&self, tx_id: &str) -> Result<AnchorStatus, AnchorError> {
        self.statuses
            .lock()
            .unwrap()
            .get(tx_id)
            .cloned()
            .ok_or_else(|| AnchorError::UnknownTransaction(tx_id.to_string()))
    }
}

pub struct Harness {
    pub node: Arc<IssuerNode>,
    pub anchor: Arc<ScriptedAnchor>,
    pub schemas: Arc<StaticSchemaLoader>,
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.publisher.max_attempts = 2;
    settings.publisher.backoff_base_ms = 1;
    settings.publisher.publish_interval_ms = 20;
    settings.publisher.confirm_interval_ms = 20;
    settings.publisher.retry_interval_ms = 20;
    settings
}

/// Non-merklized schema: `birthday` in index slot A, `documentType` in value slot A.
pub fn age_schema() -> serde_json::Value {
    json!({
        "$metadata": {
            "uris": { "jsonLdContext": "https://schemas.example.com/ageOver18.jsonld" },
            "serialization": { "indexDataSlotA": "birthday", "valueDataSlotA": "documentType" }
        },
        "properties": {
            "credentialSubject": {
                "properties": {
                    "id": { "type": "string" },
                    "birthday": { "type": "integer" },
                    "documentType": { "type": "integer" }
                },
                "required": ["birthday"]
            }
        }
    })
}

/// Merklized schema.
pub fn kyc_schema() -> serde_json::Value {
    json!({
        "properties": {
            "credentialSubject": {
                "properties": {
                    "id": { "type": "string" },
                    "country": { "type": "string" },
                    "verified": { "type": "boolean" }
                },
                "required": ["country"]
            }
        }
    })
}

impl Harness {
    pub fn new(script: Script) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let anchor = Arc::new(ScriptedAnchor::new(script));
        let schemas = Arc::new(StaticSchemaLoader::new());
        schemas.insert(AGE_SCHEMA, age_schema()).unwrap();
        schemas.insert(KYC_SCHEMA, kyc_schema()).unwrap();
        let node = IssuerNode::new(
            &settings(),
            Arc::new(MemoryStore::new()),
            Arc::new(LocalKeyStore::new()),
            anchor.clone(),
            schemas.clone(),
        );
        Self { node: Arc::new(node), anchor, schemas }
    }

    pub async fn identity(&self) -> Did {
        let (identity, _) = self
            .node
            .states
            .genesis(KeyType::BabyJubJub, None, CredentialStatusMode::Signature)
            .await
            .unwrap();
        identity.did
    }

    /// Publishes `did` and polls the anchor once.
    pub async fn publish_and_confirm(&self, did: &Did) -> IdentityState {
        self.node.publisher.publish_identity(did).await.unwrap();
        match self.node.publisher.confirm_identity(did).await.unwrap() {
            ConfirmOutcome::Confirmed(state) => state,
            other => panic!("expected confirmation, got {:?}", other),
        }
    }
}

pub fn age_request(holder: &str, birthday: i64) -> IssueRequest {
    let mut subject = CredentialSubject::new();
    subject.insert("birthday".into(), ScalarValue::Int(birthday));
    subject.insert("documentType".into(), ScalarValue::Int(2));
    IssueRequest {
        schema_url: AGE_SCHEMA.into(),
        credential_type: "ageOver18".into(),
        subject: Some(holder.into()),
        credential_subject: subject,
        signature: true,
        ..IssueRequest::default()
    }
}

pub fn kyc_request(holder: &str, country: &str) -> IssueRequest {
    let mut subject = CredentialSubject::new();
    subject.insert("country".into(), ScalarValue::String(country.into()));
    subject.insert("verified".into(), ScalarValue::Bool(true));
    IssueRequest {
        schema_url: KYC_SCHEMA.into(),
        credential_type: "KYCCountry".into(),
        subject: Some(holder.into()),
        credential_subject: subject,
        merkle_inclusion: true,
        ..IssueRequest::default()
    }
}
