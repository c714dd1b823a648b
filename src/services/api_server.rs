// src/services/api_server.rs
//! API Server for the issuer node
//!
//! Thin REST adapter over [`IssuerNode`]. Handlers parse paths and bodies,
//! call one service operation and map [`IssuerError`] to a status code.
//!
//! The API is built using Axum and includes endpoints for:
//! - identity genesis and state queries
//! - credential issuance, delivery, deletion and verification
//! - revocation and revocation status
//! - state publication, retry and confirmation
//! - credential links
//! - starting and stopping the publisher workers

use crate::error::{ErrorKind, IssuerError, Result};
use crate::models::credential::Credential;
use crate::models::did::Did;
use crate::models::state::{CredentialStatusMode, Identity, IdentityState, KeyType};
use crate::services::credential_issuer::{CredentialFilter, IssueRequest};
use crate::services::link_engine::CreateLinkRequest;
use crate::services::publisher::ConfirmOutcome;
use crate::services::IssuerNode;
use crate::utils::crypto::Hash;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for IssuerError {
    fn into_response(self) -> Response {
        let status = status_of(self.kind());
        if status.is_server_error() {
            error!("request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>>;

fn parse_did(raw: &str) -> Result<Did> {
    Ok(Did::parse(raw)?)
}

// API request and response structures

/// Request payload for creating an identity
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIdentityRequest {
    key_type: KeyType,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default = "default_revocation_mode")]
    revocation_mode: CredentialStatusMode,
}

fn default_revocation_mode() -> CredentialStatusMode {
    CredentialStatusMode::OffChain
}

/// Identity with its latest confirmed and open states
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    identity: Identity,
    latest: IdentityState,
    pending: Option<IdentityState>,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    state: Option<Hash>,
}

#[derive(Debug, Deserialize)]
struct RedeemRequest {
    holder: String,
}

#[derive(Debug, Deserialize)]
struct ActivateRequest {
    active: bool,
}

#[derive(Debug, Serialize)]
struct AttributeProofResponse {
    root: Hash,
    proof: crate::merkle::MerkleProof,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
enum ConfirmResponse {
    Idle,
    Pending,
    Confirmed { state: IdentityState },
    Failed { reason: String },
}

impl From<ConfirmOutcome> for ConfirmResponse {
    fn from(outcome: ConfirmOutcome) -> Self {
        match outcome {
            ConfirmOutcome::Idle => ConfirmResponse::Idle,
            ConfirmOutcome::Pending => ConfirmResponse::Pending,
            ConfirmOutcome::Confirmed(state) => ConfirmResponse::Confirmed { state },
            ConfirmOutcome::Failed(reason) => ConfirmResponse::Failed { reason },
        }
    }
}

struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// HTTP front of an issuer node; also owns the publisher workers.
pub struct ApiServer {
    node: Arc<IssuerNode>,
    workers: Mutex<Option<Workers>>,
}

impl ApiServer {
    pub fn new(node: Arc<IssuerNode>) -> Self {
        Self { node, workers: Mutex::new(None) }
    }

    pub fn node(&self) -> &Arc<IssuerNode> {
        &self.node
    }

    /// Spawns the publisher workers. Returns `false` if they already run.
    pub async fn start_workers(&self) -> bool {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return false;
        }
        let (shutdown, receiver) = watch::channel(false);
        let handles = self.node.publisher.clone().run(receiver);
        *workers = Some(Workers { shutdown, handles });
        info!("publisher workers started");
        true
    }

    /// Signals the workers and waits for their current pass to finish.
    /// Returns `false` if none were running.
    pub async fn stop_workers(&self) -> bool {
        let Some(workers) = self.workers.lock().await.take() else {
            return false;
        };
        // Receivers only disappear once the loops have exited.
        let _ = workers.shutdown.send(true);
        for handle in workers.handles {
            if let Err(e) = handle.await {
                error!("publisher worker ended abnormally: {}", e);
            }
        }
        info!("publisher workers stopped");
        true
    }

    pub async fn workers_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/v1/identities", post(Self::create_identity_handler).get(Self::list_identities_handler))
            .route("/v1/identities/:did", get(Self::get_identity_handler))
            .route("/v1/identities/:did/states", get(Self::list_states_handler))
            .route("/v1/identities/:did/states/publish", post(Self::publish_handler))
            .route("/v1/identities/:did/states/retry", post(Self::retry_handler))
            .route("/v1/identities/:did/states/confirm", post(Self::confirm_handler))
            .route(
                "/v1/identities/:did/credentials",
                post(Self::issue_credential_handler).get(Self::list_credentials_handler),
            )
            .route(
                "/v1/identities/:did/credentials/:id",
                get(Self::get_credential_handler).delete(Self::delete_credential_handler),
            )
            .route("/v1/identities/:did/credentials/:id/revoke", post(Self::revoke_credential_handler))
            .route("/v1/identities/:did/claims/revocation/revoke/:nonce", post(Self::revoke_nonce_handler))
            .route("/v1/:did/claims/revocation/status/:nonce", get(Self::revocation_status_handler))
            .route("/v1/credentials/:id/w3c", get(Self::deliver_credential_handler))
            .route("/v1/credentials/:id/verify", get(Self::verify_credential_handler))
            .route("/v1/credentials/:id/attributes/:name", get(Self::attribute_proof_handler))
            .route("/v1/identities/:did/links", post(Self::create_link_handler).get(Self::list_links_handler))
            .route("/v1/links/:id", get(Self::get_link_handler).delete(Self::delete_link_handler))
            .route("/v1/links/:id/redeem", post(Self::redeem_link_handler))
            .route("/v1/links/:id/activate", post(Self::activate_link_handler))
            .route("/v1/workers/start", post(Self::start_workers_handler))
            .route("/v1/workers/stop", post(Self::stop_workers_handler))
            .with_state(self)
    }

    /// Serves on `listener` until `shutdown` resolves.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("API listening on {}", addr);
        }
        axum::serve(listener, self.router()).with_graceful_shutdown(shutdown).await
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr, shutdown: impl Future<Output = ()> + Send + 'static) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    // =====================
    // Identity Handlers
    // =====================

    /// Creates an identity with a fresh key and a confirmed genesis state
    ///
    /// # Endpoint
    /// POST /v1/identities
    ///
    /// # Responses
    /// - 201 Created: identity and genesis state
    /// - 400 Bad Request: empty display name
    /// - 409 Conflict: display name taken
    async fn create_identity_handler(
        State(server): State<Arc<ApiServer>>,
        Json(payload): Json<CreateIdentityRequest>,
    ) -> Result<impl IntoResponse> {
        let (identity, genesis) = server
            .node
            .states
            .genesis(payload.key_type, payload.display_name, payload.revocation_mode)
            .await?;
        Ok((StatusCode::CREATED, Json(json!({ "identity": identity, "state": genesis }))))
    }

    async fn list_identities_handler(State(server): State<Arc<ApiServer>>) -> ApiResult<Vec<Identity>> {
        Ok(Json(server.node.states.identities()?))
    }

    /// # Endpoint
    /// GET /v1/identities/:did
    ///
    /// # Responses
    /// - 200 OK: identity, latest confirmed state and open state if any
    /// - 404 Not Found: unknown identity
    async fn get_identity_handler(
        Path(did): Path<String>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<IdentityResponse> {
        let did = parse_did(&did)?;
        let states = &server.node.states;
        Ok(Json(IdentityResponse {
            identity: states.identity(&did)?,
            latest: states.current_latest(&did)?,
            pending: states.pending_state(&did)?,
        }))
    }

    async fn list_states_handler(
        Path(did): Path<String>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<Vec<IdentityState>> {
        Ok(Json(server.node.states.states(&parse_did(&did)?)?))
    }

    // =====================
    // Publication Handlers
    // =====================

    /// Seals the open state and submits it to the anchor
    ///
    /// # Endpoint
    /// POST /v1/identities/:did/states/publish
    ///
    /// # Responses
    /// - 200 OK: the state now publishing
    /// - 409 Conflict: nothing to publish, or a publication is in flight
    /// - 502 Bad Gateway: anchor unavailable
    async fn publish_handler(
        Path(did): Path<String>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<IdentityState> {
        Ok(Json(server.node.publisher.publish_identity(&parse_did(&did)?).await?))
    }

    /// # Endpoint
    /// POST /v1/identities/:did/states/retry
    async fn retry_handler(
        Path(did): Path<String>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<IdentityState> {
        Ok(Json(server.node.publisher.retry(&parse_did(&did)?).await?))
    }

    /// Polls the anchor once for the publishing state
    ///
    /// # Endpoint
    /// POST /v1/identities/:did/states/confirm
    async fn confirm_handler(
        Path(did): Path<String>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<ConfirmResponse> {
        let outcome = server.node.publisher.confirm_identity(&parse_did(&did)?).await?;
        Ok(Json(outcome.into()))
    }

    // =====================
    // Credential Handlers
    // =====================

    /// Issues a credential from the identity
    ///
    /// # Endpoint
    /// POST /v1/identities/:did/credentials
    ///
    /// # Request Body
    /// schema URL, credential type, subject, attributes and requested proofs
    ///
    /// # Responses
    /// - 201 Created: the credential record
    /// - 400 Bad Request: invalid request or attributes not matching the schema
    /// - 409 Conflict: a claim with the same index and another value exists
    /// - 502 Bad Gateway: schema or key store unavailable
    async fn issue_credential_handler(
        Path(did): Path<String>,
        State(server): State<Arc<ApiServer>>,
        Json(payload): Json<IssueRequest>,
    ) -> Result<impl IntoResponse> {
        let credential = server.node.issuer.issue(&parse_did(&did)?, payload).await?;
        Ok((StatusCode::CREATED, Json(credential)))
    }

    async fn list_credentials_handler(
        Path(did): Path<String>,
        State(server): State<Arc<ApiServer>>,
        Query(filter): Query<CredentialFilter>,
    ) -> ApiResult<Vec<Credential>> {
        Ok(Json(server.node.issuer.list(&parse_did(&did)?, &filter)?))
    }

    async fn get_credential_handler(
        Path((did, id)): Path<(String, Uuid)>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<Credential> {
        let did = parse_did(&did)?;
        let credential = server.node.issuer.get(&id)?;
        if credential.issuer != did {
            return Err(IssuerError::UnknownCredential(id.to_string()));
        }
        Ok(Json(credential))
    }

    /// Soft-deletes a credential; its claim stays in the Claims tree
    ///
    /// # Endpoint
    /// DELETE /v1/identities/:did/credentials/:id
    async fn delete_credential_handler(
        Path((did, id)): Path<(String, Uuid)>,
        State(server): State<Arc<ApiServer>>,
    ) -> Result<StatusCode> {
        server.node.issuer.delete(&parse_did(&did)?, &id).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    /// W3C document for the holder
    ///
    /// # Endpoint
    /// GET /v1/credentials/:id/w3c
    ///
    /// # Responses
    /// - 200 OK: the credential document
    /// - 409 Conflict: Merkle-inclusion credential whose state is not yet confirmed
    async fn deliver_credential_handler(
        Path(id): Path<Uuid>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<Value> {
        Ok(Json(server.node.issuer.deliver(&id)?))
    }

    async fn verify_credential_handler(
        Path(id): Path<Uuid>,
        State(server): State<Arc<ApiServer>>,
    ) -> Result<impl IntoResponse> {
        let credential = server.node.issuer.get(&id)?;
        Ok(Json(server.node.verifier.verify(&credential).await?))
    }

    async fn attribute_proof_handler(
        Path((id, name)): Path<(Uuid, String)>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<AttributeProofResponse> {
        let (root, proof) = server.node.issuer.attribute_proof(&id, &name)?;
        Ok(Json(AttributeProofResponse { root, proof }))
    }

    // =====================
    // Revocation Handlers
    // =====================

    /// # Endpoint
    /// POST /v1/identities/:did/credentials/:id/revoke
    async fn revoke_credential_handler(
        Path((did, id)): Path<(String, Uuid)>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<Credential> {
        Ok(Json(server.node.revocation.revoke_credential(&parse_did(&did)?, &id).await?))
    }

    /// # Endpoint
    /// POST /v1/identities/:did/claims/revocation/revoke/:nonce
    async fn revoke_nonce_handler(
        Path((did, nonce)): Path<(String, u64)>,
        State(server): State<Arc<ApiServer>>,
    ) -> ApiResult<Credential> {
        Ok(Json(server.node.revocation.revoke(&parse_did(&did)?, nonce).await?))
    }

    /// Revocation status with a Merkle proof, at `?state=` or the latest
    /// confirmed state
    ///
    /// # Endpoint
    /// GET /v1/:did/claims/revocation/status/:nonce
    ///
    /// # Responses
    /// - 200 OK: issuer state, proof and revoked flag
    /// - 404 Not Found: unknown identity or state not confirmed
    async fn revocation_status_handler(
        Path((did, nonce)): Path<(String, u64)>,
        State(server): State<Arc<ApiServer>>,
        Query(query): Query<StatusQuery>,
    ) -> Result<impl IntoResponse> {
        let did = parse_did(&did)?;
        let status = match query.state {
            Some(state) => server.node.revocation.status_at(&did, nonce, &state)?,
            None => server.node.revocation.status_latest(&did, nonce)?,
        };
        Ok(Json(status))
    }

    // =====================
    // Link Handlers
    // =====================

    /// # Endpoint
    /// POST /v1/identities/:did/links
    ///
    /// # Responses
    /// - 201 Created: the link
    /// - 400 Bad Request: template not matching the schema, past dates
    async fn create_link_handler(
        Path(did): Path<String>,
        State(server): State<Arc<ApiServer>>,
        Json(payload): Json<CreateLinkRequest>,
    ) -> Result<impl IntoResponse> {
        let link = server.node.links.create_link(&parse_did(&did)?, payload).await?;
        Ok((StatusCode::CREATED, Json(link)))
    }

    async fn list_links_handler(
        Path(did): Path<String>,
        State(server): State<Arc<ApiServer>>,
    ) -> Result<impl IntoResponse> {
        Ok(Json(server.node.links.list_links(&parse_did(&did)?)?))
    }

    async fn get_link_handler(Path(id): Path<Uuid>, State(server): State<Arc<ApiServer>>) -> Result<impl IntoResponse> {
        Ok(Json(server.node.links.get_link(&id)?))
    }

    async fn delete_link_handler(Path(id): Path<Uuid>, State(server): State<Arc<ApiServer>>) -> Result<StatusCode> {
        server.node.links.delete(&id).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    /// Issues the link's credential to a holder
    ///
    /// # Endpoint
    /// POST /v1/links/:id/redeem
    ///
    /// # Responses
    /// - 201 Created: the credential
    /// - 409 Conflict: link exhausted, expired or inactive
    async fn redeem_link_handler(
        Path(id): Path<Uuid>,
        State(server): State<Arc<ApiServer>>,
        Json(payload): Json<RedeemRequest>,
    ) -> Result<impl IntoResponse> {
        let credential = server.node.links.redeem(&id, &payload.holder).await?;
        Ok((StatusCode::CREATED, Json(credential)))
    }

    async fn activate_link_handler(
        Path(id): Path<Uuid>,
        State(server): State<Arc<ApiServer>>,
        Json(payload): Json<ActivateRequest>,
    ) -> Result<impl IntoResponse> {
        Ok(Json(server.node.links.activate(&id, payload.active).await?))
    }

    // =====================
    // Worker Handlers
    // =====================

    async fn start_workers_handler(State(server): State<Arc<ApiServer>>) -> Json<Value> {
        let started = server.start_workers().await;
        Json(json!({ "running": true, "changed": started }))
    }

    async fn stop_workers_handler(State(server): State<Arc<ApiServer>>) -> Json<Value> {
        let stopped = server.stop_workers().await;
        Json(json!({ "running": false, "changed": stopped }))
    }
}
