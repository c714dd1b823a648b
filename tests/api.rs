mod common;

use common::{Harness, Script};
use issuer_node::services::api_server::ApiServer;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Running {
    base: String,
    client: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

async fn start(h: &Harness) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let api = Arc::new(ApiServer::new(h.node.clone()));
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(api.serve(listener, async move {
        let _ = stopped.await;
    }));
    Running { base, client: reqwest::Client::new(), stop: Some(stop), server }
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).unwrap();
        }
        self.server.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn issue_publish_and_query_over_http() {
    let h = Harness::new(Script::Confirm);
    let api = start(&h).await;

    let created = api
        .client
        .post(api.url("/v1/identities"))
        .json(&json!({ "keyType": "bjj", "displayName": "http issuer", "revocationMode": "signature" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let body: Value = created.json().await.unwrap();
    let did = body["identity"]["did"].as_str().unwrap().to_string();

    let issued = api
        .client
        .post(api.url(&format!("/v1/identities/{}/credentials", did)))
        .json(&json!({
            "schemaUrl": common::KYC_SCHEMA,
            "credentialType": "KYCCountry",
            "subject": "did:x:web",
            "credentialSubject": { "country": "CH", "verified": true },
            "merkleInclusion": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(issued.status(), StatusCode::CREATED);
    let credential: Value = issued.json().await.unwrap();
    let id = credential["id"].as_str().unwrap().to_string();
    let nonce = credential["revocationNonce"].as_u64().unwrap();

    let early = api.client.get(api.url(&format!("/v1/credentials/{}/w3c", id))).send().await.unwrap();
    assert_eq!(early.status(), StatusCode::CONFLICT);

    let published = api.client.post(api.url(&format!("/v1/identities/{}/states/publish", did))).send().await.unwrap();
    assert_eq!(published.status(), StatusCode::OK);
    let confirm: Value = api
        .client
        .post(api.url(&format!("/v1/identities/{}/states/confirm", did)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(confirm["outcome"], "confirmed");

    let document = api.client.get(api.url(&format!("/v1/credentials/{}/w3c", id))).send().await.unwrap();
    assert_eq!(document.status(), StatusCode::OK);

    let nothing = api.client.post(api.url(&format!("/v1/identities/{}/states/publish", did))).send().await.unwrap();
    assert_eq!(nothing.status(), StatusCode::CONFLICT);

    let status: Value = api
        .client
        .get(api.url(&format!("/v1/{}/claims/revocation/status/{}", did, nonce)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["revoked"], false);

    let identity: Value =
        api.client.get(api.url(&format!("/v1/identities/{}", did))).send().await.unwrap().json().await.unwrap();
    assert_eq!(identity["latest"]["seq"], 1);

    api.shutdown().await;
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let h = Harness::new(Script::Confirm);
    let issuer = h.identity().await;
    let api = start(&h).await;

    let unknown = api
        .client
        .get(api.url("/v1/credentials/00000000-0000-4000-8000-000000000000/w3c"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    let body: Value = unknown.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("unknown credential"));

    let bad_did = api.client.get(api.url("/v1/identities/not-a-did")).send().await.unwrap();
    assert_eq!(bad_did.status(), StatusCode::BAD_REQUEST);

    let no_proof = api
        .client
        .post(api.url(&format!("/v1/identities/{}/credentials", issuer)))
        .json(&json!({ "schemaUrl": common::KYC_SCHEMA, "credentialType": "KYCCountry", "credentialSubject": { "country": "CH" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(no_proof.status(), StatusCode::BAD_REQUEST);

    let unavailable = api
        .client
        .post(api.url(&format!("/v1/identities/{}/credentials", issuer)))
        .json(&json!({ "schemaUrl": "https://nowhere.example/s.json", "credentialType": "X", "signature": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(unavailable.status(), StatusCode::BAD_GATEWAY);

    api.shutdown().await;
}

#[tokio::test]
async fn workers_start_and_stop() {
    let h = Harness::new(Script::Confirm);
    let api = start(&h).await;

    let started: Value =
        api.client.post(api.url("/v1/workers/start")).send().await.unwrap().json().await.unwrap();
    assert_eq!(started["changed"], true);
    let again: Value = api.client.post(api.url("/v1/workers/start")).send().await.unwrap().json().await.unwrap();
    assert_eq!(again["changed"], false);
    let stopped: Value = api.client.post(api.url("/v1/workers/stop")).send().await.unwrap().json().await.unwrap();
    assert_eq!(stopped["changed"], true);

    api.shutdown().await;
}
