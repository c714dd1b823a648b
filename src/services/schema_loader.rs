// src/services/schema_loader.rs
//! Schema fetching with a content-addressed cache.
//!
//! `http(s)://` documents come through reqwest, `ipfs://<cid>` documents
//! through the IPFS API. Each URL is remembered together with the Keccak
//! digest of its bytes; identical documents behind different URLs share one
//! parsed schema.

use crate::models::schema::{Schema, SchemaError};
use crate::storage::ipfs_client::IpfsStorage;
use crate::utils::crypto::hash_data;
use crate::utils::retry::{retry_with_backoff, RetryPolicy, Transient};
use async_trait::async_trait;
use ethers_core::utils::hex;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

impl Transient for SchemaError {
    fn is_transient(&self) -> bool {
        matches!(self, SchemaError::Transient(_))
    }
}

#[async_trait]
pub trait SchemaLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<Arc<Schema>, SchemaError>;
}

#[derive(Default)]
struct Cache {
    by_url: HashMap<String, String>,
    by_digest: HashMap<String, Arc<Schema>>,
}

pub struct HttpSchemaLoader {
    client: reqwest::Client,
    ipfs: IpfsStorage,
    retry: RetryPolicy,
    cache: RwLock<Cache>,
}

impl HttpSchemaLoader {
    pub fn new(ipfs: IpfsStorage, timeout: Duration, retry: RetryPolicy) -> Result<Self, SchemaError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchemaError::Unavailable(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, ipfs, retry, cache: RwLock::new(Cache::default()) })
    }

    fn cached(&self, url: &str) -> Option<Arc<Schema>> {
        let cache = self.cache.read().ok()?;
        cache.by_url.get(url).and_then(|digest| cache.by_digest.get(digest)).cloned()
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, SchemaError> {
        if let Some(cid) = url.strip_prefix("ipfs://") {
            return self
                .ipfs
                .retrieve_data(cid)
                .await
                .map_err(|e| SchemaError::Transient(format!("{}: {}", url, e)));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SchemaError::UnsupportedScheme(url.to_string()));
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SchemaError::Transient(format!("{}: {}", url, e)))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(SchemaError::Transient(format!("{}: HTTP {}", url, status)));
        }
        if !status.is_success() {
            return Err(SchemaError::Unavailable(format!("{}: HTTP {}", url, status)));
        }
        let body = response.bytes().await.map_err(|e| SchemaError::Transient(format!("{}: {}", url, e)))?;
        Ok(body.to_vec())
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SchemaError> {
        retry_with_backoff(&self.retry, "schema fetch", || self.fetch_once(url)).await
    }

    async fn fetch_json(&self, url: &str) -> Result<(Vec<u8>, Value), SchemaError> {
        let bytes = self.fetch(url).await?;
        let json = serde_json::from_slice(&bytes).map_err(|e| SchemaError::Invalid(format!("{}: {}", url, e)))?;
        Ok((bytes, json))
    }
}

#[async_trait]
impl SchemaLoader for HttpSchemaLoader {
    async fn load(&self, url: &str) -> Result<Arc<Schema>, SchemaError> {
        if let Some(schema) = self.cached(url) {
            return Ok(schema);
        }
        let (bytes, json) = self.fetch_json(url).await?;
        let digest = hex::encode(hash_data(&bytes));

        let known = self.cache.read().ok().and_then(|c| c.by_digest.get(&digest).cloned());
        let schema = match known {
            Some(schema) => schema,
            None => {
                let context = match Schema::context_uri(&json) {
                    Some(uri) => Some(self.fetch_json(&uri).await?.1),
                    None => None,
                };
                Arc::new(Schema::parse(url, digest.clone(), json, context)?)
            }
        };

        if let Ok(mut cache) = self.cache.write() {
            cache.by_url.insert(url.to_string(), digest.clone());
            cache.by_digest.entry(digest).or_insert_with(|| schema.clone());
        }
        debug!("loaded schema {} ({} attributes)", url, schema.attributes.len());
        Ok(schema)
    }
}

/// Fixed set of schemas, for development and tests.
#[derive(Default)]
pub struct StaticSchemaLoader {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl StaticSchemaLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, json_schema: Value) -> Result<Arc<Schema>, SchemaError> {
        let digest = hex::encode(hash_data(json_schema.to_string().as_bytes()));
        let schema = Arc::new(Schema::parse(url, digest, json_schema, None)?);
        self.schemas
            .write()
            .map_err(|_| SchemaError::Unavailable("schema table poisoned".into()))?
            .insert(url.to_string(), schema.clone());
        Ok(schema)
    }
}

#[async_trait]
impl SchemaLoader for StaticSchemaLoader {
    async fn load(&self, url: &str) -> Result<Arc<Schema>, SchemaError> {
        let schemas = self.schemas.read().map_err(|_| SchemaError::Unavailable("schema table poisoned".into()))?;
        schemas.get(url).cloned().ok_or_else(|| SchemaError::Unavailable(format!("no schema at {}", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::mock;
    use serde_json::json;

    fn age_schema() -> Value {
        json!({
            "$metadata": { "uris": { "jsonLdContext": format!("{}/age.jsonld", mockito::server_url()) } },
            "properties": {
                "credentialSubject": {
                    "properties": { "id": { "type": "string" }, "birthday": { "type": "integer" } },
                    "required": ["birthday"]
                }
            }
        })
    }

    fn loader() -> HttpSchemaLoader {
        HttpSchemaLoader::new(IpfsStorage::new(), Duration::from_secs(5), RetryPolicy::new(2, Duration::from_millis(1)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_http_schema_with_context_is_cached() {
        let schema_mock = mock("GET", "/age.json").with_status(200).with_body(age_schema().to_string()).expect(1).create();
        let context_mock = mock("GET", "/age.jsonld").with_status(200).with_body(r#"{"@context":{}}"#).expect(1).create();

        let loader = loader();
        let url = format!("{}/age.json", mockito::server_url());
        let first = loader.load(&url).await.unwrap();
        assert!(first.attributes.contains_key("birthday"));
        assert!(first.json_ld_context.is_some());
        let second = loader.load(&url).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        schema_mock.assert();
        context_mock.assert();
    }

    #[tokio::test]
    async fn test_missing_schema_is_unavailable() {
        let _m = mock("GET", "/missing.json").with_status(404).create();
        let err = loader().load(&format!("{}/missing.json", mockito::server_url())).await.unwrap_err();
        assert!(matches!(err, SchemaError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let err = loader().load("ftp://schemas.example/age.json").await.unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn test_static_loader() {
        let loader = StaticSchemaLoader::new();
        loader.insert("https://schemas.example/age.json", age_schema()).unwrap();
        assert!(loader.load("https://schemas.example/age.json").await.is_ok());
        assert!(matches!(loader.load("https://schemas.example/other.json").await, Err(SchemaError::Unavailable(_))));
    }
}
