// src/storage/ipfs_client.rs
//! IPFS retrieval for `ipfs://` schema documents.
//!
//! The hyper-backed client's futures are driven on a blocking thread with
//! their own runtime so callers can hold the returned futures across `Send`
//! boundaries.

use bytes::BytesMut;
use futures::TryStreamExt;
use ipfs_api_backend_hyper::{IpfsApi, IpfsClient, TryFromUri};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task;

#[derive(Debug, thiserror::Error)]
pub enum IpfsError {
    #[error("invalid IPFS API URL: {0}")]
    InvalidUrl(String),
    #[error("IPFS request failed: {0}")]
    Request(String),
    #[error("IPFS content is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct IpfsStorage {
    client: Arc<IpfsClient>,
}

impl IpfsStorage {
    /// Client for the node at `http://localhost:5001`.
    pub fn new() -> Self {
        Self { client: Arc::new(IpfsClient::default()) }
    }

    pub fn connect(api_url: &str) -> Result<Self, IpfsError> {
        let client = IpfsClient::from_str(api_url).map_err(|e| IpfsError::InvalidUrl(format!("{}: {}", api_url, e)))?;
        Ok(Self { client: Arc::new(client) })
    }

    /// Raw bytes behind `cid`.
    pub async fn retrieve_data(&self, cid: &str) -> Result<Vec<u8>, IpfsError> {
        let client = self.client.clone();
        let cid = cid.to_string();

        let joined = task::spawn_blocking(move || -> Result<Vec<u8>, IpfsError> {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| IpfsError::Request(e.to_string()))?;
            rt.block_on(async {
                let data = client
                    .cat(&cid)
                    .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                        acc.extend_from_slice(&chunk);
                        Ok(acc)
                    })
                    .await
                    .map_err(|e| IpfsError::Request(e.to_string()))?;
                Ok(data.to_vec())
            })
        })
        .await;

        joined.map_err(|e| IpfsError::Request(e.to_string()))?
    }

    pub async fn retrieve_json<T: DeserializeOwned>(&self, cid: &str) -> Result<T, IpfsError> {
        let bytes = self.retrieve_data(cid).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Default for IpfsStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_garbage_url() {
        assert!(matches!(IpfsStorage::connect("not a uri"), Err(IpfsError::InvalidUrl(_))));
        assert!(IpfsStorage::connect("http://127.0.0.1:5001").is_ok());
    }
}
