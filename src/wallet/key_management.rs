// src/wallet/key_management.rs
//! Issuer signing keys.
//!
//! [`KeyStore`] is the opaque sign/verify oracle the core talks to. The
//! bundled [`LocalKeyStore`] keeps keys in process memory and supports two key
//! types:
//! - BabyJubJub (Schnorr, see [`crate::wallet::babyjubjub`]), message = a
//!   32-byte big-endian field element
//! - secp256k1 (ECDSA via `k256`) over a Keccak-256 prehash, Ethereum style
//!
//! [`KeyManager`] wraps any key store, serialising signatures per key and
//! guarding deletion of keys that still authenticate an identity.

use crate::models::state::KeyType;
use crate::storage::store::Store;
use crate::utils::crypto::hash_data;
use crate::utils::retry::{retry_with_backoff, RetryPolicy, Transient};
use crate::wallet::babyjubjub;
use ark_bn254::Fr;
use ark_ff::PrimeField;
use async_trait::async_trait;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use log::{debug, info};
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyStoreError {
    #[error("unknown key '{0}'")]
    UnknownKey(String),
    #[error("key '{0}' still authenticates an identity")]
    KeyInUse(String),
    #[error("key store unavailable: {0}")]
    Unavailable(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("invalid public key: {0}")]
    InvalidKey(String),
}

impl Transient for KeyStoreError {
    fn is_transient(&self) -> bool {
        matches!(self, KeyStoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn create(&self, key_type: KeyType) -> Result<String, KeyStoreError>;
    async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, KeyStoreError>;
    async fn sign(&self, key_id: &str, message: &[u8]) -> Result<Vec<u8>, KeyStoreError>;
    async fn delete(&self, key_id: &str) -> Result<(), KeyStoreError>;

    fn verify(&self, key_type: KeyType, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        verify_signature(key_type, public_key, message, signature)
    }
}

/// Checks a signature produced by [`KeyStore::sign`].
pub fn verify_signature(key_type: KeyType, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match key_type {
        KeyType::BabyJubJub => {
            let (Ok(pk), Ok(sig)) =
                (babyjubjub::PublicKey::from_bytes(public_key), babyjubjub::Signature::from_bytes(signature))
            else {
                return false;
            };
            pk.verify(&bjj_message(message), &sig)
        }
        KeyType::Ethereum => {
            let (Ok(vk), Ok(sig)) = (VerifyingKey::from_sec1_bytes(public_key), Signature::from_slice(signature)) else {
                return false;
            };
            vk.verify_prehash(&hash_data(message), &sig).is_ok()
        }
    }
}

fn bjj_message(message: &[u8]) -> Fr {
    Fr::from_be_bytes_mod_order(message)
}

/// 20-byte Ethereum address of a SEC1-encoded secp256k1 public key.
pub fn ethereum_address(public_key: &[u8]) -> Result<[u8; 20], KeyStoreError> {
    let key = PublicKey::from_sec1_bytes(public_key).map_err(|e| KeyStoreError::InvalidKey(e.to_string()))?;
    let point = key.to_encoded_point(false);
    let digest = hash_data(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    Ok(address)
}

enum LocalKey {
    BabyJubJub(babyjubjub::SecretKey),
    Ethereum(SecretKey),
}

/// In-memory key store. Keys do not survive a restart.
#[derive(Default)]
pub struct LocalKeyStore {
    keys: Mutex<HashMap<String, Arc<LocalKey>>>,
}

impl LocalKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self, key_id: &str) -> Result<Arc<LocalKey>, KeyStoreError> {
        let keys = self.keys.lock().map_err(|_| KeyStoreError::Unavailable("key table poisoned".into()))?;
        keys.get(key_id).cloned().ok_or_else(|| KeyStoreError::UnknownKey(key_id.to_string()))
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    async fn create(&self, key_type: KeyType) -> Result<String, KeyStoreError> {
        let (prefix, key) = match key_type {
            KeyType::BabyJubJub => ("bjj", LocalKey::BabyJubJub(babyjubjub::SecretKey::random())),
            KeyType::Ethereum => ("eth", LocalKey::Ethereum(SecretKey::random(&mut OsRng))),
        };
        let key_id = format!("{}:{}", prefix, Uuid::new_v4());
        let mut keys = self.keys.lock().map_err(|_| KeyStoreError::Unavailable("key table poisoned".into()))?;
        keys.insert(key_id.clone(), Arc::new(key));
        debug!("created {:?} key {}", key_type, key_id);
        Ok(key_id)
    }

    async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, KeyStoreError> {
        match self.key(key_id)?.as_ref() {
            LocalKey::BabyJubJub(sk) => sk.public_key().to_bytes().map_err(|e| KeyStoreError::Signing(e.to_string())),
            LocalKey::Ethereum(sk) => Ok(sk.public_key().to_encoded_point(false).as_bytes().to_vec()),
        }
    }

    async fn sign(&self, key_id: &str, message: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        match self.key(key_id)?.as_ref() {
            LocalKey::BabyJubJub(sk) => {
                sk.sign(&bjj_message(message)).to_bytes().map_err(|e| KeyStoreError::Signing(e.to_string()))
            }
            LocalKey::Ethereum(sk) => {
                let signing_key = SigningKey::from(sk);
                let signature: Signature = signing_key
                    .sign_prehash(&hash_data(message))
                    .map_err(|e| KeyStoreError::Signing(e.to_string()))?;
                Ok(signature.to_bytes().to_vec())
            }
        }
    }

    async fn delete(&self, key_id: &str) -> Result<(), KeyStoreError> {
        let mut keys = self.keys.lock().map_err(|_| KeyStoreError::Unavailable("key table poisoned".into()))?;
        keys.remove(key_id).map(|_| ()).ok_or_else(|| KeyStoreError::UnknownKey(key_id.to_string()))
    }
}

/// Key store front used by the services.
pub struct KeyManager {
    keys: Arc<dyn KeyStore>,
    store: Arc<dyn Store>,
    signing: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    retry: RetryPolicy,
}

impl KeyManager {
    pub fn new(keys: Arc<dyn KeyStore>, store: Arc<dyn Store>, retry: RetryPolicy) -> Self {
        Self { keys, store, signing: Mutex::new(HashMap::new()), retry }
    }

    pub async fn create(&self, key_type: KeyType) -> Result<String, KeyStoreError> {
        retry_with_backoff(&self.retry, "key creation", || self.keys.create(key_type)).await
    }

    pub async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, KeyStoreError> {
        retry_with_backoff(&self.retry, "public key lookup", || self.keys.public_key(key_id)).await
    }

    /// Signs with `key_id`; at most one signature per key is in progress.
    pub async fn sign(&self, key_id: &str, message: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let lock = {
            let mut locks = self.signing.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(key_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let _guard = lock.lock().await;
        retry_with_backoff(&self.retry, "signing", || self.keys.sign(key_id, message)).await
    }

    pub fn verify(&self, key_type: KeyType, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        self.keys.verify(key_type, public_key, message, signature)
    }

    /// Deletes a key no identity authenticates with anymore.
    ///
    /// A key is in use while some identity holds it and that identity's
    /// authentication credential is not revoked.
    pub async fn delete(&self, key_id: &str) -> Result<(), KeyStoreError> {
        let unavailable = |e: crate::storage::store::StoreError| KeyStoreError::Unavailable(e.to_string());
        for identity in self.store.identities().map_err(unavailable)? {
            if identity.key_id != key_id {
                continue;
            }
            let credentials = self.store.credentials(&identity.did).map_err(unavailable)?;
            if credentials.iter().any(|c| c.is_auth_credential() && !c.revoked) {
                return Err(KeyStoreError::KeyInUse(key_id.to_string()));
            }
        }
        self.keys.delete(key_id).await?;
        self.signing.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(key_id);
        info!("deleted key {}", key_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;

    #[tokio::test]
    async fn test_bjj_sign_verify() {
        let ks = LocalKeyStore::new();
        let id = ks.create(KeyType::BabyJubJub).await.unwrap();
        let pk = ks.public_key(&id).await.unwrap();
        let msg = [7u8; 32];
        let sig = ks.sign(&id, &msg).await.unwrap();
        assert!(ks.verify(KeyType::BabyJubJub, &pk, &msg, &sig));
        assert!(!ks.verify(KeyType::BabyJubJub, &pk, &[8u8; 32], &sig));
        assert!(!ks.verify(KeyType::Ethereum, &pk, &msg, &sig));
    }

    #[tokio::test]
    async fn test_eth_sign_verify_and_address() {
        let ks = LocalKeyStore::new();
        let id = ks.create(KeyType::Ethereum).await.unwrap();
        let pk = ks.public_key(&id).await.unwrap();
        assert_eq!(pk.len(), 65);
        let sig = ks.sign(&id, b"transition").await.unwrap();
        assert_eq!(sig.len(), 64);
        assert!(verify_signature(KeyType::Ethereum, &pk, b"transition", &sig));
        assert!(ethereum_address(&pk).is_ok());
        assert!(ethereum_address(&[1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn test_unknown_and_deleted_keys() {
        let ks = Arc::new(LocalKeyStore::new());
        let manager = KeyManager::new(ks.clone(), Arc::new(MemoryStore::new()), RetryPolicy::immediate());
        let id = manager.create(KeyType::BabyJubJub).await.unwrap();
        manager.delete(&id).await.unwrap();
        assert!(matches!(manager.sign(&id, &[0u8; 32]).await, Err(KeyStoreError::UnknownKey(_))));
        assert!(matches!(manager.delete(&id).await, Err(KeyStoreError::UnknownKey(_))));
    }
}
