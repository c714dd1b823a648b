// src/config.rs
//! Node configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `config/issuer.{toml,yaml,json}`, then `ISSUER__<SECTION>__<FIELD>`
//! environment variables (e.g. `ISSUER__SERVER__PORT=8080`). A `.env` file is
//! loaded into the environment first.

use crate::utils::retry::RetryPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 3000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IssuerSettings {
    /// Public base URL, used in credential status links.
    pub base_url: String,
    pub did_method: String,
    pub did_network: String,
    /// Width of revocation nonces in bits (1..=64).
    pub nonce_bits: u32,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            did_method: "iden3".into(),
            did_network: "zksync:sepolia".into(),
            nonce_bits: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TreeSettings {
    pub max_levels: usize,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self { max_levels: 40 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    /// Start the publication workers with the node.
    pub enabled: bool,
    pub publish_interval_ms: u64,
    pub confirm_interval_ms: u64,
    /// Period of the pass that resubmits failed states whose backoff elapsed.
    pub retry_interval_ms: u64,
    /// Identities published or confirmed concurrently.
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            publish_interval_ms: 10_000,
            confirm_interval_ms: 3_000,
            retry_interval_ms: 5_000,
            workers: 4,
            max_attempts: 5,
            backoff_base_ms: 200,
        }
    }
}

impl PublisherSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_base_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorMode {
    Local,
    Zksync,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnchorSettings {
    pub mode: AnchorMode,
    pub rpc_url: String,
    pub contract_address: String,
    pub private_key: Option<String>,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            mode: AnchorMode::Local,
            rpc_url: "https://sepolia.era.zksync.dev".into(),
            contract_address: "0x0000000000000000000000000000000000000000".into(),
            private_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaSettings {
    pub ipfs_api_url: String,
    pub request_timeout_ms: u64,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self { ipfs_api_url: "http://localhost:5001".into(), request_timeout_ms: 10_000 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub issuer: IssuerSettings,
    pub tree: TreeSettings,
    pub publisher: PublisherSettings,
    pub anchor: AnchorSettings,
    pub schema: SchemaSettings,
}

impl Settings {
    /// Loads `.env`, `config/issuer.*` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::load_from("config/issuer")
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("ISSUER").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=64).contains(&self.issuer.nonce_bits) {
            return Err(ConfigError::Message(format!("issuer.nonce_bits must be in 1..=64, got {}", self.issuer.nonce_bits)));
        }
        if self.tree.max_levels < 2 || self.tree.max_levels > 254 {
            return Err(ConfigError::Message(format!("tree.max_levels must be in 2..=254, got {}", self.tree.max_levels)));
        }
        if self.anchor.mode == AnchorMode::Zksync && self.anchor.private_key.is_none() {
            return Err(ConfigError::Message("anchor.private_key is required in zksync mode".into()));
        }
        Ok(())
    }
}
