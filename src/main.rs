// src/main.rs

//! # Issuer Node - Main Entry Point
//!
//! Loads the settings, wires the services and serves the HTTP API until
//! Ctrl-C. Publisher workers start with the node when
//! `publisher.enabled` is set and are drained on shutdown.
//!
//! ## Configuration
//! - `config/issuer.{toml,yaml,json}` (optional)
//! - `ISSUER__<SECTION>__<FIELD>` environment variables, `.env` honoured
//! - `RUST_LOG` for log filtering

use anyhow::Context;
use issuer_node::blockchain::{LocalAnchor, StateAnchor, ZkSyncStateAnchor};
use issuer_node::config::{AnchorMode, Settings};
use issuer_node::services::api_server::ApiServer;
use issuer_node::services::schema_loader::HttpSchemaLoader;
use issuer_node::services::IssuerNode;
use issuer_node::storage::ipfs_client::IpfsStorage;
use issuer_node::storage::store::MemoryStore;
use issuer_node::wallet::key_management::LocalKeyStore;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn build_anchor(settings: &Settings) -> anyhow::Result<Arc<dyn StateAnchor>> {
    match settings.anchor.mode {
        AnchorMode::Local => {
            warn!("anchoring to the in-process ledger; states never reach a chain");
            Ok(Arc::new(LocalAnchor::new()))
        }
        AnchorMode::Zksync => {
            let private_key = settings
                .anchor
                .private_key
                .as_deref()
                .context("anchor.private_key is required in zksync mode")?;
            let anchor = ZkSyncStateAnchor::new(&settings.anchor.rpc_url, private_key, &settings.anchor.contract_address)
                .await
                .context("failed to initialise the zkSync anchor")?;
            Ok(Arc::new(anchor))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::load().context("invalid configuration")?;

    let anchor = build_anchor(&settings).await?;
    let ipfs = IpfsStorage::connect(&settings.schema.ipfs_api_url).context("invalid IPFS API URL")?;
    let schemas = HttpSchemaLoader::new(
        ipfs,
        Duration::from_millis(settings.schema.request_timeout_ms),
        settings.publisher.retry_policy(),
    )
    .context("failed to build the schema loader")?;

    let node = IssuerNode::new(
        &settings,
        Arc::new(MemoryStore::new()),
        Arc::new(LocalKeyStore::new()),
        anchor,
        Arc::new(schemas),
    );
    let server = Arc::new(ApiServer::new(Arc::new(node)));
    if settings.publisher.enabled {
        server.start_workers().await;
    }

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("invalid server address")?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };
    server.clone().run(addr, shutdown).await.context("API server failed")?;

    server.stop_workers().await;
    info!("issuer node stopped");
    Ok(())
}
