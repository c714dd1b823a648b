// src/blockchain/mod.rs
pub mod anchor;
pub mod zksync_client;

pub use anchor::{AnchorError, AnchorStatus, AnchorTransition, LocalAnchor, StateAnchor};
pub use zksync_client::ZkSyncStateAnchor;
