// src/storage/mod.rs
pub mod ipfs_client;
pub mod store;
