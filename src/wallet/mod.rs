// src/wallet/mod.rs
pub mod babyjubjub;
pub mod key_management;
