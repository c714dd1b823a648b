// src/utils/mod.rs
//! Helper functions shared across layers.

pub mod crypto;
pub mod retry;
pub mod serialization;
