// src/claims/mod.rs
pub mod codec;
pub mod merklize;

pub use codec::{ClaimEntry, ClaimFields, ClaimRequest, CodecError, EncodedClaim};
