// src/lib.rs

//! # Issuer Node
//!
//! Verifiable-credential issuer core. Each issuer identity owns three sparse
//! Merkle trees (Claims, Revocation, Roots) whose roots hash into an identity
//! state; states are anchored on a zkSync Era contract.
//!
//! ## Layers
//! 1. **Cryptography**: Poseidon over BN254, BabyJubJub and secp256k1 keys
//! 2. **Trees**: sparse Merkle trees with per-identity transactions
//! 3. **Claims**: the 8-slot claim codec and attribute merklization
//! 4. **Services**: state management, issuance, revocation, publication, links
//! 5. **Transport**: a thin axum adapter

pub mod blockchain; // state anchoring on zkSync Era
pub mod claims; // claim codec and merklization
pub mod config; // layered settings
pub mod error; // error taxonomy
pub mod merkle; // sparse Merkle trees
pub mod models; // data structures
pub mod services; // business logic and API
pub mod storage; // persistence and IPFS
pub mod utils; // helper functions
pub mod wallet; // key management
