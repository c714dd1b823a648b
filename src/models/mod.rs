// src/models/mod.rs
//! Data structures shared by every layer.

pub mod credential;
pub mod did;
pub mod link;
pub mod schema;
pub mod state;
