//! Common types shared across the network management crates
//!
//! This crate provides shared types, the error kind taxonomy, input
//! validation and the persistence boundary so that service crates do not
//! depend on each other directly.

pub mod error;
pub mod network;
pub mod store;
pub mod validation;

pub use error::*;
pub use network::*;
pub use store::{load_json, save_json, JsonFileStore, MemoryStore, StateStore};
pub use validation::*;
