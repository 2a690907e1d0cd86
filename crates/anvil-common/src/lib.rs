//! # Anvil Common
//!
//! Shared types, errors, and constants used across Anvil components.
//!
//! ## Modules
//! - `types` - Core data structures (Node, Topology, JoinCredential, etc.)
//! - `error` - Error taxonomy shared by provisioning and bootstrap
//! - `constants` - Defaults and well-known paths

pub mod constants;
pub mod error;
pub mod types;

pub use error::{AnvilError, Stage};
pub use types::*;
