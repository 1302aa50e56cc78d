//! Transport abstraction and connection routing for the tether messenger.
//!
//! This crate provides the pluggable transport layer: a registry of transport
//! backends keyed by medium, a relay-backed transport with a supervised
//! reconnecting link, and a router that walks preference-ordered candidates
//! to establish peer connections. Wire protocols, identity, and encryption
//! live in collaborating crates; this layer only decides how a connection is
//! made and reports what happened.

pub mod config;
pub mod errors;
pub mod events;
pub mod registry;
pub mod relay;
pub mod router;
pub mod testing;
pub mod traits;
pub mod types;

pub use config::*;
pub use errors::*;
pub use events::*;
pub use registry::*;
pub use relay::*;
pub use router::*;
pub use testing::*;
pub use traits::*;
pub use types::*;
