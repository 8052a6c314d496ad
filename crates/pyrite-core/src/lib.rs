//! # pyrite-core — core types and adapter traits.
//!
//! Defines the protocol data model (hashes, headers, blocks, peer snapshots)
//! and the contracts between the synchronization core and its external
//! collaborators: the chain store, the peer manager, and the wire protocol.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
