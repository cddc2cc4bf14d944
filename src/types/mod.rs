//! Fundamental types shared across the node.
//!
//! - [`hash`]: fixed-size 32-byte SHA3-256 hashes and incremental hashing
//! - [`address`]: 20-byte account addresses derived from public keys
//! - [`wire`]: canonical tag-wire binary serialization
//! - [`merkle`]: transaction merkle roots and the authenticated state tree

pub mod address;
pub mod hash;
pub mod merkle;
pub mod wire;
