//! Signing keys, signature verification, and encrypted key persistence.

pub mod key_pair;
pub mod key_store;

pub use key_pair::{PrivateKey, PublicKey, Signature};
