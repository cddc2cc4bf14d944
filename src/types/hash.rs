//! 32-byte SHA3-256 hash type with zero-allocation operations.

use sha3::{Digest, Sha3_256};
use std::fmt;
use std::sync::Mutex;

use crate::types::wire::EncodeSink;

/// SHA3-256 hash length in bytes.
pub const HASH_LEN: usize = 32;

/// Fixed-size 32-byte hash used throughout the node.
///
/// `Copy` on purpose: hashes are passed constantly during block validation
/// and comparisons, and 32 bytes on the stack beats reference indirection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash, Ord, PartialOrd)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Creates a zero-valued hash, the sentinel for "no parent" and empty roots.
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    /// Returns true if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    /// Returns the hash as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates a hash from a byte slice.
    ///
    /// Returns `None` unless the slice is exactly [`HASH_LEN`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Hash> {
        let bytes: [u8; HASH_LEN] = slice.try_into().ok()?;
        Some(Hash(bytes))
    }

    /// Creates a new SHA3-256 hash builder for incremental hashing.
    pub fn sha3() -> HashBuilder {
        HashBuilder::new()
    }

    /// Convenience one-shot SHA3-256 of `data`.
    pub fn of(data: &[u8]) -> Hash {
        Hash::sha3().chain(data).finalize()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Incremental SHA3-256 hash builder.
///
/// Implements [`EncodeSink`] so wire-encodable types can be hashed directly
/// without an intermediate byte buffer.
pub struct HashBuilder {
    hasher: Sha3_256,
}

impl HashBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha3_256::new(),
        }
    }

    /// Feeds data into the hash computation.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn chain(mut self, data: &[u8]) -> Self {
        self.hasher.update(data);
        self
    }

    /// Consumes the builder and returns the final hash.
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeSink for HashBuilder {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

/// Lazily-computed hash cached after the first computation.
///
/// Headers are hashed repeatedly during processing; the cache makes the
/// second and later lookups O(1).
#[derive(Debug, Default)]
pub struct HashCache {
    cached: Mutex<Option<Hash>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached hash, computing it via `f` on the first call.
    pub fn get_or_compute(&self, f: impl FnOnce() -> Hash) -> Hash {
        let mut guard = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(hash) => hash,
            None => {
                let hash = f();
                *guard = Some(hash);
                hash
            }
        }
    }
}

impl Clone for HashCache {
    fn clone(&self) -> Self {
        let cached = *self.cached.lock().unwrap_or_else(|e| e.into_inner());
        HashCache {
            cached: Mutex::new(cached),
        }
    }
}

impl PartialEq for HashCache {
    fn eq(&self, _other: &Self) -> bool {
        // Caches never affect value identity.
        true
    }
}

impl Eq for HashCache {}
