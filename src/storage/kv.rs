//! Transactional key/value contract and key composition.
//!
//! The node core never touches a database directly; everything goes through
//! [`Kv`]. Writes that must be atomic are staged on a write transaction and
//! committed in one shot, or rolled back by dropping the staged writes.

use std::fmt;
use thiserror::Error;

use crate::types::address::Address;
use crate::types::hash::Hash;

/// Errors surfaced by storage backends and the stores above them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Backend(String),
    #[error("failed to decode stored value: {0}")]
    Decode(String),
    #[error("chain not found: {0}")]
    ChainNotFound(String),
    #[error("block not found")]
    BlockNotFound,
    #[error("transaction not found")]
    TxNotFound,
    #[error("account not found")]
    AccountNotFound,
    #[error("best chain unknown")]
    BestChainUnknown,
    #[error(
        "block does not extend tip: expected number {expected_number} with parent {expected_parent}"
    )]
    NotOnTip {
        expected_number: u64,
        expected_parent: Hash,
    },
}

impl From<crate::types::wire::WireError> for StoreError {
    fn from(err: crate::types::wire::WireError) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// Identifier of one chain (branch) in the store.
///
/// Chains are referenced by id, never by owning pointers, so parent/child
/// branches cannot form ownership cycles.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a fresh chain id from the block seeding the chain and the
    /// creation time.
    pub fn derive(seed: Hash, timestamp: i64) -> Self {
        let digest = Hash::sha3()
            .chain(b"CHAIN_ID")
            .chain(seed.as_slice())
            .chain(&timestamp.to_be_bytes())
            .finalize();
        Self(hex::encode(&digest.as_slice()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transactional key/value storage.
///
/// Backends must be thread-safe; atomicity of [`commit`](Kv::commit) is what
/// the block processor relies on when writing state objects and blocks
/// together.
pub trait Kv: Send + Sync + 'static {
    /// A staged batch of writes, atomic on commit.
    type WriteTx: Send;

    /// Opens a new empty write transaction.
    fn new_tx(&self) -> Self::WriteTx;

    /// Stages a write onto the transaction.
    fn put_with_tx(&self, tx: &mut Self::WriteTx, key: &[u8], value: &[u8]);

    /// Atomically applies all writes staged on `tx`.
    fn commit(&self, tx: Self::WriteTx) -> Result<(), StoreError>;

    /// Discards all writes staged on `tx`.
    fn rollback(&self, tx: Self::WriteTx);

    /// Reads the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns all `(key, value)` pairs whose key starts with `prefix`,
    /// in ascending key order.
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// One-shot write of a single pair.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut tx = self.new_tx();
        self.put_with_tx(&mut tx, key, value);
        self.commit(tx)
    }
}

/// Key composition for everything the core persists.
///
/// - chain info: `"chain_info" || chain_id`
/// - block by number: `"block" || chain_id || be_u64(number)`
/// - block hash index: `"block_hash" || chain_id || block_hash`
/// - transaction index: `"tx" || chain_id || tx_hash`
/// - account snapshot: `"account" || chain_id || be_u64(number) || address`
pub mod keys {
    use super::*;

    const CHAIN_INFO: &[u8] = b"chain_info";
    const CHAIN_TIP: &[u8] = b"chain_tip";
    const BLOCK: &[u8] = b"block";
    const BLOCK_HASH: &[u8] = b"block_hash";
    const TX: &[u8] = b"tx";
    const ACCOUNT: &[u8] = b"account";

    fn compose(parts: &[&[u8]]) -> Vec<u8> {
        let len = parts.iter().map(|p| p.len()).sum();
        let mut key = Vec::with_capacity(len);
        for part in parts {
            key.extend_from_slice(part);
        }
        key
    }

    pub fn chain_info(chain: &ChainId) -> Vec<u8> {
        compose(&[CHAIN_INFO, chain.as_bytes()])
    }

    pub fn chain_info_prefix() -> Vec<u8> {
        CHAIN_INFO.to_vec()
    }

    pub fn chain_tip(chain: &ChainId) -> Vec<u8> {
        compose(&[CHAIN_TIP, chain.as_bytes()])
    }

    pub fn block(chain: &ChainId, number: u64) -> Vec<u8> {
        compose(&[BLOCK, chain.as_bytes(), &number.to_be_bytes()])
    }

    pub fn block_prefix(chain: &ChainId) -> Vec<u8> {
        compose(&[BLOCK, chain.as_bytes()])
    }

    pub fn block_hash(chain: &ChainId, hash: Hash) -> Vec<u8> {
        compose(&[BLOCK_HASH, chain.as_bytes(), hash.as_slice()])
    }

    pub fn tx(chain: &ChainId, hash: Hash) -> Vec<u8> {
        compose(&[TX, chain.as_bytes(), hash.as_slice()])
    }

    pub fn account(chain: &ChainId, number: u64, address: Address) -> Vec<u8> {
        compose(&[
            ACCOUNT,
            chain.as_bytes(),
            &number.to_be_bytes(),
            address.as_slice(),
        ])
    }

    pub fn account_prefix(chain: &ChainId) -> Vec<u8> {
        compose(&[ACCOUNT, chain.as_bytes()])
    }

    /// Splits an account key back into `(block_number, address)`.
    ///
    /// Returns `None` if the key does not belong to `chain`'s account space.
    pub fn parse_account(key: &[u8], chain: &ChainId) -> Option<(u64, Address)> {
        let prefix = account_prefix(chain);
        let suffix = key.strip_prefix(prefix.as_slice())?;
        if suffix.len() != 8 + crate::types::address::ADDRESS_SIZE {
            return None;
        }
        let number = u64::from_be_bytes(suffix[..8].try_into().ok()?);
        let address = Address::from_slice(&suffix[8..])?;
        Some((number, address))
    }

    /// Key of an account snapshot inside the authenticated state tree:
    /// `SHA3-256(be_u64(block_number) || chain_id || address)`.
    pub fn tree_account_key(number: u64, chain: &ChainId, address: Address) -> Hash {
        Hash::sha3()
            .chain(&number.to_be_bytes())
            .chain(chain.as_bytes())
            .chain(address.as_slice())
            .finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_derivation_is_deterministic() {
        let seed = Hash::of(b"genesis");
        assert_eq!(ChainId::derive(seed, 42), ChainId::derive(seed, 42));
        assert_ne!(ChainId::derive(seed, 42), ChainId::derive(seed, 43));
    }

    #[test]
    fn block_keys_sort_by_number() {
        let chain = ChainId::new("main");
        let k1 = keys::block(&chain, 1);
        let k2 = keys::block(&chain, 2);
        let k300 = keys::block(&chain, 300);
        assert!(k1 < k2);
        assert!(k2 < k300);
        assert!(k300.starts_with(&keys::block_prefix(&chain)));
    }

    #[test]
    fn account_key_roundtrip() {
        let chain = ChainId::new("main");
        let address = Address([5u8; 20]);
        let key = keys::account(&chain, 77, address);
        assert_eq!(keys::parse_account(&key, &chain), Some((77, address)));
    }

    #[test]
    fn parse_account_rejects_foreign_chain() {
        let chain = ChainId::new("main");
        let other = ChainId::new("fork");
        let key = keys::account(&chain, 77, Address([5u8; 20]));
        assert_eq!(keys::parse_account(&key, &other), None);
    }

    #[test]
    fn tree_keys_differ_per_dimension() {
        let chain = ChainId::new("main");
        let other = ChainId::new("fork");
        let addr = Address([5u8; 20]);
        let base = keys::tree_account_key(1, &chain, addr);
        assert_ne!(keys::tree_account_key(2, &chain, addr), base);
        assert_ne!(keys::tree_account_key(1, &other, addr), base);
        assert_ne!(keys::tree_account_key(1, &chain, Address([6u8; 20])), base);
    }
}
