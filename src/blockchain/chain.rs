//! One chain (branch) of blocks with its authenticated state.

use num_bigint::BigUint;
use num_traits::Zero;
use std::sync::{Arc, Mutex};

use crate::core::block::Header;
use crate::storage::chain_store::{ChainInfo, ChainStore};
use crate::storage::kv::{keys, ChainId, Kv, StoreError};
use crate::types::hash::Hash;
use crate::types::merkle::{StateTree, TreeSeed};
use crate::types::wire::WireDecode;
use crate::core::account::Account;

/// A chain pairs its persistent store with the in-memory state tree whose
/// root authenticates the chain's account snapshots.
///
/// The state tree of a branch created at a fork starts empty; lookups fall
/// back into the parent chain through the chain topology, and the branch
/// accumulates its own state as blocks extend it.
pub struct Chain<K: Kv> {
    info: ChainInfo,
    store: ChainStore<K>,
    state: Mutex<StateTree>,
}

impl<K: Kv> Chain<K> {
    /// Creates a chain handle with an empty state tree.
    pub fn new(db: Arc<K>, info: ChainInfo) -> Self {
        let store = ChainStore::new(db, info.id.clone());
        Self {
            info,
            store,
            state: Mutex::new(StateTree::new()),
        }
    }

    /// Recreates a chain handle from persisted data, rebuilding the state
    /// tree from the chain's account snapshots.
    pub fn load(db: Arc<K>, info: ChainInfo) -> Result<Self, StoreError> {
        let chain = Self::new(db, info);
        {
            let mut state = chain.state.lock().unwrap_or_else(|e| e.into_inner());
            let prefix = keys::account_prefix(chain.id());
            for (key, value) in chain.store.db().iter_prefix(&prefix)? {
                let Some((number, address)) = keys::parse_account(&key, chain.id()) else {
                    continue;
                };
                // Snapshots must stay decodable; surface corruption early.
                Account::from_wire_bytes(&value)?;
                state.upsert(keys::tree_account_key(number, chain.id(), address), value);
            }
        }
        Ok(chain)
    }

    pub fn id(&self) -> &ChainId {
        &self.info.id
    }

    pub fn info(&self) -> &ChainInfo {
        &self.info
    }

    pub fn store(&self) -> &ChainStore<K> {
        &self.store
    }

    /// Header of this chain's tip.
    pub fn tip(&self) -> Result<Header, StoreError> {
        self.store.current()
    }

    /// Total difficulty at the tip; zero for an empty chain.
    pub fn tip_total_difficulty(&self) -> BigUint {
        self.tip()
            .map(|header| header.total_difficulty)
            .unwrap_or_else(|_| BigUint::zero())
    }

    /// Snapshot of the live state tree for mock execution.
    pub fn state_seed(&self) -> (Hash, TreeSeed) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).root()
    }

    /// Current state root of this chain.
    pub fn state_root(&self) -> Hash {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .root_hash()
    }

    /// Folds committed state entries into the live tree.
    ///
    /// Called only after the matching KV transaction committed, so tree and
    /// store cannot diverge.
    pub fn apply_tree_entries(&self, entries: impl IntoIterator<Item = (Hash, Vec<u8>)>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in entries {
            state.upsert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_kv::MemoryKv;
    use crate::types::wire::WireEncode;
    use crate::utils::test_utils::chain_of;
    use crate::types::address::Address;
    use rust_decimal_macros::dec;

    fn genesis_info() -> ChainInfo {
        ChainInfo::genesis(ChainId::new("main"), 0)
    }

    #[test]
    fn empty_chain_has_zero_state_and_difficulty() {
        let chain = Chain::new(Arc::new(MemoryKv::new()), genesis_info());
        assert_eq!(chain.state_root(), Hash::zero());
        assert!(chain.tip_total_difficulty().is_zero());
        assert!(chain.tip().is_err());
    }

    #[test]
    fn tip_follows_appended_blocks() {
        let chain = Chain::new(Arc::new(MemoryKv::new()), genesis_info());
        for block in chain_of(2) {
            chain.store().append(&block).expect("append failed");
        }
        assert_eq!(chain.tip().unwrap().number, 2);
        assert!(!chain.tip_total_difficulty().is_zero());
    }

    #[test]
    fn apply_tree_entries_changes_root_and_seed() {
        let chain = Chain::new(Arc::new(MemoryKv::new()), genesis_info());
        let account = Account::new(Address([1u8; 20]), dec!(5));
        let key = keys::tree_account_key(1, chain.id(), account.address);

        chain.apply_tree_entries([(key, account.to_wire_bytes())]);
        let (root, seed) = chain.state_seed();
        assert_ne!(root, Hash::zero());
        assert_eq!(StateTree::seeded(&seed).root_hash(), root);
    }

    #[test]
    fn load_rebuilds_state_from_snapshots() {
        let db = Arc::new(MemoryKv::new());
        let chain = Chain::new(db.clone(), genesis_info());
        let account = Account::new(Address([1u8; 20]), dec!(5));

        let mut tx = db.new_tx();
        chain.store().put_account(&mut tx, 3, &account);
        db.commit(tx).unwrap();
        chain.apply_tree_entries([(
            keys::tree_account_key(3, chain.id(), account.address),
            account.to_wire_bytes(),
        )]);
        let expected_root = chain.state_root();

        let reloaded = Chain::load(db, genesis_info()).expect("load failed");
        assert_eq!(reloaded.state_root(), expected_root);
    }
}
