//! The blockchain facade: multi-branch chain state, block processing,
//! transaction ingress, and the sync-facing query surface.
//!
//! All chain-mutating work is serialized behind one mutex held for the
//! whole of `process_block`; the mempool keeps its own internal lock.

pub mod chain;
pub mod process;
pub mod select;
pub mod validator;

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::consensus::Pow;
use crate::core::account::Account;
use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::events::EventBus;
use crate::mempool::TxPool;
use crate::params;
use crate::storage::kv::{ChainId, Kv, StoreError};
use crate::types::hash::Hash;

pub use chain::Chain;
pub use process::{BlockError, ProcessStatus};
pub use validator::{TxContext, TxError, TxValidator};

/// Mutable processor state: every known chain plus the block caches.
///
/// Lives behind the [`Blockchain`] mutex; methods take `&self`/`&mut self`
/// borrows so nothing escapes the lock.
pub(crate) struct ChainsState<K: Kv> {
    pub(crate) chains: HashMap<ChainId, Arc<Chain<K>>>,
    pub(crate) best: Option<ChainId>,
    /// Validly-formed blocks whose parents are not yet known.
    pub(crate) orphans: LruCache<Hash, Block>,
    /// Hashes of blocks already rejected, to fail repeats fast.
    pub(crate) rejected: LruCache<Hash, ()>,
}

impl<K: Kv> ChainsState<K> {
    fn new() -> Self {
        Self {
            chains: HashMap::new(),
            best: None,
            orphans: LruCache::new(
                NonZeroUsize::new(params::MAX_ORPHAN_BLOCKS).expect("orphan cache capacity"),
            ),
            rejected: LruCache::new(
                NonZeroUsize::new(params::MAX_REJECTED_BLOCKS).expect("rejected cache capacity"),
            ),
        }
    }

    /// Locates the chain holding a block with `hash`.
    ///
    /// Returns the block, its chain, and that chain's current tip header.
    pub(crate) fn find_block_chain(
        &self,
        hash: Hash,
    ) -> Option<(Block, Arc<Chain<K>>, crate::core::block::Header)> {
        for chain in self.chains.values() {
            if let Ok(block) = chain.store().get_block_by_hash(hash) {
                let tip = chain.tip().ok()?;
                return Some((block, chain.clone(), tip));
            }
        }
        None
    }

    /// Returns true if any known chain holds the block.
    pub(crate) fn have_block(&self, hash: Hash) -> Result<bool, StoreError> {
        for chain in self.chains.values() {
            if chain.store().has_block(hash)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns true if any known chain has indexed the transaction.
    pub(crate) fn have_transaction(&self, hash: Hash) -> Result<bool, StoreError> {
        for chain in self.chains.values() {
            if chain.store().has_transaction(hash)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resolves the current account for `address` as seen from `chain`.
    ///
    /// Looks at the chain's own snapshots first; when absent, walks up the
    /// parent topology, each hop bounded by the child's fork point.
    pub(crate) fn resolve_account(
        &self,
        chain: &Chain<K>,
        address: crate::types::address::Address,
    ) -> Result<Account, StoreError> {
        match chain.store().get_account_bounded(address, None) {
            Err(StoreError::AccountNotFound) => {}
            other => return other,
        }

        let mut info = chain.info().clone();
        loop {
            let Some(parent_id) = info.parent_chain_id.clone() else {
                return Err(StoreError::AccountNotFound);
            };
            let parent = self
                .chains
                .get(&parent_id)
                .ok_or_else(|| StoreError::ChainNotFound(parent_id.to_string()))?;
            match parent
                .store()
                .get_account_bounded(address, Some(info.parent_block_number))
            {
                Err(StoreError::AccountNotFound) => info = parent.info().clone(),
                other => return other,
            }
        }
    }

    /// Block at `number` as seen from `chain`, falling back into ancestors
    /// for numbers at or below each fork point.
    pub(crate) fn block_by_number(&self, chain: &Chain<K>, number: u64) -> Option<Block> {
        match chain.store().get_by_number(number) {
            Ok(block) => Some(block),
            Err(_) => {
                let mut info = chain.info().clone();
                loop {
                    let parent_id = info.parent_chain_id.clone()?;
                    let parent = self.chains.get(&parent_id)?;
                    if number <= info.parent_block_number {
                        if let Ok(block) = parent.store().get_by_number(number) {
                            return Some(block);
                        }
                    }
                    info = parent.info().clone();
                }
            }
        }
    }

    /// Block with `hash` as seen from `chain` or any of its ancestors.
    pub(crate) fn block_by_hash(&self, chain: &Chain<K>, hash: Hash) -> Option<Block> {
        if let Ok(block) = chain.store().get_block_by_hash(hash) {
            return Some(block);
        }
        let mut info = chain.info().clone();
        let mut bound = u64::MAX;
        loop {
            let parent_id = info.parent_chain_id.clone()?;
            let parent = self.chains.get(&parent_id)?;
            bound = bound.min(info.parent_block_number);
            if let Ok(block) = parent.store().get_block_by_hash(hash) {
                if block.number() <= bound {
                    return Some(block);
                }
            }
            info = parent.info().clone();
        }
    }

    /// Re-selects the best chain: greatest tip total difficulty wins, the
    /// incumbent keeps the slot on ties.
    pub(crate) fn update_best(&mut self) {
        let mut best_id = self.best.clone();
        let mut best_td = best_id
            .as_ref()
            .and_then(|id| self.chains.get(id))
            .map(|chain| chain.tip_total_difficulty());

        for (id, chain) in &self.chains {
            let td = chain.tip_total_difficulty();
            let better = match &best_td {
                None => true,
                Some(current) => td > *current,
            };
            if better {
                best_id = Some(id.clone());
                best_td = Some(td);
            }
        }
        self.best = best_id;
    }

    pub(crate) fn best_chain(&self) -> Result<Arc<Chain<K>>, StoreError> {
        let id = self.best.as_ref().ok_or(StoreError::BestChainUnknown)?;
        self.chains
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ChainNotFound(id.to_string()))
    }
}

/// The node's chain subsystem.
pub struct Blockchain<K: Kv> {
    pub(crate) db: Arc<K>,
    pub(crate) engine: Pow,
    pub(crate) pool: Arc<TxPool>,
    pub(crate) events: EventBus,
    pub(crate) state: Mutex<ChainsState<K>>,
}

impl<K: Kv> Blockchain<K> {
    /// Creates the subsystem over `db` with the given consensus engine.
    pub fn new(db: Arc<K>, engine: Pow) -> Self {
        let events = EventBus::new();
        let pool = Arc::new(TxPool::new(params::TX_POOL_CAPACITY, events.clone()));
        Self {
            db,
            engine,
            pool,
            events,
            state: Mutex::new(ChainsState::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pool(&self) -> Arc<TxPool> {
        self.pool.clone()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ChainsState<K>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of blocks waiting in the orphan cache.
    pub fn orphan_count(&self) -> usize {
        self.lock_state().orphans.len()
    }

    /// Returns true if `hash` sits in the rejected cache.
    pub fn is_rejected(&self, hash: Hash) -> bool {
        self.lock_state().rejected.contains(&hash)
    }

    /// Ids of all known chains.
    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.lock_state().chains.keys().cloned().collect()
    }

    /// Id of the current best chain.
    pub fn best_chain_id(&self) -> Result<ChainId, StoreError> {
        Ok(self.lock_state().best_chain()?.id().clone())
    }

    /// Tip header of the best chain.
    pub fn best_tip(&self) -> Result<crate::core::block::Header, StoreError> {
        self.lock_state().best_chain()?.tip()
    }

    /// Current account state of `address` on the best chain.
    pub fn get_account(&self, address: crate::types::address::Address) -> Result<Account, StoreError> {
        let state = self.lock_state();
        let best = state.best_chain()?;
        state.resolve_account(&best, address)
    }

    /// Looks up an included transaction, searching the best chain and its
    /// ancestors.
    pub fn get_transaction(&self, hash: Hash) -> Result<Transaction, StoreError> {
        let state = self.lock_state();
        let mut chain = state.best_chain()?;
        loop {
            match chain.store().get_transaction(hash) {
                Err(StoreError::TxNotFound) => {}
                other => return other,
            }
            let Some(parent_id) = chain.info().parent_chain_id.clone() else {
                return Err(StoreError::TxNotFound);
            };
            chain = state
                .chains
                .get(&parent_id)
                .cloned()
                .ok_or_else(|| StoreError::ChainNotFound(parent_id.to_string()))?;
        }
    }

    /// Returns true if any known chain holds the block.
    pub fn have_block(&self, hash: Hash) -> Result<bool, StoreError> {
        self.lock_state().have_block(hash)
    }

    /// Block locators for sync negotiation.
    ///
    /// In reverse order from the best tip: the last ten block hashes, then
    /// hashes at doubling distances back to genesis.
    pub fn get_locators(&self) -> Result<Vec<Hash>, StoreError> {
        let state = self.lock_state();
        let best = state.best_chain()?;
        let tip = best.tip()?;

        let hash_at = |number: u64| -> Result<Hash, StoreError> {
            state
                .block_by_number(&best, number)
                .map(|block| block.hash())
                .ok_or(StoreError::BlockNotFound)
        };

        let mut locators = Vec::new();
        let window_end = tip.number.saturating_sub(9).max(1);
        for number in (window_end..=tip.number).rev() {
            locators.push(hash_at(number)?);
        }

        let mut last = window_end;
        let mut step = 1u64;
        while last > 1 {
            step *= 2;
            let next = last.saturating_sub(step);
            if next <= 1 {
                locators.push(hash_at(1)?);
                break;
            }
            locators.push(hash_at(next)?);
            last = next;
        }

        Ok(locators)
    }

    /// Hashes of best-chain blocks following the first locator hash we
    /// recognize, capped at `max`.
    ///
    /// When no locator hash is known the walk starts right after genesis.
    pub fn get_block_hashes(&self, locator: &[Hash], max: u64) -> Result<Vec<Hash>, StoreError> {
        let state = self.lock_state();
        let best = state.best_chain()?;
        let tip = best.tip()?;

        let mut begin = 2u64;
        for hash in locator {
            if let Some(block) = state.block_by_hash(&best, *hash) {
                begin = block.number() + 1;
                break;
            }
        }

        let mut hashes = Vec::new();
        let mut number = begin;
        while number <= tip.number && (hashes.len() as u64) < max.min(params::MAX_GET_BLOCK_HASHES)
        {
            let block = state
                .block_by_number(&best, number)
                .ok_or(StoreError::BlockNotFound)?;
            hashes.push(block.hash());
            number += 1;
        }
        Ok(hashes)
    }

    /// Full blocks for the requested hashes; unknown hashes are skipped.
    pub fn get_block_bodies(&self, hashes: &[Hash]) -> Vec<Block> {
        let state = self.lock_state();
        let Ok(best) = state.best_chain() else {
            return Vec::new();
        };
        hashes
            .iter()
            .filter_map(|hash| state.block_by_hash(&best, *hash))
            .collect()
    }

    /// Validates a network transaction and admits it into the mempool.
    ///
    /// Emits `TransactionProcessed` after the outcome is decided.
    pub fn process_transaction(&self, tx: Transaction) -> Result<(), TxError> {
        let hash = tx.hash;
        let result = self.admit_transaction(tx);
        self.events.emit_transaction_processed(hash);
        result
    }

    fn admit_transaction(&self, tx: Transaction) -> Result<(), TxError> {
        let errors = TxValidator::new(&tx, self, TxContext::Network).validate();
        if let Some(first) = errors.into_iter().next() {
            return Err(first);
        }
        self.pool.put(tx).map_err(TxError::Pool)
    }

    /// Read-only handle over the best chain for concurrent consumers.
    pub fn chain_reader(&self) -> Result<ChainReader<K>, StoreError> {
        Ok(ChainReader {
            chain: self.lock_state().best_chain()?,
        })
    }
}

/// Snapshot-consistent read access to one chain.
///
/// Readers never take the processor lock: block commits are atomic in the
/// underlying store, so a reader observes either the pre-commit or the
/// post-commit chain, never a torn state.
#[derive(Clone)]
pub struct ChainReader<K: Kv> {
    chain: Arc<Chain<K>>,
}

impl<K: Kv> ChainReader<K> {
    pub fn chain_id(&self) -> &ChainId {
        self.chain.id()
    }

    pub fn current(&self) -> Result<crate::core::block::Header, StoreError> {
        self.chain.tip()
    }

    pub fn get_block_by_hash(&self, hash: Hash) -> Result<Block, StoreError> {
        self.chain.store().get_block_by_hash(hash)
    }

    pub fn get_header_by_hash(&self, hash: Hash) -> Result<crate::core::block::Header, StoreError> {
        self.chain.store().get_header_by_hash(hash)
    }

    pub fn get_by_number(&self, number: u64) -> Result<Block, StoreError> {
        self.chain.store().get_by_number(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{funded_blockchain, make_child_block, test_key, transfer};
    use rust_decimal_macros::dec;

    /// Extends the best chain by `n` empty blocks, returning all blocks
    /// from genesis onward.
    fn grow(bc: &Blockchain<crate::storage::memory_kv::MemoryKv>, genesis: Block, n: u64) -> Vec<Block> {
        let mut blocks = vec![genesis];
        for _ in 0..n {
            let block = make_child_block(bc, vec![]);
            bc.process_block(block.clone()).expect("grow failed");
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn locators_cover_short_chains_fully_in_reverse() {
        let (bc, genesis) = funded_blockchain();
        let blocks = grow(&bc, genesis, 9); // ten blocks total

        let locators = bc.get_locators().expect("locators failed");
        assert_eq!(locators.len(), 10);
        for (offset, locator) in locators.iter().enumerate() {
            assert_eq!(*locator, blocks[blocks.len() - 1 - offset].hash());
        }
    }

    #[test]
    fn locators_step_double_on_longer_chains() {
        let (bc, genesis) = funded_blockchain();
        let blocks = grow(&bc, genesis, 19); // twenty blocks total

        let locators = bc.get_locators().expect("locators failed");
        assert_eq!(locators.len(), 13);

        // Window: blocks 20 down to 11.
        for offset in 0..10 {
            assert_eq!(locators[offset], blocks[19 - offset].hash());
        }
        // Doubling distances: 9, 5, then genesis.
        assert_eq!(locators[10], blocks[8].hash());
        assert_eq!(locators[11], blocks[4].hash());
        assert_eq!(locators[12], blocks[0].hash());
    }

    #[test]
    fn block_hashes_resume_after_known_locator() {
        let (bc, genesis) = funded_blockchain();
        let blocks = grow(&bc, genesis, 6);

        let locator = vec![Hash::of(b"unknown"), blocks[3].hash()];
        let hashes = bc.get_block_hashes(&locator, 100).expect("hashes failed");
        let expected: Vec<Hash> = blocks[4..].iter().map(|block| block.hash()).collect();
        assert_eq!(hashes, expected);
    }

    #[test]
    fn block_hashes_fall_back_past_genesis_and_cap_at_max() {
        let (bc, genesis) = funded_blockchain();
        let blocks = grow(&bc, genesis, 6);

        let hashes = bc
            .get_block_hashes(&[Hash::of(b"nowhere")], 3)
            .expect("hashes failed");
        let expected: Vec<Hash> = blocks[1..4].iter().map(|block| block.hash()).collect();
        assert_eq!(hashes, expected);
    }

    #[test]
    fn block_bodies_skip_unknown_hashes() {
        let (bc, genesis) = funded_blockchain();
        let blocks = grow(&bc, genesis, 2);

        let bodies =
            bc.get_block_bodies(&[blocks[1].hash(), Hash::of(b"missing"), blocks[2].hash()]);
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0].hash(), blocks[1].hash());
        assert_eq!(bodies[1].hash(), blocks[2].hash());
    }

    #[test]
    fn transaction_lookup_follows_best_chain() {
        let (bc, _) = funded_blockchain();
        let tx = transfer(&test_key(1), 1, test_key(9).public_key().address(), dec!(1), dec!(0.1));
        let block = make_child_block(&bc, vec![tx.clone()]);
        bc.process_block(block).expect("process failed");

        assert_eq!(bc.get_transaction(tx.hash).unwrap().hash, tx.hash);
        assert!(matches!(
            bc.get_transaction(Hash::of(b"unknown")),
            Err(StoreError::TxNotFound)
        ));
    }

    #[test]
    fn account_lookup_recurses_into_parent_chain() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        let recipient = test_key(9).public_key().address();

        // Block 2 funds the recipient on the main chain.
        let tx = transfer(&sender, 1, recipient, dec!(7), dec!(0.1));
        let block2 = make_child_block(&bc, vec![tx]);
        bc.process_block(block2).expect("block2 failed");
        let block3 = make_child_block(&bc, vec![]);
        bc.process_block(block3.clone()).expect("block3 failed");

        // A sibling of block 3 spawns an empty branch rooted at block 2.
        let mut sibling = block3.header.clone();
        sibling.timestamp += 1;
        sibling.sign(&test_key(1));
        bc.process_block(Block::new(sibling, vec![]))
            .expect("sibling failed");

        let state = bc.lock_state();
        let branch = state
            .chains
            .values()
            .find(|chain| chain.info().parent_chain_id.is_some())
            .expect("branch exists")
            .clone();

        // The branch itself holds no snapshots; resolution walks into the
        // parent chain up to the fork point.
        let account = state.resolve_account(&branch, recipient).expect("resolve");
        assert_eq!(account.balance, dec!(7));
    }

    #[test]
    fn best_chain_tracks_total_difficulty() {
        let (bc, genesis) = funded_blockchain();
        let main_id = bc.best_chain_id().expect("best chain");
        grow(&bc, genesis, 2);

        // The main chain keeps the crown while the branch is shorter.
        let tip = bc.best_tip().expect("tip");
        assert_eq!(bc.best_chain_id().unwrap(), main_id);
        assert_eq!(tip.number, 3);
    }

    #[test]
    fn chain_reader_serves_committed_blocks() {
        let (bc, _) = funded_blockchain();
        let block = make_child_block(&bc, vec![]);
        bc.process_block(block.clone()).expect("process failed");

        let reader = bc.chain_reader().expect("reader");
        assert_eq!(reader.current().unwrap().number, 2);
        assert_eq!(reader.get_by_number(2).unwrap().hash(), block.hash());
        assert_eq!(
            reader.get_block_by_hash(block.hash()).unwrap().number(),
            2
        );
        assert_eq!(
            reader.get_header_by_hash(block.hash()).unwrap().number,
            2
        );
    }

    #[test]
    fn process_transaction_validates_and_pools() {
        let (bc, _) = funded_blockchain();
        let mut events = bc.events().subscribe_transaction_processed();

        let tx = transfer(&test_key(1), 1, test_key(9).public_key().address(), dec!(1), dec!(0.1));
        bc.process_transaction(tx.clone()).expect("process failed");
        assert!(bc.pool().has(tx.hash));
        assert_eq!(events.try_recv().unwrap(), tx.hash);

        // The same transaction is refused the second time around.
        assert!(bc.process_transaction(tx).is_err());
    }
}

