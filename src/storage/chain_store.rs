//! Per-chain persistent store: blocks, headers, the transaction index, and
//! account snapshots, all namespaced under the chain id.

use std::sync::Arc;

use crate::consensus::HeaderReader;
use crate::core::account::Account;
use crate::core::block::{Block, Header};
use crate::core::transaction::Transaction;
use crate::storage::kv::{keys, ChainId, Kv, StoreError};
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::types::wire::{self, EncodeSink, WireDecode, WireEncode, WireError};

/// Persisted description of a chain (branch).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainInfo {
    pub id: ChainId,
    /// Chain this branch forked from; `None` for the genesis chain.
    pub parent_chain_id: Option<ChainId>,
    /// Block number on the parent chain this branch is rooted at.
    pub parent_block_number: u64,
    /// Creation time of the branch.
    pub timestamp: i64,
}

impl ChainInfo {
    /// Info for the genesis chain, which has no parent.
    pub fn genesis(id: ChainId, timestamp: i64) -> Self {
        Self {
            id,
            parent_chain_id: None,
            parent_block_number: 0,
            timestamp,
        }
    }
}

/// Wire layout:
/// 1. id (string)
/// 2. parent_chain_id (string; empty when none)
/// 3. parent_block_number (varint)
/// 4. timestamp (varint, two's complement)
impl WireEncode for ChainInfo {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        wire::write_str(out, 1, self.id.as_str());
        let parent = self
            .parent_chain_id
            .as_ref()
            .map(|id| id.as_str())
            .unwrap_or("");
        wire::write_str(out, 2, parent);
        wire::write_uint(out, 3, self.parent_block_number);
        wire::write_int(out, 4, self.timestamp);
    }
}

impl WireDecode for ChainInfo {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let id = ChainId::new(wire::read_str(input, 1)?);
        let parent = wire::read_str(input, 2)?;
        let parent_chain_id = (!parent.is_empty()).then(|| ChainId::new(parent));
        let parent_block_number = wire::read_uint(input, 3)?;
        let timestamp = wire::read_int(input, 4)?;
        Ok(ChainInfo {
            id,
            parent_chain_id,
            parent_block_number,
            timestamp,
        })
    }
}

/// Block and account persistence for a single chain.
///
/// All writes that belong to one block go through a caller-supplied KV
/// transaction, so the block, its indices, and its state objects land
/// atomically or not at all.
pub struct ChainStore<K: Kv> {
    db: Arc<K>,
    chain_id: ChainId,
}

impl<K: Kv> ChainStore<K> {
    pub fn new(db: Arc<K>, chain_id: ChainId) -> Self {
        Self { db, chain_id }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub(crate) fn db(&self) -> &K {
        &self.db
    }

    /// Number of the chain's tip block, if the chain has one.
    pub fn tip_number(&self) -> Result<Option<u64>, StoreError> {
        let Some(raw) = self.db.get(&keys::chain_tip(&self.chain_id))? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Decode("chain tip is not a block number".into()))?;
        Ok(Some(u64::from_be_bytes(bytes)))
    }

    /// Header of the chain's tip block.
    pub fn current(&self) -> Result<Header, StoreError> {
        let number = self.tip_number()?.ok_or(StoreError::BlockNotFound)?;
        Ok(self.get_by_number(number)?.header)
    }

    /// Loads the block stored at `number`.
    pub fn get_by_number(&self, number: u64) -> Result<Block, StoreError> {
        let raw = self
            .db
            .get(&keys::block(&self.chain_id, number))?
            .ok_or(StoreError::BlockNotFound)?;
        Ok(Block::from_wire_bytes(&raw)?)
    }

    /// Loads the block identified by `hash`, if this chain holds it.
    pub fn get_block_by_hash(&self, hash: Hash) -> Result<Block, StoreError> {
        let raw = self
            .db
            .get(&keys::block_hash(&self.chain_id, hash))?
            .ok_or(StoreError::BlockNotFound)?;
        let bytes: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Decode("block hash index is not a block number".into()))?;
        self.get_by_number(u64::from_be_bytes(bytes))
    }

    /// Loads the header of the block identified by `hash`.
    pub fn get_header_by_hash(&self, hash: Hash) -> Result<Header, StoreError> {
        Ok(self.get_block_by_hash(hash)?.header)
    }

    /// Returns true if this chain holds a block with the given hash.
    pub fn has_block(&self, hash: Hash) -> Result<bool, StoreError> {
        Ok(self
            .db
            .get(&keys::block_hash(&self.chain_id, hash))?
            .is_some())
    }

    /// Appends `block` in its own transaction.
    pub fn append(&self, block: &Block) -> Result<(), StoreError> {
        let mut tx = self.db.new_tx();
        self.append_with_tx(&mut tx, block)?;
        self.db.commit(tx)
    }

    /// Stages `block` as the chain's new tip.
    ///
    /// The first block of a chain is exempt from linkage checks; afterwards
    /// the block must carry `tip.number + 1` and reference the tip's hash.
    pub fn append_with_tx(&self, tx: &mut K::WriteTx, block: &Block) -> Result<(), StoreError> {
        if let Some(tip_number) = self.tip_number()? {
            let tip = self.get_by_number(tip_number)?;
            if block.number() != tip_number + 1 || block.parent_hash() != tip.hash() {
                return Err(StoreError::NotOnTip {
                    expected_number: tip_number + 1,
                    expected_parent: tip.hash(),
                });
            }
        }

        let number = block.number();
        self.db.put_with_tx(
            tx,
            &keys::block(&self.chain_id, number),
            &block.to_wire_bytes(),
        );
        self.db.put_with_tx(
            tx,
            &keys::block_hash(&self.chain_id, block.hash()),
            &number.to_be_bytes(),
        );
        self.db
            .put_with_tx(tx, &keys::chain_tip(&self.chain_id), &number.to_be_bytes());
        self.put_transactions(tx, &block.transactions, number);
        Ok(())
    }

    /// Indexes the given transactions as included at `block_number`.
    ///
    /// The stored value is the block number followed by the transaction's
    /// wire encoding, so a hash resolves to both the transaction and its
    /// inclusion point.
    pub fn put_transactions(
        &self,
        tx: &mut K::WriteTx,
        transactions: &[Transaction],
        block_number: u64,
    ) {
        for transaction in transactions {
            let mut value = Vec::with_capacity(8 + transaction.wire_size());
            value.extend_from_slice(&block_number.to_be_bytes());
            transaction.encode(&mut value);
            self.db
                .put_with_tx(tx, &keys::tx(&self.chain_id, transaction.hash), &value);
        }
    }

    /// Looks up an included transaction by hash.
    pub fn get_transaction(&self, hash: Hash) -> Result<Transaction, StoreError> {
        Ok(self.get_transaction_with_number(hash)?.1)
    }

    /// Looks up an included transaction and the block number holding it.
    pub fn get_transaction_with_number(
        &self,
        hash: Hash,
    ) -> Result<(u64, Transaction), StoreError> {
        let raw = self
            .db
            .get(&keys::tx(&self.chain_id, hash))?
            .ok_or(StoreError::TxNotFound)?;
        if raw.len() < 8 {
            return Err(StoreError::Decode("transaction index entry too short".into()));
        }
        let number = u64::from_be_bytes(raw[..8].try_into().expect("length checked"));
        Ok((number, Transaction::from_wire_bytes(&raw[8..])?))
    }

    /// Returns true if this chain has indexed the given transaction.
    pub fn has_transaction(&self, hash: Hash) -> Result<bool, StoreError> {
        Ok(self.db.get(&keys::tx(&self.chain_id, hash))?.is_some())
    }

    /// Stages an account snapshot at `(chain, block_number, address)`.
    pub fn put_account(&self, tx: &mut K::WriteTx, block_number: u64, account: &Account) {
        self.db.put_with_tx(
            tx,
            &keys::account(&self.chain_id, block_number, account.address),
            &account.to_wire_bytes(),
        );
    }

    /// Resolves the current snapshot of `address` on this chain alone.
    ///
    /// Picks the snapshot with the greatest block number, bounded by
    /// `max_block_number` when given. Parent-chain fallback lives a level
    /// up, where the chain topology is known.
    pub fn get_account_bounded(
        &self,
        address: Address,
        max_block_number: Option<u64>,
    ) -> Result<Account, StoreError> {
        if address.is_empty() {
            return Err(StoreError::AccountNotFound);
        }

        let mut best: Option<(u64, Vec<u8>)> = None;
        for (key, value) in self.db.iter_prefix(&keys::account_prefix(&self.chain_id))? {
            let Some((number, key_address)) = keys::parse_account(&key, &self.chain_id) else {
                continue;
            };
            if key_address != address {
                continue;
            }
            if let Some(bound) = max_block_number {
                if number > bound {
                    continue;
                }
            }
            if best.as_ref().is_none_or(|(n, _)| number >= *n) {
                best = Some((number, value));
            }
        }

        let (_, raw) = best.ok_or(StoreError::AccountNotFound)?;
        Ok(Account::from_wire_bytes(&raw)?)
    }

    /// Persists this chain's [`ChainInfo`] record.
    pub fn save_info(&self, tx: &mut K::WriteTx, info: &ChainInfo) {
        self.db.put_with_tx(
            tx,
            &keys::chain_info(&self.chain_id),
            &info.to_wire_bytes(),
        );
    }
}

impl<K: Kv> HeaderReader for ChainStore<K> {
    fn header_by_hash(&self, hash: Hash) -> Option<Header> {
        self.get_header_by_hash(hash).ok()
    }
}

/// Loads every persisted [`ChainInfo`] record.
pub fn load_chain_infos<K: Kv>(db: &K) -> Result<Vec<ChainInfo>, StoreError> {
    let mut infos = Vec::new();
    for (_, value) in db.iter_prefix(&keys::chain_info_prefix())? {
        infos.push(ChainInfo::from_wire_bytes(&value)?);
    }
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_kv::MemoryKv;
    use crate::utils::test_utils::{chain_of, genesis_block};
    use rust_decimal_macros::dec;

    fn store() -> ChainStore<MemoryKv> {
        ChainStore::new(Arc::new(MemoryKv::new()), ChainId::new("main"))
    }

    #[test]
    fn chain_info_wire_roundtrip() {
        let info = ChainInfo {
            id: ChainId::new("fork-1"),
            parent_chain_id: Some(ChainId::new("main")),
            parent_block_number: 9,
            timestamp: 1_700_000_000,
        };
        let decoded = ChainInfo::from_wire_bytes(&info.to_wire_bytes()).expect("decode failed");
        assert_eq!(decoded, info);

        let genesis = ChainInfo::genesis(ChainId::new("main"), 5);
        let decoded = ChainInfo::from_wire_bytes(&genesis.to_wire_bytes()).expect("decode failed");
        assert_eq!(decoded.parent_chain_id, None);
    }

    #[test]
    fn append_and_lookup() {
        let store = store();
        let blocks = chain_of(3);

        for block in &blocks {
            store.append(block).expect("append failed");
        }

        assert_eq!(store.current().unwrap().number, 3);
        assert_eq!(store.get_by_number(2).unwrap(), blocks[1]);
        assert_eq!(
            store.get_block_by_hash(blocks[2].hash()).unwrap(),
            blocks[2]
        );
        assert!(store.has_block(blocks[0].hash()).unwrap());
        assert!(!store.has_block(Hash::of(b"unknown")).unwrap());
    }

    #[test]
    fn append_rejects_number_gap() {
        let store = store();
        let blocks = chain_of(3);
        store.append(&blocks[0]).expect("append failed");

        let err = store.append(&blocks[2]).unwrap_err();
        assert!(matches!(err, StoreError::NotOnTip { expected_number: 2, .. }));
    }

    #[test]
    fn append_rejects_wrong_parent() {
        let store = store();
        let blocks = chain_of(2);
        store.append(&blocks[0]).expect("append failed");

        let mut wrong = blocks[1].clone();
        wrong.header.parent_hash = Hash::of(b"not the tip");
        let err = store.append(&Block::new(wrong.header, vec![])).unwrap_err();
        assert!(matches!(err, StoreError::NotOnTip { .. }));
    }

    #[test]
    fn first_block_is_exempt_from_linkage() {
        let store = store();
        // A branch's first block may start at any height.
        let blocks = chain_of(5);
        store.append(&blocks[4]).expect("append failed");
        assert_eq!(store.current().unwrap().number, 5);
    }

    #[test]
    fn transactions_are_indexed_on_append() {
        let store = store();
        let genesis = genesis_block();
        store.append(&genesis).expect("append failed");

        for tx in &genesis.transactions {
            assert_eq!(store.get_transaction(tx.hash).unwrap(), *tx);
            assert!(store.has_transaction(tx.hash).unwrap());
            let (number, _) = store.get_transaction_with_number(tx.hash).unwrap();
            assert_eq!(number, genesis.number());
        }
        assert!(matches!(
            store.get_transaction(Hash::of(b"missing")),
            Err(StoreError::TxNotFound)
        ));
    }

    #[test]
    fn account_resolution_picks_highest_snapshot() {
        let store = store();
        let address = Address([3u8; 20]);

        let mut tx = store.db.new_tx();
        store.put_account(&mut tx, 2, &Account::new(address, dec!(10)));
        store.put_account(&mut tx, 5, &Account::new(address, dec!(50)));
        store.put_account(&mut tx, 3, &Account::new(address, dec!(30)));
        store.db.commit(tx).unwrap();

        let account = store.get_account_bounded(address, None).unwrap();
        assert_eq!(account.balance, dec!(50));
    }

    #[test]
    fn account_resolution_honors_bound() {
        let store = store();
        let address = Address([3u8; 20]);

        let mut tx = store.db.new_tx();
        store.put_account(&mut tx, 2, &Account::new(address, dec!(10)));
        store.put_account(&mut tx, 5, &Account::new(address, dec!(50)));
        store.db.commit(tx).unwrap();

        let account = store.get_account_bounded(address, Some(4)).unwrap();
        assert_eq!(account.balance, dec!(10));
        assert!(matches!(
            store.get_account_bounded(address, Some(1)),
            Err(StoreError::AccountNotFound)
        ));
    }

    #[test]
    fn empty_address_is_rejected() {
        let store = store();
        assert!(matches!(
            store.get_account_bounded(Address::zero(), None),
            Err(StoreError::AccountNotFound)
        ));
    }

    #[test]
    fn chain_infos_are_reloadable() {
        let db = Arc::new(MemoryKv::new());
        let main = ChainStore::new(db.clone(), ChainId::new("main"));
        let fork = ChainStore::new(db.clone(), ChainId::new("fork"));

        let mut tx = db.new_tx();
        main.save_info(&mut tx, &ChainInfo::genesis(ChainId::new("main"), 1));
        fork.save_info(
            &mut tx,
            &ChainInfo {
                id: ChainId::new("fork"),
                parent_chain_id: Some(ChainId::new("main")),
                parent_block_number: 4,
                timestamp: 2,
            },
        );
        db.commit(tx).unwrap();

        let mut infos = load_chain_infos(db.as_ref()).unwrap();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id.as_str(), "fork");
        assert_eq!(infos[1].parent_chain_id, None);
    }
}
