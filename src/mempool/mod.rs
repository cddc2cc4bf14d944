//! Transaction mempool.
//!
//! A capacity-bounded, totally ordered container of pending transactions.
//! Ordering is fee-per-byte descending, then timestamp ascending, then hash
//! ascending, so iteration order is stable across nodes holding the same
//! set. An internal mutex protects the ordered container; hash and
//! (sender, nonce) indexes give O(1) duplicate checks.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::events::EventBus;
use crate::types::address::Address;
use crate::types::hash::Hash;

/// Errors returned by [`TxPool::put`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("capacity reached")]
    ContainerFull,
    #[error("exact transaction already in the pool")]
    TxAlreadyAdded,
    /// Raised by ingress paths that admit foreign transaction kinds the
    /// pool does not order.
    #[error("unknown transaction type")]
    UnknownTxType,
}

/// Total-order key for pool entries.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PoolKey {
    fee_rate: Decimal,
    timestamp: i64,
    hash: Hash,
}

impl PoolKey {
    fn for_tx(tx: &Transaction) -> Self {
        Self {
            fee_rate: tx.fee_per_byte(),
            timestamp: tx.timestamp,
            hash: tx.hash,
        }
    }
}

impl Ord for PoolKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest fee rate first, oldest first, hash as the tie breaker.
        other
            .fee_rate
            .cmp(&self.fee_rate)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for PoolKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Container {
    entries: BTreeMap<PoolKey, Transaction>,
    byte_size: u64,
}

/// Pool of pending transactions awaiting block inclusion.
pub struct TxPool {
    capacity: usize,
    container: Mutex<Container>,
    /// hash -> ordering key, for O(1) membership and removal.
    hash_index: DashMap<Hash, PoolKey>,
    /// (sender, nonce) -> hash, for the one-occupant-per-nonce rule.
    nonce_index: DashMap<(Address, u64), Hash>,
    events: EventBus,
}

impl TxPool {
    /// Creates a pool holding at most `capacity` transactions.
    pub fn new(capacity: usize, events: EventBus) -> Self {
        Self {
            capacity,
            container: Mutex::new(Container {
                entries: BTreeMap::new(),
                byte_size: 0,
            }),
            hash_index: DashMap::new(),
            nonce_index: DashMap::new(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Container> {
        self.container.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a transaction to the pool and emits `NewTransaction` on success.
    pub fn put(&self, tx: Transaction) -> Result<(), PoolError> {
        let mut container = self.lock();

        if container.entries.len() >= self.capacity {
            return Err(PoolError::ContainerFull);
        }
        if self.hash_index.contains_key(&tx.hash) {
            return Err(PoolError::TxAlreadyAdded);
        }

        let key = PoolKey::for_tx(&tx);
        self.hash_index.insert(tx.hash, key.clone());
        self.nonce_index
            .insert((tx.sender_address(), tx.nonce), tx.hash);
        container.byte_size += tx.size_excluding_fee();
        container.entries.insert(key, tx.clone());
        drop(container);

        self.events.emit_new_transaction(tx);
        Ok(())
    }

    /// Puts a drained transaction back without announcing it again.
    ///
    /// Used by the selector, which drains the pool and returns everything
    /// it did not consume; those transactions were already announced.
    pub(crate) fn restore(&self, tx: Transaction) -> Result<(), PoolError> {
        let mut container = self.lock();
        if self.hash_index.contains_key(&tx.hash) {
            return Err(PoolError::TxAlreadyAdded);
        }

        let key = PoolKey::for_tx(&tx);
        self.hash_index.insert(tx.hash, key.clone());
        self.nonce_index
            .insert((tx.sender_address(), tx.nonce), tx.hash);
        container.byte_size += tx.size_excluding_fee();
        container.entries.insert(key, tx);
        Ok(())
    }

    /// Returns true if the pool holds a transaction with this hash.
    pub fn has(&self, hash: Hash) -> bool {
        self.hash_index.contains_key(&hash)
    }

    /// Returns true if the pool holds a transaction from `sender` with the
    /// given nonce.
    pub fn sender_has_nonce(&self, sender: Address, nonce: u64) -> bool {
        self.nonce_index.contains_key(&(sender, nonce))
    }

    /// Number of transactions in the pool.
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    /// Sum of `size_excluding_fee` over all pooled transactions.
    pub fn byte_size(&self) -> u64 {
        self.lock().byte_size
    }

    fn unindex(&self, tx: &Transaction) {
        self.hash_index.remove(&tx.hash);
        self.nonce_index.remove(&(tx.sender_address(), tx.nonce));
    }

    /// Removes and returns the highest-priority transaction.
    pub fn first(&self) -> Option<Transaction> {
        let mut container = self.lock();
        let (_, tx) = container.entries.pop_first()?;
        container.byte_size -= tx.size_excluding_fee();
        self.unindex(&tx);
        Some(tx)
    }

    /// Removes and returns the lowest-priority transaction.
    pub fn last(&self) -> Option<Transaction> {
        let mut container = self.lock();
        let (_, tx) = container.entries.pop_last()?;
        container.byte_size -= tx.size_excluding_fee();
        self.unindex(&tx);
        Some(tx)
    }

    /// Removes every pooled transaction that `block` included.
    pub fn prune_included(&self, block: &Block) {
        let mut container = self.lock();
        for tx in &block.transactions {
            let Some((_, key)) = self.hash_index.remove(&tx.hash) else {
                continue;
            };
            if let Some(removed) = container.entries.remove(&key) {
                container.byte_size -= removed.size_excluding_fee();
                self.nonce_index
                    .remove(&(removed.sender_address(), removed.nonce));
            }
        }
    }
}
