//! Node event broadcasting.
//!
//! One broadcast channel per event kind. Emissions happen after the
//! corresponding state change is durable and before the processor lock is
//! released, so listeners always observe a consistent snapshot. Lagging or
//! absent receivers never block the pipeline.

use tokio::sync::broadcast;

use crate::core::transaction::Transaction;
use crate::types::hash::Hash;

/// Capacity of each event channel. Slow receivers past this lag lose the
/// oldest events rather than stalling the processor.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A block accepted onto a chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockProcessed {
    pub hash: Hash,
    pub number: u64,
}

/// Fan-out hub for node events.
#[derive(Clone)]
pub struct EventBus {
    new_transaction: broadcast::Sender<Transaction>,
    transaction_processed: broadcast::Sender<Hash>,
    block_processed: broadcast::Sender<BlockProcessed>,
    orphan_block: broadcast::Sender<Hash>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            new_transaction: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            transaction_processed: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            block_processed: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            orphan_block: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    /// A transaction entered the mempool.
    pub fn subscribe_new_transaction(&self) -> broadcast::Receiver<Transaction> {
        self.new_transaction.subscribe()
    }

    /// A network transaction finished processing.
    pub fn subscribe_transaction_processed(&self) -> broadcast::Receiver<Hash> {
        self.transaction_processed.subscribe()
    }

    /// A block was committed to a chain.
    pub fn subscribe_block_processed(&self) -> broadcast::Receiver<BlockProcessed> {
        self.block_processed.subscribe()
    }

    /// A block was parked in the orphan cache.
    pub fn subscribe_orphan_block(&self) -> broadcast::Receiver<Hash> {
        self.orphan_block.subscribe()
    }

    pub(crate) fn emit_new_transaction(&self, tx: Transaction) {
        let _ = self.new_transaction.send(tx);
    }

    pub(crate) fn emit_transaction_processed(&self, hash: Hash) {
        let _ = self.transaction_processed.send(hash);
    }

    pub(crate) fn emit_block_processed(&self, event: BlockProcessed) {
        let _ = self.block_processed.send(event);
    }

    pub(crate) fn emit_orphan_block(&self, hash: Hash) {
        let _ = self.orphan_block.send(hash);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
