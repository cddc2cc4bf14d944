//! Transaction selection for block production.
//!
//! Selection drains the pool, rebuilds per-sender nonce runs, and greedily
//! fills a byte budget in pool-priority order. Every drained transaction
//! goes back into the pool afterwards, selected or not; inclusion only
//! removes transactions once the produced block commits.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::collections::VecDeque;

use crate::blockchain::process::BlockError;
use crate::blockchain::Blockchain;
use crate::consensus::HeaderReader;
use crate::core::block::{Block, Header};
use crate::core::transaction::Transaction;
use crate::crypto::PrivateKey;
use crate::params;
use crate::storage::kv::{Kv, StoreError};
use crate::types::address::Address;
use crate::warn;

/// Nonce searches during sealing are bounded; production fails rather than
/// spinning forever on an unlucky target.
const SEAL_MAX_ATTEMPTS: u64 = 1 << 34;

struct SenderQueue {
    txs: VecDeque<Transaction>,
}

impl SenderQueue {
    fn head_priority(&self) -> Option<(Decimal, i64)> {
        self.txs
            .front()
            .map(|tx| (tx.fee_per_byte(), tx.timestamp))
    }
}

impl<K: Kv> Blockchain<K> {
    /// Chooses a byte-bounded, nonce-monotonic transaction set.
    ///
    /// Per sender, the first selectable transaction must carry
    /// `account.nonce + 1` and successors must be contiguous; senders whose
    /// head does not line up are skipped whole this round.
    pub fn select_transactions(&self, max_bytes: u64) -> Result<Vec<Transaction>, StoreError> {
        // Drain the pool into a working list.
        let mut drained = Vec::new();
        while let Some(tx) = self.pool.first() {
            drained.push(tx);
        }

        // Group by sender, nonce-ascending within each group.
        let mut order: Vec<Address> = Vec::new();
        let mut groups: HashMap<Address, Vec<Transaction>> = HashMap::new();
        for tx in &drained {
            let sender = tx.sender_address();
            if !groups.contains_key(&sender) {
                order.push(sender);
            }
            groups.entry(sender).or_default().push(tx.clone());
        }

        // Senders are eligible only when their lowest nonce continues the
        // account's nonce run on the best chain.
        let mut queues: HashMap<Address, SenderQueue> = HashMap::new();
        {
            let state = self.lock_state();
            let best = state.best_chain()?;
            for sender in &order {
                let mut txs = groups.remove(sender).unwrap_or_default();
                txs.sort_by_key(|tx| tx.nonce);

                let account_nonce = match state.resolve_account(&best, *sender) {
                    Ok(account) => account.nonce,
                    Err(StoreError::AccountNotFound) => 0,
                    Err(err) => return Err(err),
                };
                let Some(first) = txs.first() else { continue };
                if first.nonce != account_nonce + 1 {
                    continue;
                }
                queues.insert(
                    *sender,
                    SenderQueue {
                        txs: txs.into(),
                    },
                );
            }
        }

        // Merge per-sender heads by pool priority under the byte budget.
        let mut selected = Vec::new();
        let mut used_bytes = 0u64;
        loop {
            let Some((&sender, _)) = queues
                .iter()
                .filter(|(_, queue)| !queue.txs.is_empty())
                .min_by(|(a_addr, a), (b_addr, b)| {
                    let (a_rate, a_ts) = a.head_priority().expect("non-empty queue");
                    let (b_rate, b_ts) = b.head_priority().expect("non-empty queue");
                    b_rate
                        .cmp(&a_rate)
                        .then_with(|| a_ts.cmp(&b_ts))
                        .then_with(|| a_addr.cmp(b_addr))
                })
            else {
                break;
            };

            let queue = queues.get_mut(&sender).expect("sender queue exists");
            let head = queue.txs.front().expect("non-empty queue");
            let size = head.size_excluding_fee();
            if used_bytes + size > max_bytes {
                // The sender cannot advance past an unfitting nonce.
                queues.remove(&sender);
                continue;
            }

            let tx = queue.txs.pop_front().expect("non-empty queue");
            let next_nonce = tx.nonce + 1;
            used_bytes += size;
            selected.push(tx);

            // A nonce gap parks the rest of the sender for this round.
            if queue
                .txs
                .front()
                .is_some_and(|next| next.nonce != next_nonce)
            {
                queues.remove(&sender);
            }
        }

        // Everything drained goes back; inclusion prunes on commit.
        for tx in drained {
            if let Err(err) = self.pool.restore(tx) {
                warn!("failed to restore transaction to pool: {err}");
            }
        }

        Ok(selected)
    }

    /// Builds a sealed, signed candidate block on the best chain.
    ///
    /// The block is not applied here; submit it through
    /// [`process_block`](Blockchain::process_block) like any other block.
    pub fn produce_block(&self, creator: &PrivateKey) -> Result<Block, BlockError> {
        let transactions = self.select_transactions(params::MAX_BLOCK_TX_BYTES)?;
        self.assemble_block(creator, transactions, now_unix())
    }

    /// Assembles a block with the given transactions and timestamp.
    pub(crate) fn assemble_block(
        &self,
        creator: &PrivateKey,
        transactions: Vec<Transaction>,
        timestamp: i64,
    ) -> Result<Block, BlockError> {
        let state = self.lock_state();
        let best = state.best_chain()?;
        let tip = best.tip()?;

        let mut header = Header {
            parent_hash: tip.hash(),
            number: tip.number + 1,
            // A block must advance past its parent's clock.
            timestamp: timestamp.max(tip.timestamp + 1),
            difficulty: tip.difficulty.clone(),
            total_difficulty: tip.total_difficulty.clone(),
            state_root: crate::types::hash::Hash::zero(),
            transactions_root: Block::transactions_root(&transactions),
            nonce: 0,
            extra: Vec::new(),
            creator_pubkey: creator.public_key(),
            signature: creator.sign(b"unsealed"),
        };

        self.engine.prepare(
            &StoreReader {
                chain: best.as_ref(),
            },
            &mut header,
        )?;

        let (state_root, _) =
            self.mock_exec_block(&state, &best, header.number, &transactions)?;
        header.state_root = state_root;
        drop(state);

        self.engine.seal(&mut header, SEAL_MAX_ATTEMPTS)?;
        header.sign(creator);

        Ok(Block::new(header, transactions))
    }
}

/// Adapter lending a chain's store to the consensus engine.
struct StoreReader<'a, K: Kv> {
    chain: &'a crate::blockchain::chain::Chain<K>,
}

impl<'a, K: Kv> HeaderReader for StoreReader<'a, K> {
    fn header_by_hash(&self, hash: crate::types::hash::Hash) -> Option<Header> {
        self.chain.store().header_by_hash(hash)
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::ProcessStatus;
    use crate::utils::test_utils::{funded_blockchain, test_key, transfer, transfer_at};
    use rust_decimal_macros::dec;

    #[test]
    fn selection_respects_nonce_order() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        // Inserted out of order: nonce 2 then nonce 1.
        let tx2 = transfer(&sender, 2, test_key(9).public_key().address(), dec!(1), dec!(0.1));
        let tx1 = transfer(&sender, 1, test_key(9).public_key().address(), dec!(1), dec!(0.1));
        bc.pool().put(tx2.clone()).unwrap();
        bc.pool().put(tx1.clone()).unwrap();

        let selected = bc.select_transactions(1 << 20).expect("select failed");
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].nonce, 1);
        assert_eq!(selected[1].nonce, 2);
    }

    #[test]
    fn selection_skips_sender_with_leading_gap() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        let tx = transfer(&sender, 2, test_key(9).public_key().address(), dec!(1), dec!(0.1));
        bc.pool().put(tx).unwrap();

        let selected = bc.select_transactions(1 << 20).expect("select failed");
        assert!(selected.is_empty());
        assert_eq!(bc.pool().size(), 1);
    }

    #[test]
    fn selection_stops_sender_at_internal_gap() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        let tx1 = transfer(&sender, 1, test_key(9).public_key().address(), dec!(1), dec!(0.1));
        let tx3 = transfer(&sender, 3, test_key(9).public_key().address(), dec!(1), dec!(0.1));
        bc.pool().put(tx1.clone()).unwrap();
        bc.pool().put(tx3).unwrap();

        let selected = bc.select_transactions(1 << 20).expect("select failed");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].nonce, 1);
    }

    #[test]
    fn selection_preserves_pool_contents() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        for nonce in 1..=3 {
            bc.pool()
                .put(transfer(
                    &sender,
                    nonce,
                    test_key(9).public_key().address(),
                    dec!(1),
                    dec!(0.1),
                ))
                .unwrap();
        }

        let selected = bc.select_transactions(1 << 20).expect("select failed");
        assert_eq!(selected.len(), 3);
        // Selected transactions go back into the pool; only a committed
        // block removes them.
        assert_eq!(bc.pool().size(), 3);
    }

    #[test]
    fn selection_honors_byte_budget() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        let recipient = test_key(9).public_key().address();
        let tx1 = transfer(&sender, 1, recipient, dec!(1), dec!(0.1));
        let tx2 = transfer(&sender, 2, recipient, dec!(1), dec!(0.1));
        let tx3 = transfer(&sender, 3, recipient, dec!(1), dec!(0.1));
        let budget = tx1.size_excluding_fee() + tx2.size_excluding_fee();

        for tx in [&tx1, &tx2, &tx3] {
            bc.pool().put(tx.clone()).unwrap();
        }

        let selected = bc.select_transactions(budget).expect("select failed");
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].nonce, 1);
        assert_eq!(selected[1].nonce, 2);
        assert_eq!(bc.pool().size(), 3);
    }

    #[test]
    fn selection_with_tiny_budget_selects_nothing_and_keeps_pool() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        for nonce in 1..=3 {
            bc.pool()
                .put(transfer(
                    &sender,
                    nonce,
                    test_key(9).public_key().address(),
                    dec!(1),
                    dec!(0.1),
                ))
                .unwrap();
        }

        let selected = bc.select_transactions(1).expect("select failed");
        assert!(selected.is_empty());
        assert_eq!(bc.pool().size(), 3);
    }

    #[test]
    fn selection_merges_senders_by_fee_priority() {
        let (bc, genesis) = funded_blockchain();
        // Genesis funds two senders.
        let rich = test_key(1);
        let poor = test_key(2);
        assert!(genesis.transactions.len() >= 2);

        let cheap = transfer_at(&poor, 1, test_key(9).public_key().address(), dec!(1), dec!(0.01), 100);
        let pricey = transfer_at(&rich, 1, test_key(9).public_key().address(), dec!(1), dec!(5), 200);
        bc.pool().put(cheap.clone()).unwrap();
        bc.pool().put(pricey.clone()).unwrap();

        let selected = bc.select_transactions(1 << 20).expect("select failed");
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].hash, pricey.hash);
        assert_eq!(selected[1].hash, cheap.hash);
    }

    #[test]
    fn produced_block_is_accepted_by_the_processor() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        let recipient = test_key(9).public_key().address();
        bc.pool()
            .put(transfer(&sender, 1, recipient, dec!(3), dec!(0.1)))
            .unwrap();

        let block = bc.produce_block(&test_key(7)).expect("produce failed");
        assert_eq!(block.number(), 2);
        assert_eq!(block.transactions.len(), 1);

        let status = bc.process_block(block).expect("process failed");
        assert_eq!(status, ProcessStatus::Accepted);
        assert_eq!(bc.get_account(recipient).unwrap().balance, dec!(3));
        // Commit pruned the included transaction from the pool.
        assert_eq!(bc.pool().size(), 0);
    }
}
