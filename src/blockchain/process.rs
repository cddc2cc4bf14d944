//! Block processing: validation, transition synthesis, state-root
//! verification, commit, fork branching, and orphan resolution.

use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;

use crate::blockchain::chain::Chain;
use crate::blockchain::validator::TxValidator;
use crate::blockchain::{Blockchain, ChainsState};
use crate::consensus::ConsensusError;
use crate::core::account::Account;
use crate::core::block::Block;
use crate::core::transaction::{Transaction, TxType};
use crate::events::BlockProcessed;
use crate::storage::chain_store::{load_chain_infos, ChainInfo};
use crate::storage::kv::{keys, ChainId, Kv, StoreError};
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::types::merkle::StateTree;
use crate::types::wire::WireEncode;
use crate::{debug, info, warn};

/// Errors raised while processing a candidate block.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block already exists")]
    BlockExists,
    #[error("block was previously rejected")]
    BlockRejected,
    #[error("block is a known orphan")]
    OrphanBlock,
    #[error("block is much older than the chain tip")]
    VeryStaleBlock,
    #[error("block failed validation: {0}")]
    FailedValidation(String),
    #[error("block state root is invalid")]
    StateRootInvalid,
    #[error("insufficient sender account balance")]
    InsufficientBalance,
    #[error("sender account missing after validation")]
    MissingSenderAccount,
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of submitting a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The block was committed to a chain (possibly a new branch).
    Accepted,
    /// The block's parent is unknown; it was parked in the orphan cache.
    Orphaned,
}

/// A pending mutation of the account store derived from one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    /// A recipient account that does not yet exist on the chain.
    CreateAccount { address: Address, account: Account },
    /// An updated account snapshot.
    NewAccountBalance { address: Address, account: Account },
}

impl Transition {
    fn address(&self) -> Address {
        match self {
            Transition::CreateAccount { address, .. }
            | Transition::NewAccountBalance { address, .. } => *address,
        }
    }

    fn same_slot(&self, other: &Transition) -> bool {
        matches!(
            (self, other),
            (Transition::CreateAccount { .. }, Transition::CreateAccount { .. })
                | (
                    Transition::NewAccountBalance { .. },
                    Transition::NewAccountBalance { .. }
                )
        ) && self.address() == other.address()
    }

    fn account(&self) -> &Account {
        match self {
            Transition::CreateAccount { account, .. }
            | Transition::NewAccountBalance { account, .. } => account,
        }
    }
}

/// A transition materialized against a concrete chain and block number.
pub(crate) struct StateObject {
    pub(crate) tree_key: Hash,
    pub(crate) account: Account,
}

/// Replaces any earlier transition occupying the same (kind, address) slot;
/// the newest write wins within a block.
fn add_op(ops: &mut Vec<Transition>, op: Transition) {
    ops.retain(|existing| !existing.same_slot(&op));
    ops.push(op);
}

/// Latest balance snapshot for `address` proposed by earlier transitions
/// in this block.
fn balance_from_ops(ops: &[Transition], address: Address) -> Option<Account> {
    ops.iter().rev().find_map(|op| match op {
        Transition::NewAccountBalance { address: a, account } if *a == address => {
            Some(account.clone())
        }
        _ => None,
    })
}

impl<K: Kv> Blockchain<K> {
    /// Brings the chain subsystem up.
    ///
    /// On first start the store is seeded from `genesis` (its allocation
    /// transactions materialize the initial accounts). On later starts the
    /// persisted chain records are reloaded and their parent references
    /// validated.
    pub fn up(&self, genesis: Block) -> Result<(), BlockError> {
        let mut state = self.lock_state();
        let infos = load_chain_infos(self.db.as_ref())?;

        if infos.is_empty() {
            self.initialize_from_genesis(&mut state, genesis)?;
        } else {
            for block_info in &infos {
                if block_info.parent_chain_id.is_some() && block_info.parent_block_number == 0 {
                    return Err(BlockError::FailedValidation(format!(
                        "chain {} names a parent chain but no parent block number",
                        block_info.id
                    )));
                }
            }
            for block_info in &infos {
                if let Some(parent) = &block_info.parent_chain_id {
                    if !infos.iter().any(|other| &other.id == parent) {
                        return Err(BlockError::Store(StoreError::ChainNotFound(
                            parent.to_string(),
                        )));
                    }
                }
            }
            for chain_info in infos {
                let chain = Arc::new(Chain::load(self.db.clone(), chain_info)?);
                info!("loaded chain: id={}", chain.id());
                state.chains.insert(chain.id().clone(), chain);
            }
        }

        state.update_best();
        Ok(())
    }

    fn initialize_from_genesis(
        &self,
        state: &mut ChainsState<K>,
        genesis: Block,
    ) -> Result<(), BlockError> {
        if !genesis.is_genesis() {
            return Err(BlockError::FailedValidation(
                "genesis block must carry number 1 and a zero parent hash".into(),
            ));
        }
        if Block::transactions_root(&genesis.transactions) != genesis.header.transactions_root {
            return Err(BlockError::FailedValidation(
                "genesis transactions root mismatch".into(),
            ));
        }

        let id = ChainId::derive(genesis.hash(), genesis.header.timestamp);
        let chain_info = ChainInfo::genesis(id, genesis.header.timestamp);
        let chain = Arc::new(Chain::new(self.db.clone(), chain_info.clone()));

        let ops = self.synthesize_transitions(state, &chain, &genesis.transactions)?;
        let objects = materialize(chain.id(), genesis.number(), &ops);

        let mut tx = self.db.new_tx();
        chain.store().save_info(&mut tx, &chain_info);
        for object in &objects {
            chain
                .store()
                .put_account(&mut tx, genesis.number(), &object.account);
        }
        chain.store().append_with_tx(&mut tx, &genesis)?;
        self.db.commit(tx)?;

        chain.apply_tree_entries(
            objects
                .iter()
                .map(|object| (object.tree_key, object.account.to_wire_bytes())),
        );

        info!(
            "chain initialized from genesis: hash={} accounts={}",
            genesis.hash(),
            objects.len()
        );
        state.chains.insert(chain.id().clone(), chain);
        Ok(())
    }

    /// Submits a block for processing.
    ///
    /// Serialized: the processor lock is held from the first cache check to
    /// the last orphan drained.
    pub fn process_block(&self, block: Block) -> Result<ProcessStatus, BlockError> {
        let mut state = self.lock_state();
        debug!("processing block: hash={} number={}", block.hash(), block.number());

        if state.rejected.contains(&block.hash()) {
            return Err(BlockError::BlockRejected);
        }
        if state.orphans.contains(&block.hash()) {
            return Err(BlockError::OrphanBlock);
        }
        if state.have_block(block.hash())? {
            debug!("block already exists: hash={}", block.hash());
            return Err(BlockError::BlockExists);
        }

        let hash = block.hash();
        let status = self.maybe_accept_block(&mut state, block)?;
        if status == ProcessStatus::Accepted {
            self.process_orphans(&mut state, hash);
        }
        Ok(status)
    }

    /// Tries to attach `block` to a chain.
    fn maybe_accept_block(
        &self,
        state: &mut ChainsState<K>,
        block: Block,
    ) -> Result<ProcessStatus, BlockError> {
        let Some((parent_block, chain, chain_tip)) = state.find_block_chain(block.parent_hash())
        else {
            // Parent unknown anywhere: park the block until it shows up.
            let hash = block.hash();
            state.orphans.put(hash, block);
            self.events.emit_orphan_block(hash);
            debug!("block parked as orphan: hash={hash}");
            return Ok(ProcessStatus::Orphaned);
        };

        if block.number() < chain_tip.number {
            state.rejected.put(block.hash(), ());
            return Err(BlockError::VeryStaleBlock);
        }

        if block.number() == chain_tip.number {
            // A sibling of the tip: root a new branch at the shared parent.
            // The branch is not executed now; it earns validation when a
            // later block extends it.
            self.spawn_branch(state, &chain, &parent_block, &block)?;
            state.update_best();
            return Ok(ProcessStatus::Accepted);
        }

        if block.number() - chain_tip.number != 1 {
            state.rejected.put(block.hash(), ());
            return Err(BlockError::FailedValidation(format!(
                "block number {} leaves a gap above tip {}",
                block.number(),
                chain_tip.number
            )));
        }

        self.extend_chain(state, &chain, &parent_block, block)
    }

    /// Creates a new branch rooted at `parent_block` and appends `block`.
    fn spawn_branch(
        &self,
        state: &mut ChainsState<K>,
        parent_chain: &Arc<Chain<K>>,
        parent_block: &Block,
        block: &Block,
    ) -> Result<(), BlockError> {
        let id = ChainId::derive(block.hash(), block.header.timestamp);
        let chain_info = ChainInfo {
            id: id.clone(),
            parent_chain_id: Some(parent_chain.id().clone()),
            parent_block_number: parent_block.number(),
            timestamp: block.header.timestamp,
        };
        let branch = Arc::new(Chain::new(self.db.clone(), chain_info.clone()));

        let mut tx = self.db.new_tx();
        branch.store().save_info(&mut tx, &chain_info);
        branch.store().append_with_tx(&mut tx, block)?;
        self.db.commit(tx)?;

        info!(
            "fork detected, new branch created: id={} root={} block={}",
            id,
            parent_block.hash(),
            block.hash()
        );
        state.chains.insert(id, branch);
        self.events.emit_block_processed(BlockProcessed {
            hash: block.hash(),
            number: block.number(),
        });
        Ok(())
    }

    /// Validates and commits a block extending `chain`'s tip.
    fn extend_chain(
        &self,
        state: &mut ChainsState<K>,
        chain: &Arc<Chain<K>>,
        parent_block: &Block,
        block: Block,
    ) -> Result<ProcessStatus, BlockError> {
        self.engine
            .verify_header(&block.header, &parent_block.header, true)?;

        if !block.header.verify_signature() {
            return Err(BlockError::FailedValidation(
                "invalid block creator signature".into(),
            ));
        }

        if Block::transactions_root(&block.transactions) != block.header.transactions_root {
            return Err(BlockError::FailedValidation(
                "transactions root mismatch".into(),
            ));
        }

        for tx in &block.transactions {
            let errors = TxValidator::for_block(tx, self, state, chain).validate();
            if let Some(first) = errors.first() {
                return Err(BlockError::FailedValidation(format!(
                    "invalid transaction {}: {first}",
                    tx.hash
                )));
            }
        }

        // Mock-execute against the parent state to learn the objects this
        // block induces and the root they produce.
        let (computed_root, objects) =
            self.mock_exec_block(state, chain, block.number(), &block.transactions)?;
        if computed_root != block.header.state_root {
            return Err(BlockError::StateRootInvalid);
        }

        let mut tx = self.db.new_tx();
        for object in &objects {
            chain
                .store()
                .put_account(&mut tx, block.number(), &object.account);
        }
        if let Err(err) = chain.store().append_with_tx(&mut tx, &block) {
            self.db.rollback(tx);
            return Err(err.into());
        }
        self.db.commit(tx)?;

        chain.apply_tree_entries(
            objects
                .iter()
                .map(|object| (object.tree_key, object.account.to_wire_bytes())),
        );
        self.pool.prune_included(&block);
        state.update_best();

        info!(
            "block committed: chain={} hash={} number={} txs={}",
            chain.id(),
            block.hash(),
            block.number(),
            block.transactions.len()
        );
        self.events.emit_block_processed(BlockProcessed {
            hash: block.hash(),
            number: block.number(),
        });
        Ok(ProcessStatus::Accepted)
    }

    /// Drains orphans whose parents became known, iteratively until no
    /// orphan makes progress.
    fn process_orphans(&self, state: &mut ChainsState<K>, accepted_hash: Hash) {
        let mut parent_hashes = vec![accepted_hash];

        while let Some(parent_hash) = parent_hashes.pop() {
            let ready: Vec<Hash> = state
                .orphans
                .iter()
                .filter(|(_, orphan)| orphan.parent_hash() == parent_hash)
                .map(|(hash, _)| *hash)
                .collect();

            for hash in ready {
                let Some(orphan) = state.orphans.pop(&hash) else {
                    continue;
                };
                match self.maybe_accept_block(state, orphan) {
                    Ok(ProcessStatus::Accepted) => parent_hashes.push(hash),
                    Ok(ProcessStatus::Orphaned) => {}
                    Err(err) => warn!("orphan block failed processing: hash={hash} err={err}"),
                }
            }
        }
    }

    /// Mock-executes `transactions` at `number` on top of `chain`'s state.
    ///
    /// Returns the state root the block would produce plus the state
    /// objects to persist, without touching the live tree.
    pub(crate) fn mock_exec_block(
        &self,
        state: &ChainsState<K>,
        chain: &Chain<K>,
        number: u64,
        transactions: &[Transaction],
    ) -> Result<(Hash, Vec<StateObject>), BlockError> {
        let ops = self.synthesize_transitions(state, chain, transactions)?;
        let objects = materialize(chain.id(), number, &ops);

        let (_, seed) = chain.state_seed();
        let mut tree = StateTree::seeded(&seed);
        for object in &objects {
            tree.upsert(object.tree_key, object.account.to_wire_bytes());
        }
        Ok((tree.root_hash(), objects))
    }

    /// Derives the transition list for `transactions` in block order.
    fn synthesize_transitions(
        &self,
        state: &ChainsState<K>,
        chain: &Chain<K>,
        transactions: &[Transaction],
    ) -> Result<Vec<Transition>, BlockError> {
        let mut ops: Vec<Transition> = Vec::new();
        for tx in transactions {
            let new_ops = match tx.tx_type {
                TxType::Balance => self.balance_transitions(state, chain, tx, &ops)?,
                TxType::Alloc => self.alloc_transitions(state, chain, tx, &ops)?,
            };
            for op in new_ops {
                add_op(&mut ops, op);
            }
        }
        Ok(ops)
    }

    /// Transitions for a balance transfer from sender to recipient.
    fn balance_transitions(
        &self,
        state: &ChainsState<K>,
        chain: &Chain<K>,
        tx: &Transaction,
        ops: &[Transition],
    ) -> Result<Vec<Transition>, BlockError> {
        let sender_address = tx.sender_address();

        // All transactions were validated before this point; a missing
        // sender here is an internal consistency failure.
        let mut sender = match balance_from_ops(ops, sender_address) {
            Some(account) => account,
            None => state
                .resolve_account(chain, sender_address)
                .map_err(|err| match err {
                    StoreError::AccountNotFound => BlockError::MissingSenderAccount,
                    other => BlockError::Store(other),
                })?,
        };

        // The per-transaction validator checks the nonce against committed
        // state only; rechecking against the running transition list catches
        // a nonce reused within the same block.
        if tx.nonce <= sender.nonce {
            return Err(BlockError::FailedValidation(format!(
                "transaction {} nonce {} does not advance sender account nonce {}",
                tx.hash, tx.nonce, sender.nonce
            )));
        }

        if tx.value.is_sign_negative() || sender.balance < tx.value {
            return Err(BlockError::InsufficientBalance);
        }
        sender.balance -= tx.value;
        sender.nonce = tx.nonce;

        let mut out = Vec::new();
        let mut recipient = if tx.recipient == sender_address {
            // Self-transfer: credit the already-debited snapshot so the
            // value cannot double-count.
            sender.clone()
        } else {
            match balance_from_ops(ops, tx.recipient) {
                Some(account) => account,
                None => match state.resolve_account(chain, tx.recipient) {
                    Ok(account) => account,
                    Err(StoreError::AccountNotFound) => {
                        let account = Account::new(tx.recipient, Decimal::ZERO);
                        out.push(Transition::CreateAccount {
                            address: tx.recipient,
                            account: account.clone(),
                        });
                        account
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        };
        recipient.balance += tx.value;

        if tx.recipient != sender_address {
            out.push(Transition::NewAccountBalance {
                address: sender_address,
                account: sender,
            });
        }
        out.push(Transition::NewAccountBalance {
            address: tx.recipient,
            account: recipient,
        });
        Ok(out)
    }

    /// Transitions for an allocation: credit the recipient out of thin air.
    fn alloc_transitions(
        &self,
        state: &ChainsState<K>,
        chain: &Chain<K>,
        tx: &Transaction,
        ops: &[Transition],
    ) -> Result<Vec<Transition>, BlockError> {
        if tx.value.is_sign_negative() {
            return Err(BlockError::InsufficientBalance);
        }

        let mut out = Vec::new();
        let mut recipient = match balance_from_ops(ops, tx.recipient) {
            Some(account) => account,
            None => match state.resolve_account(chain, tx.recipient) {
                Ok(account) => account,
                Err(StoreError::AccountNotFound) => {
                    let account = Account::new(tx.recipient, Decimal::ZERO);
                    out.push(Transition::CreateAccount {
                        address: tx.recipient,
                        account: account.clone(),
                    });
                    account
                }
                Err(err) => return Err(err.into()),
            },
        };
        recipient.balance += tx.value;
        out.push(Transition::NewAccountBalance {
            address: tx.recipient,
            account: recipient,
        });
        Ok(out)
    }
}

/// Converts transitions into state objects keyed for `chain` at `number`.
fn materialize(chain_id: &ChainId, number: u64, ops: &[Transition]) -> Vec<StateObject> {
    ops.iter()
        .map(|op| StateObject {
            tree_key: keys::tree_account_key(number, chain_id, op.address()),
            account: op.account().clone(),
        })
        .collect()
}
