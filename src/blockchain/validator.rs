//! Transaction validation.
//!
//! Validation collects every failure instead of stopping at the first, so
//! callers can report the full picture. The content rules, the duplicate
//! rule, and the nonce rule apply everywhere a transaction enters the
//! node; the pool admission rules and the allocation refusal apply only
//! to network ingress.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::blockchain::chain::Chain;
use crate::blockchain::{Blockchain, ChainsState};
use crate::core::transaction::{Transaction, TxType};
use crate::mempool::PoolError;
use crate::params;
use crate::storage::kv::{Kv, StoreError};

/// Where a transaction came from, which decides the rule set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxContext {
    /// Received from a peer; full rule set, allocations refused.
    Network,
    /// Carried inside a block under processing; pool admission rules and
    /// the allocation refusal do not apply.
    Block,
}

/// Individual validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("nonce must be at least 1")]
    NonceBelowOne,
    #[error("value must not be negative")]
    NegativeValue,
    #[error("fee must not be negative")]
    NegativeFee,
    #[error("fee is below the minimum of {minimum} for this transaction size")]
    InsufficientFee { minimum: Decimal },
    #[error("recipient address is required")]
    MissingRecipient,
    #[error("timestamp is required")]
    MissingTimestamp,
    #[error("transaction hash is not correct")]
    InvalidHash,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("transaction already exists in the pool")]
    AlreadyInPool,
    #[error("transaction already exists on a chain")]
    AlreadyOnChain,
    #[error("nonce must be greater than the sender account nonce")]
    NonceNotAhead,
    #[error("another pooled transaction from the same sender uses this nonce")]
    NonceOccupied,
    #[error("sender account not found")]
    UnknownSender,
    #[error("allocation transactions are not accepted from the network")]
    AllocFromNetwork,
    #[error("storage lookup failed: {0}")]
    Lookup(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Validates one transaction against the pool and the chain state.
pub struct TxValidator<'a, K: Kv> {
    tx: &'a Transaction,
    chain: &'a Blockchain<K>,
    context: TxContext,
    /// Processor state already borrowed by the caller. The block pipeline
    /// validates while it holds the processor lock; locking again here
    /// would deadlock.
    state: Option<&'a ChainsState<K>>,
    /// Chain the transaction is judged against; the best chain when absent.
    target: Option<&'a Chain<K>>,
}

impl<'a, K: Kv> TxValidator<'a, K> {
    pub fn new(tx: &'a Transaction, chain: &'a Blockchain<K>, context: TxContext) -> Self {
        Self {
            tx,
            chain,
            context,
            state: None,
            target: None,
        }
    }

    /// Validator for a transaction inside a block being committed, judged
    /// against the chain that block extends.
    pub(crate) fn for_block(
        tx: &'a Transaction,
        chain: &'a Blockchain<K>,
        state: &'a ChainsState<K>,
        target: &'a Chain<K>,
    ) -> Self {
        Self {
            tx,
            chain,
            context: TxContext::Block,
            state: Some(state),
            target: Some(target),
        }
    }

    fn with_chain_state<R>(&self, f: impl FnOnce(&ChainsState<K>) -> R) -> R {
        match self.state {
            Some(state) => f(state),
            None => {
                let guard = self.chain.lock_state();
                f(&guard)
            }
        }
    }

    /// Runs every applicable check, returning all failures in rule order.
    pub fn validate(&self) -> Vec<TxError> {
        let mut errors = Vec::new();
        self.check_fields(&mut errors);
        self.check_signature(&mut errors);
        self.check_chain_duplicate(&mut errors);
        if self.tx.tx_type == TxType::Balance {
            self.check_account_nonce(&mut errors);
        }

        if self.context == TxContext::Network {
            self.check_fee(&mut errors);
            self.check_pool(&mut errors);
            if self.tx.tx_type == TxType::Alloc {
                errors.push(TxError::AllocFromNetwork);
            }
        }
        errors
    }

    fn check_fields(&self, errors: &mut Vec<TxError>) {
        if self.tx.nonce < 1 {
            errors.push(TxError::NonceBelowOne);
        }
        if self.tx.value.is_sign_negative() {
            errors.push(TxError::NegativeValue);
        }
        if self.tx.fee.is_sign_negative() {
            errors.push(TxError::NegativeFee);
        }
        if self.tx.recipient.is_empty() {
            errors.push(TxError::MissingRecipient);
        }
        if self.tx.timestamp == 0 {
            errors.push(TxError::MissingTimestamp);
        }
        if self.tx.compute_hash() != self.tx.hash {
            errors.push(TxError::InvalidHash);
        }
    }

    fn check_signature(&self, errors: &mut Vec<TxError>) {
        if !self.tx.verify_signature() {
            errors.push(TxError::InvalidSignature);
        }
    }

    fn check_fee(&self, errors: &mut Vec<TxError>) {
        let minimum = Decimal::from(self.tx.size_excluding_fee()) * params::fee_per_byte();
        if self.tx.fee < minimum {
            errors.push(TxError::InsufficientFee { minimum });
        }
    }

    /// The duplicate rule: a content hash may be committed at most once
    /// across all known chains.
    fn check_chain_duplicate(&self, errors: &mut Vec<TxError>) {
        match self.with_chain_state(|state| state.have_transaction(self.tx.hash)) {
            Ok(true) => errors.push(TxError::AlreadyOnChain),
            Ok(false) => {}
            Err(err) => errors.push(TxError::Lookup(err.to_string())),
        }
    }

    /// The nonce rule: a balance transaction must advance its sender's
    /// account nonce.
    fn check_account_nonce(&self, errors: &mut Vec<TxError>) {
        let sender = self.tx.sender_address();
        let account = self.with_chain_state(|state| match self.target {
            Some(chain) => state.resolve_account(chain, sender),
            None => state.resolve_account(&state.best_chain()?, sender),
        });

        match account {
            Ok(account) if self.tx.nonce <= account.nonce => {
                errors.push(TxError::NonceNotAhead);
            }
            Ok(_) => {}
            Err(StoreError::AccountNotFound) => errors.push(TxError::UnknownSender),
            Err(err) => errors.push(TxError::Lookup(err.to_string())),
        }
    }

    /// Pool admission rules: the pool holds at most one occupant per
    /// content hash and per (sender, nonce).
    fn check_pool(&self, errors: &mut Vec<TxError>) {
        if self.chain.pool.has(self.tx.hash) {
            errors.push(TxError::AlreadyInPool);
        }
        if self
            .chain
            .pool
            .sender_has_nonce(self.tx.sender_address(), self.tx.nonce)
        {
            errors.push(TxError::NonceOccupied);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{funded_blockchain, make_child_block, test_key, transfer};
    use crate::types::address::Address;
    use rust_decimal_macros::dec;

    fn assert_has(errors: &[TxError], expected: &TxError) {
        assert!(
            errors.contains(expected),
            "expected {expected:?} in {errors:?}"
        );
    }

    fn assert_lacks(errors: &[TxError], unexpected: &TxError) {
        assert!(
            !errors.contains(unexpected),
            "unexpected {unexpected:?} in {errors:?}"
        );
    }

    #[test]
    fn valid_network_transaction_passes() {
        let (bc, _) = funded_blockchain();
        let tx = transfer(&test_key(1), 1, Address([9u8; 20]), dec!(1), dec!(0.1));
        let errors = TxValidator::new(&tx, &bc, TxContext::Network).validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn collects_multiple_failures_without_short_circuiting() {
        let (bc, _) = funded_blockchain();
        let mut tx = transfer(&test_key(1), 0, Address::zero(), dec!(1), dec!(0.1));
        tx.value = dec!(-3);

        let errors = TxValidator::new(&tx, &bc, TxContext::Network).validate();
        assert_has(&errors, &TxError::NonceBelowOne);
        assert_has(&errors, &TxError::NegativeValue);
        assert_has(&errors, &TxError::MissingRecipient);
        // Mutating value after signing also breaks hash and signature.
        assert_has(&errors, &TxError::InvalidHash);
        assert_has(&errors, &TxError::InvalidSignature);
    }

    #[test]
    fn rejects_duplicate_in_pool() {
        let (bc, _) = funded_blockchain();
        let tx = transfer(&test_key(1), 1, Address([9u8; 20]), dec!(1), dec!(0.1));
        bc.pool().put(tx.clone()).expect("put failed");

        let errors = TxValidator::new(&tx, &bc, TxContext::Network).validate();
        assert_has(&errors, &TxError::AlreadyInPool);
    }

    #[test]
    fn rejects_transaction_already_on_chain() {
        let (bc, genesis) = funded_blockchain();
        let minted = &genesis.transactions[0];
        let errors = TxValidator::new(minted, &bc, TxContext::Network).validate();
        assert_has(&errors, &TxError::AlreadyOnChain);
    }

    #[test]
    fn rejects_nonce_at_or_below_account_nonce() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        let tx1 = transfer(&sender, 1, Address([9u8; 20]), dec!(1), dec!(0.1));
        let block = make_child_block(&bc, vec![tx1]);
        bc.process_block(block).expect("process failed");

        // Account nonce is now 1; a replayed nonce must be refused.
        let replay = transfer(&sender, 1, Address([9u8; 20]), dec!(2), dec!(0.1));
        let errors = TxValidator::new(&replay, &bc, TxContext::Network).validate();
        assert_has(&errors, &TxError::NonceNotAhead);

        // Any strictly larger nonce is acceptable, gaps included.
        let ahead = transfer(&sender, 5, Address([9u8; 20]), dec!(2), dec!(0.1));
        let errors = TxValidator::new(&ahead, &bc, TxContext::Network).validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn rejects_nonce_already_pooled_for_sender() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        let pooled = transfer(&sender, 2, Address([9u8; 20]), dec!(1), dec!(0.1));
        bc.pool().put(pooled).expect("put failed");

        let rival = transfer(&sender, 2, Address([8u8; 20]), dec!(3), dec!(0.1));
        let errors = TxValidator::new(&rival, &bc, TxContext::Network).validate();
        assert_has(&errors, &TxError::NonceOccupied);
    }

    #[test]
    fn rejects_unknown_sender() {
        let (bc, _) = funded_blockchain();
        let stranger = test_key(42);
        let tx = transfer(&stranger, 1, Address([9u8; 20]), dec!(1), dec!(0.1));
        let errors = TxValidator::new(&tx, &bc, TxContext::Network).validate();
        assert_has(&errors, &TxError::UnknownSender);
    }

    #[test]
    fn rejects_underpaying_fee() {
        let (bc, _) = funded_blockchain();
        let tx = transfer(&test_key(1), 1, Address([9u8; 20]), dec!(1), dec!(0));
        let errors = TxValidator::new(&tx, &bc, TxContext::Network).validate();
        assert!(errors
            .iter()
            .any(|err| matches!(err, TxError::InsufficientFee { .. })));
    }

    #[test]
    fn refuses_network_allocations() {
        let (bc, _) = funded_blockchain();
        let mut tx = transfer(&test_key(1), 1, Address([9u8; 20]), dec!(1), dec!(0.1));
        tx.tx_type = crate::core::transaction::TxType::Alloc;
        tx.hash = tx.compute_hash();
        tx.signature = test_key(1).sign(tx.signing_digest().as_slice());

        let errors = TxValidator::new(&tx, &bc, TxContext::Network).validate();
        assert_has(&errors, &TxError::AllocFromNetwork);
    }

    #[test]
    fn block_context_enforces_duplicate_rule() {
        let (bc, genesis) = funded_blockchain();
        let minted = &genesis.transactions[0];
        let errors = TxValidator::new(minted, &bc, TxContext::Block).validate();
        assert_has(&errors, &TxError::AlreadyOnChain);
    }

    #[test]
    fn block_context_enforces_nonce_rule() {
        let (bc, _) = funded_blockchain();
        let sender = test_key(1);
        let tx1 = transfer(&sender, 1, Address([9u8; 20]), dec!(1), dec!(0.1));
        let block = make_child_block(&bc, vec![tx1]);
        bc.process_block(block).expect("process failed");

        let replay = transfer(&sender, 1, Address([9u8; 20]), dec!(2), dec!(0.1));
        let errors = TxValidator::new(&replay, &bc, TxContext::Block).validate();
        assert_has(&errors, &TxError::NonceNotAhead);

        // Unknown senders cannot fund a balance transfer inside a block
        // either.
        let stranger = transfer(&test_key(42), 1, Address([9u8; 20]), dec!(1), dec!(0.1));
        let errors = TxValidator::new(&stranger, &bc, TxContext::Block).validate();
        assert_has(&errors, &TxError::UnknownSender);
    }

    #[test]
    fn block_context_skips_pool_fee_and_alloc_rules() {
        let (bc, _) = funded_blockchain();

        // Zero fee and presence in the pool are fine inside a block.
        let tx = transfer(&test_key(1), 1, Address([9u8; 20]), dec!(1), dec!(0));
        bc.pool().put(tx.clone()).expect("put failed");
        let errors = TxValidator::new(&tx, &bc, TxContext::Block).validate();
        assert_lacks(&errors, &TxError::AlreadyInPool);
        assert_lacks(&errors, &TxError::NonceOccupied);
        assert!(!errors
            .iter()
            .any(|err| matches!(err, TxError::InsufficientFee { .. })));
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");

        // Allocations are legitimate block content; the nonce rule does
        // not apply to them.
        let mut alloc = transfer(&test_key(42), 1, Address([9u8; 20]), dec!(5), dec!(0));
        alloc.tx_type = TxType::Alloc;
        alloc.hash = alloc.compute_hash();
        alloc.signature = test_key(42).sign(alloc.signing_digest().as_slice());
        let errors = TxValidator::new(&alloc, &bc, TxContext::Block).validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }
}
