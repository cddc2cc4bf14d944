//! Deterministic fixtures shared across test modules.
//!
//! Everything here is reproducible run to run: fixed key scalars, fixed
//! timestamps, and ECDSA's deterministic nonces keep hashes stable, so two
//! independently built chains agree block for block.

use num_bigint::BigUint;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;

use crate::blockchain::Blockchain;
use crate::consensus::{Pow, PowMode};
use crate::core::block::{Block, Header};
use crate::core::transaction::{Transaction, TxType};
use crate::crypto::PrivateKey;
use crate::params;
use crate::storage::memory_kv::MemoryKv;
use crate::types::address::Address;
use crate::types::hash::Hash;

/// Base timestamp for fixture chains. Far enough in the past that the
/// future-block bound never interferes.
pub const BASE_TIME: i64 = 1_700_000_000;

/// Private key from a fixed scalar; `seed` 0 is remapped to 1.
pub fn test_key(seed: u8) -> PrivateKey {
    let mut bytes = [0u8; 32];
    bytes[31] = seed.max(1);
    PrivateKey::from_bytes(&bytes).expect("valid scalar")
}

/// Balance transfer with a fixed timestamp.
pub fn transfer(
    key: &PrivateKey,
    nonce: u64,
    recipient: Address,
    value: Decimal,
    fee: Decimal,
) -> Transaction {
    transfer_at(key, nonce, recipient, value, fee, BASE_TIME + 100)
}

/// Balance transfer with an explicit timestamp.
pub fn transfer_at(
    key: &PrivateKey,
    nonce: u64,
    recipient: Address,
    value: Decimal,
    fee: Decimal,
    timestamp: i64,
) -> Transaction {
    Transaction::new(TxType::Balance, nonce, key, recipient, value, fee, timestamp)
}

/// Signed header fixture at the given number, linked to nothing useful.
pub fn sample_header(number: u64) -> Header {
    let creator = test_key(1);
    let mut header = Header {
        parent_hash: Hash::of(b"sample parent"),
        number,
        timestamp: BASE_TIME,
        difficulty: BigUint::from(params::MINIMUM_DIFFICULTY),
        total_difficulty: BigUint::from(params::MINIMUM_DIFFICULTY) * BigUint::from(number),
        state_root: Hash::zero(),
        transactions_root: Hash::zero(),
        nonce: 0,
        extra: Vec::new(),
        creator_pubkey: creator.public_key(),
        signature: creator.sign(b"unsigned"),
    };
    header.sign(&creator);
    header
}

/// Deterministic genesis block.
///
/// Allocates 100 to `test_key(1)` and 50 to `test_key(2)`. Its state root
/// is the zero hash: the root depends on the chain id, which depends on
/// this block's own hash, so genesis is exempt from the state-root check.
pub fn genesis_block() -> Block {
    let creator = test_key(1);
    let allocs = vec![
        Transaction::new(
            TxType::Alloc,
            1,
            &creator,
            test_key(1).public_key().address(),
            dec!(100),
            dec!(0),
            BASE_TIME,
        ),
        Transaction::new(
            TxType::Alloc,
            2,
            &creator,
            test_key(2).public_key().address(),
            dec!(50),
            dec!(0),
            BASE_TIME,
        ),
    ];

    let mut header = Header {
        parent_hash: Hash::zero(),
        number: 1,
        timestamp: BASE_TIME,
        difficulty: BigUint::from(params::MINIMUM_DIFFICULTY),
        total_difficulty: BigUint::from(params::MINIMUM_DIFFICULTY),
        state_root: Hash::zero(),
        transactions_root: Block::transactions_root(&allocs),
        nonce: 0,
        extra: Vec::new(),
        creator_pubkey: creator.public_key(),
        signature: creator.sign(b"unsigned"),
    };
    header.sign(&creator);
    Block::new(header, allocs)
}

/// Renders a block as the JSON genesis document format.
pub fn genesis_json(block: &Block) -> String {
    let txs: Vec<serde_json::Value> = block
        .transactions
        .iter()
        .map(|tx| {
            json!({
                "type": tx.tx_type.to_wire(),
                "nonce": tx.nonce,
                "senderPubkey": hex::encode(tx.sender_pubkey.to_bytes()),
                "recipient": hex::encode(tx.recipient.as_slice()),
                "value": tx.value.to_string(),
                "fee": tx.fee.to_string(),
                "timestamp": tx.timestamp,
                "hash": tx.hash.to_string(),
                "signature": hex::encode(tx.signature.to_bytes()),
            })
        })
        .collect();

    json!({
        "hash": block.hash().to_string(),
        "header": {
            "parentHash": block.header.parent_hash.to_string(),
            "number": block.header.number,
            "timestamp": block.header.timestamp,
            "difficulty": block.header.difficulty.to_string(),
            "totalDifficulty": block.header.total_difficulty.to_string(),
            "stateRoot": block.header.state_root.to_string(),
            "transactionsRoot": block.header.transactions_root.to_string(),
            "nonce": block.header.nonce,
            "extra": hex::encode(&block.header.extra),
            "creatorPubkey": hex::encode(block.header.creator_pubkey.to_bytes()),
            "signature": hex::encode(block.header.signature.to_bytes()),
        },
        "transactions": txs,
    })
    .to_string()
}

/// Standalone linked chain of `n` signed blocks numbered 1..=n.
///
/// Linkage and difficulty accounting are correct; state roots are not, so
/// these are for store-level tests, not the processor.
pub fn chain_of(n: u64) -> Vec<Block> {
    let creator = test_key(1);
    let mut blocks: Vec<Block> = Vec::with_capacity(n as usize);
    let difficulty = BigUint::from(params::MINIMUM_DIFFICULTY);

    for number in 1..=n {
        let parent_hash = blocks
            .last()
            .map(|parent: &Block| parent.hash())
            .unwrap_or_else(Hash::zero);
        let mut header = Header {
            parent_hash,
            number,
            timestamp: BASE_TIME + (number as i64) * 5,
            difficulty: difficulty.clone(),
            total_difficulty: difficulty.clone() * BigUint::from(number),
            state_root: Hash::zero(),
            transactions_root: Block::transactions_root(&[]),
            nonce: 0,
            extra: Vec::new(),
            creator_pubkey: creator.public_key(),
            signature: creator.sign(b"unsigned"),
        };
        header.sign(&creator);
        blocks.push(Block::new(header, Vec::new()));
    }
    blocks
}

/// Fresh in-memory blockchain brought up from [`genesis_block`], with the
/// consensus engine in test mode.
pub fn funded_blockchain() -> (Blockchain<MemoryKv>, Block) {
    let bc = Blockchain::new(Arc::new(MemoryKv::new()), Pow::new(PowMode::Test));
    let genesis = genesis_block();
    bc.up(genesis.clone()).expect("genesis up failed");
    (bc, genesis)
}

/// Fully valid child of `bc`'s best tip carrying `txs`.
///
/// Deterministic: the timestamp is the parent's plus five seconds.
pub fn make_child_block(bc: &Blockchain<MemoryKv>, txs: Vec<Transaction>) -> Block {
    let tip = bc.best_tip().expect("chain has a tip");
    bc.assemble_block(&test_key(1), txs, tip.timestamp + 5)
        .expect("assemble failed")
}
