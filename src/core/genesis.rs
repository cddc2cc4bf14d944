//! Genesis block loading from a JSON document.
//!
//! The document mirrors the wire data model with hex-encoded hashes and
//! keys and decimal-string amounts:
//!
//! ```json
//! {
//!   "hash": "…",
//!   "header": { "parentHash": "00…", "number": 1, … },
//!   "transactions": [ { "type": 2, "nonce": 1, … } ]
//! }
//! ```
//!
//! Loading fails with `hash is not correct` when the document's `hash` does
//! not match the hash computed over the decoded header.

use num_bigint::BigUint;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::core::block::{Block, Header};
use crate::core::transaction::{Transaction, TxType};
use crate::crypto::{PublicKey, Signature};
use crate::types::address::Address;
use crate::types::hash::Hash;

/// Errors raised while loading a genesis document.
#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("failed to read genesis file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse genesis document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid genesis field `{0}`")]
    InvalidField(&'static str),
    #[error("hash is not correct")]
    HashMismatch,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenesisDoc {
    hash: String,
    header: HeaderDoc,
    #[serde(default)]
    transactions: Vec<TransactionDoc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeaderDoc {
    parent_hash: String,
    number: u64,
    timestamp: i64,
    difficulty: String,
    total_difficulty: String,
    state_root: String,
    transactions_root: String,
    nonce: u64,
    #[serde(default)]
    extra: String,
    creator_pubkey: String,
    signature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDoc {
    #[serde(rename = "type")]
    tx_type: u64,
    nonce: u64,
    sender_pubkey: String,
    recipient: String,
    value: String,
    fee: String,
    timestamp: i64,
    hash: String,
    signature: String,
}

fn parse_hash(value: &str, field: &'static str) -> Result<Hash, GenesisError> {
    let bytes = hex::decode(value).map_err(|_| GenesisError::InvalidField(field))?;
    Hash::from_slice(&bytes).ok_or(GenesisError::InvalidField(field))
}

fn parse_biguint(value: &str, field: &'static str) -> Result<BigUint, GenesisError> {
    BigUint::from_str(value).map_err(|_| GenesisError::InvalidField(field))
}

fn parse_decimal(value: &str, field: &'static str) -> Result<Decimal, GenesisError> {
    Decimal::from_str(value).map_err(|_| GenesisError::InvalidField(field))
}

fn parse_pubkey(value: &str, field: &'static str) -> Result<PublicKey, GenesisError> {
    let bytes = hex::decode(value).map_err(|_| GenesisError::InvalidField(field))?;
    PublicKey::from_sec1_bytes(&bytes).map_err(|_| GenesisError::InvalidField(field))
}

fn parse_signature(value: &str, field: &'static str) -> Result<Signature, GenesisError> {
    let bytes = hex::decode(value).map_err(|_| GenesisError::InvalidField(field))?;
    Signature::from_slice(&bytes).map_err(|_| GenesisError::InvalidField(field))
}

fn build_header(doc: &HeaderDoc) -> Result<Header, GenesisError> {
    Ok(Header {
        parent_hash: parse_hash(&doc.parent_hash, "header.parentHash")?,
        number: doc.number,
        timestamp: doc.timestamp,
        difficulty: parse_biguint(&doc.difficulty, "header.difficulty")?,
        total_difficulty: parse_biguint(&doc.total_difficulty, "header.totalDifficulty")?,
        state_root: parse_hash(&doc.state_root, "header.stateRoot")?,
        transactions_root: parse_hash(&doc.transactions_root, "header.transactionsRoot")?,
        nonce: doc.nonce,
        extra: hex::decode(&doc.extra).map_err(|_| GenesisError::InvalidField("header.extra"))?,
        creator_pubkey: parse_pubkey(&doc.creator_pubkey, "header.creatorPubkey")?,
        signature: parse_signature(&doc.signature, "header.signature")?,
    })
}

fn build_transaction(doc: &TransactionDoc) -> Result<Transaction, GenesisError> {
    let recipient_bytes =
        hex::decode(&doc.recipient).map_err(|_| GenesisError::InvalidField("tx.recipient"))?;
    Ok(Transaction {
        tx_type: TxType::from_wire(doc.tx_type).ok_or(GenesisError::InvalidField("tx.type"))?,
        nonce: doc.nonce,
        sender_pubkey: parse_pubkey(&doc.sender_pubkey, "tx.senderPubkey")?,
        recipient: Address::from_slice(&recipient_bytes)
            .ok_or(GenesisError::InvalidField("tx.recipient"))?,
        value: parse_decimal(&doc.value, "tx.value")?,
        fee: parse_decimal(&doc.fee, "tx.fee")?,
        timestamp: doc.timestamp,
        hash: parse_hash(&doc.hash, "tx.hash")?,
        signature: parse_signature(&doc.signature, "tx.signature")?,
    })
}

/// Decodes a genesis block from a JSON string.
pub fn from_json(json: &str) -> Result<Block, GenesisError> {
    let doc: GenesisDoc = serde_json::from_str(json)?;
    let expected_hash = parse_hash(&doc.hash, "hash")?;

    let header = build_header(&doc.header)?;
    let transactions = doc
        .transactions
        .iter()
        .map(build_transaction)
        .collect::<Result<Vec<_>, _>>()?;

    let block = Block::new(header, transactions);
    if block.hash() != expected_hash {
        return Err(GenesisError::HashMismatch);
    }
    Ok(block)
}

/// Reads and decodes a genesis block from a file.
pub fn from_file(path: &Path) -> Result<Block, GenesisError> {
    let json = std::fs::read_to_string(path)?;
    from_json(&json)
}
