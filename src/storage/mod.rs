//! Persistence: the transactional key/value contract, its backends, and the
//! per-chain block store built on top.
//!
//! - [`kv`]: the [`Kv`](kv::Kv) trait and key composition
//! - [`rocksdb_kv`]: production RocksDB backend
//! - [`memory_kv`]: in-memory backend for tests
//! - [`chain_store`]: per-chain blocks, headers, transactions, accounts

pub mod chain_store;
pub mod kv;
pub mod memory_kv;
pub mod rocksdb_kv;
