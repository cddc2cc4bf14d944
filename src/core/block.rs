//! Blocks and headers.

use num_bigint::BigUint;

use crate::core::transaction::Transaction;
use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::types::hash::{Hash, HashCache};
use crate::types::merkle::MerkleTree;
use crate::types::wire::{self, EncodeSink, WireDecode, WireEncode, WireError};

/// Domain separator for header hashes.
const HEADER_HASH_PREFIX: &[u8] = b"BLOCK_HEADER";
/// Domain separator for the pre-seal hash fed to the proof-of-work.
const HEADER_NO_NONCE_PREFIX: &[u8] = b"BLOCK_POW";
/// Domain separator for block creator signatures.
const BLOCK_SIG_PREFIX: &[u8] = b"BLOCK_SIG";

/// Block header: metadata plus cryptographic commitments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Hash of the parent header; zero only for genesis.
    pub parent_hash: Hash,
    /// Height of this block. Genesis is 1.
    pub number: u64,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Proof-of-work difficulty of this block. Always positive.
    pub difficulty: BigUint,
    /// Cumulative difficulty from genesis through this block.
    pub total_difficulty: BigUint,
    /// Root of the state tree after applying this block.
    pub state_root: Hash,
    /// Merkle root over the block's transactions, sorted by hash.
    pub transactions_root: Hash,
    /// Proof-of-work nonce.
    pub nonce: u64,
    /// Free-form extra data, bounded by `MAX_EXTRA_DATA_SIZE`.
    pub extra: Vec<u8>,
    /// Public key of the block creator.
    pub creator_pubkey: PublicKey,
    /// Creator's signature over the signing digest.
    pub signature: Signature,
}

impl Header {
    /// Encodes every field except `signature`.
    fn encode_unsigned<S: EncodeSink>(&self, out: &mut S) {
        wire::write_bytes(out, 1, self.parent_hash.as_slice());
        wire::write_uint(out, 2, self.number);
        wire::write_int(out, 3, self.timestamp);
        wire::write_bytes(out, 4, &self.difficulty.to_bytes_be());
        wire::write_bytes(out, 5, &self.total_difficulty.to_bytes_be());
        wire::write_bytes(out, 6, self.state_root.as_slice());
        wire::write_bytes(out, 7, self.transactions_root.as_slice());
        wire::write_uint(out, 8, self.nonce);
        wire::write_bytes(out, 9, &self.extra);
        wire::write_bytes(out, 10, &self.creator_pubkey.to_bytes());
    }

    /// Hash identifying the block carrying this header.
    pub fn hash(&self) -> Hash {
        let mut h = Hash::sha3();
        h.update(HEADER_HASH_PREFIX);
        self.encode(&mut h);
        h.finalize()
    }

    /// Hash of the header with `nonce` and `signature` left out.
    ///
    /// This is the value the proof-of-work seals: the miner varies only the
    /// nonce, so the sealed digest must not depend on it.
    pub fn hash_no_nonce(&self) -> Hash {
        let mut h = Hash::sha3();
        h.update(HEADER_NO_NONCE_PREFIX);
        wire::write_bytes(&mut h, 1, self.parent_hash.as_slice());
        wire::write_uint(&mut h, 2, self.number);
        wire::write_int(&mut h, 3, self.timestamp);
        wire::write_bytes(&mut h, 4, &self.difficulty.to_bytes_be());
        wire::write_bytes(&mut h, 5, &self.total_difficulty.to_bytes_be());
        wire::write_bytes(&mut h, 6, self.state_root.as_slice());
        wire::write_bytes(&mut h, 7, self.transactions_root.as_slice());
        wire::write_bytes(&mut h, 9, &self.extra);
        wire::write_bytes(&mut h, 10, &self.creator_pubkey.to_bytes());
        h.finalize()
    }

    /// Digest the creator signs, covering all fields including the nonce.
    pub fn signing_digest(&self) -> Hash {
        let mut h = Hash::sha3();
        h.update(BLOCK_SIG_PREFIX);
        self.encode_unsigned(&mut h);
        h.finalize()
    }

    /// Signs the header in place with the creator's key.
    ///
    /// Must run after sealing: the signature covers the final nonce.
    pub fn sign(&mut self, key: &PrivateKey) {
        self.signature = key.sign(self.signing_digest().as_slice());
    }

    /// Verifies the creator signature.
    pub fn verify_signature(&self) -> bool {
        self.creator_pubkey
            .verify(self.signing_digest().as_slice(), &self.signature)
    }
}

/// Wire layout:
/// 1. parent_hash (bytes, 32)
/// 2. number (varint)
/// 3. timestamp (varint, two's complement)
/// 4. difficulty (bytes, minimal big-endian)
/// 5. total_difficulty (bytes, minimal big-endian)
/// 6. state_root (bytes, 32)
/// 7. transactions_root (bytes, 32)
/// 8. nonce (varint)
/// 9. extra (bytes)
/// 10. creator_pubkey (bytes, 33)
/// 11. signature (bytes, 64)
impl WireEncode for Header {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.encode_unsigned(out);
        wire::write_bytes(out, 11, &self.signature.to_bytes());
    }
}

impl WireDecode for Header {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let parent_hash =
            Hash::from_slice(&wire::read_bytes(input, 1)?).ok_or(WireError::InvalidValue(1))?;
        let number = wire::read_uint(input, 2)?;
        let timestamp = wire::read_int(input, 3)?;
        let difficulty = BigUint::from_bytes_be(&wire::read_bytes(input, 4)?);
        let total_difficulty = BigUint::from_bytes_be(&wire::read_bytes(input, 5)?);
        let state_root =
            Hash::from_slice(&wire::read_bytes(input, 6)?).ok_or(WireError::InvalidValue(6))?;
        let transactions_root =
            Hash::from_slice(&wire::read_bytes(input, 7)?).ok_or(WireError::InvalidValue(7))?;
        let nonce = wire::read_uint(input, 8)?;
        let extra = wire::read_bytes(input, 9)?;
        let creator_pubkey = PublicKey::from_sec1_bytes(&wire::read_bytes(input, 10)?)
            .map_err(|_| WireError::InvalidValue(10))?;
        let signature = Signature::from_slice(&wire::read_bytes(input, 11)?)
            .map_err(|_| WireError::InvalidValue(11))?;

        Ok(Header {
            parent_hash,
            number,
            timestamp,
            difficulty,
            total_difficulty,
            state_root,
            transactions_root,
            nonce,
            extra,
            creator_pubkey,
            signature,
        })
    }
}

/// Immutable block: a header plus its ordered transactions.
///
/// Identified by the header hash, which is computed once and cached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    cached_hash: HashCache,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            cached_hash: HashCache::new(),
        }
    }

    /// The block's identity: the hash of its header.
    pub fn hash(&self) -> Hash {
        self.cached_hash.get_or_compute(|| self.header.hash())
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    /// True for a well-formed genesis block: number 1, zero parent.
    pub fn is_genesis(&self) -> bool {
        self.header.number == 1 && self.header.parent_hash.is_zero()
    }

    /// Merkle root over the given transactions, sorted ascending by hash.
    pub fn transactions_root(transactions: &[Transaction]) -> Hash {
        let mut leaves: Vec<Hash> = transactions.iter().map(|tx| tx.hash).collect();
        leaves.sort_unstable();
        MerkleTree::from_raw(leaves)
    }
}

/// Wire layout:
/// 1. header (message)
/// 2. transactions (repeated message)
impl WireEncode for Block {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        wire::write_message(out, 1, &self.header);
        wire::write_repeated(out, 2, &self.transactions);
    }
}

impl WireDecode for Block {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let header: Header = wire::read_message(input, 1)?;
        let transactions: Vec<Transaction> = wire::read_repeated(input, 2)?;
        Ok(Block::new(header, transactions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::TxType;
    use rust_decimal_macros::dec;
    use crate::types::address::Address;

    fn key(seed: u8) -> PrivateKey {
        let mut bytes = [0u8; 32];
        bytes[31] = seed.max(1);
        PrivateKey::from_bytes(&bytes).expect("valid scalar")
    }

    fn sample_header(number: u64) -> Header {
        let creator = key(1);
        let mut header = Header {
            parent_hash: Hash::of(b"parent"),
            number,
            timestamp: 1_700_000_000,
            difficulty: BigUint::from(131_072u64),
            total_difficulty: BigUint::from(262_144u64),
            state_root: Hash::of(b"state"),
            transactions_root: Hash::zero(),
            nonce: 7,
            extra: vec![1, 2, 3],
            creator_pubkey: creator.public_key(),
            signature: creator.sign(b"placeholder"),
        };
        header.sign(&creator);
        header
    }

    #[test]
    fn header_wire_roundtrip() {
        let header = sample_header(5);
        let decoded = Header::from_wire_bytes(&header.to_wire_bytes()).expect("decode failed");
        assert_eq!(decoded, header);
        assert!(decoded.verify_signature());
    }

    #[test]
    fn header_hash_is_deterministic_and_content_bound() {
        let header = sample_header(5);
        assert_eq!(header.hash(), header.hash());

        let mut other = header.clone();
        other.number = 6;
        assert_ne!(other.hash(), header.hash());
    }

    #[test]
    fn hash_no_nonce_ignores_nonce_and_signature() {
        let header = sample_header(5);
        let mut reworked = header.clone();
        reworked.nonce = 999_999;
        reworked.sign(&key(1));
        assert_eq!(reworked.hash_no_nonce(), header.hash_no_nonce());
        assert_ne!(reworked.hash(), header.hash());
    }

    #[test]
    fn signature_covers_nonce() {
        let mut header = sample_header(5);
        header.nonce += 1;
        assert!(!header.verify_signature());
    }

    #[test]
    fn block_wire_roundtrip_with_transactions() {
        let tx1 = Transaction::new(
            TxType::Balance,
            1,
            &key(2),
            Address([9u8; 20]),
            dec!(1),
            dec!(0.1),
            1_700_000_000,
        );
        let tx2 = Transaction::new(
            TxType::Balance,
            2,
            &key(2),
            Address([9u8; 20]),
            dec!(2),
            dec!(0.1),
            1_700_000_001,
        );

        let mut header = sample_header(2);
        header.transactions_root = Block::transactions_root(&[tx1.clone(), tx2.clone()]);
        let block = Block::new(header, vec![tx1, tx2]);

        let decoded = Block::from_wire_bytes(&block.to_wire_bytes()).expect("decode failed");
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn transactions_root_is_order_independent() {
        let tx1 = Transaction::new(
            TxType::Balance,
            1,
            &key(2),
            Address([9u8; 20]),
            dec!(1),
            dec!(0),
            1,
        );
        let tx2 = Transaction::new(
            TxType::Balance,
            2,
            &key(3),
            Address([9u8; 20]),
            dec!(1),
            dec!(0),
            2,
        );
        assert_eq!(
            Block::transactions_root(&[tx1.clone(), tx2.clone()]),
            Block::transactions_root(&[tx2, tx1])
        );
    }

    #[test]
    fn empty_transactions_root_is_zero() {
        assert_eq!(Block::transactions_root(&[]), Hash::zero());
    }

    #[test]
    fn genesis_detection() {
        let mut header = sample_header(1);
        header.parent_hash = Hash::zero();
        assert!(Block::new(header, vec![]).is_genesis());
        assert!(!Block::new(sample_header(2), vec![]).is_genesis());
    }

    #[test]
    fn block_decode_rejects_trailing_bytes() {
        let block = Block::new(sample_header(2), vec![]);
        let mut bytes = block.to_wire_bytes();
        bytes.push(0xAA);
        assert!(Block::from_wire_bytes(&bytes).is_err());
    }
}
