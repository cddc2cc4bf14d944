//! Signed, content-addressed transactions.

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::types::wire::{self, EncodeSink, WireDecode, WireEncode, WireError};

/// Domain separator for transaction content hashes.
const TX_HASH_PREFIX: &[u8] = b"TX";
/// Domain separator for transaction signing digests.
const TX_SIG_PREFIX: &[u8] = b"TX_SIG";

/// Kind of operation a transaction performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxType {
    /// Moves value from the sender to the recipient.
    Balance,
    /// Credits the recipient without a funding sender. Only block creators
    /// may mint these; they are never accepted from the network.
    Alloc,
}

impl TxType {
    pub(crate) fn to_wire(self) -> u64 {
        match self {
            TxType::Balance => 1,
            TxType::Alloc => 2,
        }
    }

    pub(crate) fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(TxType::Balance),
            2 => Some(TxType::Alloc),
            _ => None,
        }
    }
}

/// A value-transfer transaction.
///
/// Content-addressed: `hash` commits to every field except itself and the
/// signature, so two transactions with identical content collapse to one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub tx_type: TxType,
    /// Sender-scoped replay counter, starting at 1.
    pub nonce: u64,
    pub sender_pubkey: PublicKey,
    pub recipient: Address,
    /// Amount transferred to the recipient. Nonnegative decimal.
    pub value: Decimal,
    /// Fee offered for inclusion. Nonnegative decimal.
    pub fee: Decimal,
    pub timestamp: i64,
    pub hash: Hash,
    pub signature: Signature,
}

impl Transaction {
    /// Builds, hashes, and signs a transaction with the sender's key.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx_type: TxType,
        nonce: u64,
        key: &PrivateKey,
        recipient: Address,
        value: Decimal,
        fee: Decimal,
        timestamp: i64,
    ) -> Self {
        let mut tx = Transaction {
            tx_type,
            nonce,
            sender_pubkey: key.public_key(),
            recipient,
            value,
            fee,
            timestamp,
            hash: Hash::zero(),
            signature: key.sign(&[]),
        };
        tx.hash = tx.compute_hash();
        tx.signature = key.sign(tx.signing_digest().as_slice());
        tx
    }

    /// Address derived from the sender's public key.
    pub fn sender_address(&self) -> Address {
        self.sender_pubkey.address()
    }

    /// Encodes every field except `hash` and `signature`.
    fn encode_content<S: EncodeSink>(&self, out: &mut S) {
        wire::write_uint(out, 1, self.tx_type.to_wire());
        wire::write_uint(out, 2, self.nonce);
        wire::write_bytes(out, 3, &self.sender_pubkey.to_bytes());
        wire::write_bytes(out, 4, self.recipient.as_slice());
        wire::write_str(out, 5, &self.value.to_string());
        wire::write_str(out, 6, &self.fee.to_string());
        wire::write_int(out, 7, self.timestamp);
    }

    /// Recomputes the content hash from the current field values.
    pub fn compute_hash(&self) -> Hash {
        let mut h = Hash::sha3();
        h.update(TX_HASH_PREFIX);
        self.encode_content(&mut h);
        h.finalize()
    }

    /// Digest the sender signs: the content under a signing domain.
    pub fn signing_digest(&self) -> Hash {
        let mut h = Hash::sha3();
        h.update(TX_SIG_PREFIX);
        self.encode_content(&mut h);
        h.finalize()
    }

    /// Verifies the signature against the sender's public key.
    pub fn verify_signature(&self) -> bool {
        self.sender_pubkey
            .verify(self.signing_digest().as_slice(), &self.signature)
    }

    /// Returns the wire size of the transaction with its fee zeroed.
    ///
    /// Fee-independent sizing keeps a sender from shrinking its measured
    /// footprint by quoting a shorter fee string.
    pub fn size_excluding_fee(&self) -> u64 {
        let mut feeless = self.clone();
        feeless.fee = Decimal::ZERO;
        feeless.wire_size() as u64
    }

    /// Fee offered per byte of feeless wire size. Zero-size input yields zero.
    pub fn fee_per_byte(&self) -> Decimal {
        let size = Decimal::from(self.size_excluding_fee());
        if size.is_zero() {
            return Decimal::ZERO;
        }
        self.fee / size
    }
}

/// Wire layout:
/// 1. tx_type (varint)
/// 2. nonce (varint)
/// 3. sender_pubkey (bytes, 33)
/// 4. recipient (bytes, 20)
/// 5. value (decimal string)
/// 6. fee (decimal string)
/// 7. timestamp (varint, two's complement)
/// 8. hash (bytes, 32)
/// 9. signature (bytes, 64)
impl WireEncode for Transaction {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.encode_content(out);
        wire::write_bytes(out, 8, self.hash.as_slice());
        wire::write_bytes(out, 9, &self.signature.to_bytes());
    }
}

impl WireDecode for Transaction {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let tx_type =
            TxType::from_wire(wire::read_uint(input, 1)?).ok_or(WireError::InvalidValue(1))?;
        let nonce = wire::read_uint(input, 2)?;
        let sender_pubkey = PublicKey::from_sec1_bytes(&wire::read_bytes(input, 3)?)
            .map_err(|_| WireError::InvalidValue(3))?;
        let recipient =
            Address::from_slice(&wire::read_bytes(input, 4)?).ok_or(WireError::InvalidValue(4))?;
        let value =
            Decimal::from_str(&wire::read_str(input, 5)?).map_err(|_| WireError::InvalidValue(5))?;
        let fee =
            Decimal::from_str(&wire::read_str(input, 6)?).map_err(|_| WireError::InvalidValue(6))?;
        let timestamp = wire::read_int(input, 7)?;
        let hash =
            Hash::from_slice(&wire::read_bytes(input, 8)?).ok_or(WireError::InvalidValue(8))?;
        let signature = Signature::from_slice(&wire::read_bytes(input, 9)?)
            .map_err(|_| WireError::InvalidValue(9))?;

        Ok(Transaction {
            tx_type,
            nonce,
            sender_pubkey,
            recipient,
            value,
            fee,
            timestamp,
            hash,
            signature,
        })
    }
}
