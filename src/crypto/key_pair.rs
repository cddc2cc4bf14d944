//! ECDSA key pairs on secp256k1.
//!
//! Public keys travel in compressed SEC1 form (33 bytes); signatures are
//! 64-byte fixed encodings. Addresses are the trailing 20 bytes of the
//! SHA3-256 digest of the compressed public key.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use sha3::{Digest, Sha3_256};
use std::fmt;
use thiserror::Error;

use crate::types::address::{Address, ADDRESS_SIZE};

/// Compressed SEC1 public key length in bytes.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Fixed signature encoding length in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors raised while handling key material.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("bytes do not encode a valid secp256k1 public key")]
    InvalidPublicKey,
    #[error("bytes do not encode a valid signature")]
    InvalidSignature,
    #[error("bytes do not encode a valid secp256k1 scalar")]
    InvalidPrivateKey,
}

/// Private key for signing blocks and transactions.
///
/// Never serialized onto the wire; persisted only through the encrypted
/// key store.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generates a new random private key from OS entropy.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Creates a private key from raw scalar bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        SigningKey::from_bytes(bytes.into())
            .map(|key| Self { key })
            .map_err(|_| KeyError::InvalidPrivateKey)
    }

    /// Returns the raw scalar bytes. Callers must zeroize copies they make.
    pub(crate) fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes().into()
    }

    /// Derives the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(*self.key.verifying_key())
    }

    /// Signs arbitrary data, producing a deterministic ECDSA signature.
    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature(self.key.sign(data))
    }
}

/// Public key carrying its derived account address.
///
/// `Copy` because keys are compared and re-verified for every transaction in
/// every block; stack copies beat shared references at this size.
#[derive(Clone, Copy, Debug)]
pub struct PublicKey {
    key: VerifyingKey,
    address: Address,
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PublicKey {}

impl PublicKey {
    fn from_verifying_key(key: VerifyingKey) -> Self {
        let sec1 = key.to_encoded_point(true);
        let digest: [u8; 32] = Sha3_256::digest(sec1.as_bytes()).into();
        let mut addr = [0u8; ADDRESS_SIZE];
        addr.copy_from_slice(&digest[12..]);
        PublicKey {
            key,
            address: Address(addr),
        }
    }

    /// Parses a compressed SEC1 public key.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(KeyError::InvalidPublicKey);
        }
        VerifyingKey::from_sec1_bytes(bytes)
            .map(Self::from_verifying_key)
            .map_err(|_| KeyError::InvalidPublicKey)
    }

    /// Returns the compressed SEC1 encoding.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let point = self.key.to_encoded_point(true);
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Returns the account address derived from this key.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Verifies a signature over `data`.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        self.key.verify(data, &signature.0).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// ECDSA signature in fixed 64-byte encoding.
#[derive(Clone, Debug)]
pub struct Signature(k256::ecdsa::Signature);

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Signature {}

impl Signature {
    /// Returns the fixed 64-byte `r || s` encoding.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        let mut out = [0u8; SIGNATURE_SIZE];
        out.copy_from_slice(&self.0.to_bytes());
        out
    }

    /// Parses a signature from its 64-byte encoding.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        k256::ecdsa::Signature::from_slice(bytes)
            .map(Signature)
            .map_err(|_| KeyError::InvalidSignature)
    }
}
