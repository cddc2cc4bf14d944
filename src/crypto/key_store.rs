//! Encrypted persistence for the node's block-creator key.
//!
//! The key file is a tag-wire message, the same serialization every other
//! persisted artifact in this crate uses. The sealed payload is the raw
//! key scalar under XChaCha20-Poly1305, with the encryption key derived
//! from a passphrase by Argon2id. The file's version and salt are fed to
//! the cipher as associated data: a file whose header was altered fails
//! authentication even when the passphrase is right.

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use std::fs;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::key_pair::PrivateKey;
use crate::info;
use crate::types::wire::{self, EncodeSink, WireDecode, WireEncode, WireError};

/// Current key file format version.
const KEY_FILE_VERSION: u64 = 1;

/// Argon2id salt length in bytes.
const SALT_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length in bytes.
const NONCE_LEN: usize = 24;

/// Errors raised while saving or loading a creator key.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file is not decodable: {0}")]
    Wire(#[from] WireError),
    #[error("unsupported key file version: {0}")]
    UnsupportedVersion(u64),
    #[error("passphrase key derivation failed")]
    Kdf,
    #[error("sealing the key failed")]
    Seal,
    #[error("wrong passphrase or corrupt key file")]
    Decrypt,
    #[error("decrypted bytes are not a valid private key")]
    InvalidKey,
}

/// On-disk form of an encrypted creator key.
///
/// Wire layout:
/// 1. version (varint)
/// 2. salt (bytes, 32)
/// 3. nonce (bytes, 24)
/// 4. ciphertext (bytes; sealed key scalar plus the Poly1305 tag)
struct KeyFile {
    version: u64,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl KeyFile {
    /// Associated data authenticated alongside the ciphertext.
    ///
    /// Covers the version and salt, so neither can be swapped without the
    /// decryption failing.
    fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::new();
        wire::write_uint(&mut aad, 1, self.version);
        wire::write_bytes(&mut aad, 2, &self.salt);
        aad
    }
}

impl WireEncode for KeyFile {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        wire::write_uint(out, 1, self.version);
        wire::write_bytes(out, 2, &self.salt);
        wire::write_bytes(out, 3, &self.nonce);
        wire::write_bytes(out, 4, &self.ciphertext);
    }
}

impl WireDecode for KeyFile {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let version = wire::read_uint(input, 1)?;
        let salt: [u8; SALT_LEN] = wire::read_bytes(input, 2)?
            .try_into()
            .map_err(|_| WireError::InvalidValue(2))?;
        let nonce: [u8; NONCE_LEN] = wire::read_bytes(input, 3)?
            .try_into()
            .map_err(|_| WireError::InvalidValue(3))?;
        let ciphertext = wire::read_bytes(input, 4)?;
        Ok(KeyFile {
            version,
            salt,
            nonce,
            ciphertext,
        })
    }
}

/// Builds the cipher for a passphrase and salt via Argon2id.
fn derive_cipher(passphrase: &[u8], salt: &[u8]) -> Result<XChaCha20Poly1305, KeyStoreError> {
    let mut secret = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase, salt, secret.as_mut())
        .map_err(|_| KeyStoreError::Kdf)?;
    Ok(XChaCha20Poly1305::new(secret.as_ref().into()))
}

/// Encrypts and writes `key` to `path`, creating parent directories.
pub fn save_key(key: &PrivateKey, path: &Path, passphrase: &[u8]) -> Result<(), KeyStoreError> {
    let mut file = KeyFile {
        version: KEY_FILE_VERSION,
        salt: [0u8; SALT_LEN],
        nonce: [0u8; NONCE_LEN],
        ciphertext: Vec::new(),
    };
    OsRng.fill_bytes(&mut file.salt);
    OsRng.fill_bytes(&mut file.nonce);

    let cipher = derive_cipher(passphrase, &file.salt)?;
    let plaintext = Zeroizing::new(key.to_bytes());
    file.ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&file.nonce),
            Payload {
                msg: plaintext.as_ref(),
                aad: &file.associated_data(),
            },
        )
        .map_err(|_| KeyStoreError::Seal)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, file.to_wire_bytes())?;

    info!("creator key saved to {}", path.display());
    Ok(())
}

/// Reads and decrypts a creator key from `path`.
pub fn load_key(path: &Path, passphrase: &[u8]) -> Result<PrivateKey, KeyStoreError> {
    let file = KeyFile::from_wire_bytes(&fs::read(path)?)?;
    if file.version != KEY_FILE_VERSION {
        return Err(KeyStoreError::UnsupportedVersion(file.version));
    }

    let cipher = derive_cipher(passphrase, &file.salt)?;
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&file.nonce),
            Payload {
                msg: &file.ciphertext,
                aad: &file.associated_data(),
            },
        )
        .map_err(|_| KeyStoreError::Decrypt)?;

    let scalar: [u8; 32] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| KeyStoreError::InvalidKey)?;
    PrivateKey::from_bytes(&scalar).map_err(|_| KeyStoreError::InvalidKey)
}

/// Loads the creator key if the file exists, otherwise generates, saves,
/// and returns a fresh key.
pub fn load_or_generate(path: &Path, passphrase: &[u8]) -> Result<PrivateKey, KeyStoreError> {
    if path.exists() {
        info!("loading creator key from {}", path.display());
        load_key(path, passphrase)
    } else {
        info!("generating new creator key");
        let key = PrivateKey::generate();
        save_key(&key, path, passphrase)?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("creator.key");
        let key = PrivateKey::generate();

        save_key(&key, &path, b"hunter2").expect("save failed");
        let loaded = load_key(&path, b"hunter2").expect("load failed");
        assert_eq!(loaded.public_key(), key.public_key());
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("creator.key");
        save_key(&PrivateKey::generate(), &path, b"right").expect("save failed");
        assert!(matches!(
            load_key(&path, b"wrong"),
            Err(KeyStoreError::Decrypt)
        ));
    }

    #[test]
    fn header_tampering_fails_authentication() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("creator.key");
        save_key(&PrivateKey::generate(), &path, b"pw").expect("save failed");

        // Flip one salt byte: decoding still succeeds, but the derived key
        // and the associated data no longer match what was sealed.
        let mut file = KeyFile::from_wire_bytes(&fs::read(&path).expect("read")).expect("decode");
        file.salt[0] ^= 0xff;
        fs::write(&path, file.to_wire_bytes()).expect("write");

        assert!(matches!(load_key(&path, b"pw"), Err(KeyStoreError::Decrypt)));
    }

    #[test]
    fn unsupported_version_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("creator.key");
        save_key(&PrivateKey::generate(), &path, b"pw").expect("save failed");

        let mut file = KeyFile::from_wire_bytes(&fs::read(&path).expect("read")).expect("decode");
        file.version = 9;
        fs::write(&path, file.to_wire_bytes()).expect("write");

        assert!(matches!(
            load_key(&path, b"pw"),
            Err(KeyStoreError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn truncated_file_is_not_decodable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("creator.key");
        save_key(&PrivateKey::generate(), &path, b"pw").expect("save failed");

        let mut data = fs::read(&path).expect("read");
        data.truncate(data.len() / 2);
        fs::write(&path, &data).expect("write");

        assert!(matches!(load_key(&path, b"pw"), Err(KeyStoreError::Wire(_))));
    }

    #[test]
    fn load_or_generate_creates_then_reuses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("creator.key");

        let first = load_or_generate(&path, b"pw").expect("generate failed");
        let second = load_or_generate(&path, b"pw").expect("reload failed");
        assert_eq!(first.public_key(), second.public_key());
    }
}
