//! 20-byte account addresses derived from public keys.

use std::fmt;

/// Address length in bytes.
pub const ADDRESS_SIZE: usize = 20;

/// Fixed-size account address.
///
/// Derived from a compressed public key as SHA3-256(pubkey)[12..32].
/// `Copy` for cheap passing through validation and lookup paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash, Ord, PartialOrd)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// The all-zero address. Used as a sentinel in tests and burn targets.
    pub const fn zero() -> Address {
        Address([0u8; ADDRESS_SIZE])
    }

    /// Returns true if every byte is zero, the "no address" sentinel.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; ADDRESS_SIZE]
    }

    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates an address from a byte slice of exactly [`ADDRESS_SIZE`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Address> {
        let bytes: [u8; ADDRESS_SIZE] = slice.try_into().ok()?;
        Some(Address(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_requires_exact_length() {
        assert!(Address::from_slice(&[1u8; 19]).is_none());
        assert!(Address::from_slice(&[1u8; 20]).is_some());
    }

    #[test]
    fn zero_is_empty() {
        assert!(Address::zero().is_empty());
        assert!(!Address([1u8; 20]).is_empty());
    }
}
