//! Account snapshots persisted in the per-chain state.

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::address::Address;
use crate::types::wire::{self, EncodeSink, WireDecode, WireEncode, WireError};

/// Kind of account. Only balance accounts exist today; the tag keeps the
/// wire format open for richer account kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountType {
    Balance,
}

impl AccountType {
    fn to_wire(self) -> u64 {
        match self {
            AccountType::Balance => 1,
        }
    }

    fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(AccountType::Balance),
            _ => None,
        }
    }
}

/// One account snapshot.
///
/// Snapshots are append-only: every balance change writes a new snapshot at
/// the block number that caused it, keyed by `(chain, block_number, address)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub account_type: AccountType,
    pub address: Address,
    /// Spendable balance. Fixed-precision decimal, never floating point.
    pub balance: Decimal,
    /// Highest transaction nonce applied to this account.
    pub nonce: u64,
}

impl Account {
    /// Creates a balance account with a zero nonce.
    pub fn new(address: Address, balance: Decimal) -> Self {
        Self {
            account_type: AccountType::Balance,
            address,
            balance,
            nonce: 0,
        }
    }
}

/// Wire layout:
/// 1. account_type (varint)
/// 2. address (bytes, 20)
/// 3. balance (decimal string)
/// 4. nonce (varint)
impl WireEncode for Account {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        wire::write_uint(out, 1, self.account_type.to_wire());
        wire::write_bytes(out, 2, self.address.as_slice());
        wire::write_str(out, 3, &self.balance.to_string());
        wire::write_uint(out, 4, self.nonce);
    }
}

impl WireDecode for Account {
    fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let account_type =
            AccountType::from_wire(wire::read_uint(input, 1)?).ok_or(WireError::InvalidValue(1))?;
        let address =
            Address::from_slice(&wire::read_bytes(input, 2)?).ok_or(WireError::InvalidValue(2))?;
        let balance =
            Decimal::from_str(&wire::read_str(input, 3)?).map_err(|_| WireError::InvalidValue(3))?;
        let nonce = wire::read_uint(input, 4)?;
        Ok(Account {
            account_type,
            address,
            balance,
            nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn new_creates_balance_account() {
        let account = Account::new(Address([7u8; 20]), dec!(100.5));
        assert_eq!(account.account_type, AccountType::Balance);
        assert_eq!(account.nonce, 0);
        assert_eq!(account.balance, dec!(100.5));
    }

    #[test]
    fn wire_roundtrip() {
        let mut account = Account::new(Address([9u8; 20]), dec!(98.9));
        account.nonce = 3;

        let bytes = account.to_wire_bytes();
        let decoded = Account::from_wire_bytes(&bytes).expect("decode failed");
        assert_eq!(decoded, account);
    }

    #[test]
    fn balance_string_preserves_scale() {
        let account = Account::new(Address::zero(), dec!(0.1000));
        let decoded = Account::from_wire_bytes(&account.to_wire_bytes()).expect("decode failed");
        assert_eq!(decoded.balance, account.balance);
    }

    #[test]
    fn unknown_account_type_rejected() {
        let account = Account::new(Address::zero(), dec!(1));
        let mut bytes = account.to_wire_bytes();
        // account_type is the second byte of the first field
        bytes[1] = 99;
        assert_eq!(
            Account::from_wire_bytes(&bytes).unwrap_err(),
            WireError::InvalidValue(1)
        );
    }
}
