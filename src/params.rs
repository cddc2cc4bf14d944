//! Chain-wide protocol parameters.
//!
//! All values are process-wide compile-time constants. Changing any of them
//! produces an incompatible chain.

use num_bigint::BigUint;
use num_traits::One;
use rust_decimal::Decimal;

/// Maximum byte length of a header's extra-data field.
pub const MAX_EXTRA_DATA_SIZE: usize = 32;

/// How far into the future a block timestamp may lie, in seconds.
pub const ALLOWED_FUTURE_BLOCK_TIME: i64 = 15;

/// Number of blocks in a difficulty epoch. Difficulty is held constant for
/// blocks that fall inside the same epoch as their parent.
pub const DIFFICULTY_EPOCH: u64 = 2;

/// Divisor bounding how much difficulty can move between adjustments.
pub const DIFFICULTY_BOUND_DIVISOR: u64 = 2048;

/// Target block interval in seconds. Blocks arriving faster than this push
/// difficulty up; slower blocks pull it down.
pub const DURATION_LIMIT: i64 = 13;

/// Floor (in percent) applied to the downward difficulty adjustment.
pub const MINIMUM_DURATION_INCREASE: i64 = 5;

/// Minimum difficulty a header may carry.
pub const MINIMUM_DIFFICULTY: u64 = 131_072;

/// Maximum number of transactions held by the mempool.
pub const TX_POOL_CAPACITY: usize = 10_000;

/// Maximum number of orphan blocks cached while their parents are fetched.
pub const MAX_ORPHAN_BLOCKS: usize = 500;

/// Maximum number of rejected block hashes remembered.
pub const MAX_REJECTED_BLOCKS: usize = 500;

/// Maximum number of hashes returned by a block-hash query.
pub const MAX_GET_BLOCK_HASHES: u64 = 512;

/// Maximum total byte size of transactions selected into one block.
pub const MAX_BLOCK_TX_BYTES: u64 = 1 << 20;

/// Returns `2^256 - 1`, the ceiling of the proof-of-work target space.
pub fn max_uint256() -> BigUint {
    (BigUint::one() << 256u32) - BigUint::one()
}

/// Returns the fee required per byte of transaction data.
pub fn fee_per_byte() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}
