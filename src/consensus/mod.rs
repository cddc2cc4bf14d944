//! Proof-of-work consensus engine.
//!
//! Validates headers against the difficulty-adjustment rules and verifies
//! the Blake2b seal. The engine owns no chain state; callers hand it the
//! parent header (or a [`HeaderReader`] for `prepare`).

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use num_bigint::BigUint;
use num_traits::Zero;
use thiserror::Error;

use crate::core::block::Header;
use crate::params;
use crate::types::hash::Hash;

type Blake2b256 = Blake2b<U32>;

/// Errors marking headers invalid under consensus rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("extra-data too long: {len} > {max}")]
    ExtraTooLong { len: usize, max: usize },
    #[error("block timestamp is too far in the future")]
    FutureBlock,
    #[error("block timestamp does not advance past parent's")]
    ZeroBlockTime,
    #[error("invalid difficulty: have {have}, want {want}")]
    InvalidDifficulty { have: BigUint, want: BigUint },
    #[error("invalid total difficulty: have {have}, want {want}")]
    InvalidTotalDifficulty { have: BigUint, want: BigUint },
    #[error("block number is not parent number + 1")]
    InvalidNumber,
    #[error("non-positive difficulty")]
    NonPositiveDifficulty,
    #[error("invalid proof-of-work")]
    InvalidPoW,
    #[error("unknown parent")]
    UnknownParent,
    #[error("no valid nonce found while sealing")]
    SealNotFound,
}

/// Read access to headers already accepted on a chain.
pub trait HeaderReader {
    fn header_by_hash(&self, hash: Hash) -> Option<Header>;
}

/// Engine operating mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowMode {
    /// Full seal verification.
    Normal,
    /// Accepts any seal. For tests and local development networks.
    Test,
}

/// The proof-of-work engine.
#[derive(Clone, Copy, Debug)]
pub struct Pow {
    mode: PowMode,
}

impl Pow {
    pub fn new(mode: PowMode) -> Self {
        Self { mode }
    }

    /// Checks whether `header` conforms to consensus rules given `parent`.
    ///
    /// Check order: extra size, future bound, monotonic timestamp,
    /// difficulty, total difficulty, number, then (optionally) the seal.
    pub fn verify_header(
        &self,
        header: &Header,
        parent: &Header,
        check_seal: bool,
    ) -> Result<(), ConsensusError> {
        if header.extra.len() > params::MAX_EXTRA_DATA_SIZE {
            return Err(ConsensusError::ExtraTooLong {
                len: header.extra.len(),
                max: params::MAX_EXTRA_DATA_SIZE,
            });
        }

        if header.timestamp > now_unix() + params::ALLOWED_FUTURE_BLOCK_TIME {
            return Err(ConsensusError::FutureBlock);
        }

        if header.timestamp <= parent.timestamp {
            return Err(ConsensusError::ZeroBlockTime);
        }

        let expected = self.calc_difficulty(header, parent);
        if expected != header.difficulty {
            return Err(ConsensusError::InvalidDifficulty {
                have: header.difficulty.clone(),
                want: expected,
            });
        }

        let expected_td = &parent.total_difficulty + &header.difficulty;
        if expected_td != header.total_difficulty {
            return Err(ConsensusError::InvalidTotalDifficulty {
                have: header.total_difficulty.clone(),
                want: expected_td,
            });
        }

        if header.number != parent.number + 1 {
            return Err(ConsensusError::InvalidNumber);
        }

        if check_seal {
            self.verify_seal(header)?;
        }

        Ok(())
    }

    /// Difficulty a block must carry given its parent.
    ///
    /// Within one difficulty epoch the parent's difficulty is carried
    /// forward unchanged. On an epoch boundary the difficulty moves by
    /// `parent.difficulty / DIFFICULTY_BOUND_DIVISOR`: up when the block
    /// arrived inside the duration limit, down by a timestamp-derived
    /// percentage otherwise, clamped to the minimum.
    pub fn calc_difficulty(&self, header: &Header, parent: &Header) -> BigUint {
        if same_epoch(parent.number, header.number) {
            return parent.difficulty.clone();
        }

        let minimum = BigUint::from(params::MINIMUM_DIFFICULTY);
        let adjust = &parent.difficulty / BigUint::from(params::DIFFICULTY_BOUND_DIVISOR);
        let dt = header.timestamp - parent.timestamp;

        let diff = if dt < params::DURATION_LIMIT {
            &parent.difficulty + &adjust
        } else {
            // Percentage slowdown measured against the header timestamp.
            let pct = ((header.timestamp - params::DURATION_LIMIT) * 100) / params::DURATION_LIMIT;
            let pct = pct.max(params::MINIMUM_DURATION_INCREASE);
            let decrease = (adjust * BigUint::from(pct as u64)) / BigUint::from(100u64);
            if decrease >= parent.difficulty {
                minimum.clone()
            } else {
                &parent.difficulty - &decrease
            }
        };

        diff.max(minimum)
    }

    /// The digest the proof-of-work produced for `header`'s nonce.
    pub fn seal_hash(hash_no_nonce: Hash, nonce: u64) -> Hash {
        let mut hasher = Blake2b256::new();
        hasher.update(hash_no_nonce.as_slice());
        hasher.update(nonce.to_be_bytes());
        Hash(hasher.finalize().into())
    }

    /// The largest seal digest `difficulty` admits.
    fn seal_target(difficulty: &BigUint) -> BigUint {
        params::max_uint256() / difficulty
    }

    /// Checks that the header's nonce satisfies its difficulty.
    pub fn verify_seal(&self, header: &Header) -> Result<(), ConsensusError> {
        if self.mode == PowMode::Test {
            return Ok(());
        }

        if header.difficulty.is_zero() {
            return Err(ConsensusError::NonPositiveDifficulty);
        }

        let digest = Self::seal_hash(header.hash_no_nonce(), header.nonce);
        let value = BigUint::from_bytes_be(digest.as_slice());
        if value > Self::seal_target(&header.difficulty) {
            return Err(ConsensusError::InvalidPoW);
        }
        Ok(())
    }

    /// Fills `difficulty` and `total_difficulty` from the parent header.
    pub fn prepare<R: HeaderReader>(
        &self,
        reader: &R,
        header: &mut Header,
    ) -> Result<(), ConsensusError> {
        let parent = reader
            .header_by_hash(header.parent_hash)
            .ok_or(ConsensusError::UnknownParent)?;

        header.difficulty = self.calc_difficulty(header, &parent);
        header.total_difficulty = &parent.total_difficulty + &header.difficulty;
        Ok(())
    }

    /// Searches for a nonce satisfying the header's difficulty.
    ///
    /// Scans nonces from zero; `max_attempts` bounds the search so callers
    /// control how long production may block.
    pub fn seal(&self, header: &mut Header, max_attempts: u64) -> Result<(), ConsensusError> {
        if self.mode == PowMode::Test {
            header.nonce = 0;
            return Ok(());
        }

        if header.difficulty.is_zero() {
            return Err(ConsensusError::NonPositiveDifficulty);
        }

        let base = header.hash_no_nonce();
        let target = Self::seal_target(&header.difficulty);
        for nonce in 0..max_attempts {
            let digest = Self::seal_hash(base, nonce);
            if BigUint::from_bytes_be(digest.as_slice()) <= target {
                header.nonce = nonce;
                return Ok(());
            }
        }
        Err(ConsensusError::SealNotFound)
    }
}

fn same_epoch(parent_number: u64, number: u64) -> bool {
    parent_number / params::DIFFICULTY_EPOCH == number / params::DIFFICULTY_EPOCH
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
