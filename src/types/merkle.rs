//! Merkle commitments: binary roots for transaction sets and the sparse
//! authenticated state tree backing account snapshots.
//!
//! Binary-root behavior:
//! - An empty list of leaves yields the all-zero hash.
//! - Odd layers duplicate the last node before hashing the pair.
//! - Reduction happens in place to avoid per-level allocations.

use crate::types::hash::Hash;
use sparse_merkle_tree::blake2b::Blake2bHasher;
use sparse_merkle_tree::default_store::DefaultStore;
use sparse_merkle_tree::traits::Value;
use sparse_merkle_tree::{H256, SparseMerkleTree};

const EMPTY_ROOT: Hash = Hash::zero();
const MERKLE_NODE_SEPARATION: &[u8] = b"MERKLE_TX_NODE";

/// Builds binary Merkle roots from leaf hashes.
pub struct MerkleTree;

impl MerkleTree {
    fn hash_pair(left: Hash, right: Hash) -> Hash {
        let mut h = Hash::sha3();
        h.update(MERKLE_NODE_SEPARATION);
        h.update(left.as_slice());
        h.update(right.as_slice());
        h.finalize()
    }

    /// Computes a Merkle root from the provided leaf hashes.
    ///
    /// Returns the zero hash when `nodes` is empty. The caller controls leaf
    /// order; transaction roots sort leaves ascending before calling this.
    pub fn from_raw(mut nodes: Vec<Hash>) -> Hash {
        if nodes.is_empty() {
            return EMPTY_ROOT;
        }

        let mut len = nodes.len();
        while len > 1 {
            let mut write = 0;
            let mut read = 0;
            while read < len {
                let left = nodes[read];
                let right = if read + 1 < len { nodes[read + 1] } else { left };
                nodes[write] = Self::hash_pair(left, right);
                write += 1;
                read += 2;
            }
            len = write;
        }

        nodes[0]
    }
}

/// Wrapper for byte values stored in the sparse state tree.
#[derive(Default, Clone)]
pub struct TreeValue(pub Vec<u8>);

impl Value for TreeValue {
    fn to_h256(&self) -> H256 {
        if self.0.is_empty() {
            return H256::zero();
        }
        H256::from(Hash::of(&self.0).0)
    }

    fn zero() -> Self {
        Self(Vec::new())
    }
}

type Smt = SparseMerkleTree<Blake2bHasher, TreeValue, DefaultStore<TreeValue>>;

fn hash_to_h256(hash: &Hash) -> H256 {
    H256::from(hash.0)
}

fn h256_to_hash(h256: &H256) -> Hash {
    Hash(*h256.as_slice().first_chunk::<32>().unwrap_or(&[0u8; 32]))
}

/// Portable snapshot of a state tree: its digest plus the leaf set needed
/// to reseed an equivalent tree.
///
/// Candidate blocks are mock-executed against a tree reseeded from the
/// parent state's seed, so the live tree is never touched until commit.
#[derive(Clone, Default)]
pub struct TreeSeed {
    root: Hash,
    leaves: Vec<(Hash, Vec<u8>)>,
}

impl TreeSeed {
    /// The digest this seed reproduces.
    pub fn root(&self) -> Hash {
        self.root
    }
}

/// Sparse, in-memory authenticated key/value map.
///
/// The root digest depends only on the set of (key, value) pairs, never on
/// insertion order.
pub struct StateTree {
    inner: Smt,
}

impl StateTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self {
            inner: Smt::new(H256::zero(), DefaultStore::default()),
        }
    }

    /// Rebuilds a tree holding exactly the leaves captured in `seed`.
    pub fn seeded(seed: &TreeSeed) -> Self {
        let mut tree = Self::new();
        let leaves: Vec<(H256, TreeValue)> = seed
            .leaves
            .iter()
            .map(|(key, value)| (hash_to_h256(key), TreeValue(value.clone())))
            .collect();
        if !leaves.is_empty() {
            tree.inner
                .update_all(leaves)
                .expect("state tree reseed failed");
        }
        tree
    }

    /// Inserts or replaces the value stored under `key`.
    pub fn upsert(&mut self, key: Hash, value: Vec<u8>) {
        self.inner
            .update(hash_to_h256(&key), TreeValue(value))
            .expect("state tree update failed");
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: Hash) -> Option<Vec<u8>> {
        self.inner
            .get(&hash_to_h256(&key))
            .ok()
            .filter(|v| !v.0.is_empty())
            .map(|v| v.0)
    }

    /// Returns the current root digest.
    pub fn root_hash(&self) -> Hash {
        h256_to_hash(self.inner.root())
    }

    /// Returns the root digest and a seed capturing the current leaf set.
    pub fn root(&self) -> (Hash, TreeSeed) {
        let leaves = self
            .inner
            .store()
            .leaves_map()
            .iter()
            .filter(|(_, value)| !value.0.is_empty())
            .map(|(key, value)| (h256_to_hash(key), value.0.clone()))
            .collect();
        (
            self.root_hash(),
            TreeSeed {
                root: self.root_hash(),
                leaves,
            },
        )
    }
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}
