//! Seeded hash family reducing topics to compact, comparable tuples.

use std::collections::HashSet;
use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;

// Mixed into the configured base seed so each family member is an
// independent hash function.
const FAMILY_SALTS: [u64; 4] = [
    0x9e37_79b9_7f4a_7c15,
    0xbf58_476d_1ce4_e5b9,
    0x94d0_49bb_1331_11eb,
    0x2545_f491_4f6c_dd1d,
];

/// Ordered tuple of family hash values for one topic.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TopicHashes(Vec<u64>);

impl TopicHashes {
    pub fn values(&self) -> &[u64] {
        &self.0
    }

    /// Approximate membership test against a set of known family hashes.
    ///
    /// `false` is definitive (the topic was never folded into `known`);
    /// `true` may be a false positive and callers must re-check exactly.
    pub fn probably_in(&self, known: &HashSet<u64>) -> bool {
        self.0.iter().all(|hash| known.contains(hash))
    }
}

/// Deterministic seeded hash family over topic strings.
///
/// For a fixed base seed and family size, every node computes the same
/// tuple for the same topic, so hashes can stand in for topic strings in
/// replicated state and in group-index selection.
#[derive(Clone)]
pub struct TopicHasher {
    states: Vec<RandomState>,
}

impl TopicHasher {
    pub fn new(base_seed: u64, family_size: usize) -> Self {
        let states = (0..family_size.max(1))
            .map(|index| {
                let salt = FAMILY_SALTS[index % FAMILY_SALTS.len()];
                let round = (index / FAMILY_SALTS.len()) as u64 + 1;
                RandomState::with_seeds(
                    base_seed ^ salt,
                    base_seed.rotate_left(17) ^ salt.wrapping_mul(round),
                    base_seed.wrapping_add(round),
                    salt.rotate_right(9) ^ round,
                )
            })
            .collect();
        Self { states }
    }

    /// Reduces a topic to its family hash tuple.
    pub fn approximate(&self, topic: &str) -> TopicHashes {
        TopicHashes(
            self.states
                .iter()
                .map(|state| {
                    let mut hasher = state.build_hasher();
                    topic.hash(&mut hasher);
                    hasher.finish()
                })
                .collect(),
        )
    }

    /// Single stable hash for group-index selection keys.
    pub fn index_hash(&self, key: &str) -> u64 {
        let mut hasher = self.states[0].build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    pub fn family_size(&self) -> usize {
        self.states.len()
    }
}
