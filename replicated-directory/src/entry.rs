//! Entry keying and the per-key versioned-register merge model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Cluster-unique address of one member.
///
/// The derived `Ord` over the address string is the total order every
/// address-priority arbitration in the fan-out layer relies on: lower
/// address wins, on every node, from the same replicated state.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of one directory entry.
///
/// Keys are either a bare node address (`"addr"`) or a subscriber handle
/// rooted at one (`"addr/path"`). The address part determines write
/// ownership and which shard holds the entry.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct EntryKey(String);

impl EntryKey {
    /// Key owned by the member itself (ack-label entries).
    pub fn for_address(address: &NodeAddress) -> Self {
        Self(address.as_str().to_string())
    }

    /// Key of a subscriber handle rooted at `address` (subscription entries).
    pub fn scoped(address: &NodeAddress, path: &str) -> Self {
        Self(format!("{}/{}", address.as_str(), path))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The node-address prefix of the key.
    pub fn address_part(&self) -> &str {
        match self.0.find('/') {
            Some(slash) => &self.0[..slash],
            None => &self.0,
        }
    }

    /// Whether this key is owned by `address`.
    pub fn owned_by(&self, address: &NodeAddress) -> bool {
        self.address_part() == address.as_str()
    }
}

impl Display for EntryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry's replicated register.
///
/// Every key has exactly one writer, so a version counter bumped by that
/// writer makes "keep the higher version" a correct merge. Removal is a
/// tombstone with a bumped version, so it survives merge reordering.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VersionedEntry {
    pub version: u64,
    pub deleted: bool,
    pub values: BTreeSet<String>,
}

impl VersionedEntry {
    pub fn live(version: u64, values: BTreeSet<String>) -> Self {
        Self {
            version,
            deleted: false,
            values,
        }
    }

    pub fn tombstone(version: u64) -> Self {
        Self {
            version,
            deleted: true,
            values: BTreeSet::new(),
        }
    }

    /// Merges a replicated copy of the same entry into this one.
    ///
    /// Higher version wins outright. Equal versions only occur through
    /// redelivery of the same write, where both sides carry the same
    /// payload; values are unioned so the merge stays idempotent even if
    /// that assumption is violated.
    pub fn merge(&mut self, other: &VersionedEntry) {
        if other.version > self.version {
            *self = other.clone();
        } else if other.version == self.version {
            self.deleted = self.deleted || other.deleted;
            if self.deleted {
                self.values.clear();
            } else {
                self.values.extend(other.values.iter().cloned());
            }
        }
    }
}

/// One shard's entry map, tombstones included.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Shard {
    pub entries: BTreeMap<EntryKey, VersionedEntry>,
}

impl Shard {
    /// Merges another replica's copy of this shard.
    pub fn merge(&mut self, other: &Shard) {
        for (key, entry) in &other.entries {
            match self.entries.get_mut(key) {
                Some(existing) => existing.merge(entry),
                None => {
                    self.entries.insert(key.clone(), entry.clone());
                }
            }
        }
    }

    /// The live (non-tombstoned) contents of this shard.
    pub fn content(&self, shard: usize) -> ShardContent {
        ShardContent {
            shard,
            entries: self
                .entries
                .iter()
                .filter(|(_, entry)| !entry.deleted)
                .map(|(key, entry)| (key.clone(), entry.values.clone()))
                .collect(),
        }
    }
}

/// Live contents of one shard, as handed to readers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShardContent {
    pub shard: usize,
    pub entries: BTreeMap<EntryKey, BTreeSet<String>>,
}

/// Shard index for a key, stable across nodes for a fixed shard count.
pub(crate) fn shard_for(key: &EntryKey, shard_count: usize) -> usize {
    use std::hash::{BuildHasher, Hash, Hasher};
    // Fixed seeds: every replica must agree on entry placement.
    let mut hasher = ahash::RandomState::with_seeds(7, 11, 13, 17).build_hasher();
    key.address_part().hash(&mut hasher);
    (hasher.finish() % shard_count.max(1) as u64) as usize
}
