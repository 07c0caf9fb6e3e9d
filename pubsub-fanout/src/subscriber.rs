//! Subscriber identity used as a map key throughout the fan-out layer.

use std::fmt::{Display, Formatter};

use replicated_directory::{EntryKey, NodeAddress};
use serde::{Deserialize, Serialize};

/// Addressable, network-unique handle of one subscriber.
///
/// Carries no identity beyond (node address, local path); equality, ordering
/// and hashing are by address. The derived `Ord` gives every node the same
/// sort order over the same replicated state, which group selection relies
/// on.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct SubscriberRef {
    pub address: NodeAddress,
    pub path: String,
}

impl SubscriberRef {
    pub fn new(address: NodeAddress, path: impl Into<String>) -> Self {
        Self {
            address,
            path: path.into(),
        }
    }

    /// The directory entry key this subscriber's record is written under.
    pub fn entry_key(&self) -> EntryKey {
        EntryKey::scoped(&self.address, &self.path)
    }

    /// Parses a subscriber handle back out of a directory entry key.
    ///
    /// Bare address keys (ack-label entries) have no path part and yield
    /// `None`.
    pub fn from_entry_key(key: &EntryKey) -> Option<Self> {
        let raw = key.as_str();
        let slash = raw.find('/')?;
        Some(Self {
            address: NodeAddress::new(&raw[..slash]),
            path: raw[slash + 1..].to_string(),
        })
    }
}

impl Display for SubscriberRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.path)
    }
}
