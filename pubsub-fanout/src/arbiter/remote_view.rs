//! The merged remote view of acknowledgement-label claims.

use std::collections::BTreeMap;

use replicated_directory::{DirectorySnapshot, NodeAddress};

use crate::store::GroupedValues;

/// One remote node's winning claim on a label.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RemoteClaim {
    pub address: NodeAddress,
    pub group: Option<String>,
}

/// Label claims of every other cluster member, folded in ascending address
/// order. The fold order is the conflict resolution: the first (lowest)
/// address to claim a label owns it, and later claimants are ignored.
#[derive(Clone, Debug, Default)]
pub(crate) struct RemoteAckView {
    owners: BTreeMap<String, RemoteClaim>,
}

impl RemoteAckView {
    /// Rebuilds from a merged directory snapshot, excluding `own` so a
    /// node's replicated echo never evicts its own claimants.
    ///
    /// Ack entries are keyed by bare node address, so the snapshot's key
    /// order is already ascending address order.
    pub(crate) fn from_snapshot(snapshot: &DirectorySnapshot, own: &NodeAddress) -> Self {
        let mut claims: BTreeMap<NodeAddress, Vec<GroupedValues>> = BTreeMap::new();
        for (key, values) in snapshot.entries() {
            let address = NodeAddress::new(key.address_part());
            if &address == own {
                continue;
            }
            let units = claims.entry(address).or_default();
            units.extend(values.iter().filter_map(|raw| GroupedValues::decode(raw)));
        }

        let mut owners = BTreeMap::new();
        for (address, units) in claims {
            for unit in units {
                for label in &unit.values {
                    owners.entry(label.clone()).or_insert_with(|| RemoteClaim {
                        address: address.clone(),
                        group: unit.group.clone(),
                    });
                }
            }
        }
        Self { owners }
    }

    pub(crate) fn claim(&self, label: &str) -> Option<&RemoteClaim> {
        self.owners.get(label)
    }

    pub(crate) fn owners(&self) -> &BTreeMap<String, RemoteClaim> {
        &self.owners
    }

    /// Whether `label` is owned by a remote member placed before `address`
    /// in the arbitration order, under a group other than `group`.
    ///
    /// A same-named group co-owns its labels across nodes and is never a
    /// conflict; an ungrouped claimant loses to any lower-address owner.
    pub(crate) fn beats(&self, label: &str, address: &NodeAddress, group: Option<&str>) -> bool {
        match self.owners.get(label) {
            Some(claim) if claim.address < *address => match (claim.group.as_deref(), group) {
                (Some(theirs), Some(ours)) => theirs != ours,
                _ => true,
            },
            _ => false,
        }
    }
}
