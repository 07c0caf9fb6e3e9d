//! Cluster membership boundary consumed by the fan-out layer.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use replicated_directory::NodeAddress;
use tokio::sync::{broadcast, RwLock};

const MEMBERSHIP_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle status of one cluster member.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemberStatus {
    Joining,
    Up,
    Leaving,
    Exiting,
    Down,
    Removed,
}

impl MemberStatus {
    /// Whether directory entries of this member should still be honored.
    pub fn is_live(self) -> bool {
        matches!(self, MemberStatus::Joining | MemberStatus::Up)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Member {
    pub address: NodeAddress,
    pub status: MemberStatus,
}

/// Point-in-time membership snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterState {
    pub members: Vec<Member>,
}

impl ClusterState {
    /// Addresses of members not in a leaving/exiting/down/removed state.
    pub fn live_addresses(&self) -> BTreeSet<String> {
        self.members
            .iter()
            .filter(|member| member.status.is_live())
            .map(|member| member.address.as_str().to_string())
            .collect()
    }
}

/// Membership change events the reconciler consumes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MembershipEvent {
    MemberUp(NodeAddress),
    MemberRemoved(NodeAddress),
}

/// The membership view boundary. Implementations own how the view is fed
/// (seed list, gossip, an external cluster manager); this layer only reads
/// snapshots and consumes the removal stream.
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn current_state(&self) -> ClusterState;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Static membership fed by hand, for tests and single-process clusters.
pub struct StaticMembership {
    state: RwLock<ClusterState>,
    events_tx: broadcast::Sender<MembershipEvent>,
}

impl StaticMembership {
    pub fn new(members: Vec<Member>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(MEMBERSHIP_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: RwLock::new(ClusterState { members }),
            events_tx,
        })
    }

    pub fn of_addresses(addresses: &[&str]) -> Arc<Self> {
        Self::new(
            addresses
                .iter()
                .map(|address| Member {
                    address: NodeAddress::new(*address),
                    status: MemberStatus::Up,
                })
                .collect(),
        )
    }

    /// Marks a member removed and emits the removal event.
    pub async fn remove_member(&self, address: &NodeAddress) {
        let mut state = self.state.write().await;
        for member in state.members.iter_mut() {
            if member.address == *address {
                member.status = MemberStatus::Removed;
            }
        }
        drop(state);
        let _ = self
            .events_tx
            .send(MembershipEvent::MemberRemoved(address.clone()));
    }

    /// Adds or revives a member and emits the up event.
    pub async fn add_member(&self, address: NodeAddress) {
        let mut state = self.state.write().await;
        match state
            .members
            .iter_mut()
            .find(|member| member.address == address)
        {
            Some(member) => member.status = MemberStatus::Up,
            None => state.members.push(Member {
                address: address.clone(),
                status: MemberStatus::Up,
            }),
        }
        drop(state);
        let _ = self.events_tx.send(MembershipEvent::MemberUp(address));
    }
}

#[async_trait]
impl ClusterMembership for StaticMembership {
    async fn current_state(&self) -> ClusterState {
        self.state.read().await.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::{ClusterMembership, MembershipEvent, StaticMembership};
    use replicated_directory::NodeAddress;

    #[tokio::test]
    async fn removed_members_leave_the_live_set() {
        let membership = StaticMembership::of_addresses(&["node-a", "node-b"]);
        let mut events = membership.subscribe();

        membership.remove_member(&NodeAddress::new("node-b")).await;

        let live = membership.current_state().await.live_addresses();
        assert!(live.contains("node-a"));
        assert!(!live.contains("node-b"));
        assert_eq!(
            events.recv().await.expect("event should arrive"),
            MembershipEvent::MemberRemoved(NodeAddress::new("node-b"))
        );
    }
}
