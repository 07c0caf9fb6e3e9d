//! Periodic cluster-state reconciliation.
//!
//! Compares the merged directory views against live cluster membership on a
//! jittered interval: entries of departed members are pruned, and a node
//! that finds its own entries missing tells its writer tasks to rewrite
//! everything on their next tick.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use replicated_directory::{NodeAddress, ReplicatedDirectory};

use crate::arbiter::AckRequest;
use crate::cluster::{ClusterMembership, MembershipEvent};
use crate::config::PubSubConfig;
use crate::coordinator::SubRequest;
use crate::observability::events;

const COMPONENT: &str = "cluster_sync";

struct SweepFindings {
    self_missing: bool,
    stale: Vec<NodeAddress>,
}

pub(crate) struct ClusterSync {
    address: NodeAddress,
    config: PubSubConfig,
    subscriptions: Arc<dyn ReplicatedDirectory>,
    acks: Arc<dyn ReplicatedDirectory>,
    membership: Arc<dyn ClusterMembership>,
    removals: broadcast::Receiver<MembershipEvent>,
    sub_tx: mpsc::Sender<SubRequest>,
    ack_tx: mpsc::Sender<AckRequest>,
}

impl ClusterSync {
    pub(crate) fn new(
        address: NodeAddress,
        config: PubSubConfig,
        subscriptions: Arc<dyn ReplicatedDirectory>,
        acks: Arc<dyn ReplicatedDirectory>,
        membership: Arc<dyn ClusterMembership>,
        sub_tx: mpsc::Sender<SubRequest>,
        ack_tx: mpsc::Sender<AckRequest>,
    ) -> Self {
        // Subscribed here, not in `run`, so removal events broadcast between
        // construction and the first poll of the task are not lost.
        let removals = membership.subscribe();
        Self {
            address,
            config,
            subscriptions,
            acks,
            membership,
            removals,
            sub_tx,
            ack_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            event = events::TASK_STARTED,
            component = COMPONENT,
            address = %self.address,
            "cluster reconciler running"
        );
        loop {
            // Jittered so a cluster-wide event does not make every node
            // sweep in lockstep.
            let jitter_ms = if self.config.sync_interval_jitter_ms == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..self.config.sync_interval_jitter_ms)
            };
            let delay = self.config.sync_interval_base() + std::time::Duration::from_millis(jitter_ms);
            tokio::select! {
                _ = tokio::time::sleep(delay) => self.sweep().await,
                event = self.removals.recv() => match event {
                    Ok(MembershipEvent::MemberRemoved(address)) => self.prune(&address).await,
                    Ok(MembershipEvent::MemberUp(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            event = events::CHANGES_LAGGED,
                            component = COMPONENT,
                            skipped,
                            "membership stream lagged; next sweep covers the gap"
                        );
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!(
            event = events::TASK_TERMINATED,
            component = COMPONENT,
            address = %self.address,
            "cluster reconciler stopped"
        );
    }

    async fn sweep(&self) {
        debug!(
            event = events::RECONCILE_SWEEP_START,
            component = COMPONENT,
            address = %self.address,
            "reconciling directories against membership"
        );
        let mut live = self.membership.current_state().await.live_addresses();
        live.insert(self.address.as_str().to_string());

        if let Some(findings) = self.inspect(self.subscriptions.as_ref(), &live).await {
            if findings.self_missing {
                debug!(
                    event = events::RECONCILE_SELF_MISSING,
                    component = COMPONENT,
                    address = %self.address,
                    directory = "subscriptions",
                    "own entries missing from merged view"
                );
                let _ = self.sub_tx.send(SubRequest::SelfAddressMissing).await;
            }
            for stale in findings.stale {
                self.remove_from(self.subscriptions.as_ref(), &stale).await;
            }
        }
        if let Some(findings) = self.inspect(self.acks.as_ref(), &live).await {
            if findings.self_missing {
                debug!(
                    event = events::RECONCILE_SELF_MISSING,
                    component = COMPONENT,
                    address = %self.address,
                    directory = "acks",
                    "own entries missing from merged view"
                );
                let _ = self.ack_tx.send(AckRequest::SelfAddressMissing).await;
            }
            for stale in findings.stale {
                self.remove_from(self.acks.as_ref(), &stale).await;
            }
        }
        debug!(
            event = events::RECONCILE_SWEEP_OK,
            component = COMPONENT,
            address = %self.address,
            "reconciliation sweep finished"
        );
    }

    async fn inspect(
        &self,
        directory: &dyn ReplicatedDirectory,
        live: &std::collections::BTreeSet<String>,
    ) -> Option<SweepFindings> {
        let snapshot = match directory.read_all(self.config.read_consistency).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    event = events::RECONCILE_SWEEP_FAILED,
                    component = COMPONENT,
                    address = %self.address,
                    err = %err,
                    "directory read failed; retrying on next sweep"
                );
                return None;
            }
        };
        // An empty snapshot still counts as the own address being absent:
        // a wholesale wipe must trigger a rewrite. The writer tasks ignore
        // the signal while their local state is empty, so idle nodes stay
        // quiet.
        let present = snapshot.addresses();
        Some(SweepFindings {
            self_missing: !present.contains(self.address.as_str()),
            stale: present
                .difference(live)
                .map(|address| NodeAddress::new(address.as_str()))
                .collect(),
        })
    }

    async fn remove_from(&self, directory: &dyn ReplicatedDirectory, stale: &NodeAddress) {
        match directory
            .remove_address(stale, self.config.write_consistency)
            .await
        {
            Ok(()) => {
                info!(
                    event = events::RECONCILE_STALE_ADDRESS_REMOVED,
                    component = COMPONENT,
                    address = %self.address,
                    stale = %stale,
                    "pruned entries of a departed member"
                );
            }
            Err(err) => {
                // Best effort: another survivor or the next sweep will prune.
                warn!(
                    event = events::RECONCILE_SWEEP_FAILED,
                    component = COMPONENT,
                    address = %self.address,
                    stale = %stale,
                    err = %err,
                    "stale-address removal failed"
                );
            }
        }
    }

    async fn prune(&self, removed: &NodeAddress) {
        if removed == &self.address {
            return;
        }
        info!(
            event = events::MEMBER_PRUNED,
            component = COMPONENT,
            address = %self.address,
            removed = %removed,
            "member removed; pruning its directory entries"
        );
        self.remove_from(self.subscriptions.as_ref(), removed).await;
        self.remove_from(self.acks.as_ref(), removed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::ClusterSync;
    use crate::arbiter::AckRequest;
    use crate::cluster::StaticMembership;
    use crate::config::PubSubConfig;
    use crate::coordinator::SubRequest;
    use crate::store::GroupedValues;
    use replicated_directory::{
        DirectoryDiff, EntryKey, NodeAddress, ReadConsistency, ReplicaNetwork,
        ReplicatedDirectory, WriteConsistency,
    };
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn encoded(label: &str) -> BTreeSet<String> {
        let mut values = BTreeSet::new();
        values.insert(
            GroupedValues::ungrouped([label.to_string()].into_iter().collect()).encode(),
        );
        values
    }

    #[tokio::test]
    async fn sweep_prunes_addresses_without_a_live_member() {
        let subs_network = ReplicaNetwork::new();
        let acks_network = ReplicaNetwork::new();
        let subs = subs_network.attach(NodeAddress::new("node-a"), 4).await;
        let acks = acks_network.attach(NodeAddress::new("node-a"), 4).await;

        // A departed node's leftovers in both directories.
        let ghost_subs = subs_network.attach(NodeAddress::new("node-ghost"), 4).await;
        let mut diff = DirectoryDiff::default();
        diff.inserts.insert(
            EntryKey::from_raw("node-ghost/s1"),
            encoded("sensor/temp"),
        );
        ghost_subs
            .put(diff, WriteConsistency::All)
            .await
            .expect("ghost write should succeed");
        let ghost_acks = acks_network.attach(NodeAddress::new("node-ghost"), 4).await;
        let mut diff = DirectoryDiff::default();
        diff.inserts.insert(
            EntryKey::for_address(ghost_acks.address()),
            encoded("created"),
        );
        ghost_acks
            .put(diff, WriteConsistency::All)
            .await
            .expect("ghost write should succeed");

        let membership = StaticMembership::of_addresses(&["node-a"]);
        let (sub_tx, mut sub_rx) = mpsc::channel(8);
        let (ack_tx, _ack_rx) = mpsc::channel(8);
        let sync = ClusterSync::new(
            NodeAddress::new("node-a"),
            PubSubConfig {
                shard_count: 4,
                ..PubSubConfig::default()
            },
            subs.clone(),
            acks.clone(),
            membership,
            sub_tx,
            ack_tx,
        );
        sync.sweep().await;

        // node-a has no entries of its own, so the sweep must also report
        // its address missing from the subscription view.
        let missing = tokio::time::timeout(Duration::from_secs(1), sub_rx.recv())
            .await
            .expect("signal should arrive")
            .expect("channel should stay open");
        assert!(matches!(missing, SubRequest::SelfAddressMissing));

        let snapshot = subs
            .read_all(ReadConsistency::Local)
            .await
            .expect("read should succeed");
        assert_eq!(snapshot.entries().count(), 0);
        let snapshot = acks
            .read_all(ReadConsistency::Local)
            .await
            .expect("read should succeed");
        assert_eq!(snapshot.entries().count(), 0);
    }

    #[tokio::test]
    async fn member_removed_event_prunes_both_directories() {
        let subs_network = ReplicaNetwork::new();
        let acks_network = ReplicaNetwork::new();
        let subs = subs_network.attach(NodeAddress::new("node-a"), 4).await;
        let acks = acks_network.attach(NodeAddress::new("node-a"), 4).await;

        let other = subs_network.attach(NodeAddress::new("node-b"), 4).await;
        let mut diff = DirectoryDiff::default();
        diff.inserts
            .insert(EntryKey::from_raw("node-b/s1"), encoded("sensor/temp"));
        other
            .put(diff, WriteConsistency::All)
            .await
            .expect("write should succeed");

        let membership = StaticMembership::of_addresses(&["node-a", "node-b"]);
        let (sub_tx, _sub_rx) = mpsc::channel::<SubRequest>(8);
        let (ack_tx, _ack_rx) = mpsc::channel::<AckRequest>(8);
        let sync = ClusterSync::new(
            NodeAddress::new("node-a"),
            PubSubConfig {
                shard_count: 4,
                ..PubSubConfig::default()
            },
            subs.clone(),
            acks,
            membership.clone(),
            sub_tx,
            ack_tx,
        );
        // The removal event must reach the task even though it is broadcast
        // before the spawned future is first polled.
        tokio::spawn(sync.run());
        membership.remove_member(&NodeAddress::new("node-b")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let snapshot = subs
                .read_all(ReadConsistency::Local)
                .await
                .expect("read should succeed");
            if snapshot.entries().count() == 0 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "departed member's entries should be pruned"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn wholesale_wiped_directory_still_reports_self_missing() {
        let subs_network = ReplicaNetwork::new();
        let acks_network = ReplicaNetwork::new();
        let subs = subs_network.attach(NodeAddress::new("node-a"), 4).await;
        let acks = acks_network.attach(NodeAddress::new("node-a"), 4).await;

        // The node had entries, then a peer pruned its whole address away.
        let mut diff = DirectoryDiff::default();
        diff.inserts
            .insert(EntryKey::from_raw("node-a/s1"), encoded("sensor/temp"));
        subs.put(diff, WriteConsistency::All)
            .await
            .expect("write should succeed");
        subs.remove_address(&NodeAddress::new("node-a"), WriteConsistency::All)
            .await
            .expect("remove should succeed");

        let membership = StaticMembership::of_addresses(&["node-a"]);
        let (sub_tx, mut sub_rx) = mpsc::channel(8);
        let (ack_tx, mut ack_rx) = mpsc::channel(8);
        let sync = ClusterSync::new(
            NodeAddress::new("node-a"),
            PubSubConfig {
                shard_count: 4,
                ..PubSubConfig::default()
            },
            subs.clone(),
            acks,
            membership,
            sub_tx,
            ack_tx,
        );
        sync.sweep().await;

        let missing = tokio::time::timeout(Duration::from_secs(1), sub_rx.recv())
            .await
            .expect("signal should arrive")
            .expect("channel should stay open");
        assert!(matches!(missing, SubRequest::SelfAddressMissing));
        // The never-written ack directory is empty too and reports the same.
        let missing = tokio::time::timeout(Duration::from_secs(1), ack_rx.recv())
            .await
            .expect("signal should arrive")
            .expect("channel should stay open");
        assert!(matches!(missing, AckRequest::SelfAddressMissing));
    }
}
