//! In-memory multi-node directory used by tests and single-process clusters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::entry::{shard_for, EntryKey, NodeAddress, Shard, VersionedEntry};
use crate::{
    DirectoryChanged, DirectoryDiff, DirectoryError, DirectorySnapshot, DirectoryState,
    ReadConsistency, ReplicatedDirectory, WriteConsistency,
};

const COMPONENT: &str = "in_memory_directory";
const CHANGE_CHANNEL_CAPACITY: usize = 64;

struct NodeState {
    address: NodeAddress,
    shard_count: usize,
    clock: AtomicU64,
    shards: Mutex<Vec<Shard>>,
    change_tx: broadcast::Sender<DirectoryChanged>,
    fail_next_writes: AtomicUsize,
}

impl NodeState {
    fn new(address: NodeAddress, shard_count: usize) -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            address,
            shard_count: shard_count.max(1),
            clock: AtomicU64::new(0),
            shards: Mutex::new(vec![Shard::default(); shard_count.max(1)]),
            change_tx,
            fail_next_writes: AtomicUsize::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn snapshot_locked(&self, shards: &[Shard]) -> DirectorySnapshot {
        DirectorySnapshot {
            shards: shards
                .iter()
                .enumerate()
                .map(|(index, shard)| shard.content(index))
                .collect(),
        }
    }

    async fn apply(&self, writes: &[(EntryKey, VersionedEntry)]) -> DirectorySnapshot {
        let mut shards = self.shards.lock().await;
        for (key, entry) in writes {
            let shard = &mut shards[shard_for(key, self.shard_count)];
            match shard.entries.get_mut(key) {
                Some(existing) => existing.merge(entry),
                None => {
                    shard.entries.insert(key.clone(), entry.clone());
                }
            }
        }
        let snapshot = self.snapshot_locked(&shards);
        drop(shards);

        let _ = self.change_tx.send(DirectoryChanged {
            snapshot: Arc::new(snapshot.clone()),
        });
        snapshot
    }
}

/// Hub linking the in-memory replicas of one simulated cluster.
///
/// A write applies to the issuing node, replicates to every peer by shard
/// merge, and drives each peer's change notification. With
/// [`WriteConsistency::Local`] replication happens in a background task;
/// stronger consistencies replicate before the write completes.
pub struct ReplicaNetwork {
    nodes: Mutex<Vec<Arc<NodeState>>>,
}

impl ReplicaNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(Vec::new()),
        })
    }

    /// Attaches a new replica for `address` and returns its directory handle.
    pub async fn attach(
        self: &Arc<Self>,
        address: NodeAddress,
        shard_count: usize,
    ) -> Arc<InMemoryDirectory> {
        let node = Arc::new(NodeState::new(address, shard_count));
        self.nodes.lock().await.push(node.clone());
        Arc::new(InMemoryDirectory {
            network: self.clone(),
            node,
        })
    }

    async fn replicate(
        self: &Arc<Self>,
        origin: &NodeAddress,
        writes: Arc<Vec<(EntryKey, VersionedEntry)>>,
    ) {
        let peers: Vec<Arc<NodeState>> = self
            .nodes
            .lock()
            .await
            .iter()
            .filter(|node| node.address != *origin)
            .cloned()
            .collect();

        for peer in peers {
            peer.apply(&writes).await;
        }
    }
}

/// One member's handle onto the [`ReplicaNetwork`].
pub struct InMemoryDirectory {
    network: Arc<ReplicaNetwork>,
    node: Arc<NodeState>,
}

impl InMemoryDirectory {
    pub fn address(&self) -> &NodeAddress {
        &self.node.address
    }

    /// Makes the next `count` writes on this replica fail, for retry tests.
    pub fn fail_next_writes(&self, count: usize) {
        self.node.fail_next_writes.store(count, Ordering::Relaxed);
    }

    fn take_injected_failure(&self) -> bool {
        self.node
            .fail_next_writes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                (remaining > 0).then(|| remaining - 1)
            })
            .is_ok()
    }

    async fn commit(
        &self,
        writes: Vec<(EntryKey, VersionedEntry)>,
        consistency: WriteConsistency,
    ) -> DirectorySnapshot {
        let snapshot = self.node.apply(&writes).await;
        let writes = Arc::new(writes);
        match consistency {
            WriteConsistency::Local => {
                let network = self.network.clone();
                let origin = self.node.address.clone();
                tokio::spawn(async move {
                    network.replicate(&origin, writes).await;
                });
            }
            WriteConsistency::Majority | WriteConsistency::All => {
                self.network.replicate(&self.node.address, writes).await;
            }
        }
        snapshot
    }

    fn guard_write(&self, operation: &str) -> Result<(), DirectoryError> {
        if self.take_injected_failure() {
            warn!(
                component = COMPONENT,
                address = %self.node.address,
                operation,
                "injected write failure"
            );
            return Err(DirectoryError::WriteFailed {
                reason: format!("injected failure of {operation}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicatedDirectory for InMemoryDirectory {
    async fn put(
        &self,
        diff: DirectoryDiff,
        consistency: WriteConsistency,
    ) -> Result<DirectorySnapshot, DirectoryError> {
        self.guard_write("put")?;

        let mut writes = Vec::with_capacity(diff.inserts.len() + diff.deletes.len());
        for (key, values) in diff.inserts {
            if !key.owned_by(&self.node.address) {
                warn!(
                    component = COMPONENT,
                    address = %self.node.address,
                    key = %key,
                    "dropping insert under foreign key"
                );
                continue;
            }
            writes.push((key, VersionedEntry::live(self.node.next_version(), values)));
        }
        for key in diff.deletes {
            writes.push((key, VersionedEntry::tombstone(self.node.next_version())));
        }

        debug!(
            component = COMPONENT,
            address = %self.node.address,
            writes = writes.len(),
            "applying diff"
        );
        Ok(self.commit(writes, consistency).await)
    }

    async fn reset(
        &self,
        state: DirectoryState,
        consistency: WriteConsistency,
    ) -> Result<DirectorySnapshot, DirectoryError> {
        self.guard_write("reset")?;

        // Owned entries absent from the replacement state are tombstoned so a
        // reset fully replaces what this writer previously published.
        let stale: Vec<EntryKey> = {
            let shards = self.node.shards.lock().await;
            shards
                .iter()
                .flat_map(|shard| shard.entries.iter())
                .filter(|(key, entry)| {
                    !entry.deleted
                        && key.owned_by(&self.node.address)
                        && !state.contains_key(*key)
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut writes = Vec::with_capacity(state.len() + stale.len());
        for (key, values) in state {
            if !key.owned_by(&self.node.address) {
                warn!(
                    component = COMPONENT,
                    address = %self.node.address,
                    key = %key,
                    "dropping reset entry under foreign key"
                );
                continue;
            }
            writes.push((key, VersionedEntry::live(self.node.next_version(), values)));
        }
        for key in stale {
            writes.push((key, VersionedEntry::tombstone(self.node.next_version())));
        }

        debug!(
            component = COMPONENT,
            address = %self.node.address,
            writes = writes.len(),
            "applying full reset"
        );
        Ok(self.commit(writes, consistency).await)
    }

    async fn remove_entry(
        &self,
        key: &EntryKey,
        consistency: WriteConsistency,
    ) -> Result<(), DirectoryError> {
        self.guard_write("remove_entry")?;

        // Removal may target another member's key (pruning a dead address),
        // so the tombstone version must beat whatever that writer published.
        let version = {
            let shards = self.node.shards.lock().await;
            shards[shard_for(key, self.node.shard_count)]
                .entries
                .get(key)
                .map(|entry| entry.version + 1)
                .unwrap_or(1)
        };

        self.commit(
            vec![(key.clone(), VersionedEntry::tombstone(version))],
            consistency,
        )
        .await;
        Ok(())
    }

    async fn remove_address(
        &self,
        address: &NodeAddress,
        consistency: WriteConsistency,
    ) -> Result<(), DirectoryError> {
        self.guard_write("remove_address")?;

        let writes: Vec<(EntryKey, VersionedEntry)> = {
            let shards = self.node.shards.lock().await;
            shards
                .iter()
                .flat_map(|shard| shard.entries.iter())
                .filter(|(key, entry)| !entry.deleted && key.owned_by(address))
                .map(|(key, entry)| {
                    (key.clone(), VersionedEntry::tombstone(entry.version + 1))
                })
                .collect()
        };

        if writes.is_empty() {
            return Ok(());
        }

        debug!(
            component = COMPONENT,
            address = %self.node.address,
            removed = %address,
            entries = writes.len(),
            "pruning address"
        );
        self.commit(writes, consistency).await;
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<DirectoryChanged> {
        self.node.change_tx.subscribe()
    }

    async fn read_all(
        &self,
        _consistency: ReadConsistency,
    ) -> Result<DirectorySnapshot, DirectoryError> {
        let shards = self.node.shards.lock().await;
        Ok(self.node.snapshot_locked(&shards))
    }
}
