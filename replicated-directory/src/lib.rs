/********************************************************************************
 * Copyright (c) 2026 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! # replicated-directory
//!
//! `replicated-directory` is the replicated key-value multimap boundary used by
//! the cluster pub/sub fan-out layer. Each cluster member writes entries only
//! under keys it owns (its own node address, or subscriber handles rooted at
//! that address), and the merge function is commutative and idempotent, so the
//! merged view is eventually consistent regardless of replication order.
//!
//! The crate owns three things:
//!
//! - the [`ReplicatedDirectory`] contract: diff writes, full-state resets,
//!   entry/address removal, change notification, and full reads for
//!   reconciliation, each carrying a write or read consistency parameter;
//! - the entry model: sharded maps of [`EntryKey`] to value sets, merged as
//!   per-key versioned registers with removal tombstones;
//! - an in-memory multi-node implementation ([`ReplicaNetwork`]) used by tests
//!   and single-process clusters, with write-failure injection.
//!
//! Values are opaque strings; the caller owns their encoding.

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

mod entry;
mod memory;

pub use entry::{EntryKey, NodeAddress, Shard, ShardContent, VersionedEntry};
pub use memory::{InMemoryDirectory, ReplicaNetwork};

/// How many replicas must durably accept a write before it completes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteConsistency {
    /// The local replica only; replication continues in the background.
    #[default]
    Local,
    /// A majority of replicas.
    Majority,
    /// Every replica.
    All,
}

/// How many replicas a read must consult.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadConsistency {
    /// The local replica only.
    #[default]
    Local,
    /// A majority of replicas.
    Majority,
}

/// Failures of directory reads and writes.
///
/// Any write may fail asynchronously (timeout, unreachable quorum). Callers
/// are expected to retry on their next periodic tick rather than block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DirectoryError {
    /// A write did not reach the requested consistency.
    WriteFailed { reason: String },
    /// A full read did not reach the requested consistency.
    ReadFailed { reason: String },
    /// The directory is shutting down and no longer accepts operations.
    Detached,
}

impl Display for DirectoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::WriteFailed { reason } => {
                write!(f, "replicated write failed: {reason}")
            }
            DirectoryError::ReadFailed { reason } => {
                write!(f, "replicated read failed: {reason}")
            }
            DirectoryError::Detached => write!(f, "directory detached from replica network"),
        }
    }
}

impl Error for DirectoryError {}

/// Per-entry changes of one writer, applied as a single replicated write.
///
/// `inserts` replace the named entries' value sets; `deletes` tombstone them.
/// An empty diff is a no-op and callers normally skip the write entirely.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirectoryDiff {
    pub inserts: BTreeMap<EntryKey, BTreeSet<String>>,
    pub deletes: BTreeSet<EntryKey>,
}

impl DirectoryDiff {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }
}

/// Full state of one writer's entries, used by `reset`.
pub type DirectoryState = BTreeMap<EntryKey, BTreeSet<String>>;

/// Point-in-time merged view of every shard, as seen by one replica.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirectorySnapshot {
    pub shards: Vec<ShardContent>,
}

impl DirectorySnapshot {
    /// All live entries across shards, in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&EntryKey, &BTreeSet<String>)> {
        self.shards.iter().flat_map(|shard| shard.entries.iter())
    }

    /// Distinct address parts of all live entry keys.
    pub fn addresses(&self) -> BTreeSet<String> {
        self.entries()
            .map(|(key, _)| key.address_part().to_string())
            .collect()
    }
}

/// Change notification pushed to subscribed recipients after a merge.
#[derive(Clone, Debug)]
pub struct DirectoryChanged {
    /// The replica's merged view after the change was applied.
    pub snapshot: Arc<DirectorySnapshot>,
}

/// The replicated multimap contract consumed by the fan-out layer.
///
/// Implementations must guarantee a commutative, associative, idempotent
/// merge so reads converge regardless of replication order. Concurrency
/// discipline is "each node writes only its own keys"; conflicting writes
/// from different nodes never target the same key.
#[async_trait]
pub trait ReplicatedDirectory: Send + Sync {
    /// Applies a per-entry diff under this writer's keys.
    async fn put(
        &self,
        diff: DirectoryDiff,
        consistency: WriteConsistency,
    ) -> Result<DirectorySnapshot, DirectoryError>;

    /// Replaces every entry owned by this writer with `state`, tombstoning
    /// owned entries absent from it.
    async fn reset(
        &self,
        state: DirectoryState,
        consistency: WriteConsistency,
    ) -> Result<DirectorySnapshot, DirectoryError>;

    /// Tombstones a single entry. Idempotent.
    async fn remove_entry(
        &self,
        key: &EntryKey,
        consistency: WriteConsistency,
    ) -> Result<(), DirectoryError>;

    /// Tombstones every entry whose key is rooted at `address`. Idempotent;
    /// used to prune members that left the cluster.
    async fn remove_address(
        &self,
        address: &NodeAddress,
        consistency: WriteConsistency,
    ) -> Result<(), DirectoryError>;

    /// Subscribes to merged-state change notifications.
    fn subscribe_changes(&self) -> broadcast::Receiver<DirectoryChanged>;

    /// Reads the full merged view of every shard, for reconciliation.
    async fn read_all(
        &self,
        consistency: ReadConsistency,
    ) -> Result<DirectorySnapshot, DirectoryError>;
}
