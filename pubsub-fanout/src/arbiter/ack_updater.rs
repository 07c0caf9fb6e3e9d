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

//! The acknowledgement-label arbiter task.
//!
//! Owns this node's declared-label relation and is the single writer of the
//! node-address entry in the acks directory. Declarations are checked for
//! uniqueness against local claims and against every lower-address cluster
//! member's replicated claims; claimants beaten by a later-arriving
//! lower-address claim are evicted and notified.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use replicated_directory::{
    DirectoryError, DirectorySnapshot, DirectoryState, EntryKey, NodeAddress,
    ReplicatedDirectory,
};

use crate::arbiter::remote_view::RemoteAckView;
use crate::config::PubSubConfig;
use crate::error::{AcksDeclared, PubSubError};
use crate::observability::events;
use crate::sink::{LocalSink, SubscriberNotice};
use crate::store::GroupedValues;
use crate::subscriber::SubscriberRef;

const COMPONENT: &str = "ack_updater";

/// Requests accepted by the arbiter task.
pub(crate) enum AckRequest {
    Declare {
        subscriber: SubscriberRef,
        group: Option<String>,
        labels: BTreeSet<String>,
        reply: oneshot::Sender<Result<AcksDeclared, PubSubError>>,
    },
    RemoveSubscriber {
        subscriber: SubscriberRef,
    },
    SelfAddressMissing,
    RemoteChanged {
        snapshot: Arc<DirectorySnapshot>,
    },
    InfrastructureLost {
        reason: String,
    },
    Terminated,
    WriteDone {
        result: Result<(), DirectoryError>,
    },
}

/// A winning claim on one label, local or remote.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AckClaim {
    pub address: NodeAddress,
    pub group: Option<String>,
    /// `Some` when the claim is held by a subscriber on this node.
    pub subscriber: Option<SubscriberRef>,
}

/// Snapshot of every known label claim, published for weak-acknowledgement
/// computation on publish.
#[derive(Clone, Debug, Default)]
pub(crate) struct AckLabelView {
    pub claims: BTreeMap<String, AckClaim>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct AckRecord {
    group: Option<String>,
    labels: BTreeSet<String>,
}

/// Local-vs-local and local-vs-remote uniqueness check for one declaration.
/// Returns the first conflicting label.
fn declare_conflict(
    local: &BTreeMap<SubscriberRef, AckRecord>,
    remote: &RemoteAckView,
    address: &NodeAddress,
    subscriber: &SubscriberRef,
    group: Option<&str>,
    labels: &BTreeSet<String>,
) -> Option<String> {
    if let Some(group) = group {
        // Group membership replaces wholesale: joining an established group
        // requires declaring exactly its label set.
        let established: BTreeSet<String> = local
            .iter()
            .filter(|(other, record)| {
                *other != subscriber && record.group.as_deref() == Some(group)
            })
            .flat_map(|(_, record)| record.labels.iter().cloned())
            .collect();
        if !established.is_empty() && established != *labels {
            let conflict = labels
                .symmetric_difference(&established)
                .next()
                .cloned()
                .unwrap_or_default();
            return Some(conflict);
        }
    }
    for label in labels {
        for (other, record) in local {
            if other == subscriber || !record.labels.contains(label) {
                continue;
            }
            let same_group = matches!(
                (record.group.as_deref(), group),
                (Some(theirs), Some(ours)) if theirs == ours
            );
            if !same_group {
                return Some(label.clone());
            }
        }
        if remote.beats(label, address, group) {
            return Some(label.clone());
        }
    }
    None
}

pub(crate) struct AckUpdater {
    address: NodeAddress,
    config: PubSubConfig,
    directory: Arc<dyn ReplicatedDirectory>,
    sink: Arc<dyn LocalSink>,
    local: BTreeMap<SubscriberRef, AckRecord>,
    remote: RemoteAckView,
    /// `None` forces a full write on the next tick.
    baseline: Option<DirectoryState>,
    in_flight: Option<DirectoryState>,
    error_count: u32,
    view_tx: watch::Sender<Arc<AckLabelView>>,
    inbox: mpsc::Receiver<AckRequest>,
    self_tx: mpsc::Sender<AckRequest>,
}

impl AckUpdater {
    pub(crate) fn new(
        address: NodeAddress,
        config: PubSubConfig,
        directory: Arc<dyn ReplicatedDirectory>,
        sink: Arc<dyn LocalSink>,
        view_tx: watch::Sender<Arc<AckLabelView>>,
        inbox: mpsc::Receiver<AckRequest>,
        self_tx: mpsc::Sender<AckRequest>,
    ) -> Self {
        Self {
            address,
            config,
            directory,
            sink,
            local: BTreeMap::new(),
            remote: RemoteAckView::default(),
            baseline: None,
            in_flight: None,
            error_count: 0,
            view_tx,
            inbox,
            self_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            event = events::TASK_STARTED,
            component = COMPONENT,
            address = %self.address,
            "ack-label arbiter running"
        );
        let mut ticker = tokio::time::interval(self.config.update_interval());
        loop {
            tokio::select! {
                request = self.inbox.recv() => match request {
                    Some(request) => {
                        if !self.handle(request).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.tick(),
            }
        }
        info!(
            event = events::TASK_TERMINATED,
            component = COMPONENT,
            address = %self.address,
            "ack-label arbiter stopped"
        );
    }

    async fn handle(&mut self, request: AckRequest) -> bool {
        match request {
            AckRequest::Declare {
                subscriber,
                group,
                labels,
                reply,
            } => {
                let result = self.declare(subscriber, group, labels);
                let _ = reply.send(result);
            }
            AckRequest::RemoveSubscriber { subscriber } => {
                if self.local.remove(&subscriber).is_some() {
                    self.publish_view();
                }
            }
            AckRequest::SelfAddressMissing => {
                if !self.local.is_empty() {
                    debug!(
                        event = events::ACK_FULL_RESET,
                        component = COMPONENT,
                        address = %self.address,
                        "own claims missing from merged view; forcing reset"
                    );
                    self.baseline = None;
                }
            }
            AckRequest::RemoteChanged { snapshot } => self.remote_changed(&snapshot).await,
            AckRequest::InfrastructureLost { reason } => {
                self.fail_terminally(&reason).await;
                return false;
            }
            AckRequest::Terminated => return false,
            AckRequest::WriteDone { result } => self.write_done(result),
        }
        true
    }

    fn declare(
        &mut self,
        subscriber: SubscriberRef,
        group: Option<String>,
        labels: BTreeSet<String>,
    ) -> Result<AcksDeclared, PubSubError> {
        if let Some(label) = declare_conflict(
            &self.local,
            &self.remote,
            &self.address,
            &subscriber,
            group.as_deref(),
            &labels,
        ) {
            debug!(
                event = events::ACK_DECLARE_REJECTED,
                component = COMPONENT,
                address = %self.address,
                subscriber = %subscriber,
                label = label.as_str(),
                "declaration rejected"
            );
            return Err(PubSubError::AckLabelNotUnique { label });
        }
        debug!(
            event = events::ACK_DECLARE_OK,
            component = COMPONENT,
            address = %self.address,
            subscriber = %subscriber,
            labels = labels.len(),
            "labels declared"
        );
        self.local.insert(
            subscriber,
            AckRecord {
                group,
                labels: labels.clone(),
            },
        );
        self.publish_view();
        Ok(AcksDeclared { labels })
    }

    async fn remote_changed(&mut self, snapshot: &DirectorySnapshot) {
        self.remote = RemoteAckView::from_snapshot(snapshot, &self.address);

        let evicted: Vec<SubscriberRef> = self
            .local
            .iter()
            .filter(|(_, record)| {
                record
                    .labels
                    .iter()
                    .any(|label| self.remote.beats(label, &self.address, record.group.as_deref()))
            })
            .map(|(subscriber, _)| subscriber.clone())
            .collect();
        for subscriber in evicted {
            if let Some(record) = self.local.remove(&subscriber) {
                warn!(
                    event = events::ACK_LABELS_EVICTED,
                    component = COMPONENT,
                    address = %self.address,
                    subscriber = %subscriber,
                    labels = record.labels.len(),
                    "claims lost to a lower-address member"
                );
                self.sink
                    .notify(
                        &subscriber,
                        SubscriberNotice::AckLabelsEvicted {
                            labels: record.labels,
                        },
                    )
                    .await;
            }
        }
        self.publish_view();
    }

    fn export(&self) -> DirectoryState {
        let values: BTreeSet<String> = self
            .local
            .values()
            .map(|record| {
                GroupedValues {
                    group: record.group.clone(),
                    values: record.labels.clone(),
                }
                .encode()
            })
            .collect();
        let mut state = DirectoryState::new();
        if !values.is_empty() {
            state.insert(EntryKey::for_address(&self.address), values);
        }
        state
    }

    /// Same decision policy as the subscription coordinator, over the single
    /// node-address entry.
    fn tick(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let export = self.export();
        let baseline_empty = self.baseline.as_ref().map_or(true, |b| b.is_empty());

        let write = if baseline_empty && !export.is_empty() {
            debug!(
                event = events::ACK_FULL_RESET,
                component = COMPONENT,
                address = %self.address,
                "writing full claim state from empty baseline"
            );
            true
        } else if !export.is_empty() && rand::random::<f64>() < self.config.reset_probability {
            debug!(
                event = events::ACK_FULL_RESET,
                component = COMPONENT,
                address = %self.address,
                "probabilistic healing reset"
            );
            true
        } else {
            self.baseline.as_ref() != Some(&export)
        };
        if !write {
            return;
        }

        self.in_flight = Some(export.clone());
        let directory = self.directory.clone();
        let consistency = self.config.write_consistency;
        let address = self.address.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            // A single owned entry makes reset and diff equivalent; reset
            // also clears stale claims left by a crashed predecessor.
            let result = if export.is_empty() {
                directory.remove_address(&address, consistency).await
            } else {
                directory.reset(export, consistency).await.map(|_| ())
            };
            let _ = self_tx.send(AckRequest::WriteDone { result }).await;
        });
    }

    fn write_done(&mut self, result: Result<(), DirectoryError>) {
        let Some(written) = self.in_flight.take() else {
            return;
        };
        match result {
            Ok(()) => {
                self.error_count = 0;
                self.baseline = Some(written);
                debug!(
                    event = events::ACK_WRITE_OK,
                    component = COMPONENT,
                    address = %self.address,
                    claims = self.local.len(),
                    "claim write completed"
                );
            }
            Err(err) => {
                self.error_count = self.error_count.saturating_add(1);
                if self.error_count >= self.config.write_failure_log_threshold {
                    error!(
                        event = events::ACK_WRITE_FAILED,
                        component = COMPONENT,
                        address = %self.address,
                        consecutive_failures = self.error_count,
                        err = %err,
                        "claim write keeps failing"
                    );
                } else {
                    debug!(
                        event = events::ACK_WRITE_FAILED,
                        component = COMPONENT,
                        address = %self.address,
                        consecutive_failures = self.error_count,
                        err = %err,
                        "claim write failed; will reset on next tick"
                    );
                }
                self.baseline = None;
            }
        }
    }

    /// Rebuilds and publishes the merged claim view, local claims included.
    /// On a label claimed both sides, the lower address wins, same as the
    /// remote fold.
    fn publish_view(&self) {
        let mut claims: BTreeMap<String, AckClaim> = self
            .remote
            .owners()
            .iter()
            .map(|(label, claim)| {
                (
                    label.clone(),
                    AckClaim {
                        address: claim.address.clone(),
                        group: claim.group.clone(),
                        subscriber: None,
                    },
                )
            })
            .collect();
        for (subscriber, record) in &self.local {
            for label in &record.labels {
                let remote_wins = claims
                    .get(label)
                    .is_some_and(|existing| existing.address < self.address);
                if !remote_wins {
                    claims.insert(
                        label.clone(),
                        AckClaim {
                            address: self.address.clone(),
                            group: record.group.clone(),
                            subscriber: Some(subscriber.clone()),
                        },
                    );
                }
            }
        }
        let _ = self.view_tx.send(Arc::new(AckLabelView { claims }));
    }

    async fn fail_terminally(&mut self, reason: &str) {
        warn!(
            event = events::INFRASTRUCTURE_LOST,
            component = COMPONENT,
            address = %self.address,
            reason,
            "dropping declared labels and notifying claimants"
        );
        let claimants: Vec<SubscriberRef> = self.local.keys().cloned().collect();
        for subscriber in claimants {
            self.sink
                .notify(
                    &subscriber,
                    SubscriberNotice::InfrastructureLost {
                        reason: reason.to_string(),
                    },
                )
                .await;
        }
        self.local.clear();
        self.baseline = None;
        self.publish_view();
    }
}
