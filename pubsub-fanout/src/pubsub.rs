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

//! The cluster pub/sub facade: wires the coordinator, arbiter, reconciler
//! and index-rebuild tasks over a pair of replicated directories and exposes
//! the public subscribe/declare/publish surface.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use replicated_directory::{DirectoryChanged, NodeAddress, ReplicatedDirectory};

use crate::arbiter::{AckLabelView, AckRequest, AckUpdater};
use crate::cluster::ClusterMembership;
use crate::config::PubSubConfig;
use crate::coordinator::{SubRequest, SubUpdater};
use crate::error::{AcksDeclared, PubSubError, SubAck};
use crate::hashing::TopicHasher;
use crate::observability::events;
use crate::reconciler::ClusterSync;
use crate::routing::{assign_groups_to_subscribers, PublisherIndex, RoutingRecord};
use crate::sink::{LocalSink, PublishedMessage, WeakAck};
use crate::store::{SubscriptionsReader, TopicFilter};
use crate::subscriber::SubscriberRef;

const COMPONENT: &str = "cluster_pubsub";

/// Acknowledgement demand attached to a publish: which labels the publisher
/// wants covered, and where to send weak acks for the uncovered ones.
#[derive(Clone, Debug)]
pub struct AckDemand {
    pub labels: BTreeSet<String>,
    pub entity_id: String,
    pub headers: std::collections::BTreeMap<String, String>,
    pub aggregator: SubscriberRef,
}

/// One node's entry point into the cluster-wide fan-out layer.
///
/// Owns the background tasks for this node; dropping it without calling
/// [`ClusterPubSub::shutdown`] leaves them running until their channels
/// close.
pub struct ClusterPubSub {
    name: String,
    address: NodeAddress,
    config: PubSubConfig,
    sink: Arc<dyn LocalSink>,
    hasher: TopicHasher,
    sub_tx: mpsc::Sender<SubRequest>,
    ack_tx: mpsc::Sender<AckRequest>,
    index: watch::Receiver<Arc<PublisherIndex>>,
    ack_view: watch::Receiver<Arc<AckLabelView>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterPubSub {
    /// Spawns the node's tasks and returns the ready facade.
    ///
    /// `subscriptions` and `acks` are two independent replicated directories
    /// (subscription entries are keyed per subscriber, ack claims per node).
    pub fn new(
        name: impl Into<String>,
        config: PubSubConfig,
        address: NodeAddress,
        subscriptions: Arc<dyn ReplicatedDirectory>,
        acks: Arc<dyn ReplicatedDirectory>,
        membership: Arc<dyn ClusterMembership>,
        sink: Arc<dyn LocalSink>,
    ) -> Arc<Self> {
        let name = name.into();
        let hasher = TopicHasher::new(config.hash_seed, config.hash_family_size);

        let (sub_tx, sub_rx) = mpsc::channel(config.channel_capacity);
        let (ack_tx, ack_rx) = mpsc::channel(config.channel_capacity);
        let (reader_tx, reader_rx) = watch::channel(Arc::new(SubscriptionsReader::default()));
        let (view_tx, view_rx) = watch::channel(Arc::new(AckLabelView::default()));
        let (index_tx, index_rx) = watch::channel(Arc::new(PublisherIndex::default()));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            SubUpdater::new(
                address.clone(),
                config.clone(),
                subscriptions.clone(),
                sink.clone(),
                reader_tx,
                sub_rx,
                sub_tx.clone(),
            )
            .run(),
        ));
        tasks.push(tokio::spawn(
            AckUpdater::new(
                address.clone(),
                config.clone(),
                acks.clone(),
                sink.clone(),
                view_tx,
                ack_rx,
                ack_tx.clone(),
            )
            .run(),
        ));
        tasks.push(tokio::spawn(
            ClusterSync::new(
                address.clone(),
                config.clone(),
                subscriptions.clone(),
                acks.clone(),
                membership,
                sub_tx.clone(),
                ack_tx.clone(),
            )
            .run(),
        ));
        tasks.push(tokio::spawn(Self::index_task(
            name.clone(),
            hasher.clone(),
            reader_rx,
            subscriptions,
            index_tx,
        )));
        tasks.push(tokio::spawn(Self::ack_change_task(acks, ack_tx.clone())));

        info!(
            event = events::TASK_STARTED,
            component = COMPONENT,
            name = name.as_str(),
            address = %address,
            "cluster pub/sub node started"
        );
        Arc::new(Self {
            name,
            address,
            config,
            sink,
            hasher,
            sub_tx,
            ack_tx,
            index: index_rx,
            ack_view: view_rx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Rebuilds the merged publisher index whenever the local store or the
    /// replicated subscription view changes. Wholesale replacement, never
    /// in-place mutation.
    async fn index_task(
        name: String,
        hasher: TopicHasher,
        mut reader_rx: watch::Receiver<Arc<SubscriptionsReader>>,
        directory: Arc<dyn ReplicatedDirectory>,
        index_tx: watch::Sender<Arc<PublisherIndex>>,
    ) {
        let mut changes = directory.subscribe_changes();
        let mut local = PublisherIndex::default();
        let mut remote = PublisherIndex::default();
        loop {
            tokio::select! {
                changed = reader_rx.changed() => match changed {
                    Ok(()) => {
                        let reader = reader_rx.borrow_and_update().clone();
                        local = PublisherIndex::from_reader(&reader, &hasher);
                    }
                    Err(_) => break,
                },
                event = changes.recv() => match event {
                    Ok(DirectoryChanged { snapshot }) => {
                        remote = PublisherIndex::from_directory(&snapshot, &hasher);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            event = events::CHANGES_LAGGED,
                            component = COMPONENT,
                            name = name.as_str(),
                            skipped,
                            "subscription change stream lagged; rereading"
                        );
                        if let Ok(snapshot) = directory
                            .read_all(replicated_directory::ReadConsistency::Local)
                            .await
                        {
                            remote = PublisherIndex::from_directory(&snapshot, &hasher);
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
            // The local shard is passed last so its filter-bearing rows win
            // a (topic, subscriber) collision with the replicated echo.
            let merged = PublisherIndex::union([remote.clone(), local.clone()]);
            debug!(
                event = events::INDEX_REBUILD_OK,
                component = COMPONENT,
                name = name.as_str(),
                topics = merged.topic_count(),
                "publisher index rebuilt"
            );
            if index_tx.send(Arc::new(merged)).is_err() {
                break;
            }
        }
        debug!(
            event = events::CHANGES_CLOSED,
            component = COMPONENT,
            name = name.as_str(),
            "index rebuild inputs closed"
        );
    }

    /// Forwards ack-directory changes to the arbiter inbox.
    async fn ack_change_task(
        directory: Arc<dyn ReplicatedDirectory>,
        ack_tx: mpsc::Sender<AckRequest>,
    ) {
        let mut changes = directory.subscribe_changes();
        loop {
            match changes.recv().await {
                Ok(DirectoryChanged { snapshot }) => {
                    if ack_tx
                        .send(AckRequest::RemoteChanged { snapshot })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => {
                    if let Ok(snapshot) = directory
                        .read_all(replicated_directory::ReadConsistency::Local)
                        .await
                    {
                        if ack_tx
                            .send(AckRequest::RemoteChanged {
                                snapshot: Arc::new(snapshot),
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers topics for a subscriber. Resolves once the batch carrying
    /// the change completed at the configured write consistency.
    pub async fn subscribe(
        &self,
        subscriber: SubscriberRef,
        topics: BTreeSet<String>,
        filter: Option<TopicFilter>,
        group: Option<String>,
    ) -> Result<SubAck, PubSubError> {
        let (reply, acked) = oneshot::channel();
        self.sub_tx
            .send(SubRequest::Subscribe {
                subscriber,
                topics,
                filter,
                group,
                reply,
            })
            .await
            .map_err(|_| PubSubError::ChannelClosed)?;
        acked.await.map_err(|_| PubSubError::ChannelClosed)
    }

    pub async fn unsubscribe(
        &self,
        subscriber: SubscriberRef,
        topics: BTreeSet<String>,
    ) -> Result<SubAck, PubSubError> {
        let (reply, acked) = oneshot::channel();
        self.sub_tx
            .send(SubRequest::Unsubscribe {
                subscriber,
                topics,
                reply,
            })
            .await
            .map_err(|_| PubSubError::ChannelClosed)?;
        acked.await.map_err(|_| PubSubError::ChannelClosed)
    }

    /// Claims acknowledgement labels for a subscriber, cluster-unique per
    /// group. Fails fast with [`PubSubError::AckLabelNotUnique`]; a claim
    /// that succeeds now can still be evicted later by a lower-address node.
    pub async fn declare_acks(
        &self,
        subscriber: SubscriberRef,
        group: Option<String>,
        labels: BTreeSet<String>,
    ) -> Result<AcksDeclared, PubSubError> {
        let (reply, answered) = oneshot::channel();
        self.ack_tx
            .send(AckRequest::Declare {
                subscriber,
                group,
                labels,
                reply,
            })
            .await
            .map_err(|_| PubSubError::ChannelClosed)?;
        answered.await.map_err(|_| PubSubError::ChannelClosed)?
    }

    /// Drops all registrations and claims of one subscriber. Idempotent;
    /// also the liveness feedback path for dead local subscribers.
    pub async fn remove_subscriber(&self, subscriber: SubscriberRef) {
        let _ = self
            .sub_tx
            .send(SubRequest::RemoveSubscriber {
                subscriber: subscriber.clone(),
            })
            .await;
        let _ = self
            .ack_tx
            .send(AckRequest::RemoveSubscriber { subscriber })
            .await;
    }

    /// Resolves the recipient set for `message` and delivers to recipients
    /// on this node. Returns every routing record, local and remote.
    pub async fn publish(&self, message: PublishedMessage) -> Vec<RoutingRecord> {
        let index = self.index.borrow().clone();
        let probably_subscribed = message
            .topics
            .iter()
            .any(|topic| index.probably_subscribed(&self.hasher.approximate(topic)));
        if !probably_subscribed {
            debug!(
                event = events::PUBLISH_FASTPATH_SKIP,
                component = COMPONENT,
                name = self.name.as_str(),
                "no topic of the message is subscribed anywhere"
            );
            return Vec::new();
        }

        let records = assign_groups_to_subscribers(
            &index,
            &message.topics,
            self.hasher.index_hash(&message.group_index_key),
            &self.config.group_pre_divisors,
        );
        debug!(
            event = events::PUBLISH_RESOLVED,
            component = COMPONENT,
            name = self.name.as_str(),
            recipients = records.len(),
            "publish resolved"
        );

        let shared = Arc::new(message);
        for record in &records {
            if record.subscriber.address == self.address {
                self.sink
                    .deliver(&record.subscriber, shared.clone(), &record.assignment)
                    .await;
            }
        }
        records
    }

    /// Like [`ClusterPubSub::publish`], additionally emitting a weak
    /// acknowledgement for every demanded label that is declared somewhere
    /// in the cluster but received no delivery from this publish.
    pub async fn publish_with_ack(
        &self,
        message: PublishedMessage,
        demand: AckDemand,
    ) -> Vec<RoutingRecord> {
        let records = self.publish(message).await;
        let view = self.ack_view.borrow().clone();

        for label in &demand.labels {
            let Some(claim) = view.claims.get(label) else {
                continue;
            };
            let covered = match &claim.group {
                Some(group) => records
                    .iter()
                    .any(|record| record.assignment.groups.contains_key(group)),
                None => match &claim.subscriber {
                    Some(subscriber) => records
                        .iter()
                        .any(|record| &record.subscriber == subscriber),
                    None => records
                        .iter()
                        .any(|record| record.subscriber.address == claim.address),
                },
            };
            if !covered {
                debug!(
                    event = events::WEAK_ACK_EMITTED,
                    component = COMPONENT,
                    name = self.name.as_str(),
                    label = label.as_str(),
                    "declared label received no delivery"
                );
                self.sink
                    .deliver_weak_ack(
                        &demand.aggregator,
                        WeakAck {
                            label: label.clone(),
                            entity_id: demand.entity_id.clone(),
                            headers: demand.headers.clone(),
                        },
                    )
                    .await;
            }
        }
        records
    }

    /// Declares the local delivery infrastructure permanently gone: every
    /// subscriber gets a terminal notice and all replicated state of this
    /// node is abandoned.
    pub async fn signal_infrastructure_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let _ = self
            .sub_tx
            .send(SubRequest::InfrastructureLost {
                reason: reason.clone(),
            })
            .await;
        let _ = self
            .ack_tx
            .send(AckRequest::InfrastructureLost { reason })
            .await;
    }

    /// Orderly shutdown of every background task.
    pub async fn shutdown(&self) {
        let _ = self.sub_tx.send(SubRequest::Terminated).await;
        let _ = self.ack_tx.send(AckRequest::Terminated).await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!(
            event = events::TASK_TERMINATED,
            component = COMPONENT,
            name = self.name.as_str(),
            address = %self.address,
            "cluster pub/sub node stopped"
        );
    }
}
