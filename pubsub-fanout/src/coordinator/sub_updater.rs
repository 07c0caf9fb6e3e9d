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

//! The subscription update coordinator task.
//!
//! Owns the local subscription store and is the single writer of this node's
//! subscription entries in the replicated directory. Mutations apply to the
//! store immediately; replication happens in batches on a periodic tick, and
//! requesters are acknowledged once the batch containing their change has
//! completed at the configured consistency.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use replicated_directory::{
    DirectoryDiff, DirectoryError, DirectoryState, NodeAddress, ReplicatedDirectory,
    WriteConsistency,
};

use crate::config::PubSubConfig;
use crate::coordinator::messages::SubRequest;
use crate::error::SubAck;
use crate::observability::events;
use crate::sink::{LocalSink, SubscriberNotice};
use crate::store::{SubscriptionStore, SubscriptionsReader, SubscriptionsUpdate};

const COMPONENT: &str = "sub_updater";

/// A sequence-numbered acknowledgement obligation.
struct AckTicket {
    seq: u64,
    reply: oneshot::Sender<SubAck>,
}

enum WriteOp {
    Reset(DirectoryState),
    Remove,
    Put(DirectoryDiff),
}

struct InFlightWrite {
    /// Sequence number of the last ticket included in the batch.
    batch_seq: u64,
    /// The export the write carries; becomes the baseline on success.
    export: SubscriptionsUpdate,
}

pub(crate) struct SubUpdater {
    address: NodeAddress,
    config: PubSubConfig,
    directory: Arc<dyn ReplicatedDirectory>,
    sink: Arc<dyn LocalSink>,
    store: SubscriptionStore,
    /// Baseline for diffing. `None` forces the next tick to treat local
    /// state as never written (fresh reset or remove).
    baseline: Option<SubscriptionsUpdate>,
    in_flight: Option<InFlightWrite>,
    next_seq: u64,
    pending_write: VecDeque<AckTicket>,
    pending_ack: VecDeque<AckTicket>,
    error_count: u32,
    /// Set when the store changed without producing a replicated diff
    /// (filter-only updates); flushes a reader on the next no-write tick.
    store_dirty: bool,
    reader_tx: watch::Sender<Arc<SubscriptionsReader>>,
    inbox: mpsc::Receiver<SubRequest>,
    self_tx: mpsc::Sender<SubRequest>,
}

impl SubUpdater {
    pub(crate) fn new(
        address: NodeAddress,
        config: PubSubConfig,
        directory: Arc<dyn ReplicatedDirectory>,
        sink: Arc<dyn LocalSink>,
        reader_tx: watch::Sender<Arc<SubscriptionsReader>>,
        inbox: mpsc::Receiver<SubRequest>,
        self_tx: mpsc::Sender<SubRequest>,
    ) -> Self {
        Self {
            address,
            config,
            directory,
            sink,
            store: SubscriptionStore::default(),
            baseline: None,
            in_flight: None,
            next_seq: 0,
            pending_write: VecDeque::new(),
            pending_ack: VecDeque::new(),
            error_count: 0,
            store_dirty: false,
            reader_tx,
            inbox,
            self_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            event = events::TASK_STARTED,
            component = COMPONENT,
            address = %self.address,
            "subscription coordinator running"
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
            "subscription coordinator stopped"
        );
    }

    /// Returns `false` when the task should stop.
    async fn handle(&mut self, request: SubRequest) -> bool {
        match request {
            SubRequest::Subscribe {
                subscriber,
                topics,
                filter,
                group,
                reply,
            } => {
                let changed = self.store.subscribe(subscriber, topics, filter, group);
                debug!(
                    event = events::SUB_STATE_CHANGED,
                    component = COMPONENT,
                    address = %self.address,
                    changed,
                    "subscribe recorded"
                );
                self.store_dirty = true;
                self.enqueue_ticket(reply);
            }
            SubRequest::Unsubscribe {
                subscriber,
                topics,
                reply,
            } => {
                self.store.unsubscribe(&subscriber, &topics);
                self.store_dirty = true;
                self.enqueue_ticket(reply);
            }
            SubRequest::RemoveSubscriber { subscriber } => {
                if self.store.remove_subscriber(&subscriber) {
                    self.store_dirty = true;
                }
            }
            SubRequest::SelfAddressMissing => {
                if !self.store.is_empty() {
                    debug!(
                        event = events::SUB_STATE_CLEARED,
                        component = COMPONENT,
                        address = %self.address,
                        "own entries missing from merged view; forcing reset"
                    );
                    self.baseline = None;
                }
            }
            SubRequest::InfrastructureLost { reason } => {
                self.fail_terminally(&reason).await;
                return false;
            }
            SubRequest::Terminated => return false,
            SubRequest::WriteDone { seq, result } => self.write_done(seq, result),
        }
        true
    }

    fn enqueue_ticket(&mut self, reply: oneshot::Sender<SubAck>) {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.pending_write.push_back(AckTicket {
            seq: self.next_seq,
            reply,
        });
    }

    fn consistent(&self) -> bool {
        self.config.write_consistency != WriteConsistency::Local
    }

    /// Fresh state gets a full reset, a small probability triggers a healing
    /// reset, an emptied store removes the address, everything else writes
    /// the diff (or nothing at all).
    fn tick(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let export = self.store.export();
        let baseline_empty = self.baseline.as_ref().map_or(true, |b| b.is_empty());

        let op = if baseline_empty && !export.is_empty() {
            debug!(
                event = events::SUB_FULL_RESET,
                component = COMPONENT,
                address = %self.address,
                entries = export.entries.len(),
                "writing full state from empty baseline"
            );
            Some(WriteOp::Reset(export.entries.clone()))
        } else if !export.is_empty() && rand::random::<f64>() < self.config.reset_probability {
            debug!(
                event = events::SUB_FULL_RESET,
                component = COMPONENT,
                address = %self.address,
                entries = export.entries.len(),
                "probabilistic healing reset"
            );
            Some(WriteOp::Reset(export.entries.clone()))
        } else if export.is_empty() {
            if baseline_empty && self.baseline.is_some() {
                None
            } else {
                Some(WriteOp::Remove)
            }
        } else {
            // Reachable only with a non-empty baseline.
            let diff = self
                .baseline
                .as_ref()
                .map(|baseline| export.diff(baseline))
                .unwrap_or_default();
            if diff.is_empty() {
                None
            } else {
                Some(WriteOp::Put(diff))
            }
        };

        match op {
            Some(op) => self.issue_write(op, export),
            None => {
                // Nothing to replicate; whatever was requested is already
                // covered by the acknowledged baseline.
                let consistent = self.consistent();
                for ticket in self.pending_write.drain(..) {
                    let _ = ticket.reply.send(SubAck {
                        seq: ticket.seq,
                        consistent,
                    });
                }
                if self.store_dirty {
                    self.publish_reader();
                }
            }
        }
    }

    fn issue_write(&mut self, op: WriteOp, export: SubscriptionsUpdate) {
        let batch_seq = self
            .pending_write
            .back()
            .map_or(self.next_seq, |ticket| ticket.seq);
        self.pending_ack.extend(self.pending_write.drain(..));
        self.in_flight = Some(InFlightWrite { batch_seq, export });

        debug!(
            event = events::SUB_WRITE_START,
            component = COMPONENT,
            address = %self.address,
            batch_seq,
            "issuing subscription write"
        );

        let directory = self.directory.clone();
        let consistency = self.config.write_consistency;
        let address = self.address.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = match op {
                WriteOp::Reset(state) => directory.reset(state, consistency).await.map(|_| ()),
                WriteOp::Put(diff) => directory.put(diff, consistency).await.map(|_| ()),
                WriteOp::Remove => directory.remove_address(&address, consistency).await,
            };
            let _ = self_tx
                .send(SubRequest::WriteDone {
                    seq: batch_seq,
                    result,
                })
                .await;
        });
    }

    fn write_done(&mut self, seq: u64, result: Result<(), DirectoryError>) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        match result {
            Ok(()) => {
                self.error_count = 0;
                self.baseline = Some(in_flight.export);
                self.publish_reader();
                debug!(
                    event = events::SUB_WRITE_OK,
                    component = COMPONENT,
                    address = %self.address,
                    batch_seq = seq,
                    store_size = self.store.estimate_size(),
                    "subscription write completed"
                );
                let consistent = self.consistent();
                while let Some(ticket) = self.pending_ack.pop_front() {
                    let ticket_seq = ticket.seq;
                    let _ = ticket.reply.send(SubAck {
                        seq: ticket_seq,
                        consistent,
                    });
                    if ticket_seq == seq {
                        break;
                    }
                }
            }
            Err(err) => {
                self.error_count = self.error_count.saturating_add(1);
                if self.error_count >= self.config.write_failure_log_threshold {
                    error!(
                        event = events::SUB_WRITE_FAILED,
                        component = COMPONENT,
                        address = %self.address,
                        batch_seq = seq,
                        consecutive_failures = self.error_count,
                        err = %err,
                        "subscription write keeps failing"
                    );
                } else {
                    debug!(
                        event = events::SUB_WRITE_FAILED,
                        component = COMPONENT,
                        address = %self.address,
                        batch_seq = seq,
                        consecutive_failures = self.error_count,
                        err = %err,
                        "subscription write failed; will reset on next tick"
                    );
                }
                // Pending acks stay queued: the next successful write covers
                // their state and drains them. Dropping the baseline forces
                // that write to be a full reset.
                self.baseline = None;
            }
        }
    }

    fn publish_reader(&mut self) {
        self.store_dirty = false;
        let _ = self.reader_tx.send(Arc::new(self.store.snapshot()));
    }

    async fn fail_terminally(&mut self, reason: &str) {
        warn!(
            event = events::INFRASTRUCTURE_LOST,
            component = COMPONENT,
            address = %self.address,
            reason,
            "notifying subscribers and clearing subscription state"
        );
        for subscriber in self.store.subscribers() {
            self.sink
                .notify(
                    &subscriber,
                    SubscriberNotice::InfrastructureLost {
                        reason: reason.to_string(),
                    },
                )
                .await;
        }
        self.store.clear();
        self.baseline = None;
        self.pending_write.clear();
        self.pending_ack.clear();
        self.publish_reader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::WeakAck;
    use crate::subscriber::SubscriberRef;
    use crate::routing::GroupAssignment;
    use crate::sink::PublishedMessage;
    use async_trait::async_trait;
    use replicated_directory::ReplicaNetwork;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct NoticeSink {
        notices: Mutex<Vec<(SubscriberRef, SubscriberNotice)>>,
    }

    #[async_trait]
    impl LocalSink for NoticeSink {
        async fn deliver(
            &self,
            _subscriber: &SubscriberRef,
            _message: Arc<PublishedMessage>,
            _assignment: &GroupAssignment,
        ) {
        }

        async fn notify(&self, subscriber: &SubscriberRef, notice: SubscriberNotice) {
            self.notices
                .lock()
                .expect("notice lock")
                .push((subscriber.clone(), notice));
        }

        async fn deliver_weak_ack(&self, _aggregator: &SubscriberRef, _ack: WeakAck) {}
    }

    fn topics(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    async fn spawn_updater(
        address: &str,
        config: PubSubConfig,
        network: &Arc<ReplicaNetwork>,
        sink: Arc<dyn LocalSink>,
    ) -> (
        mpsc::Sender<SubRequest>,
        watch::Receiver<Arc<SubscriptionsReader>>,
        Arc<replicated_directory::InMemoryDirectory>,
    ) {
        let directory = network
            .attach(NodeAddress::new(address), config.shard_count)
            .await;
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (reader_tx, reader_rx) =
            watch::channel(Arc::new(SubscriptionsReader { rows: Vec::new() }));
        let updater = SubUpdater::new(
            NodeAddress::new(address),
            config,
            directory.clone(),
            sink,
            reader_tx,
            rx,
            tx.clone(),
        );
        tokio::spawn(updater.run());
        (tx, reader_rx, directory)
    }

    fn fast_config() -> PubSubConfig {
        PubSubConfig {
            update_interval_ms: 20,
            reset_probability: 0.0,
            shard_count: 4,
            ..PubSubConfig::default()
        }
    }

    #[tokio::test]
    async fn subscribe_is_acked_after_replicated_write() {
        let network = ReplicaNetwork::new();
        let sink = Arc::new(NoticeSink::default());
        let (tx, mut reader_rx, directory) =
            spawn_updater("node-a", fast_config(), &network, sink).await;

        let subscriber = SubscriberRef::new(NodeAddress::new("node-a"), "s1");
        let (reply, ack) = oneshot::channel();
        tx.send(SubRequest::Subscribe {
            subscriber: subscriber.clone(),
            topics: topics(&["sensor/temp"]),
            filter: None,
            group: None,
            reply,
        })
        .await
        .expect("inbox should accept subscribe");

        let ack = tokio::time::timeout(Duration::from_secs(2), ack)
            .await
            .expect("ack should arrive")
            .expect("reply channel should stay open");
        assert!(!ack.consistent, "default consistency is local");

        reader_rx.changed().await.expect("reader should update");
        assert_eq!(reader_rx.borrow().rows.len(), 1);

        let snapshot = directory
            .read_all(replicated_directory::ReadConsistency::Local)
            .await
            .expect("read should succeed");
        assert!(snapshot
            .entries()
            .any(|(key, _)| key == &subscriber.entry_key()));
    }

    #[tokio::test]
    async fn failed_writes_are_retried_as_one_full_reset() {
        let network = ReplicaNetwork::new();
        let sink = Arc::new(NoticeSink::default());
        let (tx, _reader_rx, directory) =
            spawn_updater("node-a", fast_config(), &network, sink).await;

        // Let the startup remove-tick complete first so the injected
        // failures hit the subscription write.
        tokio::time::sleep(Duration::from_millis(60)).await;
        directory.fail_next_writes(3);

        let subscriber = SubscriberRef::new(NodeAddress::new("node-a"), "s1");
        let (reply, ack) = oneshot::channel();
        tx.send(SubRequest::Subscribe {
            subscriber,
            topics: topics(&["sensor/temp"]),
            filter: None,
            group: None,
            reply,
        })
        .await
        .expect("inbox should accept subscribe");

        // The ack arrives only after the three failures are exhausted and
        // the fourth attempt (a reset, since the baseline was cleared)
        // succeeds.
        let ack = tokio::time::timeout(Duration::from_secs(5), ack)
            .await
            .expect("ack should arrive after retries")
            .expect("reply channel should stay open");
        assert!(ack.seq > 0);

        let snapshot = directory
            .read_all(replicated_directory::ReadConsistency::Local)
            .await
            .expect("read should succeed");
        assert_eq!(snapshot.entries().count(), 1);
    }

    #[tokio::test]
    async fn infrastructure_loss_notifies_all_tracked_subscribers() {
        let network = ReplicaNetwork::new();
        let sink = Arc::new(NoticeSink::default());
        let (tx, _reader_rx, _directory) =
            spawn_updater("node-a", fast_config(), &network, sink.clone()).await;

        let subscriber = SubscriberRef::new(NodeAddress::new("node-a"), "s1");
        let (reply, ack) = oneshot::channel();
        tx.send(SubRequest::Subscribe {
            subscriber: subscriber.clone(),
            topics: topics(&["sensor/temp"]),
            filter: None,
            group: None,
            reply,
        })
        .await
        .expect("inbox should accept subscribe");
        tokio::time::timeout(Duration::from_secs(2), ack)
            .await
            .expect("ack should arrive")
            .expect("reply channel should stay open");

        tx.send(SubRequest::InfrastructureLost {
            reason: "delivery actor terminated".to_string(),
        })
        .await
        .expect("inbox should accept loss signal");

        // The task stops after notifying; closing is observable through the
        // sender.
        tx.closed().await;
        let notices = sink.notices.lock().expect("notice lock");
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, subscriber);
        assert!(matches!(
            notices[0].1,
            SubscriberNotice::InfrastructureLost { .. }
        ));
    }

    #[tokio::test]
    async fn pending_acks_drain_across_sequence_number_wrap() {
        let network = ReplicaNetwork::new();
        let config = fast_config();
        let directory = network
            .attach(NodeAddress::new("node-a"), config.shard_count)
            .await;
        let sink: Arc<dyn LocalSink> = Arc::new(NoticeSink::default());
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (reader_tx, _reader_rx) =
            watch::channel(Arc::new(SubscriptionsReader { rows: Vec::new() }));
        let mut updater = SubUpdater::new(
            NodeAddress::new("node-a"),
            config,
            directory,
            sink,
            reader_tx,
            rx,
            tx,
        );
        // Two tickets straddling the wrap: u64::MAX, then 0.
        updater.next_seq = u64::MAX - 1;

        let subscriber = SubscriberRef::new(NodeAddress::new("node-a"), "s1");
        let (reply, ack_before_wrap) = oneshot::channel();
        assert!(
            updater
                .handle(SubRequest::Subscribe {
                    subscriber: subscriber.clone(),
                    topics: topics(&["sensor/temp"]),
                    filter: None,
                    group: None,
                    reply,
                })
                .await
        );
        let (reply, ack_after_wrap) = oneshot::channel();
        assert!(
            updater
                .handle(SubRequest::Subscribe {
                    subscriber,
                    topics: topics(&["sensor/humidity"]),
                    filter: None,
                    group: None,
                    reply,
                })
                .await
        );
        assert_eq!(updater.pending_write.back().map(|ticket| ticket.seq), Some(0));

        updater.tick();
        let done = tokio::time::timeout(Duration::from_secs(2), updater.inbox.recv())
            .await
            .expect("write completion should arrive")
            .expect("inbox should stay open");
        assert!(matches!(&done, SubRequest::WriteDone { seq: 0, .. }));
        assert!(updater.handle(done).await);

        // The drain must pop past the pre-wrap ticket and stop exactly at
        // the batch sequence, not compare by ordering.
        let ack = ack_before_wrap.await.expect("pre-wrap ack");
        assert_eq!(ack.seq, u64::MAX);
        let ack = ack_after_wrap.await.expect("post-wrap ack");
        assert_eq!(ack.seq, 0);
        assert!(updater.pending_ack.is_empty());
    }
}
