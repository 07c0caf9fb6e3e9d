#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use pubsub_fanout::{
    ClusterMembership, ClusterPubSub, GroupAssignment, LocalSink, PubSubConfig, PublishedMessage,
    SubscriberNotice, SubscriberRef, WeakAck,
};
use replicated_directory::{NodeAddress, ReplicaNetwork};

/// Sink that records everything it is handed, for assertions.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub deliveries: Mutex<Vec<(SubscriberRef, Arc<PublishedMessage>, GroupAssignment)>>,
    pub notices: Mutex<Vec<(SubscriberRef, SubscriberNotice)>>,
    pub weak_acks: Mutex<Vec<(SubscriberRef, WeakAck)>>,
}

impl RecordingSink {
    pub(crate) fn delivered_to(&self) -> Vec<SubscriberRef> {
        self.deliveries
            .lock()
            .expect("delivery lock")
            .iter()
            .map(|(subscriber, _, _)| subscriber.clone())
            .collect()
    }

    pub(crate) fn weak_ack_labels(&self) -> Vec<String> {
        self.weak_acks
            .lock()
            .expect("weak-ack lock")
            .iter()
            .map(|(_, ack)| ack.label.clone())
            .collect()
    }
}

#[async_trait]
impl LocalSink for RecordingSink {
    async fn deliver(
        &self,
        subscriber: &SubscriberRef,
        message: Arc<PublishedMessage>,
        assignment: &GroupAssignment,
    ) {
        self.deliveries.lock().expect("delivery lock").push((
            subscriber.clone(),
            message,
            assignment.clone(),
        ));
    }

    async fn notify(&self, subscriber: &SubscriberRef, notice: SubscriberNotice) {
        self.notices
            .lock()
            .expect("notice lock")
            .push((subscriber.clone(), notice));
    }

    async fn deliver_weak_ack(&self, aggregator: &SubscriberRef, ack: WeakAck) {
        self.weak_acks
            .lock()
            .expect("weak-ack lock")
            .push((aggregator.clone(), ack));
    }
}

/// Installs a per-test tracing subscriber; later calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Short intervals and no probabilistic resets, so tests are fast and
/// deterministic.
pub(crate) fn test_config() -> PubSubConfig {
    PubSubConfig {
        update_interval_ms: 20,
        sync_interval_base_ms: 200,
        sync_interval_jitter_ms: 50,
        reset_probability: 0.0,
        shard_count: 4,
        ..PubSubConfig::default()
    }
}

/// One node of a single-process test cluster sharing both replica networks.
pub(crate) struct TestNode {
    pub pubsub: Arc<ClusterPubSub>,
    pub sink: Arc<RecordingSink>,
    pub address: NodeAddress,
}

pub(crate) async fn make_node(
    name: &str,
    address: &str,
    subs: &Arc<ReplicaNetwork>,
    acks: &Arc<ReplicaNetwork>,
    membership: Arc<dyn ClusterMembership>,
) -> TestNode {
    init_tracing();
    let config = test_config();
    let address = NodeAddress::new(address);
    let sink = Arc::new(RecordingSink::default());
    let pubsub = ClusterPubSub::new(
        name,
        config.clone(),
        address.clone(),
        subs.attach(address.clone(), config.shard_count).await,
        acks.attach(address.clone(), config.shard_count).await,
        membership,
        sink.clone(),
    );
    TestNode {
        pubsub,
        sink,
        address,
    }
}

pub(crate) fn topics(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| item.to_string()).collect()
}

pub(crate) fn message(topic: &str, key: &str) -> PublishedMessage {
    PublishedMessage {
        topics: topics(&[topic]),
        payload: serde_json::json!({ "topic": topic }),
        group_index_key: key.to_string(),
    }
}

/// Publishes until the resolved recipient set is non-empty or the deadline
/// passes; index rebuilds trail subscribe acks.
pub(crate) async fn publish_until_resolved(
    node: &TestNode,
    build: impl Fn() -> PublishedMessage,
) -> Vec<pubsub_fanout::RoutingRecord> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let records = node.pubsub.publish(build()).await;
        if !records.is_empty() {
            return records;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "publish never resolved any recipient"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
