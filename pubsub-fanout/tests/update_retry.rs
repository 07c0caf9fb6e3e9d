mod support;

use std::collections::BTreeSet;
use std::time::Duration;

use pubsub_fanout::{ClusterPubSub, StaticMembership, SubscriberRef};
use replicated_directory::{NodeAddress, ReadConsistency, ReplicaNetwork, ReplicatedDirectory};

use support::{init_tracing, test_config, topics, RecordingSink};

/// A run of failed directory writes must collapse into one full reset, and
/// the pending subscribe must still be acked once that reset lands.
#[tokio::test]
async fn failed_directory_writes_recover_through_a_full_reset() {
    init_tracing();
    let config = test_config();
    let address = NodeAddress::new("node-a");
    let subs_network = ReplicaNetwork::new();
    let acks_network = ReplicaNetwork::new();
    let subs = subs_network.attach(address.clone(), config.shard_count).await;
    let acks = acks_network.attach(address.clone(), config.shard_count).await;
    let sink = std::sync::Arc::new(RecordingSink::default());
    let pubsub = ClusterPubSub::new(
        "retry",
        config,
        address.clone(),
        subs.clone(),
        acks,
        StaticMembership::of_addresses(&["node-a"]),
        sink,
    );

    // Let startup ticks and the first sweep settle before injecting faults.
    tokio::time::sleep(Duration::from_millis(100)).await;
    subs.fail_next_writes(3);

    let subscriber = SubscriberRef::new(address.clone(), "worker");
    let ack = pubsub
        .subscribe(subscriber.clone(), topics(&["orders"]), None, None)
        .await
        .expect("subscribe must survive transient write failures");
    assert!(ack.seq > 0);

    // The directory must hold exactly the entry the reset rewrote.
    let snapshot = subs
        .read_all(ReadConsistency::Local)
        .await
        .expect("read after recovery");
    let entries: Vec<(_, &BTreeSet<String>)> = snapshot.entries().collect();
    assert_eq!(entries.len(), 1);
    let (key, values) = entries[0];
    assert_eq!(key, &subscriber.entry_key());
    assert_eq!(values.len(), 1);
    let encoded = values.iter().next().expect("one encoded unit");
    assert!(encoded.contains("orders"));

    pubsub.shutdown().await;
}
