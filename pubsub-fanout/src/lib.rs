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

//! # pubsub-fanout
//!
//! `pubsub-fanout` implements cluster-wide publish/subscribe fan-out with
//! declared-acknowledgement-label arbitration over an eventually consistent
//! replicated directory.
//!
//! Each node runs one [`ClusterPubSub`] facade over two replicated
//! directories (subscription entries and ack-label claims), a cluster
//! membership view, and a [`LocalSink`] for in-process delivery. Subscription
//! state replicates in batched diffs on a periodic tick; routing happens
//! against an atomically replaced publisher index so publishes never block
//! on replication. All conflict resolution is deterministic: for
//! delivery groups, the candidate pick is a pure function of the message's
//! group index key and the address-sorted candidate pool; for ack labels,
//! the lowest claiming node address wins.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use pubsub_fanout::{
//!     ClusterPubSub, PubSubConfig, PublishedMessage, StaticMembership, SubscriberRef,
//! };
//! use replicated_directory::{NodeAddress, ReplicaNetwork};
//!
//! # pub mod null_sink {
//! #     use std::sync::Arc;
//! #     use async_trait::async_trait;
//! #     use pubsub_fanout::{
//! #         GroupAssignment, LocalSink, PublishedMessage, SubscriberNotice, SubscriberRef,
//! #         WeakAck,
//! #     };
//! #
//! #     pub struct NullSink;
//! #
//! #     #[async_trait]
//! #     impl LocalSink for NullSink {
//! #         async fn deliver(
//! #             &self,
//! #             _subscriber: &SubscriberRef,
//! #             _message: Arc<PublishedMessage>,
//! #             _assignment: &GroupAssignment,
//! #         ) {
//! #         }
//! #         async fn notify(&self, _subscriber: &SubscriberRef, _notice: SubscriberNotice) {}
//! #         async fn deliver_weak_ack(&self, _aggregator: &SubscriberRef, _ack: WeakAck) {}
//! #     }
//! # }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = PubSubConfig::default();
//! let subs = ReplicaNetwork::new();
//! let acks = ReplicaNetwork::new();
//! let address = NodeAddress::new("node-a");
//!
//! let node = ClusterPubSub::new(
//!     "quick-start",
//!     config.clone(),
//!     address.clone(),
//!     subs.attach(address.clone(), config.shard_count).await,
//!     acks.attach(address.clone(), config.shard_count).await,
//!     StaticMembership::of_addresses(&["node-a"]),
//!     Arc::new(null_sink::NullSink),
//! );
//!
//! let subscriber = SubscriberRef::new(address, "telemetry");
//! node.subscribe(
//!     subscriber,
//!     ["sensor/temp".to_string()].into_iter().collect(),
//!     None,
//!     None,
//! )
//! .await
//! .unwrap();
//!
//! // The publisher index rebuilds asynchronously behind the subscribe ack.
//! let mut records = Vec::new();
//! for _ in 0..100 {
//!     records = node
//!         .publish(PublishedMessage {
//!             topics: ["sensor/temp".to_string()].into_iter().collect(),
//!             payload: serde_json::json!({"celsius": 21.5}),
//!             group_index_key: "device-42".to_string(),
//!         })
//!         .await;
//!     if !records.is_empty() {
//!         break;
//!     }
//!     tokio::time::sleep(Duration::from_millis(20)).await;
//! }
//! assert_eq!(records.len(), 1);
//! node.shutdown().await;
//! # });
//! ```
//!
//! ## Internal architecture map
//!
//! - API facade: [`ClusterPubSub`] and the boundary traits
//! - Coordinator: subscription store ownership and batched directory writes
//! - Arbiter: ack-label claims and lowest-address conflict resolution
//! - Routing: publisher index rebuilds and deterministic group assignment
//! - Reconciler: membership-driven pruning of departed nodes' entries
//!
//! ## Observability model
//!
//! The workspace uses `tracing` for logs/events. Library code emits events
//! and does not initialize a global subscriber; binaries and tests own
//! one-time `tracing_subscriber` initialization.

mod arbiter;
mod coordinator;
mod reconciler;

mod cluster;
pub use cluster::{
    ClusterMembership, ClusterState, Member, MemberStatus, MembershipEvent, StaticMembership,
};

mod config;
pub use config::PubSubConfig;

mod error;
pub use error::{AcksDeclared, PubSubError, SubAck};

mod hashing;
pub use hashing::{TopicHasher, TopicHashes};

pub mod observability;

mod routing;
pub use routing::{GroupAssignment, RoutingRecord};

mod sink;
pub use sink::{LocalSink, PublishedMessage, SubscriberNotice, WeakAck};

mod store;
pub use store::TopicFilter;

mod subscriber;
pub use subscriber::SubscriberRef;

mod pubsub;
pub use pubsub::{AckDemand, ClusterPubSub};
