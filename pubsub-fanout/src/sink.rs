//! Boundary between routing decisions and actual in-process delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::routing::GroupAssignment;
use crate::subscriber::SubscriberRef;

/// A message as handed to the fan-out layer. Topics are the routing tuple;
/// the payload is opaque to routing. `group_index_key` is the value hashed
/// for group-member selection, so messages sharing it stick to the same
/// member while the pool is stable.
#[derive(Clone, Debug)]
pub struct PublishedMessage {
    pub topics: BTreeSet<String>,
    pub payload: serde_json::Value,
    pub group_index_key: String,
}

/// Out-of-band event delivered to a subscriber instead of a message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriberNotice {
    /// The replication substrate is gone for good; registrations are void.
    InfrastructureLost { reason: String },
    /// A lower-address node claimed these acknowledgement labels.
    AckLabelsEvicted { labels: BTreeSet<String> },
}

/// A weak acknowledgement emitted back toward the publishing side.
///
/// "Weak" because it attests that routing state covered the label when the
/// message was resolved, not that any subscriber processed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WeakAck {
    pub label: String,
    pub entity_id: String,
    pub headers: BTreeMap<String, String>,
}

/// How resolved messages, notices and weak acks reach local parties.
///
/// Implemented by the host process; the fan-out layer never blocks on it,
/// so implementations should hand off to their own channels quickly.
#[async_trait]
pub trait LocalSink: Send + Sync {
    async fn deliver(
        &self,
        subscriber: &SubscriberRef,
        message: Arc<PublishedMessage>,
        assignment: &GroupAssignment,
    );

    async fn notify(&self, subscriber: &SubscriberRef, notice: SubscriberNotice);

    async fn deliver_weak_ack(&self, aggregator: &SubscriberRef, ack: WeakAck);
}
