//! Derived, rebuildable routing table from topic to subscriber to groups.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use replicated_directory::DirectorySnapshot;

use crate::hashing::{TopicHasher, TopicHashes};
use crate::store::{GroupedValues, SubscriptionsReader, TopicFilter};
use crate::subscriber::SubscriberRef;

/// Group-name sentinel for ungrouped (wildcard-delivery) membership.
pub const UNGROUPED: &str = "";

/// Read-only routing table.
///
/// Created empty, replaced atomically on every change notification, never
/// mutated in place. Construction is a pure fold over subscription rows or
/// decoded directory entries.
#[derive(Clone, Default)]
pub struct PublisherIndex {
    routes: BTreeMap<String, BTreeMap<SubscriberRef, BTreeSet<String>>>,
    filters: BTreeMap<SubscriberRef, TopicFilter>,
    topic_hashes: HashSet<u64>,
}

impl PublisherIndex {
    /// Builds the local index from a store snapshot. Filters are only known
    /// locally, so only this constructor populates them.
    pub fn from_reader(reader: &SubscriptionsReader, hasher: &TopicHasher) -> Self {
        let mut index = Self::default();
        for row in &reader.rows {
            let group = row.group.clone().unwrap_or_else(|| UNGROUPED.to_string());
            for topic in &row.topics {
                index.fold_in(topic, &row.subscriber, &group, hasher);
            }
            if let Some(filter) = &row.filter {
                index.filters.insert(row.subscriber.clone(), filter.clone());
            }
        }
        index
    }

    /// Builds the cluster-wide index from the directory's merged view.
    ///
    /// Bare-address entries (ack-label claims) and malformed values are
    /// skipped; only subscriber-keyed grouped topic sets contribute.
    pub fn from_directory(snapshot: &DirectorySnapshot, hasher: &TopicHasher) -> Self {
        let mut index = Self::default();
        for (key, values) in snapshot.entries() {
            let Some(subscriber) = SubscriberRef::from_entry_key(key) else {
                continue;
            };
            for raw in values {
                let Some(unit) = GroupedValues::decode(raw) else {
                    continue;
                };
                let group = unit.group.unwrap_or_else(|| UNGROUPED.to_string());
                for topic in &unit.values {
                    index.fold_in(topic, &subscriber, &group, hasher);
                }
            }
        }
        index
    }

    fn fold_in(
        &mut self,
        topic: &str,
        subscriber: &SubscriberRef,
        group: &str,
        hasher: &TopicHasher,
    ) {
        self.routes
            .entry(topic.to_string())
            .or_default()
            .entry(subscriber.clone())
            .or_default()
            .insert(group.to_string());
        self.topic_hashes
            .extend(hasher.approximate(topic).values().iter().copied());
    }

    /// Unions index shards. On a (topic, subscriber) collision the later
    /// index overwrites: shards own disjoint address ranges in practice, and
    /// the local shard is passed last so its filter-bearing rows win.
    pub fn union(shards: impl IntoIterator<Item = PublisherIndex>) -> Self {
        let mut merged = Self::default();
        for shard in shards {
            for (topic, subscribers) in shard.routes {
                let merged_topic = merged.routes.entry(topic).or_default();
                for (subscriber, groups) in subscribers {
                    merged_topic.insert(subscriber, groups);
                }
            }
            merged.filters.extend(shard.filters);
            merged.topic_hashes.extend(shard.topic_hashes);
        }
        merged
    }

    /// Candidate (subscriber, groups) pairs for one topic.
    pub fn candidates_for(
        &self,
        topic: &str,
    ) -> Option<&BTreeMap<SubscriberRef, BTreeSet<String>>> {
        self.routes.get(topic)
    }

    /// Filter predicate of a subscriber, when one was registered locally.
    pub fn filter_of(&self, subscriber: &SubscriberRef) -> Option<&TopicFilter> {
        self.filters.get(subscriber)
    }

    /// Approximate-membership fast path: `false` means no topic of the
    /// tuple set was ever folded in, so a lookup cannot match.
    pub fn probably_subscribed(&self, hashes: &TopicHashes) -> bool {
        hashes.probably_in(&self.topic_hashes)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Number of distinct topics indexed, for gauge logging.
    pub fn topic_count(&self) -> usize {
        self.routes.len()
    }
}
