//! Deterministic recipient selection for one published message.

use std::collections::{BTreeMap, BTreeSet};

use crate::routing::publisher_index::{PublisherIndex, UNGROUPED};
use crate::subscriber::SubscriberRef;

/// Why a subscriber was selected, carried alongside the payload so the sink
/// and the weak-ack aggregator can reason about coverage.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GroupAssignment {
    /// Selected because of an ungrouped subscription.
    pub ungrouped: bool,
    /// Selected as the representative of these groups, mapped to the size of
    /// the candidate pool the pick was made from.
    pub groups: BTreeMap<String, usize>,
}

/// One delivery decision: this subscriber receives the message, for these
/// reasons.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutingRecord {
    pub subscriber: SubscriberRef,
    pub assignment: GroupAssignment,
}

/// Resolves the recipient set for a message published under `topics`.
///
/// Every candidate subscribed to at least one of the topics is considered.
/// Filters are evaluated against the full topic set of the message, not the
/// single topic that matched. Ungrouped candidates always receive the
/// message; for each named group exactly one member is picked by indexing
/// the address-ordered candidate list with `(key_hash / divisor) % len`.
/// All inputs being equal, every node resolves the same recipients.
pub fn assign_groups_to_subscribers(
    index: &PublisherIndex,
    topics: &BTreeSet<String>,
    key_hash: u64,
    pre_divisors: &BTreeMap<String, u64>,
) -> Vec<RoutingRecord> {
    // Candidate -> groups it competes under, unioned across matched topics.
    let mut candidates: BTreeMap<SubscriberRef, BTreeSet<String>> = BTreeMap::new();
    for topic in topics {
        if let Some(per_topic) = index.candidates_for(topic) {
            for (subscriber, groups) in per_topic {
                candidates
                    .entry(subscriber.clone())
                    .or_default()
                    .extend(groups.iter().cloned());
            }
        }
    }
    candidates.retain(|subscriber, _| match index.filter_of(subscriber) {
        Some(filter) => filter(topics),
        None => true,
    });

    let mut assignments: BTreeMap<SubscriberRef, GroupAssignment> = BTreeMap::new();
    let mut pools: BTreeMap<String, Vec<SubscriberRef>> = BTreeMap::new();
    for (subscriber, groups) in &candidates {
        for group in groups {
            if group == UNGROUPED {
                assignments.entry(subscriber.clone()).or_default().ungrouped = true;
            } else {
                pools
                    .entry(group.clone())
                    .or_default()
                    .push(subscriber.clone());
            }
        }
    }

    // Pool members arrive in BTreeMap key order, so each list is already
    // sorted by address then path. The index arithmetic is plain integer
    // division, identical on every node for identical pools.
    for (group, pool) in pools {
        let divisor = pre_divisors.get(&group).copied().unwrap_or(1).max(1);
        let picked = &pool[((key_hash / divisor) % pool.len() as u64) as usize];
        assignments
            .entry(picked.clone())
            .or_default()
            .groups
            .insert(group, pool.len());
    }

    assignments
        .into_iter()
        .map(|(subscriber, assignment)| RoutingRecord {
            subscriber,
            assignment,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::assign_groups_to_subscribers;
    use crate::hashing::TopicHasher;
    use crate::routing::publisher_index::PublisherIndex;
    use crate::store::SubscriptionStore;
    use crate::subscriber::SubscriberRef;
    use replicated_directory::NodeAddress;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn topics(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    fn subscriber(address: &str, path: &str) -> SubscriberRef {
        SubscriberRef::new(NodeAddress::new(address), path)
    }

    #[test]
    fn one_recipient_per_group_and_all_ungrouped() {
        let mut store = SubscriptionStore::default();
        let g1_a = subscriber("node-a", "s1");
        let g1_b = subscriber("node-b", "s1");
        let solo = subscriber("node-c", "s2");
        store.subscribe(g1_a.clone(), topics(&["t"]), None, Some("g1".into()));
        store.subscribe(g1_b.clone(), topics(&["t"]), None, Some("g1".into()));
        store.subscribe(solo.clone(), topics(&["t"]), None, None);

        let hasher = TopicHasher::new(1, 4);
        let index = PublisherIndex::from_reader(&store.snapshot(), &hasher);
        let records =
            assign_groups_to_subscribers(&index, &topics(&["t"]), 10, &BTreeMap::new());

        let grouped: Vec<_> = records
            .iter()
            .filter(|record| record.assignment.groups.contains_key("g1"))
            .collect();
        assert_eq!(grouped.len(), 1, "exactly one g1 member should be picked");
        assert_eq!(grouped[0].assignment.groups["g1"], 2);
        assert!(records
            .iter()
            .any(|record| record.subscriber == solo && record.assignment.ungrouped));
    }

    #[test]
    fn pick_is_a_pure_function_of_key_hash_and_pool() {
        let mut store = SubscriptionStore::default();
        let first = subscriber("node-a", "s");
        let second = subscriber("node-b", "s");
        store.subscribe(first.clone(), topics(&["t"]), None, Some("g".into()));
        store.subscribe(second.clone(), topics(&["t"]), None, Some("g".into()));

        let hasher = TopicHasher::new(1, 4);
        let index = PublisherIndex::from_reader(&store.snapshot(), &hasher);

        // Pool of two, divisor one: even hashes pick node-a, odd pick node-b,
        // and repeated resolution never flips.
        for _ in 0..3 {
            let even = assign_groups_to_subscribers(&index, &topics(&["t"]), 4, &BTreeMap::new());
            assert_eq!(even.len(), 1);
            assert_eq!(even[0].subscriber, first);
            let odd = assign_groups_to_subscribers(&index, &topics(&["t"]), 5, &BTreeMap::new());
            assert_eq!(odd.len(), 1);
            assert_eq!(odd[0].subscriber, second);
        }
    }

    #[test]
    fn divisor_widens_the_stickiness_window() {
        let mut store = SubscriptionStore::default();
        store.subscribe(subscriber("node-a", "s"), topics(&["t"]), None, Some("g".into()));
        store.subscribe(subscriber("node-b", "s"), topics(&["t"]), None, Some("g".into()));

        let hasher = TopicHasher::new(1, 4);
        let index = PublisherIndex::from_reader(&store.snapshot(), &hasher);
        let divisors: BTreeMap<String, u64> = [("g".to_string(), 4)].into_iter().collect();

        // Hashes 0..=3 all collapse to index 0 under divisor 4.
        let picks: BTreeSet<_> = (0..4)
            .map(|hash| {
                assign_groups_to_subscribers(&index, &topics(&["t"]), hash, &divisors)[0]
                    .subscriber
                    .clone()
            })
            .collect();
        assert_eq!(picks.len(), 1);
    }

    #[test]
    fn filters_see_the_full_topic_set() {
        let mut store = SubscriptionStore::default();
        let picky = subscriber("node-a", "s");
        store.subscribe(
            picky.clone(),
            topics(&["t1"]),
            Some(Arc::new(|published: &BTreeSet<String>| {
                published.contains("t2")
            })),
            None,
        );

        let hasher = TopicHasher::new(1, 4);
        let index = PublisherIndex::from_reader(&store.snapshot(), &hasher);

        let rejected =
            assign_groups_to_subscribers(&index, &topics(&["t1"]), 0, &BTreeMap::new());
        assert!(rejected.is_empty(), "filter should reject a lone t1");

        let accepted =
            assign_groups_to_subscribers(&index, &topics(&["t1", "t2"]), 0, &BTreeMap::new());
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].subscriber, picky);
    }
}
