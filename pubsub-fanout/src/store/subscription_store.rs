//! Per-node authoritative record of local subscriptions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use replicated_directory::{DirectoryDiff, DirectoryState};

use crate::store::grouped_values::GroupedValues;
use crate::subscriber::SubscriberRef;

/// Boolean predicate over the full topic set of a published message.
///
/// Filters are local-only: they never enter the replicated directory and are
/// evaluated against the complete topic collection of a publish, not a
/// single topic.
pub type TopicFilter = Arc<dyn Fn(&BTreeSet<String>) -> bool + Send + Sync>;

#[derive(Clone)]
struct SubscriptionRecord {
    topics: BTreeSet<String>,
    filter: Option<TopicFilter>,
    group: Option<String>,
}

/// The per-node subscription store.
///
/// NOT thread-safe; owned and mutated only by the update coordinator task.
#[derive(Default)]
pub struct SubscriptionStore {
    subscriptions: BTreeMap<SubscriberRef, SubscriptionRecord>,
}

impl SubscriptionStore {
    /// Adds topics to the subscriber's record.
    ///
    /// Group and filter are taken as requested, first-writer-wins: the store
    /// does not cross-validate them against existing group peers. Returns
    /// whether the replicated-visible state (topics or group) changed.
    pub fn subscribe(
        &mut self,
        subscriber: SubscriberRef,
        topics: BTreeSet<String>,
        filter: Option<TopicFilter>,
        group: Option<String>,
    ) -> bool {
        match self.subscriptions.get_mut(&subscriber) {
            Some(record) => {
                let mut changed = false;
                for topic in topics {
                    changed |= record.topics.insert(topic);
                }
                if record.group != group {
                    record.group = group;
                    changed = true;
                }
                record.filter = filter;
                changed
            }
            None => {
                if topics.is_empty() {
                    return false;
                }
                self.subscriptions.insert(
                    subscriber,
                    SubscriptionRecord {
                        topics,
                        filter,
                        group,
                    },
                );
                true
            }
        }
    }

    /// Removes topics; drains the whole record when no topic remains.
    pub fn unsubscribe(&mut self, subscriber: &SubscriberRef, topics: &BTreeSet<String>) -> bool {
        let Some(record) = self.subscriptions.get_mut(subscriber) else {
            return false;
        };
        let mut changed = false;
        for topic in topics {
            changed |= record.topics.remove(topic);
        }
        if record.topics.is_empty() {
            self.subscriptions.remove(subscriber);
        }
        changed
    }

    /// Drops the subscriber's record entirely. Idempotent.
    pub fn remove_subscriber(&mut self, subscriber: &SubscriberRef) -> bool {
        self.subscriptions.remove(subscriber).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    /// All currently tracked subscribers, for terminal notification.
    pub fn subscribers(&self) -> Vec<SubscriberRef> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Rough size of the replicated representation, for gauge logging.
    pub fn estimate_size(&self) -> usize {
        self.subscriptions
            .iter()
            .map(|(subscriber, record)| {
                subscriber.path.len()
                    + record.topics.iter().map(String::len).sum::<usize>()
                    + record.group.as_ref().map_or(0, String::len)
            })
            .sum()
    }

    /// The full replicated-data representation of current state.
    pub fn export(&self) -> SubscriptionsUpdate {
        SubscriptionsUpdate {
            entries: self
                .subscriptions
                .iter()
                .map(|(subscriber, record)| {
                    let unit = GroupedValues {
                        group: record.group.clone(),
                        values: record.topics.clone(),
                    };
                    let mut values = BTreeSet::new();
                    values.insert(unit.encode());
                    (subscriber.entry_key(), values)
                })
                .collect(),
        }
    }

    /// Immutable point-in-time view for rebuilding the local publisher
    /// index. Must be taken before diff state advances so exported diffs and
    /// snapshots stay consistent.
    pub fn snapshot(&self) -> SubscriptionsReader {
        SubscriptionsReader {
            rows: self
                .subscriptions
                .iter()
                .map(|(subscriber, record)| SubscriptionRow {
                    subscriber: subscriber.clone(),
                    topics: record.topics.clone(),
                    filter: record.filter.clone(),
                    group: record.group.clone(),
                })
                .collect(),
        }
    }
}

/// Replicated representation of one node's subscription state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscriptionsUpdate {
    pub entries: DirectoryState,
}

impl SubscriptionsUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Diff against a previously exported baseline.
    pub fn diff(&self, previous: &SubscriptionsUpdate) -> DirectoryDiff {
        let inserts: BTreeMap<_, _> = self
            .entries
            .iter()
            .filter(|(key, values)| previous.entries.get(*key) != Some(*values))
            .map(|(key, values)| (key.clone(), values.clone()))
            .collect();
        let deletes: BTreeSet<_> = previous
            .entries
            .keys()
            .filter(|key| !self.entries.contains_key(*key))
            .cloned()
            .collect();
        DirectoryDiff { inserts, deletes }
    }

    /// Applies a diff produced by [`SubscriptionsUpdate::diff`]; diff and
    /// apply are inverses, which keeps replicated writes reconstructible.
    pub fn apply(&mut self, diff: &DirectoryDiff) {
        for (key, values) in &diff.inserts {
            self.entries.insert(key.clone(), values.clone());
        }
        for key in &diff.deletes {
            self.entries.remove(key);
        }
    }
}

/// One row of a store snapshot.
#[derive(Clone)]
pub struct SubscriptionRow {
    pub subscriber: SubscriberRef,
    pub topics: BTreeSet<String>,
    pub filter: Option<TopicFilter>,
    pub group: Option<String>,
}

/// Immutable snapshot of the store, consumed by index rebuilds.
#[derive(Clone, Default)]
pub struct SubscriptionsReader {
    pub rows: Vec<SubscriptionRow>,
}

impl SubscriptionsReader {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{SubscriptionStore, SubscriptionsUpdate, TopicFilter};
    use crate::subscriber::SubscriberRef;
    use replicated_directory::NodeAddress;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn subscriber(path: &str) -> SubscriberRef {
        SubscriberRef::new(NodeAddress::new("node-a"), path)
    }

    fn topics(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn subscribe_reports_replicated_visible_changes_only() {
        let mut store = SubscriptionStore::default();
        let s1 = subscriber("s1");

        assert!(store.subscribe(s1.clone(), topics(&["t1", "t2"]), None, None));
        // Same topics again: nothing replicated changes.
        assert!(!store.subscribe(s1.clone(), topics(&["t1"]), None, None));
        // Filter changes are local-only.
        let filter: TopicFilter = Arc::new(|_| true);
        assert!(!store.subscribe(s1.clone(), topics(&["t1"]), Some(filter), None));
        // Group change is replicated-visible.
        assert!(store.subscribe(s1, topics(&["t1"]), None, Some("g1".to_string())));
    }

    #[test]
    fn unsubscribing_last_topic_drops_the_record() {
        let mut store = SubscriptionStore::default();
        let s1 = subscriber("s1");
        store.subscribe(s1.clone(), topics(&["t1", "t2"]), None, None);

        assert!(store.unsubscribe(&s1, &topics(&["t1"])));
        assert!(!store.is_empty());
        assert!(store.unsubscribe(&s1, &topics(&["t2"])));
        assert!(store.is_empty());
        assert!(store.export().is_empty());
    }

    #[test]
    fn diff_then_apply_reconstructs_the_current_export() {
        let mut store = SubscriptionStore::default();
        store.subscribe(subscriber("s1"), topics(&["t1"]), None, None);
        store.subscribe(subscriber("s2"), topics(&["t2"]), None, Some("g1".to_string()));
        let previous = store.export();

        store.unsubscribe(&subscriber("s1"), &topics(&["t1"]));
        store.subscribe(subscriber("s2"), topics(&["t3"]), None, Some("g1".to_string()));
        store.subscribe(subscriber("s3"), topics(&["t4"]), None, None);
        let current = store.export();

        let diff = current.diff(&previous);
        assert_eq!(diff.deletes.len(), 1);
        assert_eq!(diff.inserts.len(), 2);

        let mut reconstructed = previous.clone();
        reconstructed.apply(&diff);
        assert_eq!(reconstructed, current);
    }

    #[test]
    fn empty_diff_for_unchanged_state() {
        let mut store = SubscriptionStore::default();
        store.subscribe(subscriber("s1"), topics(&["t1"]), None, None);
        let exported = store.export();
        assert!(exported.diff(&exported.clone()).is_empty());
        assert!(exported.diff(&SubscriptionsUpdate::default()).deletes.is_empty());
    }

    #[test]
    fn snapshot_rows_carry_group_and_filter() {
        let mut store = SubscriptionStore::default();
        let filter: TopicFilter = Arc::new(|set: &BTreeSet<String>| set.contains("t1"));
        store.subscribe(
            subscriber("s1"),
            topics(&["t1"]),
            Some(filter),
            Some("g1".to_string()),
        );

        let snapshot = store.snapshot();
        assert_eq!(snapshot.rows.len(), 1);
        let row = &snapshot.rows[0];
        assert_eq!(row.group.as_deref(), Some("g1"));
        let filter = row.filter.as_ref().expect("filter should be present");
        assert!(filter(&topics(&["t1", "t9"])));
        assert!(!filter(&topics(&["t9"])));
    }
}
