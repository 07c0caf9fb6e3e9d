//! Routing layer.
//!
//! Owns the derived publisher index (topic to subscriber to groups) and the
//! deterministic group-member selection algorithm. Indexes are rebuilt
//! wholesale from store snapshots or directory state and swapped atomically;
//! nothing here mutates incrementally, so identical replicated state yields
//! identical routing on every node.

pub(crate) mod group_assignment;
pub(crate) mod publisher_index;

pub use group_assignment::{assign_groups_to_subscribers, GroupAssignment, RoutingRecord};
pub use publisher_index::PublisherIndex;
