//! Local subscription state layer.
//!
//! Owns the per-node authoritative record of who subscribes to what, the
//! grouped-value wire encoding written into the replicated directory, and
//! the export/diff machinery the update coordinator batches writes with.
//! Snapshots taken here feed the local publisher index; exports feed the
//! directory.

pub(crate) mod grouped_values;
pub(crate) mod subscription_store;

pub use grouped_values::GroupedValues;
pub use subscription_store::{
    SubscriptionStore, SubscriptionsReader, SubscriptionsUpdate, TopicFilter,
};
