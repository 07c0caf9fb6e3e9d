//! Subscription state ownership: one task per node owns the local store and
//! is the only writer of this node's subscription entries.

pub(crate) mod messages;
pub(crate) mod sub_updater;

pub(crate) use messages::SubRequest;
pub(crate) use sub_updater::SubUpdater;
