//! Inbox protocol of the subscription update coordinator.

use std::collections::BTreeSet;

use tokio::sync::oneshot;

use replicated_directory::DirectoryError;

use crate::error::SubAck;
use crate::store::TopicFilter;
use crate::subscriber::SubscriberRef;

/// Requests accepted by the subscription coordinator task.
///
/// `WriteDone` is internal: the coordinator spawns each directory write as
/// its own task and the result comes back through the same inbox, so store
/// mutations and write completions are serialized without locks.
pub(crate) enum SubRequest {
    Subscribe {
        subscriber: SubscriberRef,
        topics: BTreeSet<String>,
        filter: Option<TopicFilter>,
        group: Option<String>,
        reply: oneshot::Sender<SubAck>,
    },
    Unsubscribe {
        subscriber: SubscriberRef,
        topics: BTreeSet<String>,
        reply: oneshot::Sender<SubAck>,
    },
    RemoveSubscriber {
        subscriber: SubscriberRef,
    },
    /// Reconciliation found no entries for this node in the merged view even
    /// though local state is non-empty. The next tick must write everything.
    SelfAddressMissing,
    /// The replication substrate is permanently gone.
    InfrastructureLost {
        reason: String,
    },
    /// Orderly shutdown.
    Terminated,
    WriteDone {
        seq: u64,
        result: Result<(), DirectoryError>,
    },
}
