//! Error taxonomy of the fan-out layer.
//!
//! Conflict errors surface synchronously to the requester and are never
//! retried automatically. Transient replication errors stay internal:
//! components recover by clearing their diff baseline and retrying on the
//! next tick.

use std::error::Error;
use std::fmt::{Display, Formatter};

use replicated_directory::DirectoryError;

/// Failures surfaced to callers of the fan-out API.
#[derive(Debug)]
pub enum PubSubError {
    /// The declared acknowledgement label is already claimed by another
    /// group locally or by a more important cluster member.
    AckLabelNotUnique { label: String },
    /// The local delivery infrastructure terminated; all tracked state was
    /// dropped and subscribers must independently resubscribe.
    InfrastructureLost { reason: String },
    /// The component task behind this request is gone.
    ChannelClosed,
    /// A directory read failed (writes are retried internally, reads are
    /// surfaced).
    Directory(DirectoryError),
}

impl Display for PubSubError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PubSubError::AckLabelNotUnique { label } => {
                write!(f, "acknowledgement label is not unique: {label}")
            }
            PubSubError::InfrastructureLost { reason } => {
                write!(f, "pub/sub infrastructure lost: {reason}")
            }
            PubSubError::ChannelClosed => write!(f, "pub/sub component is no longer running"),
            PubSubError::Directory(err) => write!(f, "directory operation failed: {err}"),
        }
    }
}

impl Error for PubSubError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PubSubError::Directory(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DirectoryError> for PubSubError {
    fn from(err: DirectoryError) -> Self {
        PubSubError::Directory(err)
    }
}

/// Successful acknowledgement of a subscribe/unsubscribe request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubAck {
    /// Sequence number the coordinator assigned to the request.
    pub seq: u64,
    /// Whether the acknowledged state was written with cluster-consistent
    /// (non-local) write consistency.
    pub consistent: bool,
}

/// Successful acknowledgement of a declare-acknowledgement-labels request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcksDeclared {
    pub labels: std::collections::BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::PubSubError;
    use replicated_directory::DirectoryError;
    use std::error::Error;

    #[test]
    fn conflict_error_names_the_label() {
        let err = PubSubError::AckLabelNotUnique {
            label: "created".to_string(),
        };
        assert!(err.to_string().contains("created"));
        assert!(err.source().is_none());
    }

    #[test]
    fn directory_error_is_exposed_as_source() {
        let err = PubSubError::from(DirectoryError::ReadFailed {
            reason: "quorum unreachable".to_string(),
        });
        assert!(err.source().is_some());
    }
}
