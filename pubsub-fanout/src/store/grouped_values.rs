//! Canonical wire form for grouped value sets stored in the directory.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::observability::events;

const COMPONENT: &str = "grouped_values";

/// A (optional group, set of values) pair.
///
/// Serializes both topic subscriptions and declared ack-label claims into
/// the replicated store. Within one unit the group is either absent
/// (ungrouped, wildcard delivery) or a single name. Field order and the
/// BTree value set make the JSON encoding canonical, so equal units encode
/// to equal strings and set-union in the directory stays idempotent.
#[derive(Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct GroupedValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub values: BTreeSet<String>,
}

impl GroupedValues {
    pub fn ungrouped(values: BTreeSet<String>) -> Self {
        Self {
            group: None,
            values,
        }
    }

    pub fn grouped(group: impl Into<String>, values: BTreeSet<String>) -> Self {
        Self {
            group: Some(group.into()),
            values,
        }
    }

    /// Canonical encoded form stored as an opaque directory value.
    pub fn encode(&self) -> String {
        // BTree field layout cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decodes one directory value; malformed remote values are logged and
    /// dropped rather than failing the whole view rebuild.
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(
                    event = events::GROUPED_VALUE_DECODE_FAILED,
                    component = COMPONENT,
                    err = %err,
                    "dropping malformed directory value"
                );
                None
            }
        }
    }
}
