//! Canonical structured event names used across `pubsub-fanout`.

// Subscription update coordinator events.
pub const SUB_STATE_CHANGED: &str = "sub_state_changed";
pub const SUB_WRITE_START: &str = "sub_write_start";
pub const SUB_WRITE_OK: &str = "sub_write_ok";
pub const SUB_WRITE_FAILED: &str = "sub_write_failed";
pub const SUB_FULL_RESET: &str = "sub_full_reset";
pub const SUB_STATE_CLEARED: &str = "sub_state_cleared";

// Ack-label arbiter events.
pub const ACK_DECLARE_OK: &str = "ack_declare_ok";
pub const ACK_DECLARE_REJECTED: &str = "ack_declare_rejected";
pub const ACK_LABELS_EVICTED: &str = "ack_labels_evicted";
pub const ACK_WRITE_OK: &str = "ack_write_ok";
pub const ACK_WRITE_FAILED: &str = "ack_write_failed";
pub const ACK_FULL_RESET: &str = "ack_full_reset";
pub const WEAK_ACK_EMITTED: &str = "weak_ack_emitted";

// Publish resolution events.
pub const PUBLISH_FASTPATH_SKIP: &str = "publish_fastpath_skip";
pub const PUBLISH_RESOLVED: &str = "publish_resolved";

// Index rebuild and change-stream events.
pub const INDEX_REBUILD_OK: &str = "index_rebuild_ok";
pub const CHANGES_LAGGED: &str = "changes_lagged";
pub const CHANGES_CLOSED: &str = "changes_closed";
pub const GROUPED_VALUE_DECODE_FAILED: &str = "grouped_value_decode_failed";

// Reconciliation sweep events.
pub const RECONCILE_SWEEP_START: &str = "reconcile_sweep_start";
pub const RECONCILE_SWEEP_OK: &str = "reconcile_sweep_ok";
pub const RECONCILE_SWEEP_FAILED: &str = "reconcile_sweep_failed";
pub const RECONCILE_STALE_ADDRESS_REMOVED: &str = "reconcile_stale_address_removed";
pub const RECONCILE_SELF_MISSING: &str = "reconcile_self_missing";
pub const MEMBER_PRUNED: &str = "member_pruned";

// Lifecycle events.
pub const TASK_STARTED: &str = "task_started";
pub const TASK_TERMINATED: &str = "task_terminated";
pub const INFRASTRUCTURE_LOST: &str = "infrastructure_lost";
