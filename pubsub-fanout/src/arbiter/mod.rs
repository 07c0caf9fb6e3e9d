//! Acknowledgement-label arbitration: cluster-unique label claims with
//! deterministic lowest-address conflict resolution.

pub(crate) mod ack_updater;
pub(crate) mod remote_view;

pub(crate) use ack_updater::{AckLabelView, AckRequest, AckUpdater};
