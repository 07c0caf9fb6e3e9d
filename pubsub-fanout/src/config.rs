/********************************************************************************
 * Copyright (c) 2026 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use std::time::Duration;

use serde::{Deserialize, Serialize};

use replicated_directory::{ReadConsistency, WriteConsistency};

/// Tunables for one fan-out node. Deserializes from the host's config file;
/// the defaults are what every field falls back to when omitted.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct PubSubConfig {
    /// Delay between subscription/ack batch write ticks, in milliseconds.
    pub update_interval_ms: u64,
    /// Base delay between full reconciliation sweeps, in milliseconds.
    pub sync_interval_base_ms: u64,
    /// Uniform random extra delay added to each sweep, in milliseconds.
    pub sync_interval_jitter_ms: u64,
    /// Consistency level used for every directory write.
    pub write_consistency: WriteConsistency,
    /// Consistency level used for reconciliation reads.
    pub read_consistency: ReadConsistency,
    /// Chance that a routine tick writes the node's full state instead of a
    /// diff, healing entries lost on remote replicas.
    pub reset_probability: f64,
    /// Number of independent hash functions in the topic approximation.
    pub hash_family_size: usize,
    /// Base seed for the topic hash family. Must match cluster-wide.
    pub hash_seed: u64,
    /// Directory shard count. Must match cluster-wide.
    pub shard_count: usize,
    /// Consecutive write failures before logs escalate from debug to error.
    pub write_failure_log_threshold: u32,
    /// Capacity of the coordinator and arbiter inboxes.
    pub channel_capacity: usize,
    /// Pre-division applied to the group index hash, per named group.
    /// A divisor of n keeps n consecutive index keys on the same member;
    /// unlisted groups use 1.
    pub group_pre_divisors: std::collections::BTreeMap<String, u64>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 500,
            sync_interval_base_ms: 20_000,
            sync_interval_jitter_ms: 10_000,
            write_consistency: WriteConsistency::Local,
            read_consistency: ReadConsistency::Local,
            reset_probability: 0.01,
            hash_family_size: 4,
            hash_seed: 0,
            shard_count: 8,
            write_failure_log_threshold: 3,
            channel_capacity: 64,
            group_pre_divisors: std::collections::BTreeMap::new(),
        }
    }
}

impl PubSubConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn sync_interval_base(&self) -> Duration {
        Duration::from_millis(self.sync_interval_base_ms)
    }

    pub fn sync_interval_jitter(&self) -> Duration {
        Duration::from_millis(self.sync_interval_jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::PubSubConfig;

    #[test]
    fn deserializes_with_partial_overrides() {
        let config: PubSubConfig =
            serde_json::from_str(r#"{"update_interval_ms": 100, "reset_probability": 0.5}"#)
                .expect("partial config should parse");
        assert_eq!(config.update_interval_ms, 100);
        assert_eq!(config.reset_probability, 0.5);
        assert_eq!(config.shard_count, PubSubConfig::default().shard_count);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = serde_json::from_str::<PubSubConfig>(r#"{"no_such_knob": true}"#);
        assert!(result.is_err());
    }
}
