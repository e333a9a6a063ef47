//! Topology core configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for topology operations.
///
/// Deserializable so that an embedding process can load it from its own
/// configuration surface; every field has a working default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Cap on concurrently executing per-replica operations in bulk moves.
    pub max_concurrent_replica_operations: usize,

    /// Pattern identifying pseudo-GTID markers in the log stream.
    /// Empty means pseudo-GTID correlation is unavailable.
    pub pseudo_gtid_pattern: String,

    /// When non-empty and present in a marker's text, the marker values are
    /// known to be monotonically increasing, enabling faster searches.
    pub pseudo_gtid_monotonic_hint: String,

    /// Skip binary-log search and go straight to relay logs when hunting
    /// for pseudo-GTID markers.
    pub skip_binlog_search: bool,

    /// Replicas lagging by more than this are postponed during bulk
    /// relocation rather than holding everyone else back. `None` disables
    /// lag-based postponing.
    pub postpone_replica_recovery_on_lag: Option<Duration>,

    /// Replicas whose last discovery took longer than this are postponed.
    pub reasonable_discovery_latency: Duration,

    /// Bounded wait used when stopping a set of replicas for sorting.
    pub bulk_operations_wait_timeout: Duration,

    /// Poll interval while waiting for a replication thread state.
    pub replication_state_poll_interval: Duration,

    /// Deadline for replication thread state waits; expiring is fatal for
    /// the enclosing operation.
    pub replication_state_timeout: Duration,

    /// Attempts for destructive, non-rollbackable driver calls
    /// (reset-main, set-gtid-purged).
    pub destructive_operation_retries: usize,

    /// Gap between destructive-operation attempts.
    pub destructive_operation_retry_interval: Duration,

    /// Hostname regexes banned from promotion candidacy.
    pub promotion_ignore_hostname_filters: Vec<String>,

    /// Shell commands invoked after a successful take-main, with
    /// `ORC_SUCCESSOR_HOST`/`ORC_FAILED_HOST` in the environment and the
    /// successor and demoted keys as positional arguments.
    pub post_take_main_hooks: Vec<String>,

    /// Owner recorded on maintenance tokens taken by this process.
    pub maintenance_owner: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_replica_operations: 5,
            pseudo_gtid_pattern: String::new(),
            pseudo_gtid_monotonic_hint: String::new(),
            skip_binlog_search: false,
            postpone_replica_recovery_on_lag: None,
            reasonable_discovery_latency: Duration::from_secs(10),
            bulk_operations_wait_timeout: Duration::from_secs(10),
            replication_state_poll_interval: Duration::from_millis(500),
            replication_state_timeout: Duration::from_secs(10),
            destructive_operation_retries: 5,
            destructive_operation_retry_interval: Duration::from_secs(5),
            promotion_ignore_hostname_filters: Vec::new(),
            post_take_main_hooks: Vec::new(),
            maintenance_owner: "corral".to_string(),
        }
    }
}
