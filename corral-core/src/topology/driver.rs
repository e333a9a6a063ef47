//! Typed control surface against one live database instance.
//!
//! Every call is a remote operation and may fail with
//! [`Error::Unreachable`](crate::Error::Unreachable) or
//! [`Error::RemoteOperationFailed`](crate::Error::RemoteOperationFailed);
//! failures always propagate to the caller.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::instance::{BinlogCoordinates, GtidSet, Instance, InstanceKey};

/// Whether a reparenting call should switch the replica's identity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtidHint {
    /// Keep whatever mode is in effect.
    Neutral,
    /// Switch global-identifier replication on.
    Force,
    /// Switch global-identifier replication off.
    Deny,
}

/// Observed state of the replication threads on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationThreadState {
    Stopped,
    Running,
    Other,
}

/// Typed operations against one target instance.
///
/// Mutating calls return a freshly-read snapshot so callers always hold the
/// post-operation view. The driver never consults the repository cache.
#[async_trait]
pub trait TopologyDriver: Send + Sync {
    /// Fetch the instance's live state.
    async fn read_topology_instance(&self, key: &InstanceKey) -> Result<Instance>;

    async fn stop_replica(&self, key: &InstanceKey) -> Result<Instance>;

    /// Stop replication after letting the SQL thread drain the relay log,
    /// waiting up to `timeout`.
    async fn stop_replica_nicely(&self, key: &InstanceKey, timeout: Duration) -> Result<Instance>;

    async fn start_replica(&self, key: &InstanceKey) -> Result<Instance>;

    /// Start replication and halt the SQL thread once the given position in
    /// the main's binary log is reached.
    async fn start_replica_until_coordinates(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
    ) -> Result<Instance>;

    /// Forget all replication configuration and relay logs.
    async fn reset_replica(&self, key: &InstanceKey) -> Result<Instance>;

    /// Destructive: wipe the instance's own binary logs and executed
    /// identifier set.
    async fn reset_main(&self, key: &InstanceKey) -> Result<Instance>;

    /// The single point of reparenting. `unresolve_hostname` tells the
    /// driver whether to trust a cached hostname (true when the new main
    /// was not live-read).
    async fn change_main_to(
        &self,
        key: &InstanceKey,
        main_key: &InstanceKey,
        coordinates: &BinlogCoordinates,
        unresolve_hostname: bool,
        gtid_hint: GtidHint,
    ) -> Result<Instance>;

    async fn change_main_credentials(
        &self,
        key: &InstanceKey,
        user: &str,
        password: &str,
    ) -> Result<Instance>;

    async fn enable_main_ssl(&self, key: &InstanceKey) -> Result<Instance>;

    /// Read the replication user and password configured on a replica.
    async fn read_replication_credentials(&self, key: &InstanceKey) -> Result<(String, String)>;

    /// Names of the instance's binary logs, oldest first.
    async fn show_binary_logs(&self, key: &InstanceKey) -> Result<Vec<String>>;

    /// Executed identifier set from the instance's main status, or `None`
    /// when the instance reports no main status at all.
    async fn show_main_status(&self, key: &InstanceKey) -> Result<Option<String>>;

    /// Identifier set contained in binary logs preceding `logfile`.
    async fn previous_gtids(&self, key: &InstanceKey, logfile: &str) -> Result<GtidSet>;

    /// Identifier-set subtraction evaluated by the server, which owns the
    /// canonical set semantics.
    async fn gtid_subtract(
        &self,
        key: &InstanceKey,
        minuend: &str,
        subtrahend: &str,
    ) -> Result<String>;

    /// Commit an empty transaction under the given single identifier.
    async fn inject_empty_gtid_transaction(&self, key: &InstanceKey, gtid: &str) -> Result<()>;

    async fn set_gtid_purged(&self, key: &InstanceKey, gtid_purged: &str) -> Result<()>;

    async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> Result<Instance>;

    async fn replication_thread_state(&self, key: &InstanceKey) -> Result<ReplicationThreadState>;

    /// Drop binary logs strictly older than `logfile`.
    async fn purge_binary_logs_to(&self, key: &InstanceKey, logfile: &str) -> Result<Instance>;
}
