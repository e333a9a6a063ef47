//! Instance inventory and audit log boundary.
//!
//! The repository serves cached snapshots written out-of-band by the
//! discovery subsystem. Reads are cheap and consistent within one call.
//! This core never writes snapshots; live state changes flow through the
//! driver and are picked up by re-discovery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::instance::{BinlogCoordinates, Instance, InstanceKey};

/// One appended audit record.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Operation kind, e.g. `move-up`, `regroup-replicas-gtid`. These
    /// strings are user-visible vocabulary.
    pub kind: String,
    pub key: InstanceKey,
    pub message: String,
}

/// Read access to cached instance snapshots plus the audit sink.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Cached snapshot for a key, `None` on a miss.
    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>>;

    /// Direct replicas of the given instance.
    async fn read_replica_instances(&self, key: &InstanceKey) -> Result<Vec<Instance>>;

    /// Direct replicas, with replicas of binlog-server intermediaries
    /// folded in recursively.
    async fn read_replica_instances_including_binlog_server_sub_replicas(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>>;

    /// Direct replicas that are binlog servers.
    async fn read_binlog_server_replica_instances(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>>;

    /// All instances known to belong to a cluster.
    async fn read_cluster_instances(&self, cluster: &str) -> Result<Vec<Instance>>;

    /// Writeable main(s) of a cluster. More than one indicates a co-main
    /// pair in a transient state.
    async fn read_cluster_writeable_main(&self, cluster: &str) -> Result<Vec<Instance>>;

    /// Rename a cluster alias after an instance changed identity.
    async fn replace_alias_cluster_name(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Known-equivalent coordinates on `other_key` for the given position
    /// in `main_key`'s binary log, when a past observation recorded one.
    async fn equivalent_binlog_coordinates(
        &self,
        main_key: &InstanceKey,
        coordinates: &BinlogCoordinates,
        other_key: &InstanceKey,
    ) -> Result<Option<BinlogCoordinates>>;

    /// Append an audit record.
    async fn audit(&self, kind: &str, key: &InstanceKey, message: &str) -> Result<()>;
}
