//! Replication topology manipulation.
//!
//! The [`Topology`] service rearranges a directed graph of database
//! instances, each replicating from at most one main, by issuing
//! side-effectful control operations through a [`TopologyDriver`]. Every
//! operation follows the same shape: read snapshots, validate, take
//! maintenance locks, execute an ordered driver sequence, restore
//! replication on all exits, audit the outcome.

pub mod bulk;
pub mod candidate;
pub mod correlation;
pub mod display;
pub mod driver;
pub mod gtid_ops;
pub mod maintenance;
pub mod moves;
pub mod postpone;
pub mod promote;
pub mod regroup;
pub mod relocate;
pub mod repository;
pub mod scanner;

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::TopologyConfig;
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceKey};

pub use bulk::{BulkOutcome, MultiMatchOutcome};
pub use candidate::{CandidateSelection, StopReplicationMethod};
pub use driver::{GtidHint, ReplicationThreadState, TopologyDriver};
pub use maintenance::{MaintenanceGuard, MaintenanceRegistry, MaintenanceToken};
pub use postpone::PostponedFunctionsContainer;
pub use regroup::{BinlogServerRegroupOutcome, RegroupOutcome};
pub use repository::{AuditEntry, InstanceRepository};
pub use scanner::BinlogScanner;

/// Log-file name substituted when a replica has no execution position yet,
/// so the driver accepts the reparenting call.
pub(crate) const UNKNOWN_LOG_FILE: &str = "corral-unknown-log-file";

/// The topology manipulation service.
///
/// Cheap to clone; clones share the driver, repository, scanner and
/// maintenance registry.
#[derive(Clone)]
pub struct Topology {
    pub(crate) driver: Arc<dyn TopologyDriver>,
    pub(crate) repository: Arc<dyn InstanceRepository>,
    pub(crate) scanner: Arc<dyn BinlogScanner>,
    pub(crate) maintenance: Arc<MaintenanceRegistry>,
    pub(crate) config: TopologyConfig,
}

impl Topology {
    pub fn new(
        driver: Arc<dyn TopologyDriver>,
        repository: Arc<dyn InstanceRepository>,
        scanner: Arc<dyn BinlogScanner>,
        config: TopologyConfig,
    ) -> Self {
        Self {
            driver,
            repository,
            scanner,
            maintenance: Arc::new(MaintenanceRegistry::new()),
            config,
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceRegistry> {
        &self.maintenance
    }

    /// Cached snapshot for a key; a repository miss is `NotFound`.
    pub(crate) async fn read_cached(&self, key: &InstanceKey) -> Result<Instance> {
        self.repository
            .read_instance(key)
            .await?
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    /// Synchronously reach into the topology and read the instance's main.
    pub async fn get_instance_main(&self, instance: &Instance) -> Result<Instance> {
        self.driver.read_topology_instance(&instance.main_key).await
    }

    /// Acquire a scoped maintenance token under the configured owner.
    pub(crate) fn begin_maintenance(
        &self,
        key: &InstanceKey,
        reason: &str,
    ) -> Result<MaintenanceGuard> {
        MaintenanceGuard::acquire(
            &self.maintenance,
            key,
            &self.config.maintenance_owner,
            reason,
        )
    }

    /// Cleanup-section helper: attempt to restart replication, logging
    /// failure without surfacing it, so it can never mask the operation's
    /// primary error.
    pub(crate) async fn start_replica_logged(&self, key: &InstanceKey) {
        if let Err(err) = self.driver.start_replica(key).await {
            warn!("cleanup: failed to start replication on {key}: {err}");
        }
    }

    /// Record an audit event; audit-sink failures are logged, never fatal.
    pub(crate) async fn audit(&self, kind: &str, key: &InstanceKey, message: &str) {
        debug!("audit {kind} on {key}: {message}");
        if let Err(err) = self.repository.audit(kind, key, message).await {
            warn!("failed to audit {kind} on {key}: {err}");
        }
    }

    /// Poll the replication threads until they reach `state`. Expiry of the
    /// configured deadline is fatal for the enclosing operation.
    pub async fn wait_for_replication_state(
        &self,
        key: &InstanceKey,
        state: ReplicationThreadState,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.replication_state_timeout;
        loop {
            if self.driver.replication_thread_state(key).await? == state {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "waiting for replication state {state:?} on {key}"
                )));
            }
            tokio::time::sleep(self.config.replication_state_poll_interval).await;
        }
    }

    /// Whether `instance` appears anywhere underneath `ancestor_key`,
    /// walking cached main pointers upward. Co-main pairs are the only
    /// permitted cycles; a visited set stops the walk on any cycle.
    pub async fn is_descendant_of(
        &self,
        instance: &Instance,
        ancestor_key: &InstanceKey,
    ) -> Result<bool> {
        let mut visited: HashSet<InstanceKey> = HashSet::new();
        visited.insert(instance.key.clone());
        let mut cursor = instance.clone();
        while cursor.is_replica() {
            if cursor.main_key == *ancestor_key {
                return Ok(true);
            }
            if !visited.insert(cursor.main_key.clone()) {
                return Ok(false);
            }
            cursor = match self.repository.read_instance(&cursor.main_key).await? {
                Some(main) => main,
                None => return Ok(false),
            };
        }
        Ok(false)
    }
}

/// Whether both instances replicate from the same main.
pub fn instances_are_siblings(instance0: &Instance, instance1: &Instance) -> bool {
    if !instance0.is_replica() || !instance1.is_replica() {
        return false;
    }
    if instance0.key == instance1.key {
        return false;
    }
    instance0.main_key == instance1.main_key
}

/// Whether `alleged_main` is the main of `alleged_replica`.
pub fn instance_is_main_of(alleged_main: &Instance, alleged_replica: &Instance) -> bool {
    if !alleged_replica.is_replica() {
        return false;
    }
    if alleged_main.key == alleged_replica.key {
        return false;
    }
    alleged_main.key == alleged_replica.main_key
}

/// Keep instances whose hostname matches `pattern`; an empty pattern keeps
/// everything, an invalid pattern keeps nothing.
pub(crate) fn filter_instances_by_pattern(instances: Vec<Instance>, pattern: &str) -> Vec<Instance> {
    if pattern.is_empty() {
        return instances;
    }
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => {
            warn!("invalid instance filter pattern {pattern:?}: {err}");
            return Vec::new();
        }
    };
    instances
        .into_iter()
        .filter(|instance| regex.is_match(&instance.key.hostname))
        .collect()
}

/// Drop the instance with the given key from the list, if present.
pub(crate) fn remove_instance(instances: Vec<Instance>, key: &InstanceKey) -> Vec<Instance> {
    instances
        .into_iter()
        .filter(|instance| instance.key != *key)
        .collect()
}
