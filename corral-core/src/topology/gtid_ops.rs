//! Global-identifier mode switches and errant-transaction remediation.

use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::instance::{GtidSet, Instance, InstanceKey};
use crate::topology::{GtidHint, ReplicationThreadState, Topology};

impl Topology {
    /// Switch a replica into global-identifier replication.
    pub async fn enable_gtid(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        if instance.using_gtid() {
            return Err(Error::precondition(format!("{key} already uses gtid")));
        }
        info!("will attempt to enable gtid on {key}");
        let instance = self.repoint(key, None, GtidHint::Force).await?;
        if !instance.using_gtid() {
            return Err(Error::precondition(format!("cannot enable gtid on {key}")));
        }
        self.audit("enable-gtid", key, &format!("enabled gtid on {key}"))
            .await;
        Ok(instance)
    }

    /// Revert a replica to plain logfile/offset replication.
    pub async fn disable_gtid(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        if !instance.using_gtid() {
            return Err(Error::precondition(format!("{key} is not using gtid")));
        }
        info!("will attempt to disable gtid on {key}");
        let instance = self.repoint(key, None, GtidHint::Deny).await?;
        if instance.using_gtid() {
            return Err(Error::precondition(format!("cannot disable gtid on {key}")));
        }
        self.audit("disable-gtid", key, &format!("disabled gtid on {key}"))
            .await;
        Ok(instance)
    }

    /// Name the binary logs on `key` that contain its errant transactions.
    pub async fn locate_errant_gtid(&self, key: &InstanceKey) -> Result<Vec<String>> {
        let instance = self.driver.read_topology_instance(key).await?;
        let mut errant_search = instance.gtid_errant.clone();
        if errant_search.is_empty() {
            return Err(Error::precondition(format!(
                "locate-errant-gtid: no errant gtid on {key}"
            )));
        }
        let subtract = self
            .driver
            .gtid_subtract(key, &errant_search, &instance.gtid_purged)
            .await?;
        if subtract != errant_search {
            return Err(Error::precondition(format!(
                "locate-errant-gtid: some errant transactions are already purged on {key}"
            )));
        }
        let binlogs = self.driver.show_binary_logs(key).await?;
        let mut previous_gtids = Vec::with_capacity(binlogs.len());
        for binlog in &binlogs {
            previous_gtids.push(self.driver.previous_gtids(key, binlog).await?);
        }
        let mut errant_binlogs = Vec::new();
        for index in 0..binlogs.len() {
            if errant_search.is_empty() {
                break;
            }
            let subtract = self
                .driver
                .gtid_subtract(key, &errant_search, &previous_gtids[index].to_string())
                .await?;
            if subtract != errant_search {
                // Entries preceding this binlog live in the previous one.
                // index zero would imply purged entries, excluded above.
                if index > 0 {
                    errant_binlogs.push(binlogs[index - 1].clone());
                }
                errant_search = subtract;
            }
        }
        if !errant_search.is_empty() {
            if let Some(last) = binlogs.last() {
                errant_binlogs.push(last.clone());
            }
        }
        errant_binlogs.dedup();
        Ok(errant_binlogs)
    }

    /// Destructive recovery for a replica carrying errant transactions:
    /// wipe its own binary logs and re-declare the purged set as everything
    /// it executed minus the errant entries, so new replicas can attach
    /// without complaints. The instance must have no replicas of its own.
    pub async fn errant_gtid_reset_main(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        if instance.gtid_errant.is_empty() {
            return Err(Error::precondition(format!(
                "gtid-errant-reset-main will not operate on {key} because no errant gtid is found"
            )));
        }
        if !instance.supports_oracle_gtid {
            return Err(Error::precondition(format!(
                "gtid-errant-reset-main requested for {key} but it is not using oracle gtid"
            )));
        }
        if !instance.replica_hosts.is_empty() {
            return Err(Error::precondition(format!(
                "gtid-errant-reset-main will not operate on {key} because it has {} replicas; expecting none",
                instance.replica_hosts.len()
            )));
        }

        let _guard = self.begin_maintenance(key, "reset-main-gtid")?;
        let retries = self.config.destructive_operation_retries;
        let retry_interval = self.config.destructive_operation_retry_interval;

        let outcome: Result<Instance> = async {
            if instance.is_replica() {
                self.driver.stop_replica(key).await?;
                self.wait_for_replication_state(key, ReplicationThreadState::Stopped)
                    .await
                    .map_err(|err| match err {
                        Error::Timeout(_) => Error::timeout(format!(
                            "gtid-errant-reset-main: waiting for replication to stop on {key}"
                        )),
                        other => other,
                    })?;
            }

            let gtid_purged = self
                .driver
                .gtid_subtract(key, &instance.executed_gtid_set, &instance.gtid_errant)
                .await?;

            // The reset is non-transactional and cannot be rolled back; a
            // failure mid-way leaves the instance broken. Allow multiple
            // attempts before giving up.
            let mut reset_result = Err(Error::remote(key, "reset-main not attempted"));
            for attempt in 0..retries {
                reset_result = self.driver.reset_main(key).await;
                if reset_result.is_ok() {
                    break;
                }
                debug!(
                    "gtid-errant-reset-main: reset-main attempt {} failed on {key}",
                    attempt + 1
                );
                sleep(retry_interval).await;
            }
            let instance_after_reset = reset_result.map_err(|err| {
                Error::remote(
                    key,
                    format!(
                        "error while resetting main, after which intended to set gtid_purged to {gtid_purged}: {err}"
                    ),
                )
            })?;

            let executed_after_reset =
                self.driver.show_main_status(key).await?.ok_or_else(|| {
                    Error::remote(
                        key,
                        format!(
                            "cannot get main status, after which intended to set gtid_purged to {gtid_purged}"
                        ),
                    )
                })?;
            if !executed_after_reset.is_empty() {
                return Err(Error::remote(
                    key,
                    format!(
                        "unexpected non-empty executed identifier set following reset-main: {executed_after_reset}; intended to set gtid_purged to {gtid_purged}"
                    ),
                ));
            }

            let mut purge_result = Err(Error::remote(key, "set-gtid-purged not attempted"));
            for attempt in 0..retries {
                purge_result = self.driver.set_gtid_purged(key, &gtid_purged).await;
                if purge_result.is_ok() {
                    break;
                }
                debug!(
                    "gtid-errant-reset-main: set-gtid-purged attempt {} failed on {key}",
                    attempt + 1
                );
                sleep(retry_interval).await;
            }
            purge_result.map_err(|err| {
                Error::remote(
                    key,
                    format!("error setting gtid_purged to {gtid_purged}: {err}"),
                )
            })?;

            Ok(instance_after_reset)
        }
        .await;

        self.start_replica_logged(key).await;
        let instance = outcome?;
        self.audit("gtid-errant-reset-main", key, &format!("{key} main reset"))
            .await;
        Ok(instance)
    }

    /// Remediate errant transactions by injecting matching empty
    /// transactions on the cluster's authoritative writeable main, so the
    /// errant entries stop being errant. Returns the cluster main and the
    /// number of transactions injected.
    pub async fn errant_gtid_inject_empty(
        &self,
        key: &InstanceKey,
    ) -> Result<(Instance, Instance, usize)> {
        let instance = self.driver.read_topology_instance(key).await?;
        if instance.gtid_errant.is_empty() {
            return Err(Error::precondition(format!(
                "gtid-errant-inject-empty will not operate on {key} because no errant gtid is found"
            )));
        }
        if !instance.supports_oracle_gtid {
            return Err(Error::precondition(format!(
                "gtid-errant-inject-empty requested for {key} but it does not support oracle gtid"
            )));
        }
        let mains = self
            .repository
            .read_cluster_writeable_main(&instance.cluster_name)
            .await?;
        let cluster_main = mains.into_iter().next().ok_or_else(|| {
            Error::precondition(format!(
                "gtid-errant-inject-empty found no writeable main for cluster {}",
                instance.cluster_name
            ))
        })?;
        if !cluster_main.supports_oracle_gtid {
            return Err(Error::precondition(format!(
                "gtid-errant-inject-empty requested for {key} but the cluster's main {} does not support oracle gtid",
                cluster_main.key
            )));
        }

        let errant_set = GtidSet::parse(&instance.gtid_errant)?;
        let singles = errant_set.explode();
        info!(
            "gtid-errant-inject-empty: about to inject {} empty transactions {errant_set} on cluster main {}",
            singles.len(),
            cluster_main.key
        );
        let mut injected = 0usize;
        for single in &singles {
            self.driver
                .inject_empty_gtid_transaction(&cluster_main.key, single)
                .await?;
            injected += 1;
        }

        self.audit(
            "gtid-errant-inject-empty",
            key,
            &format!("injected {injected} empty transactions on {}", cluster_main.key),
        )
        .await;
        Ok((instance, cluster_main, injected))
    }
}
