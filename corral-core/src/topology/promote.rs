//! Promotions: co-main pairing, main takeover, local-main recovery.

use std::time::Instant;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceKey};
use crate::topology::{GtidHint, Topology};

impl Topology {
    /// Turn `key` and its main into a writable co-main pair, by making the
    /// main replicate from `key`. Requires `key` to be read-only and the
    /// main to have no real upstream (or a demotable co-main partner).
    pub async fn make_co_main(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        instance.can_move()?;
        let main = self.get_instance_main(&instance).await?;
        debug!(
            "will check whether {}'s main ({}) can become its co-main",
            instance.key, main.key
        );
        main.can_move_as_co_main()?;
        if *key == main.main_key {
            return Err(Error::precondition(format!(
                "instance {key} is already co-main of {}",
                main.key
            )));
        }
        if !instance.read_only {
            return Err(Error::precondition(format!(
                "instance {key} is not read-only; first make it read-only before making it co-main"
            )));
        }
        if main.is_co_main {
            // The main is already part of a co-main pair. We allow breaking
            // that pair only when we are replacing one read-only co-main
            // with another: the other co-main must be read-only or gone.
            if let Some(other_co_main) = self.repository.read_instance(&main.main_key).await? {
                if other_co_main.is_last_check_valid && !other_co_main.read_only {
                    return Err(Error::precondition(format!(
                        "main {} is already co-main with {}, which is alive and not read-only; refusing to demote it. Please set it read-only beforehand",
                        main.key, other_co_main.key
                    )));
                }
            }
        } else if self.repository.read_instance(&main.main_key).await?.is_some() {
            return Err(Error::precondition(format!(
                "{} is not a real main; it replicates from {}",
                main.key, main.main_key
            )));
        }
        main.can_replicate_from(&instance)?;

        info!("will make {key} co-main of {}", main.key);
        let _instance_guard =
            self.begin_maintenance(key, &format!("make co-main of {}", main.key))?;
        let _main_guard =
            self.begin_maintenance(&main.key, &format!("{key} turns into co-main of this"))?;

        // The main used to be a plain main; for a co-main it is itself a
        // replica and the stop/start bracket applies.
        let main_replicates = main.is_replica();
        let outcome: Result<Instance> = async {
            if main_replicates {
                self.driver.stop_replica(&main.key).await?;
            }
            if !main.replication_credentials_present {
                // Best effort: copy credentials over from the replica.
                if let Ok((user, password)) =
                    self.driver.read_replication_credentials(key).await
                {
                    debug!("got replication credentials from a replica; applying");
                    self.driver
                        .change_main_credentials(&main.key, &user, &password)
                        .await?;
                }
            }
            if instance.allow_tls {
                debug!("enabling TLS replication on {}", main.key);
                self.driver.enable_main_ssl(&main.key).await?;
            }
            let gtid_hint = if instance.using_oracle_gtid {
                GtidHint::Force
            } else {
                GtidHint::Neutral
            };
            self.driver
                .change_main_to(
                    &main.key,
                    key,
                    &instance.self_binlog_coordinates,
                    false,
                    gtid_hint,
                )
                .await
        }
        .await;

        self.start_replica_logged(&main.key).await;
        outcome?;
        self.audit(
            "make-co-main",
            key,
            &format!("{key} made co-main of {}", main.key),
        )
        .await;
        Ok(instance)
    }

    /// Swap a replica with its main: the replica catches up to the main's
    /// position, attaches to the grandparent, and the demoted main attaches
    /// below it. Other replicas of either are unaffected.
    pub async fn take_main(
        &self,
        key: &InstanceKey,
        allow_taking_co_main: bool,
    ) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        let main = self.read_cached(&instance.main_key).await?;
        if main.is_co_main && !allow_taking_co_main {
            return Err(Error::precondition(format!(
                "{} is co-main. Cannot take it",
                main.key
            )));
        }
        debug!(
            "take-main: will attempt making {key} take its main {}, now resolved as {}",
            instance.main_key, main.key
        );
        main.can_replicate_from(&instance)?;

        let outcome: Result<(Instance, Instance)> = async {
            let main = self.driver.stop_replica(&main.key).await?;
            self.driver.stop_replica(key).await?;
            let instance = self
                .driver
                .start_replica_until_coordinates(key, &main.self_binlog_coordinates)
                .await?;
            // The two are now equal. Skip hostname unresolve: the
            // grandparent may be dead and unresolvable, and this path runs
            // in dead-main recovery.
            let instance = self
                .driver
                .change_main_to(
                    key,
                    &main.main_key,
                    &main.exec_binlog_coordinates,
                    true,
                    GtidHint::Neutral,
                )
                .await?;
            // The instance is now a sibling of its old main; demote it.
            let main = self
                .driver
                .change_main_to(
                    &main.key,
                    key,
                    &instance.self_binlog_coordinates,
                    false,
                    GtidHint::Neutral,
                )
                .await?;
            Ok((instance, main))
        }
        .await;

        self.start_replica_logged(key).await;
        self.start_replica_logged(&main.key).await;
        let (instance, demoted) = outcome?;
        self.audit("take-main", key, &format!("took main: {}", demoted.key))
            .await;

        if !self.config.post_take_main_hooks.is_empty() {
            self.run_take_main_hooks(&instance, &demoted).await;
        }
        Ok(instance)
    }

    /// Invoke the configured post-take-main commands. Hook failures are
    /// logged, never surfaced: the takeover already succeeded.
    async fn run_take_main_hooks(&self, successor: &Instance, demoted: &Instance) {
        let successor_key = successor.key.to_string();
        let demoted_key = demoted.key.to_string();
        let hook_count = self.config.post_take_main_hooks.len();
        for (index, command) in self.config.post_take_main_hooks.iter().enumerate() {
            let description = format!("post-take-main hook {} of {hook_count}", index + 1);
            debug!("take-main: invoking {description}");
            let started = Instant::now();
            let status = Command::new("sh")
                .arg("-c")
                .arg(command)
                .arg("take-main-hook")
                .arg(&successor_key)
                .arg(&demoted_key)
                .env("ORC_SUCCESSOR_HOST", &successor_key)
                .env("ORC_FAILED_HOST", &demoted_key)
                .status()
                .await;
            match status {
                Ok(status) if status.success() => {
                    info!(
                        "take-main: completed {description} in {:?}",
                        started.elapsed()
                    );
                }
                Ok(status) => {
                    warn!(
                        "take-main: {description} exited with {status} after {:?}",
                        started.elapsed()
                    );
                }
                Err(err) => {
                    warn!("take-main: failed to spawn {description}: {err}");
                }
            }
        }
    }

    /// Promote `key` to main: its siblings are matched below it via
    /// pseudo-GTID and it is made writable. The original main must be
    /// inaccessible or non-replicating, and `key` must be the most advanced
    /// among its siblings.
    pub async fn make_main(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        if let Ok(main) = self.driver.read_topology_instance(&instance.main_key).await {
            // The main is reachable: refuse to usurp a living topology.
            if main.is_replica() {
                return Err(Error::precondition(format!(
                    "make-main: instance's main {} seems to be replicating",
                    main.key
                )));
            }
            if main.is_last_check_valid {
                return Err(Error::precondition(format!(
                    "make-main: instance's main {} seems to be accessible",
                    main.key
                )));
            }
        }
        if !instance.sql_thread_up_to_date() {
            return Err(Error::precondition(format!(
                "make-main: instance's sql thread must be up-to-date with io thread for {key}"
            )));
        }
        let siblings = self
            .repository
            .read_replica_instances(&instance.main_key)
            .await?;
        for sibling in &siblings {
            if sibling.key != *key
                && instance
                    .exec_binlog_coordinates
                    .smaller_than(&sibling.exec_binlog_coordinates)
            {
                return Err(Error::precondition(format!(
                    "make-main: instance {key} has more advanced sibling: {}",
                    sibling.key
                )));
            }
        }

        let _guard = self.begin_maintenance(key, &format!("siblings match below this: {key}"))?;
        // The guard on the candidate is ours, so per-replica matching must
        // not insist the target be maintenance-free.
        let (outcome, _) = self.multi_match_below(siblings, key, None, false).await?;
        if outcome.all_failed() {
            return Err(Error::precondition(format!(
                "make-main: error on all operations while matching siblings below {key}"
            )));
        }
        let instance = self.driver.set_read_only(key, false).await?;
        self.audit("make-main", key, &format!("made main of {key}"))
            .await;
        Ok(instance)
    }

    /// Promote a replica above its (typically failed) local main: match it
    /// below its grandparent, then match its siblings below it.
    pub async fn make_local_main(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        let main = self.read_cached(&instance.main_key).await?;
        let grandparent = self.driver.read_topology_instance(&main.main_key).await?;
        let siblings = self.repository.read_replica_instances(&main.key).await?;
        for sibling in &siblings {
            if sibling.key != *key
                && instance
                    .exec_binlog_coordinates
                    .smaller_than(&sibling.exec_binlog_coordinates)
            {
                return Err(Error::precondition(format!(
                    "make-local-main: instance {key} has more advanced sibling: {}",
                    sibling.key
                )));
            }
        }
        self.driver
            .stop_replica_nicely(key, self.config.bulk_operations_wait_timeout)
            .await?;
        self.match_below(key, &grandparent.key, true).await?;
        let (outcome, _) = self.multi_match_below(siblings, key, None, false).await?;
        if outcome.all_failed() {
            return Err(Error::precondition(format!(
                "make-local-main: error on all operations while matching siblings below {key}"
            )));
        }
        self.audit("make-local-main", key, &format!("made main of {key}"))
            .await;
        Ok(instance)
    }

    /// Turn the siblings of a replica into its own replicas, using whatever
    /// relocation means are available. Returns the refreshed instance and
    /// how many siblings were taken.
    pub async fn take_siblings(&self, key: &InstanceKey) -> Result<(Instance, usize)> {
        let instance = self.driver.read_topology_instance(key).await?;
        if !instance.is_replica() {
            return Err(Error::precondition(format!(
                "take-siblings: instance {key} is not a replica"
            )));
        }
        let main_key = instance.main_key.clone();
        let outcome = self.relocate_replicas(&main_key, key, "").await?;
        Ok((instance, outcome.succeeded.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFleet;

    #[tokio::test]
    async fn test_make_co_main() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("r", &main);
        let topology = fleet.topology();

        topology.make_co_main(&replica).await.unwrap();
        let demoted = fleet.instance(&main);
        assert_eq!(demoted.main_key, replica);
        assert!(demoted.replica_running());
        // Credentials were copied over, best effort.
        assert!(demoted.replication_credentials_present);
        assert_eq!(fleet.audits().last().unwrap().kind, "make-co-main");
    }

    #[tokio::test]
    async fn test_make_co_main_requires_read_only_replica() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("r", &main);
        fleet.update_instance(&replica, |instance| {
            instance.read_only = false;
        });
        let topology = fleet.topology();

        let err = topology.make_co_main(&replica).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
        assert_eq!(fleet.instance(&main).main_key, InstanceKey::default());
    }

    #[tokio::test]
    async fn test_make_co_main_refuses_when_main_has_real_upstream() {
        let fleet = MockFleet::new();
        let grandparent = fleet.add_main("g");
        let parent = fleet.add_replica("p", &grandparent);
        let replica = fleet.add_replica("r", &parent);
        let topology = fleet.topology();

        let err = topology.make_co_main(&replica).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
    }

    #[tokio::test]
    async fn test_take_main_swaps_roles() {
        let fleet = MockFleet::new();
        let grandparent = fleet.add_main("g");
        let parent = fleet.add_replica("p", &grandparent);
        let replica = fleet.add_replica("r", &parent);
        let topology = fleet.topology();

        let promoted = topology.take_main(&replica, false).await.unwrap();
        assert_eq!(promoted.main_key, grandparent);
        let demoted = fleet.instance(&parent);
        assert_eq!(demoted.main_key, replica);
        assert!(fleet.instance(&replica).replica_running());
        assert!(demoted.replica_running());
        assert_eq!(fleet.audits().last().unwrap().kind, "take-main");
    }

    #[tokio::test]
    async fn test_take_main_refuses_co_main_by_default() {
        let fleet = MockFleet::new();
        let grandparent = fleet.add_main("g");
        let parent = fleet.add_replica("p", &grandparent);
        let replica = fleet.add_replica("r", &parent);
        fleet.update_instance(&parent, |instance| {
            instance.is_co_main = true;
        });
        let topology = fleet.topology();

        assert!(topology.take_main(&replica, false).await.is_err());
        assert!(topology.take_main(&replica, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_make_main_requires_dead_or_idle_main() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("r", &main);
        let topology = fleet.topology();

        // The main is alive and well; promotion would usurp it.
        let err = topology.make_main(&replica).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
    }

    #[tokio::test]
    async fn test_make_main_rejects_more_advanced_sibling() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("r", &main);
        let sibling = fleet.add_replica("s", &main);
        fleet.update_instance(&sibling, |instance| {
            instance.exec_binlog_coordinates.log_pos += 500;
        });
        fleet.set_unreachable(&main);
        let topology = fleet.topology();

        let err = topology.make_main(&replica).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
    }

    #[tokio::test]
    async fn test_make_main_promotes_and_clears_read_only() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("r", &main);
        let sibling = fleet.add_replica("s", &main);
        fleet.set_unreachable(&main);
        let marker = crate::instance::BinlogCoordinates::relay("s-relay.000002", 40);
        fleet.script_marker(&sibling, marker, "marker-text");
        fleet.script_marker_search(
            &replica,
            "marker-text",
            crate::instance::BinlogCoordinates::new("r-bin.000003", 100),
        );
        fleet.script_correlation(
            &sibling,
            &replica,
            crate::instance::BinlogCoordinates::new("r-bin.000003", 120),
            3,
        );
        let config = crate::config::TopologyConfig {
            pseudo_gtid_pattern: "marker".to_string(),
            ..MockFleet::test_config()
        };
        let topology = fleet.topology_with_config(config);

        let promoted = topology.make_main(&replica).await.unwrap();
        assert!(!promoted.read_only);
        assert_eq!(fleet.instance(&sibling).main_key, replica);
        assert_eq!(fleet.audits().last().unwrap().kind, "make-main");
        assert!(!topology.maintenance().in_maintenance(&replica));
    }

    #[tokio::test]
    async fn test_take_siblings() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("r", &main);
        let sibling_a = fleet.add_replica("a", &main);
        let sibling_b = fleet.add_replica("b", &main);
        for key in [&replica, &sibling_a, &sibling_b] {
            fleet.update_instance(key, |instance| {
                instance.using_oracle_gtid = true;
                instance.supports_oracle_gtid = true;
            });
        }
        let topology = fleet.topology();

        let (_, taken) = topology.take_siblings(&replica).await.unwrap();
        assert_eq!(taken, 2);
        assert_eq!(fleet.instance(&sibling_a).main_key, replica);
        assert_eq!(fleet.instance(&sibling_b).main_key, replica);
    }
}
