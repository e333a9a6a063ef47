//! Single-instance moves.
//!
//! Every operation here follows one outer skeleton: read snapshots, run
//! predicate checks, take maintenance tokens, stop the relevant
//! replication, do the minimum driver work, then a cleanup section that
//! restarts whatever was stopped (in reverse stop order) no matter how the
//! body exited, and finally audit on success. The body runs as an inner
//! async block so the cleanup section executes on every exit path.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::instance::{BinlogCoordinates, Instance, InstanceKey};
use crate::topology::{instances_are_siblings, GtidHint, Topology, UNKNOWN_LOG_FILE};

impl Topology {
    /// Move replica `key` up the hierarchy, below its grandparent.
    pub async fn move_up(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        if !instance.is_replica() {
            return Err(Error::precondition(format!(
                "instance is not a replica: {key}"
            )));
        }
        self.read_cached(key).await?.can_move()?;
        let main = self.get_instance_main(&instance).await?;
        if !main.is_replica() {
            return Err(Error::precondition(format!(
                "main is not a replica itself: {}",
                main.key
            )));
        }
        instance.can_replicate_from(&main)?;
        if main.is_binlog_server {
            // Quick solution via binlog servers.
            return self.repoint(key, Some(&main.main_key), GtidHint::Deny).await;
        }

        info!("will move {key} up the topology");
        let _instance_guard = self.begin_maintenance(key, "move up")?;
        let _main_guard =
            self.begin_maintenance(&main.key, &format!("child {key} moves up"))?;

        // With MariaDB GTID the replica can reattach at any position; no
        // need to silence the main or align first.
        let main_participates = !instance.using_mariadb_gtid;

        let outcome: Result<Instance> = async {
            if main_participates {
                self.driver.stop_replica(&main.key).await?;
            }
            let mut instance = self.driver.stop_replica(key).await?;
            if main_participates {
                instance = self
                    .driver
                    .start_replica_until_coordinates(key, &main.self_binlog_coordinates)
                    .await?;
            }
            // No hostname unresolve: we copy whatever our main thinks of
            // its own main.
            instance = self
                .driver
                .change_main_to(
                    key,
                    &main.main_key,
                    &main.exec_binlog_coordinates,
                    true,
                    GtidHint::Deny,
                )
                .await?;
            Ok(instance)
        }
        .await;

        self.start_replica_logged(key).await;
        if main_participates {
            self.start_replica_logged(&main.key).await;
        }
        let instance = outcome?;
        self.audit(
            "move-up",
            key,
            &format!("moved up {key}. Previous main: {}", main.key),
        )
        .await;
        Ok(instance)
    }

    /// Move replica `key` below its sibling `sibling_key`, aligning the two
    /// first so no statement is lost or duplicated.
    pub async fn move_below(
        &self,
        key: &InstanceKey,
        sibling_key: &InstanceKey,
    ) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        let sibling = self.driver.read_topology_instance(sibling_key).await?;

        if sibling.is_binlog_server {
            // Binlog server has same coordinates as its main: easy solution.
            return self.repoint(key, Some(sibling_key), GtidHint::Deny).await;
        }

        self.read_cached(key).await?.can_move()?;
        self.read_cached(sibling_key).await?.can_move()?;
        if !instances_are_siblings(&instance, &sibling) {
            return Err(Error::precondition(format!(
                "instances are not siblings: {key}, {sibling_key}"
            )));
        }
        instance.can_replicate_from(&sibling)?;

        info!("will move {key} below {sibling_key}");
        let _instance_guard =
            self.begin_maintenance(key, &format!("move below {sibling_key}"))?;
        let _sibling_guard =
            self.begin_maintenance(sibling_key, &format!("{key} moves below this"))?;

        let outcome: Result<Instance> = async {
            let mut instance = self.driver.stop_replica(key).await?;
            let sibling = self.driver.stop_replica(sibling_key).await?;

            // Align: run whichever is further behind up to the other's
            // position, so both have executed the exact same statements.
            if instance
                .exec_binlog_coordinates
                .smaller_than(&sibling.exec_binlog_coordinates)
            {
                instance = self
                    .driver
                    .start_replica_until_coordinates(key, &sibling.exec_binlog_coordinates)
                    .await?;
            } else if sibling
                .exec_binlog_coordinates
                .smaller_than(&instance.exec_binlog_coordinates)
            {
                self.driver
                    .start_replica_until_coordinates(
                        sibling_key,
                        &instance.exec_binlog_coordinates,
                    )
                    .await?;
            }

            instance = self
                .driver
                .change_main_to(
                    key,
                    sibling_key,
                    &sibling.self_binlog_coordinates,
                    false,
                    GtidHint::Deny,
                )
                .await?;
            Ok(instance)
        }
        .await;

        self.start_replica_logged(key).await;
        self.start_replica_logged(sibling_key).await;
        let instance = outcome?;
        self.audit(
            "move-below",
            key,
            &format!("moved {key} below {sibling_key}"),
        )
        .await;
        Ok(instance)
    }

    /// Cheap optimisation: move `key` below `other_key` using previously
    /// recorded coordinate equivalence, with no log scan at all.
    pub async fn move_equivalent(
        &self,
        key: &InstanceKey,
        other_key: &InstanceKey,
    ) -> Result<Instance> {
        let instance = self.read_cached(key).await?;
        if instance.key == *other_key {
            return Err(Error::precondition(format!(
                "move-equivalent: attempt to move an instance below itself: {key}"
            )));
        }
        // Resolve equivalence before touching the replica at all; a miss
        // skips the whole operation without a single driver call.
        let equivalent_coordinates = self
            .repository
            .equivalent_binlog_coordinates(
                &instance.main_key,
                &instance.exec_binlog_coordinates,
                other_key,
            )
            .await?
            .ok_or_else(|| {
                Error::precondition(format!(
                    "no equivalent coordinates found for {key} replicating from {} at {}",
                    instance.main_key, instance.exec_binlog_coordinates
                ))
            })?;

        let known_coordinates = instance.exec_binlog_coordinates.clone();
        let outcome: Result<Instance> = async {
            let instance = self.driver.stop_replica(key).await?;
            // If the position advanced while stopping, the replica was
            // still applying statements and the recorded equivalence is
            // stale.
            if !instance.exec_binlog_coordinates.equals(&known_coordinates) {
                return Err(Error::precondition(format!(
                    "move-equivalent: exec coordinates changed after stopping replication on {key}; aborting"
                )));
            }
            self.driver
                .change_main_to(
                    key,
                    other_key,
                    &equivalent_coordinates,
                    false,
                    GtidHint::Neutral,
                )
                .await
        }
        .await;

        self.start_replica_logged(key).await;
        let instance = outcome?;
        self.audit(
            "move-equivalent",
            key,
            &format!("moved {key} via equivalence coordinates below {other_key}"),
        )
        .await;
        Ok(instance)
    }

    /// Reconnect a replica to a main at its exact current execution
    /// coordinates. `main_key = None` repoints at the existing main (the
    /// corrupted-relay-logs use case); a binlog-server target keeps
    /// coordinates unchanged by construction.
    pub async fn repoint(
        &self,
        key: &InstanceKey,
        main_key: Option<&InstanceKey>,
        gtid_hint: GtidHint,
    ) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        if !instance.is_replica() {
            return Err(Error::precondition(format!(
                "instance is not a replica: {key}"
            )));
        }
        let main_key = main_key.cloned().unwrap_or_else(|| instance.main_key.clone());

        // We prefer the main alive but do not require it; fall back to the
        // cached record when it cannot be reached.
        let (main, main_is_accessible) = match self.driver.read_topology_instance(&main_key).await {
            Ok(main) => (main, true),
            Err(_) => (self.read_cached(&main_key).await?, false),
        };
        instance.can_replicate_from(&main)?;

        // Repoint trusts the user, but only so much: repointing under a
        // binlog server that is behind us is strictly wrong.
        if main.is_binlog_server
            && !instance
                .exec_binlog_coordinates
                .smaller_or_equal(&main.self_binlog_coordinates)
        {
            return Err(Error::precondition(format!(
                "repoint: binlog server {main_key} is not sufficiently up to date to repoint {key} below it"
            )));
        }

        info!("will repoint {key} to main {main_key}");
        let _guard = self.begin_maintenance(key, "repoint")?;

        let outcome: Result<Instance> = async {
            let instance = self.driver.stop_replica(key).await?;
            let mut coordinates = instance.exec_binlog_coordinates.clone();
            if coordinates.is_empty() {
                coordinates.log_file = UNKNOWN_LOG_FILE.to_string();
            }
            // Unresolve the hostname only when the main was live-read;
            // otherwise instruct the driver to take the cached name on
            // trust rather than fail the reparenting.
            self.driver
                .change_main_to(key, &main_key, &coordinates, !main_is_accessible, gtid_hint)
                .await
        }
        .await;

        self.start_replica_logged(key).await;
        let instance = outcome?;
        self.audit(
            "repoint",
            key,
            &format!("replica {key} repointed to main: {main_key}"),
        )
        .await;
        Ok(instance)
    }

    /// Move `key` below `other_key` via a global-identifier strategy.
    pub async fn move_below_gtid(
        &self,
        key: &InstanceKey,
        other_key: &InstanceKey,
    ) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        let other = self.driver.read_topology_instance(other_key).await?;
        self.move_instance_below_via_gtid(&instance, &other).await
    }

    /// Global-identifier move of one instance below another. Both oracle
    /// and MariaDB identifier flavors are served by the same sequence.
    pub(crate) async fn move_instance_below_via_gtid(
        &self,
        instance: &Instance,
        other: &Instance,
    ) -> Result<Instance> {
        self.read_cached(&instance.key).await?.can_move_via_match()?;
        instance.can_replicate_from(other)?;
        self.check_move_via_gtid(instance, other).await?;
        info!("will move {} below {} via gtid", instance.key, other.key);

        let key = &instance.key;
        let _guard = self.begin_maintenance(key, &format!("move below {}", other.key))?;

        let outcome: Result<Instance> = async {
            self.driver.stop_replica(key).await?;
            self.driver
                .change_main_to(
                    key,
                    &other.key,
                    &other.self_binlog_coordinates,
                    false,
                    GtidHint::Force,
                )
                .await
        }
        .await;

        self.start_replica_logged(key).await;
        let moved = outcome?;
        self.audit(
            "move-below-gtid",
            key,
            &format!("moved {key} below {}", other.key),
        )
        .await;
        Ok(moved)
    }

    /// Move `key` below `other_key` by correlating pseudo-GTID markers.
    /// The other instance can be a sibling or any ancestor; it only has to
    /// be more advanced in replication than `key`.
    pub async fn match_below(
        &self,
        key: &InstanceKey,
        other_key: &InstanceKey,
        require_instance_maintenance: bool,
    ) -> Result<(Instance, BinlogCoordinates)> {
        let instance = self.driver.read_topology_instance(key).await?;
        if self.config.pseudo_gtid_pattern.is_empty() {
            return Err(Error::precondition(
                "pseudo-gtid pattern not configured; cannot use pseudo-gtid",
            ));
        }
        if key == other_key {
            return Err(Error::precondition(format!(
                "match-below: attempt to match an instance below itself: {key}"
            )));
        }
        let other = self.driver.read_topology_instance(other_key).await?;
        self.read_cached(key).await?.can_move_via_match()?;
        instance.can_replicate_from(&other)?;
        if other.is_binlog_server {
            // A binlog server cannot answer the log-iteration queries that
            // matching requires.
            return Err(Error::precondition(format!(
                "cannot use pseudo-gtid with binlog server {other_key}"
            )));
        }

        info!("will match {key} below {other_key}");
        let _guard = if require_instance_maintenance {
            let guard = self.begin_maintenance(key, &format!("match below {other_key}"))?;
            // We do not lock the other instance, but we do require that it
            // is not already being operated on.
            if self.maintenance.in_maintenance(other_key) {
                return Err(Error::precondition(format!(
                    "cannot match below {other_key}; it is in maintenance"
                )));
            }
            Some(guard)
        } else {
            None
        };

        let outcome: Result<(Instance, BinlogCoordinates)> = async {
            debug!("stopping replication on {key}");
            let instance = self.driver.stop_replica(key).await?;
            let (next_coordinates, count_matched) = self
                .correlate_binlog_coordinates(&instance, None, &other)
                .await?;
            debug!(
                "{key} will match below {other_key} at {next_coordinates}; validated events: {count_matched}"
            );
            let instance = self
                .driver
                .change_main_to(key, other_key, &next_coordinates, false, GtidHint::Deny)
                .await?;
            Ok((instance, next_coordinates))
        }
        .await;

        self.start_replica_logged(key).await;
        let (instance, coordinates) = outcome?;
        self.audit(
            "match-below",
            key,
            &format!("matched {key} below {other_key}"),
        )
        .await;
        Ok((instance, coordinates))
    }

    /// Re-match a replica below its own main via pseudo-GTID.
    pub async fn rematch_replica(
        &self,
        key: &InstanceKey,
        require_instance_maintenance: bool,
    ) -> Result<(Instance, BinlogCoordinates)> {
        let instance = self.driver.read_topology_instance(key).await?;
        let main = self.read_cached(&instance.main_key).await?;
        self.match_below(key, &main.key, require_instance_maintenance)
            .await
    }

    /// Move a replica up to become a sibling of its main, via pseudo-GTID.
    /// Works from cached records only; the grandparent may well be dead.
    pub async fn match_up(
        &self,
        key: &InstanceKey,
        require_instance_maintenance: bool,
    ) -> Result<(Instance, BinlogCoordinates)> {
        let instance = self.read_cached(key).await?;
        if !instance.is_replica() {
            return Err(Error::precondition(format!(
                "instance is not a replica: {key}"
            )));
        }
        let main = self.read_cached(&instance.main_key).await?;
        if !main.is_replica() {
            return Err(Error::precondition(format!(
                "main is not a replica itself: {}",
                main.key
            )));
        }
        self.match_below(key, &main.main_key, require_instance_maintenance)
            .await
    }

    /// Forget a replica's replication configuration entirely.
    pub async fn reset_replica_operation(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        info!("will reset replica on {key}");
        let _guard = self.begin_maintenance(key, "reset replica")?;

        let outcome: Result<Instance> = async {
            if instance.is_replica() {
                self.driver.stop_replica(key).await?;
            }
            self.driver.reset_replica(key).await
        }
        .await;

        self.start_replica_logged(key).await;
        let instance = outcome?;
        self.audit("reset-subordinate", key, &format!("{key} replication reset"))
            .await;
        Ok(instance)
    }

    /// Park a replica by reversibly mangling its main's hostname, so it
    /// cannot accidentally resume replication.
    pub async fn detach_replica_main_host(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        if !instance.is_replica() {
            return Err(Error::precondition(format!(
                "instance is not a replica: {key}"
            )));
        }
        if instance.main_key.is_detached() {
            return Err(Error::precondition(format!(
                "instance already detached: {key}"
            )));
        }
        let detached_main_key = instance.main_key.detached_key();
        info!("will detach main host on {key}. Detached key is {detached_main_key}");
        let _guard = self.begin_maintenance(key, "detach-replica-main-host")?;

        let outcome: Result<Instance> = async {
            let instance = self.driver.stop_replica(key).await?;
            self.driver
                .change_main_to(
                    key,
                    &detached_main_key,
                    &instance.exec_binlog_coordinates,
                    true,
                    GtidHint::Neutral,
                )
                .await
        }
        .await;

        self.start_replica_logged(key).await;
        let instance = outcome?;
        self.audit(
            "repoint",
            key,
            &format!("replica {key} detached from main into {detached_main_key}"),
        )
        .await;
        Ok(instance)
    }

    /// Undo [`Topology::detach_replica_main_host`].
    pub async fn reattach_replica_main_host(&self, key: &InstanceKey) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        if !instance.is_replica() {
            return Err(Error::precondition(format!(
                "instance is not a replica: {key}"
            )));
        }
        if !instance.main_key.is_detached() {
            return Err(Error::precondition(format!(
                "instance does not seem to be detached: {key}"
            )));
        }
        let reattached_main_key = instance.main_key.reattached_key();
        info!("will reattach main host on {key}. Reattached key is {reattached_main_key}");
        let _guard = self.begin_maintenance(key, "reattach-replica-main-host")?;

        let outcome: Result<Instance> = async {
            let instance = self.driver.stop_replica(key).await?;
            let instance = self
                .driver
                .change_main_to(
                    key,
                    &reattached_main_key,
                    &instance.exec_binlog_coordinates,
                    true,
                    GtidHint::Neutral,
                )
                .await?;
            // In case this instance used to be a main of its own cluster.
            self.repository
                .replace_alias_cluster_name(&key.to_string(), &reattached_main_key.to_string())
                .await?;
            Ok(instance)
        }
        .await;

        self.start_replica_logged(key).await;
        let instance = outcome?;
        self.audit(
            "repoint",
            key,
            &format!("replica {key} reattached to main {reattached_main_key}"),
        )
        .await;
        Ok(instance)
    }

    /// Purge the instance's binary logs up to (excluding) `logfile`.
    /// Unless `force` is given, refuse while any replica has not executed
    /// past the purge target.
    pub async fn purge_binary_logs_to(
        &self,
        key: &InstanceKey,
        logfile: &str,
        force: bool,
    ) -> Result<Instance> {
        if !force {
            let purge_coordinates = BinlogCoordinates::new(logfile, 0);
            let replicas = self.repository.read_replica_instances(key).await?;
            for replica in &replicas {
                if !purge_coordinates.smaller_than(&replica.exec_binlog_coordinates) {
                    return Err(Error::precondition(format!(
                        "unsafe to purge binary logs on {key} up to {logfile} because replica {} has only applied up to {}",
                        replica.key, replica.exec_binlog_coordinates
                    )));
                }
            }
        }
        self.driver.purge_binary_logs_to(key, logfile).await
    }

    /// Purge the instance's binary logs up to the latest one.
    pub async fn purge_binary_logs_to_latest(
        &self,
        key: &InstanceKey,
        force: bool,
    ) -> Result<Instance> {
        let instance = self.driver.read_topology_instance(key).await?;
        self.purge_binary_logs_to(key, &instance.self_binlog_coordinates.log_file, force)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::testing::MockFleet;

    #[tokio::test]
    async fn test_move_up_simple_chain() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let parent = fleet.add_replica("p", &main);
        let child = fleet.add_replica("c", &parent);
        let topology = fleet.topology();

        let moved = topology.move_up(&child).await.unwrap();
        assert_eq!(moved.main_key, main);
        // The child landed exactly at its old parent's execution position.
        let parent_exec = fleet.instance(&parent).exec_binlog_coordinates;
        assert_eq!(fleet.instance(&child).exec_binlog_coordinates, parent_exec);

        // Fixed call order: stop parent, stop child, advance child, reparent,
        // then restart child before parent.
        let journal = fleet.journal();
        let position = |needle: &str| {
            journal
                .iter()
                .position(|line| line.starts_with(needle))
                .unwrap_or_else(|| panic!("{needle} not found in {journal:?}"))
        };
        assert!(position("stop_replica p:3306") < position("stop_replica c:3306"));
        assert!(
            position("stop_replica c:3306")
                < position("start_replica_until_coordinates c:3306")
        );
        assert!(
            position("start_replica_until_coordinates c:3306")
                < position("change_main_to c:3306")
        );
        assert!(position("change_main_to c:3306") < position("start_replica c:3306"));
        assert!(position("start_replica c:3306") < position("start_replica p:3306"));
        assert_eq!(fleet.audits().last().unwrap().kind, "move-up");

        // Maintenance tokens were released on the way out.
        assert!(!topology.maintenance().in_maintenance(&child));
        assert!(!topology.maintenance().in_maintenance(&parent));
    }

    #[tokio::test]
    async fn test_move_up_short_circuits_through_binlog_server() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let binlog_server = fleet.add_binlog_server("bls", &main);
        let child = fleet.add_replica("c", &binlog_server);
        let topology = fleet.topology();

        let exec_before = fleet.instance(&child).exec_binlog_coordinates;
        let moved = topology.move_up(&child).await.unwrap();
        assert_eq!(moved.main_key, main);
        // Coordinates carried over untouched; no advancement happened.
        assert_eq!(fleet.instance(&child).exec_binlog_coordinates, exec_before);
        let journal = fleet.journal();
        assert!(!journal
            .iter()
            .any(|line| line.starts_with("start_replica_until_coordinates")));
        assert!(journal
            .iter()
            .any(|line| line.starts_with("change_main_to c:3306") && line.contains("hint=Deny")));
        assert_eq!(fleet.audits().last().unwrap().kind, "repoint");
    }

    #[tokio::test]
    async fn test_move_up_requires_replicating_grandparent() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let topology = fleet.topology();

        // The parent is a main, not a replica; there is nowhere to move up to.
        let err = topology.move_up(&replica).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
    }

    #[tokio::test]
    async fn test_move_below_aligns_siblings_first() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let behind = fleet.add_replica("b", &main);
        let ahead = fleet.add_replica("c", &main);
        fleet.update_instance(&behind, |instance| {
            instance.exec_binlog_coordinates.log_pos = 100;
        });
        fleet.update_instance(&ahead, |instance| {
            instance.exec_binlog_coordinates.log_pos = 150;
        });
        let topology = fleet.topology();

        let moved = topology.move_below(&behind, &ahead).await.unwrap();
        assert_eq!(moved.main_key, ahead);
        // The lagging sibling was run up to 150 before reparenting.
        let journal = fleet.journal();
        assert!(journal.iter().any(|line| {
            line.starts_with("start_replica_until_coordinates b:3306")
                && line.contains("m-bin.000010:150")
        }));
        // And attached at the new main's own log position.
        let ahead_self = fleet.instance(&ahead).self_binlog_coordinates;
        assert_eq!(fleet.instance(&behind).exec_binlog_coordinates, ahead_self);
        assert_eq!(fleet.audits().last().unwrap().kind, "move-below");
    }

    #[tokio::test]
    async fn test_move_below_rejects_non_siblings() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let grandchild = fleet.add_replica("g", &replica);
        let other_main = fleet.add_main("m2");
        let stranger = fleet.add_replica("s", &other_main);
        let topology = fleet.topology();

        assert!(topology.move_below(&grandchild, &stranger).await.is_err());
    }

    #[tokio::test]
    async fn test_repoint_is_idempotent_on_own_main() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let topology = fleet.topology();

        let before = fleet.instance(&replica);
        let repointed = topology
            .repoint(&replica, None, GtidHint::Neutral)
            .await
            .unwrap();
        assert_eq!(repointed.main_key, main);
        let after = fleet.instance(&replica);
        assert_eq!(after.exec_binlog_coordinates, before.exec_binlog_coordinates);
        assert!(after.replica_running());
        assert_eq!(fleet.audits().last().unwrap().kind, "repoint");
    }

    #[tokio::test]
    async fn test_repoint_substitutes_sentinel_for_empty_coordinates() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        fleet.update_instance(&replica, |instance| {
            instance.exec_binlog_coordinates = BinlogCoordinates::default();
        });
        let topology = fleet.topology();

        topology
            .repoint(&replica, None, GtidHint::Neutral)
            .await
            .unwrap();
        assert!(fleet
            .journal()
            .iter()
            .any(|line| line.starts_with("change_main_to a:3306")
                && line.contains(UNKNOWN_LOG_FILE)));
    }

    #[tokio::test]
    async fn test_repoint_falls_back_to_cached_main() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        fleet.set_unreachable(&main);
        let topology = fleet.topology();

        topology
            .repoint(&replica, None, GtidHint::Neutral)
            .await
            .unwrap();
        // The dead main means the driver must trust the cached hostname.
        assert!(fleet
            .journal()
            .iter()
            .any(|line| line.starts_with("change_main_to a:3306")
                && line.contains("unresolve=true")));
    }

    #[tokio::test]
    async fn test_repoint_refuses_stale_binlog_server() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let binlog_server = fleet.add_binlog_server("bls", &main);
        let replica = fleet.add_replica("a", &main);
        // The binlog server is behind the replica.
        fleet.update_instance(&binlog_server, |instance| {
            instance.self_binlog_coordinates.log_pos = 10;
        });
        let topology = fleet.topology();

        let err = topology
            .repoint(&replica, Some(&binlog_server), GtidHint::Deny)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
        assert!(fleet.mutation_journal().is_empty());
    }

    #[tokio::test]
    async fn test_move_equivalent_uses_recorded_coordinates() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        let exec = fleet.instance(&replica).exec_binlog_coordinates;
        let equivalent = BinlogCoordinates::new("b-bin.000003", 777);
        fleet.script_equivalence(&main, &exec, &other, equivalent.clone());
        let topology = fleet.topology();

        let moved = topology.move_equivalent(&replica, &other).await.unwrap();
        assert_eq!(moved.main_key, other);
        assert_eq!(
            fleet.instance(&replica).exec_binlog_coordinates,
            equivalent
        );
        assert_eq!(fleet.audits().last().unwrap().kind, "move-equivalent");
    }

    #[tokio::test]
    async fn test_move_equivalent_without_record_touches_nothing() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        let topology = fleet.topology();

        let err = topology.move_equivalent(&replica, &other).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
        assert!(fleet.mutation_journal().is_empty());
    }

    #[tokio::test]
    async fn test_move_equivalent_aborts_on_stale_position() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        let exec = fleet.instance(&replica).exec_binlog_coordinates;
        fleet.script_equivalence(
            &main,
            &exec,
            &other,
            BinlogCoordinates::new("b-bin.000003", 777),
        );
        // Position creeps forward while stopping: equivalence is stale.
        fleet.advance_on_stop(&replica);
        let topology = fleet.topology();

        let err = topology.move_equivalent(&replica, &other).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
        // No reparenting happened, and the replica was restarted.
        assert!(!fleet
            .journal()
            .iter()
            .any(|line| line.starts_with("change_main_to")));
        assert!(fleet.instance(&replica).replica_running());
    }

    #[tokio::test]
    async fn test_move_below_gtid() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        for key in [&replica, &other] {
            fleet.update_instance(key, |instance| {
                instance.using_oracle_gtid = true;
                instance.supports_oracle_gtid = true;
            });
        }
        let topology = fleet.topology();

        let moved = topology.move_below_gtid(&replica, &other).await.unwrap();
        assert_eq!(moved.main_key, other);
        assert!(fleet
            .journal()
            .iter()
            .any(|line| line.starts_with("change_main_to a:3306")
                && line.contains("hint=Force")));
        assert_eq!(fleet.audits().last().unwrap().kind, "move-below-gtid");
    }

    #[tokio::test]
    async fn test_move_below_gtid_refuses_purged_entries() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        for key in [&replica, &other] {
            fleet.update_instance(key, |instance| {
                instance.using_oracle_gtid = true;
                instance.supports_oracle_gtid = true;
            });
        }
        // The target purged entries the mover never executed.
        fleet.update_instance(&other, |instance| {
            instance.gtid_purged = "00020194-3333-3333-3333-333333333333:1-100".to_string();
        });
        let topology = fleet.topology();

        let err = topology.move_below_gtid(&replica, &other).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
        assert!(!fleet
            .journal()
            .iter()
            .any(|line| line.starts_with("change_main_to")));
    }

    #[tokio::test]
    async fn test_match_below_via_scripted_correlation() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        let marker_coordinates = BinlogCoordinates::relay("a-relay.000002", 300);
        let matched_coordinates = BinlogCoordinates::new("b-bin.000003", 450);
        fleet.script_marker(&replica, marker_coordinates, "drop view if exists `_corral_hint__asc:59f364`");
        fleet.script_marker_search(
            &other,
            "drop view if exists `_corral_hint__asc:59f364`",
            BinlogCoordinates::new("b-bin.000003", 400),
        );
        fleet.script_correlation(&replica, &other, matched_coordinates.clone(), 12);
        let config = TopologyConfig {
            pseudo_gtid_pattern: "drop view if exists".to_string(),
            ..MockFleet::test_config()
        };
        let topology = fleet.topology_with_config(config);

        let (matched, coordinates) = topology.match_below(&replica, &other, true).await.unwrap();
        assert_eq!(matched.main_key, other);
        assert_eq!(coordinates, matched_coordinates);
        assert_eq!(
            fleet.instance(&replica).exec_binlog_coordinates,
            matched_coordinates
        );
        assert_eq!(fleet.audits().last().unwrap().kind, "match-below");
    }

    #[tokio::test]
    async fn test_match_below_requires_pattern() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        let topology = fleet.topology();

        let err = topology.match_below(&replica, &other, true).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
    }

    #[tokio::test]
    async fn test_match_below_respects_target_maintenance() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        let config = TopologyConfig {
            pseudo_gtid_pattern: "drop view if exists".to_string(),
            ..MockFleet::test_config()
        };
        let topology = fleet.topology_with_config(config);
        let _token = topology
            .maintenance()
            .begin_maintenance(&other, "operator", "manual work")
            .unwrap();

        let err = topology.match_below(&replica, &other, true).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
        // Our own token was released despite the early failure.
        assert!(!topology.maintenance().in_maintenance(&replica));
    }

    #[tokio::test]
    async fn test_detach_reattach_round_trip() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let topology = fleet.topology();

        let detached = topology.detach_replica_main_host(&replica).await.unwrap();
        assert!(detached.main_key.is_detached());
        assert_eq!(detached.main_key.reattached_key(), main);
        // Detaching twice is refused.
        assert!(topology.detach_replica_main_host(&replica).await.is_err());

        let reattached = topology.reattach_replica_main_host(&replica).await.unwrap();
        assert_eq!(reattached.main_key, main);
        assert!(fleet
            .journal()
            .iter()
            .any(|line| line.starts_with("replace_alias_cluster_name")));
        // Reattaching a non-detached replica is refused.
        assert!(topology.reattach_replica_main_host(&replica).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_replica_operation() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let topology = fleet.topology();

        let reset = topology.reset_replica_operation(&replica).await.unwrap();
        assert!(!reset.is_replica());
        assert_eq!(fleet.audits().last().unwrap().kind, "reset-subordinate");
    }

    #[tokio::test]
    async fn test_purge_binary_logs_guards_replicas() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        // The replica has only applied up to an early binlog.
        fleet.update_instance(&replica, |instance| {
            instance.exec_binlog_coordinates = BinlogCoordinates::new("m-bin.000002", 100);
        });
        let topology = fleet.topology();

        let err = topology
            .purge_binary_logs_to(&main, "m-bin.000009", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));

        // Forcing ignores the replica's position.
        topology
            .purge_binary_logs_to(&main, "m-bin.000009", true)
            .await
            .unwrap();
        assert!(fleet
            .journal()
            .iter()
            .any(|line| line.starts_with("purge_binary_logs_to m:3306")));
    }
}
