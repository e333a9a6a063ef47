//! Relocate: pick the cheapest way to move an instance (or its replicas)
//! below an arbitrary other instance, spanning plain positions,
//! identifier arithmetic, marker matching and binlog-server hops.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceKey};
use crate::topology::{
    bulk::BulkOutcome, correlation::instances_are_gtid_compatible, filter_instances_by_pattern,
    instance_is_main_of, instances_are_siblings, remove_instance, GtidHint, Topology,
};

impl Topology {
    /// Move the instance below another, choosing the best available
    /// strategy. Refuses to move an instance under its own descendant.
    pub async fn relocate_below(
        &self,
        key: &InstanceKey,
        other_key: &InstanceKey,
    ) -> Result<Instance> {
        let instance = self.read_cached(key).await?;
        let other = self.read_cached(other_key).await?;
        if self.is_descendant_of(&other, key).await? {
            return Err(Error::precondition(format!(
                "relocate: {other_key} is a descendant of {key}"
            )));
        }
        let relocated = self.relocate_below_internal(&instance, &other).await?;
        self.audit(
            "relocate-below",
            key,
            &format!("relocated {key} below {other_key}"),
        )
        .await;
        Ok(relocated)
    }

    /// The strategy ladder. Potentially recursive: relocating under a
    /// binlog server first relocates under the server's main, then
    /// repoints down; moving up through a binlog-server parent recurses
    /// after the hop.
    fn relocate_below_internal<'a>(
        &'a self,
        instance: &'a Instance,
        other: &'a Instance,
    ) -> Pin<Box<dyn Future<Output = Result<Instance>> + Send + 'a>> {
        Box::pin(async move {
            instance.can_replicate_from(other).map_err(|err| {
                Error::precondition(format!(
                    "{} cannot replicate from {}: {err}",
                    instance.key, other.key
                ))
            })?;
            // Simplest: already the desired setup.
            if instance_is_main_of(other, instance) {
                return self
                    .repoint(&instance.key, Some(&other.key), GtidHint::Neutral)
                    .await;
            }
            // Do we have a record of equivalent coordinates?
            if !instance.is_binlog_server {
                if let Ok(moved) = self.move_equivalent(&instance.key, &other.key).await {
                    return Ok(moved);
                }
            }
            // Take advantage of binlog servers where the structure allows.
            if instances_are_siblings(instance, other) && other.is_binlog_server {
                return self.move_below(&instance.key, &other.key).await;
            }
            let instance_main = self.repository.read_instance(&instance.main_key).await?;
            if let Some(instance_main) = &instance_main {
                if instance_main.main_key == other.key && instance_main.is_binlog_server {
                    // Moving to the grandparent through a binlog server.
                    return self
                        .repoint(&instance.key, Some(&instance_main.main_key), GtidHint::Deny)
                        .await;
                }
            }
            if other.is_binlog_server {
                if let Some(instance_main) = &instance_main {
                    if instance_main.is_binlog_server
                        && instances_are_siblings(instance_main, other)
                    {
                        // Binlog-server family: move under the uncle in one step.
                        return self
                            .repoint(&instance.key, Some(&other.key), GtidHint::Deny)
                            .await;
                    }
                }
                // Relocate under the binlog server's main, then repoint down.
                let other_main = self
                    .repository
                    .read_instance(&other.main_key)
                    .await?
                    .ok_or_else(|| Error::NotFound(other.main_key.clone()))?;
                if !other.is_last_check_valid {
                    return Err(Error::precondition(format!(
                        "binlog server {} is not reachable. It would take two steps to relocate {} below it, and I won't even do the first step",
                        other.key, instance.key
                    )));
                }
                debug!(
                    "relocating to a binlog server; will first relocate to its main {} and then repoint down",
                    other_main.key
                );
                self.relocate_below_internal(instance, &other_main).await?;
                return self
                    .repoint(&instance.key, Some(&other.key), GtidHint::Deny)
                    .await;
            }
            if instance.is_binlog_server {
                // A binlog server can only move within its own family tree,
                // and those shapes were covered above. Anything else is not
                // worth automating.
                return Err(Error::precondition(format!(
                    "relocating binlog server {} below {} turns out to be too complex; please do it manually",
                    instance.key, other.key
                )));
            }
            // Next, try a global-identifier move.
            let (_, _, gtid_compatible) = instances_are_gtid_compatible(instance, other);
            if gtid_compatible {
                return self.move_instance_below_via_gtid(instance, other).await;
            }
            // Next, pseudo-GTID. Preferred over plain positions because it
            // stops replication on no server other than `instance` itself.
            if instance.using_pseudo_gtid && other.using_pseudo_gtid {
                let (relocated, _) = self.match_below(&instance.key, &other.key, true).await?;
                return Ok(relocated);
            }
            // Plain binlog file/offset operations.
            if instances_are_siblings(instance, other) && (!other.is_co_main || other.read_only) {
                return self.move_below(&instance.key, &other.key).await;
            }
            if let Some(instance_main) = &instance_main {
                if instance_main.main_key == other.key {
                    // Moving to the grandparent; also handles the writable
                    // co-main case.
                    return self.move_up(&instance.key).await;
                }
                if instance_main.is_binlog_server {
                    // Break into two: hop over the binlog server, then
                    // reconsider from the new position.
                    self.move_up(&instance.key).await?;
                    let refreshed = self.read_cached(&instance.key).await?;
                    return self.relocate_below_internal(&refreshed, other).await;
                }
            }
            // Too complex.
            Err(Error::precondition(format!(
                "relocating {} below {} turns out to be too complex; please do it manually",
                instance.key, other.key
            )))
        })
    }

    /// Move the replicas of `key` below `other_key`, choosing the best
    /// available bulk strategy.
    pub async fn relocate_replicas(
        &self,
        key: &InstanceKey,
        other_key: &InstanceKey,
        pattern: &str,
    ) -> Result<BulkOutcome> {
        let instance = self.read_cached(key).await?;
        let other = self.read_cached(other_key).await?;

        let replicas = remove_instance(
            self.repository.read_replica_instances(key).await?,
            other_key,
        );
        let replicas = filter_instances_by_pattern(replicas, pattern);
        if replicas.is_empty() {
            return Ok(BulkOutcome::default());
        }
        for replica in &replicas {
            if self.is_descendant_of(&other, &replica.key).await? {
                return Err(Error::precondition(format!(
                    "relocate-replicas: {other_key} is a descendant of {}",
                    replica.key
                )));
            }
        }
        let outcome = self
            .relocate_replicas_internal(replicas, &instance, &other)
            .await?;
        self.audit(
            "relocate-replicas",
            key,
            &format!(
                "relocated {} replicas of {key} below {other_key}",
                outcome.succeeded.len()
            ),
        )
        .await;
        Ok(outcome)
    }

    /// Bulk strategy ladder, mirroring the single-instance one.
    fn relocate_replicas_internal<'a>(
        &'a self,
        replicas: Vec<Instance>,
        instance: &'a Instance,
        other: &'a Instance,
    ) -> Pin<Box<dyn Future<Output = Result<BulkOutcome>> + Send + 'a>> {
        Box::pin(async move {
            // Simplest: already in place, just repoint.
            if instance.key == other.key {
                return self.repoint_to(replicas, &other.key).await;
            }
            // Binlog-server structural cases: a plain repoint suffices.
            if instance_is_main_of(other, instance) && instance.is_binlog_server {
                // Up from a binlog server.
                return self.repoint_to(replicas, &other.key).await;
            }
            if instance_is_main_of(instance, other) && other.is_binlog_server {
                // Down under a binlog server.
                return self.repoint_to(replicas, &other.key).await;
            }
            if instances_are_siblings(instance, other)
                && instance.is_binlog_server
                && other.is_binlog_server
            {
                // Between sibling binlog servers.
                return self.repoint_to(replicas, &other.key).await;
            }
            if other.is_binlog_server {
                // Relocate under the binlog server's main, then repoint down.
                let other_main = self
                    .repository
                    .read_instance(&other.main_key)
                    .await?
                    .ok_or_else(|| Error::NotFound(other.main_key.clone()))?;
                let relocated = self
                    .relocate_replicas_internal(replicas, instance, &other_main)
                    .await?;
                return self.repoint_to(relocated.succeeded, &other.key).await;
            }
            // Global identifiers: move whatever is movable that way.
            let gtid_outcome = self
                .move_replicas_via_gtid(replicas.clone(), other, None)
                .await?;
            if gtid_outcome.succeeded.len() == replicas.len() {
                // Moved (or tried moving) everything via identifiers.
                return Ok(gtid_outcome);
            }
            if !gtid_outcome.succeeded.is_empty() {
                // Partial: press on with the leftovers.
                let leftovers = gtid_outcome.failed;
                let mut outcome = self
                    .relocate_replicas_internal(leftovers, instance, other)
                    .await?;
                outcome.succeeded.extend(gtid_outcome.succeeded);
                outcome.attempted = gtid_outcome.attempted;
                return Ok(outcome);
            }
            // Nothing moved via identifiers; maybe there are none in play.

            // Pseudo-GTID leftovers.
            if other.using_pseudo_gtid {
                let pseudo_gtid_replicas: Vec<Instance> = replicas
                    .into_iter()
                    .filter(|replica| {
                        let (_, _, has_to_be_gtid) =
                            instances_are_gtid_compatible(replica, other);
                        replica.using_pseudo_gtid && !has_to_be_gtid
                    })
                    .collect();
                let (outcome, _) = self
                    .multi_match_below(pseudo_gtid_replicas, &other.key, None, true)
                    .await?;
                return Ok(outcome);
            }

            // Too complex.
            Err(Error::precondition(format!(
                "relocating {} replicas of {} below {} turns out to be too complex; please do it manually",
                replicas.len(),
                instance.key,
                other.key
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFleet;

    #[tokio::test]
    async fn test_relocate_refuses_descendant() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("a");
        let middle = fleet.add_replica("b", &main);
        let leaf = fleet.add_replica("c", &middle);
        let topology = fleet.topology();

        let err = topology.relocate_below(&main, &leaf).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
        // Refusal happened before any driver mutation.
        assert!(fleet.mutation_journal().is_empty());
    }

    #[tokio::test]
    async fn test_relocate_already_in_place_repoints() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let topology = fleet.topology();

        let relocated = topology.relocate_below(&replica, &main).await.unwrap();
        assert_eq!(relocated.main_key, main);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "relocate-below"));
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "repoint"));
    }

    #[tokio::test]
    async fn test_relocate_prefers_recorded_equivalence() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        let exec = fleet.instance(&replica).exec_binlog_coordinates;
        fleet.script_equivalence(
            &main,
            &exec,
            &other,
            crate::instance::BinlogCoordinates::new("b-bin.000003", 42),
        );
        let topology = fleet.topology();

        let relocated = topology.relocate_below(&replica, &other).await.unwrap();
        assert_eq!(relocated.main_key, other);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "move-equivalent"));
    }

    #[tokio::test]
    async fn test_relocate_uses_gtid_when_compatible() {
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

        let relocated = topology.relocate_below(&replica, &other).await.unwrap();
        assert_eq!(relocated.main_key, other);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "move-below-gtid"));
    }

    #[tokio::test]
    async fn test_relocate_falls_back_to_pseudo_gtid() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        for key in [&replica, &other] {
            fleet.update_instance(key, |instance| {
                instance.using_pseudo_gtid = true;
            });
        }
        let marker = crate::instance::BinlogCoordinates::relay("a-relay.000002", 10);
        fleet.script_marker(&replica, marker, "marker-a");
        fleet.script_marker_search(
            &other,
            "marker-a",
            crate::instance::BinlogCoordinates::new("b-bin.000003", 80),
        );
        fleet.script_correlation(
            &replica,
            &other,
            crate::instance::BinlogCoordinates::new("b-bin.000003", 95),
            7,
        );
        let config = crate::config::TopologyConfig {
            pseudo_gtid_pattern: "marker".to_string(),
            ..MockFleet::test_config()
        };
        let topology = fleet.topology_with_config(config);

        let relocated = topology.relocate_below(&replica, &other).await.unwrap();
        assert_eq!(relocated.main_key, other);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "match-below"));
    }

    #[tokio::test]
    async fn test_relocate_plain_positions_between_siblings() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other = fleet.add_replica("b", &main);
        let topology = fleet.topology();

        let relocated = topology.relocate_below(&replica, &other).await.unwrap();
        assert_eq!(relocated.main_key, other);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "move-below"));
    }

    #[tokio::test]
    async fn test_relocate_below_binlog_server_goes_via_main() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let binlog_server = fleet.add_binlog_server("bls", &main);
        let other_main = fleet.add_main("m2");
        let replica = fleet.add_replica("a", &other_main);
        // Make the second cluster attachable below the first.
        fleet.update_instance(&replica, |instance| {
            instance.using_oracle_gtid = true;
            instance.supports_oracle_gtid = true;
        });
        fleet.update_instance(&main, |instance| {
            instance.supports_oracle_gtid = true;
        });
        let topology = fleet.topology();

        let relocated = topology
            .relocate_below(&replica, &binlog_server)
            .await
            .unwrap();
        // Two steps: below the binlog server's main, then repointed down.
        assert_eq!(relocated.main_key, binlog_server);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "move-below-gtid"));
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "repoint"));
    }

    #[tokio::test]
    async fn test_relocate_refuses_too_complex() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica = fleet.add_replica("a", &main);
        let other_main = fleet.add_main("m2");
        let other = fleet.add_replica("b", &other_main);
        let topology = fleet.topology();

        // Different clusters, no identifiers, no markers: nothing applies.
        let err = topology.relocate_below(&replica, &other).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionViolated(_)));
    }

    #[tokio::test]
    async fn test_relocate_replicas_repoints_when_target_is_instance() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica_a = fleet.add_replica("a", &main);
        let replica_b = fleet.add_replica("b", &main);
        let topology = fleet.topology();

        let outcome = topology.relocate_replicas(&main, &main, "").await.unwrap();
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(fleet.instance(&replica_a).main_key, main);
        assert_eq!(fleet.instance(&replica_b).main_key, main);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "relocate-replicas"));
    }
}
