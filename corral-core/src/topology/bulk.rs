//! Bulk moves: fan one operation out over a set of replicas.
//!
//! Every fan-out spawns one task per replica, bounded by a semaphore of
//! `max_concurrent_replica_operations`, aggregates results under a single
//! mutex, and waits on a full barrier before the caller's cleanup section
//! runs. A bulk operation is a total failure only when every attempted
//! item failed; partial success is reported through per-item errors.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceKey};
use crate::topology::{
    filter_instances_by_pattern, remove_instance, GtidHint, PostponedFunctionsContainer, Topology,
};

/// Aggregated result of one bulk operation.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Replicas the operation succeeded on, refreshed.
    pub succeeded: Vec<Instance>,
    /// Replicas the operation failed on (their pre-operation snapshots).
    pub failed: Vec<Instance>,
    /// One error per failed replica, in completion order.
    pub errors: Vec<Error>,
    /// How many replicas the operation considered, postponed ones included.
    pub attempted: usize,
}

impl BulkOutcome {
    /// The "global error" condition: every attempted item failed.
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.errors.len() == self.attempted
    }
}

/// Result of a multi-match: the bulk outcome plus the refreshed instance
/// everything was matched below.
pub type MultiMatchOutcome = (BulkOutcome, Instance);

impl Topology {
    /// Move all replicas of `key` up the topology, below their
    /// grandparent, in parallel. Clock-time this beats moving one at a
    /// time, at the cost of briefly stopping the parent and all replicas
    /// together.
    pub async fn move_up_replicas(&self, key: &InstanceKey, pattern: &str) -> Result<BulkOutcome> {
        let instance = self.driver.read_topology_instance(key).await?;
        if !instance.is_replica() {
            return Err(Error::precondition(format!(
                "instance is not a replica: {key}"
            )));
        }
        self.get_instance_main(&instance).await?;

        if instance.is_binlog_server {
            // Coordinates are transparent through a binlog server; a plain
            // repoint of its replicas is all it takes.
            return self
                .repoint_replicas_to(key, pattern, Some(&instance.main_key))
                .await;
        }

        let replicas = filter_instances_by_pattern(
            self.repository.read_replica_instances(key).await?,
            pattern,
        );
        if replicas.is_empty() {
            return Ok(BulkOutcome::default());
        }
        info!("will move replicas of {key} up the topology");

        let mut guards = vec![self.begin_maintenance(key, "move up replicas")?];
        for replica in &replicas {
            guards.push(
                self.begin_maintenance(&replica.key, &format!("{} moves up", replica.key))?,
            );
        }

        let outcome: Result<BulkOutcome> = async {
            let parent = self.driver.stop_replica(key).await?;
            let results = Arc::new(Mutex::new(BulkOutcome {
                attempted: replicas.len(),
                ..Default::default()
            }));
            let semaphore = Arc::new(Semaphore::new(
                self.config.max_concurrent_replica_operations,
            ));
            let mut tasks = JoinSet::new();
            for replica in replicas {
                let topology = self.clone();
                let parent = parent.clone();
                let semaphore = Arc::clone(&semaphore);
                let results = Arc::clone(&results);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let replica_key = replica.key.clone();
                    let moved: Result<Instance> = async {
                        replica.can_replicate_from(&parent)?;
                        if parent.is_binlog_server {
                            // Special case: just repoint.
                            topology
                                .repoint(&replica_key, Some(&parent.key), GtidHint::Deny)
                                .await
                        } else {
                            // Normal case: do the math.
                            topology.driver.stop_replica(&replica_key).await?;
                            topology
                                .driver
                                .start_replica_until_coordinates(
                                    &replica_key,
                                    &parent.self_binlog_coordinates,
                                )
                                .await?;
                            topology
                                .driver
                                .change_main_to(
                                    &replica_key,
                                    &parent.main_key,
                                    &parent.exec_binlog_coordinates,
                                    false,
                                    GtidHint::Deny,
                                )
                                .await
                        }
                    }
                    .await;
                    topology.start_replica_logged(&replica_key).await;
                    let mut results = results.lock();
                    match moved {
                        Ok(moved) => results.succeeded.push(moved),
                        Err(err) => {
                            results.failed.push(replica);
                            results.errors.push(err);
                        }
                    }
                });
            }
            while tasks.join_next().await.is_some() {}
            let results = std::mem::take(&mut *results.lock());
            Ok(results)
        }
        .await;

        self.start_replica_logged(key).await;
        let outcome = outcome?;
        if outcome.all_failed() {
            warn!("move-up-replicas: error on all operations below {key}");
            return Ok(outcome);
        }
        self.audit(
            "move-up-replicas",
            key,
            &format!(
                "moved up {}/{} replicas of {key}",
                outcome.succeeded.len(),
                outcome.attempted
            ),
        )
        .await;
        Ok(outcome)
    }

    /// Repoint a list of replicas below another instance. The binlog-server
    /// tree is the major use case: coordinates carry over unchanged.
    pub async fn repoint_to(
        &self,
        replicas: Vec<Instance>,
        below_key: &InstanceKey,
    ) -> Result<BulkOutcome> {
        let replicas = remove_instance(replicas, below_key);
        if replicas.is_empty() {
            return Ok(BulkOutcome::default());
        }
        info!("will repoint {} replicas below {below_key}", replicas.len());

        let results = Arc::new(Mutex::new(BulkOutcome {
            attempted: replicas.len(),
            ..Default::default()
        }));
        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrent_replica_operations,
        ));
        let mut tasks = JoinSet::new();
        for replica in replicas {
            let topology = self.clone();
            let below_key = below_key.clone();
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let repointed = topology
                    .repoint(&replica.key, Some(&below_key), GtidHint::Neutral)
                    .await;
                let mut results = results.lock();
                match repointed {
                    Ok(repointed) => results.succeeded.push(repointed),
                    Err(err) => {
                        results.failed.push(replica);
                        results.errors.push(err);
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        let outcome = std::mem::take(&mut *results.lock());

        if outcome.all_failed() {
            warn!("repoint-to: error on all operations below {below_key}");
            return Ok(outcome);
        }
        self.audit(
            "repoint-to",
            below_key,
            &format!(
                "repointed {}/{} replicas to {below_key}",
                outcome.succeeded.len(),
                outcome.attempted
            ),
        )
        .await;
        Ok(outcome)
    }

    /// Repoint replicas of `key` (filtered by `pattern`) onto `below_key`,
    /// or onto their existing main when `below_key` is `None`.
    pub async fn repoint_replicas_to(
        &self,
        key: &InstanceKey,
        pattern: &str,
        below_key: Option<&InstanceKey>,
    ) -> Result<BulkOutcome> {
        let mut replicas = self.repository.read_replica_instances(key).await?;
        if let Some(below_key) = below_key {
            replicas = remove_instance(replicas, below_key);
        }
        let replicas = filter_instances_by_pattern(replicas, pattern);
        if replicas.is_empty() {
            return Ok(BulkOutcome::default());
        }
        // All replicas share a main; absent an explicit target, any of
        // their main keys will do.
        let below_key = match below_key {
            Some(below_key) => below_key.clone(),
            None => replicas[0].main_key.clone(),
        };
        info!("will repoint replicas of {key} to {below_key}");
        self.repoint_to(replicas, &below_key).await
    }

    /// Repoint all replicas of `key` onto their existing main.
    pub async fn repoint_replicas(&self, key: &InstanceKey, pattern: &str) -> Result<BulkOutcome> {
        self.repoint_replicas_to(key, pattern, None).await
    }

    /// Move a list of replicas below `other` via a global-identifier
    /// strategy. Replicas that would hold the operation back are postponed
    /// into the container instead of executed now.
    pub(crate) async fn move_replicas_via_gtid(
        &self,
        replicas: Vec<Instance>,
        other: &Instance,
        postponed: Option<&PostponedFunctionsContainer>,
    ) -> Result<BulkOutcome> {
        let replicas = remove_instance(replicas, &other.key);
        if replicas.is_empty() {
            return Ok(BulkOutcome::default());
        }
        info!(
            "move-replicas-gtid: will move {} replicas below {} via gtid",
            replicas.len(),
            other.key
        );

        let attempted = replicas.len();
        let results = Arc::new(Mutex::new(BulkOutcome {
            attempted,
            ..Default::default()
        }));
        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrent_replica_operations,
        ));
        let mut tasks = JoinSet::new();
        for replica in replicas {
            if let Some(container) = postponed.filter(|_| self.should_postpone_relocating_replica(&replica)) {
                // Register and trust our invoker to drain the container
                // once the main operation completes.
                let topology = self.clone();
                let other = other.clone();
                let description = format!("move-replicas-gtid {}", replica.key);
                container.add(description, move || async move {
                    topology
                        .move_instance_below_via_gtid(&replica, &other)
                        .await
                        .map(|_| ())
                });
                continue;
            }
            let topology = self.clone();
            let other = other.clone();
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let moved = topology.move_instance_below_via_gtid(&replica, &other).await;
                let mut results = results.lock();
                match moved {
                    Ok(moved) => results.succeeded.push(moved),
                    Err(err) => {
                        results.failed.push(replica);
                        results.errors.push(err);
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        let outcome = std::mem::take(&mut *results.lock());

        if outcome.all_failed() {
            warn!(
                "move-replicas-gtid: error on all {} operations below {}",
                outcome.errors.len(),
                other.key
            );
            return Ok(outcome);
        }
        self.audit(
            "move-replicas-gtid",
            &other.key,
            &format!(
                "moved {}/{attempted} replicas below {} via gtid",
                outcome.succeeded.len(),
                other.key
            ),
        )
        .await;
        Ok(outcome)
    }

    /// Move all replicas of `main_key` below `below_key` via a global
    /// identifier strategy.
    pub async fn move_replicas_gtid(
        &self,
        main_key: &InstanceKey,
        below_key: &InstanceKey,
        pattern: &str,
    ) -> Result<BulkOutcome> {
        let below = self.driver.read_topology_instance(below_key).await?;
        let replicas = filter_instances_by_pattern(
            self.repository
                .read_replica_instances_including_binlog_server_sub_replicas(main_key)
                .await?,
            pattern,
        );
        let outcome = self.move_replicas_via_gtid(replicas, &below, None).await?;
        if !outcome.failed.is_empty() {
            warn!(
                "move-replicas-gtid: only moved {} out of {} replicas of {main_key}",
                outcome.succeeded.len(),
                outcome.attempted
            );
        }
        Ok(outcome)
    }

    /// Match multiple replicas below an instance via pseudo-GTID,
    /// independently and in parallel. All given replicas are assumed
    /// siblings. `require_instance_maintenance` is forwarded to each
    /// individual match; callers already holding the below-instance token
    /// pass `false`.
    pub(crate) async fn multi_match_below(
        &self,
        replicas: Vec<Instance>,
        below_key: &InstanceKey,
        postponed: Option<&PostponedFunctionsContainer>,
        require_instance_maintenance: bool,
    ) -> Result<MultiMatchOutcome> {
        let below = self.read_cached(below_key).await?;
        let replicas = remove_instance(replicas, below_key);
        if replicas.is_empty() {
            return Ok((BulkOutcome::default(), below));
        }
        info!(
            "will match {} replicas below {below_key} via pseudo-gtid, independently",
            replicas.len()
        );

        let attempted = replicas.len();
        let results = Arc::new(Mutex::new(BulkOutcome {
            attempted,
            ..Default::default()
        }));
        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrent_replica_operations,
        ));
        let mut tasks = JoinSet::new();
        for replica in replicas {
            if let Some(container) = postponed.filter(|_| self.should_postpone_relocating_replica(&replica)) {
                let topology = self.clone();
                let below_key = below_key.clone();
                let description = format!("multi-match-below-independent {}", replica.key);
                container.add(description, move || async move {
                    topology
                        .match_below(&replica.key, &below_key, require_instance_maintenance)
                        .await
                        .map(|_| ())
                });
                continue;
            }
            let topology = self.clone();
            let below_key = below_key.clone();
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let matched = topology
                    .match_below(&replica.key, &below_key, require_instance_maintenance)
                    .await;
                let mut results = results.lock();
                match matched {
                    Ok((matched, _)) => results.succeeded.push(matched),
                    Err(err) => {
                        results.failed.push(replica);
                        results.errors.push(err);
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        let outcome = std::mem::take(&mut *results.lock());

        if outcome.all_failed() {
            warn!("multi-match-below: error on all {} operations", outcome.errors.len());
            return Ok((outcome, below));
        }
        self.audit(
            "multi-match-below-independent",
            below_key,
            &format!(
                "matched {}/{attempted} replicas below {below_key} via pseudo-gtid",
                outcome.succeeded.len()
            ),
        )
        .await;
        Ok((outcome, below))
    }

    /// Match all replicas of `main_key` below `below_key` via pseudo-GTID.
    /// Structural binlog-server cases (up from, down to, or across relays)
    /// degrade into a plain repoint.
    pub async fn multi_match_replicas(
        &self,
        main_key: &InstanceKey,
        below_key: &InstanceKey,
        pattern: &str,
    ) -> Result<BulkOutcome> {
        let below = self.driver.read_topology_instance(below_key).await?;
        let main = self.read_cached(main_key).await?;

        let binlog_case = if main.is_binlog_server && main.main_key == *below_key {
            // Pointing replicas up from a binlog server.
            true
        } else if below.is_binlog_server && below.main_key == *main_key {
            // Pointing replicas down under a binlog server.
            true
        } else if main.is_binlog_server
            && below.is_binlog_server
            && main.main_key == below.main_key
        {
            // Sibling binlog servers.
            true
        } else {
            false
        };
        if binlog_case {
            return self
                .repoint_replicas_to(main_key, pattern, Some(below_key))
                .await;
        }

        let replicas = filter_instances_by_pattern(
            self.repository
                .read_replica_instances_including_binlog_server_sub_replicas(main_key)
                .await?,
            pattern,
        );
        let (outcome, _) = self
            .multi_match_below(replicas, &below.key, None, true)
            .await?;
        if !outcome.failed.is_empty() {
            warn!(
                "multi-match-replicas: only matched {} out of {} replicas of {main_key}",
                outcome.succeeded.len(),
                outcome.attempted
            );
        }
        self.audit(
            "multi-match-replicas",
            main_key,
            &format!(
                "matched {} replicas under {below_key}",
                outcome.succeeded.len()
            ),
        )
        .await;
        Ok(outcome)
    }

    /// Move all replicas of a (dead) main up the chain so they become its
    /// siblings, via pseudo-GTID.
    pub async fn match_up_replicas(
        &self,
        main_key: &InstanceKey,
        pattern: &str,
    ) -> Result<BulkOutcome> {
        let main = self.read_cached(main_key).await?;
        self.multi_match_replicas(main_key, &main.main_key, pattern)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFleet;

    #[tokio::test]
    async fn test_move_up_replicas_moves_all_children() {
        let fleet = MockFleet::new();
        let grandparent = fleet.add_main("g");
        let parent = fleet.add_replica("p", &grandparent);
        let child_a = fleet.add_replica("a", &parent);
        let child_b = fleet.add_replica("b", &parent);
        let topology = fleet.topology();

        let outcome = topology.move_up_replicas(&parent, "").await.unwrap();
        assert_eq!(outcome.succeeded.len(), 2);
        assert!(outcome.errors.is_empty());
        assert_eq!(fleet.instance(&child_a).main_key, grandparent);
        assert_eq!(fleet.instance(&child_b).main_key, grandparent);
        // Parent was restarted after the barrier.
        assert!(fleet.instance(&parent).replica_running());
        assert_eq!(fleet.audits().last().unwrap().kind, "move-up-replicas");
        assert!(!topology.maintenance().in_maintenance(&parent));
        assert!(!topology.maintenance().in_maintenance(&child_a));
    }

    #[tokio::test]
    async fn test_move_up_replicas_partial_failure() {
        let fleet = MockFleet::new();
        let grandparent = fleet.add_main("g");
        let parent = fleet.add_replica("p", &grandparent);
        let child_a = fleet.add_replica("a", &parent);
        let child_b = fleet.add_replica("b", &parent);
        fleet.fail_next("change_main_to", &child_b, 1);
        let topology = fleet.topology();

        let outcome = topology.move_up_replicas(&parent, "").await.unwrap();
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(!outcome.all_failed());
        assert_eq!(fleet.instance(&child_a).main_key, grandparent);
        assert_eq!(fleet.instance(&child_b).main_key, parent);
        // The failed child still got its restart attempt.
        assert!(fleet
            .journal()
            .iter()
            .any(|line| line.starts_with("start_replica b:3306")));
    }

    #[tokio::test]
    async fn test_move_up_replicas_all_failed_is_global_error() {
        let fleet = MockFleet::new();
        let grandparent = fleet.add_main("g");
        let parent = fleet.add_replica("p", &grandparent);
        let child_a = fleet.add_replica("a", &parent);
        let child_b = fleet.add_replica("b", &parent);
        fleet.fail_next("stop_replica", &child_a, 1);
        fleet.fail_next("stop_replica", &child_b, 1);
        let topology = fleet.topology();

        let outcome = topology.move_up_replicas(&parent, "").await.unwrap();
        assert!(outcome.all_failed());
        // Total failure is not audited as success.
        assert!(fleet
            .audits()
            .iter()
            .all(|entry| entry.kind != "move-up-replicas"));
    }

    #[tokio::test]
    async fn test_move_up_replicas_honors_pattern() {
        let fleet = MockFleet::new();
        let grandparent = fleet.add_main("g");
        let parent = fleet.add_replica("p", &grandparent);
        let child_a = fleet.add_replica("prod-a", &parent);
        let child_b = fleet.add_replica("test-b", &parent);
        let topology = fleet.topology();

        let outcome = topology.move_up_replicas(&parent, "^prod-").await.unwrap();
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(fleet.instance(&child_a).main_key, grandparent);
        assert_eq!(fleet.instance(&child_b).main_key, parent);
    }

    #[tokio::test]
    async fn test_repoint_replicas_to_defaults_to_existing_main() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica_a = fleet.add_replica("a", &main);
        let replica_b = fleet.add_replica("b", &main);
        let topology = fleet.topology();

        let outcome = topology.repoint_replicas(&main, "").await.unwrap();
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(fleet.instance(&replica_a).main_key, main);
        assert_eq!(fleet.instance(&replica_b).main_key, main);
        assert_eq!(fleet.audits().last().unwrap().kind, "repoint-to");
    }

    #[tokio::test]
    async fn test_repoint_to_excludes_target() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let replica_a = fleet.add_replica("a", &main);
        let replica_b = fleet.add_replica("b", &main);
        let replicas = vec![fleet.instance(&replica_a), fleet.instance(&replica_b)];
        let topology = fleet.topology();

        let outcome = topology.repoint_to(replicas, &replica_b).await.unwrap();
        assert_eq!(outcome.attempted, 1);
        assert_eq!(fleet.instance(&replica_a).main_key, replica_b);
    }

    #[tokio::test]
    async fn test_move_replicas_gtid_postpones_lagging_replica() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let target = fleet.add_replica("t", &main);
        let prompt_replica = fleet.add_replica("a", &main);
        let lagging = fleet.add_replica("lag", &main);
        for key in [&target, &prompt_replica, &lagging] {
            fleet.update_instance(key, |instance| {
                instance.using_oracle_gtid = true;
                instance.supports_oracle_gtid = true;
            });
        }
        fleet.update_instance(&lagging, |instance| {
            instance.sql_delay = 3600;
        });
        let config = crate::config::TopologyConfig {
            postpone_replica_recovery_on_lag: Some(std::time::Duration::from_secs(600)),
            ..MockFleet::test_config()
        };
        let topology = fleet.topology_with_config(config);

        let container = PostponedFunctionsContainer::new();
        let replicas = vec![fleet.instance(&prompt_replica), fleet.instance(&lagging)];
        let target_instance = fleet.instance(&target);
        let outcome = topology
            .move_replicas_via_gtid(replicas, &target_instance, Some(&container))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(fleet.instance(&prompt_replica).main_key, target);
        // The laggard was deferred, not moved.
        assert_eq!(fleet.instance(&lagging).main_key, main);
        assert_eq!(container.len(), 1);

        // Draining the container performs the postponed move.
        let results = container.invoke_all().await;
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(fleet.instance(&lagging).main_key, target);
    }

    #[tokio::test]
    async fn test_multi_match_replicas_binlog_server_case_degrades_to_repoint() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let binlog_server = fleet.add_binlog_server("bls", &main);
        let replica_a = fleet.add_replica("a", &binlog_server);
        let replica_b = fleet.add_replica("b", &binlog_server);
        let topology = fleet.topology();

        // Pointing replicas up from a binlog server: no matching required.
        let outcome = topology
            .multi_match_replicas(&binlog_server, &main, "")
            .await
            .unwrap();
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(fleet.instance(&replica_a).main_key, main);
        assert_eq!(fleet.instance(&replica_b).main_key, main);
        assert!(!fleet
            .journal()
            .iter()
            .any(|line| line.starts_with("last_pseudo_gtid")));
    }

    #[tokio::test]
    async fn test_multi_match_replicas_detached_binlog_server_falls_through() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let binlog_server = fleet.add_binlog_server("bls", &main);
        fleet.add_replica("a", &binlog_server);
        // Manually detached relay: its cached main key no longer equals the
        // structural parent, so the binlog-server shortcut must not fire.
        fleet.update_instance(&binlog_server, |instance| {
            instance.main_key = instance.main_key.detached_key();
        });
        let topology = fleet.topology();

        // Falls through to pseudo-gtid matching, which is unconfigured
        // here, so every per-replica match fails.
        let outcome = topology
            .multi_match_replicas(&binlog_server, &main, "")
            .await
            .unwrap();
        assert!(outcome.all_failed());
        assert!(matches!(
            outcome.errors[0],
            Error::PreconditionViolated(_)
        ));
    }
}
