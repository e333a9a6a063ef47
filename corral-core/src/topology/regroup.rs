//! Regroup: promote one replica over its siblings and reattach the rest,
//! choosing between global-identifier, pseudo-identifier and binlog-server
//! strategies.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceKey};
use crate::topology::{GtidHint, PostponedFunctionsContainer, Topology};

/// Callback invoked as soon as a regroup settles on its candidate.
pub type OnCandidateChosen<'a> = &'a (dyn Fn(&Instance) + Send + Sync);

/// Predicate deciding whether all match operations of a regroup should be
/// postponed wholesale (e.g. the candidate itself lags badly).
pub type PostponeAllMatches<'a> = &'a (dyn Fn(&Instance) -> bool + Send + Sync);

/// Classification of a main's replicas after a regroup.
#[derive(Debug, Default)]
pub struct RegroupOutcome {
    /// More advanced than the promoted candidate; lost for rematch.
    pub ahead: Vec<Instance>,
    /// Identical coordinates; attached cheaply.
    pub equal: Vec<Instance>,
    /// Behind the candidate; attached by replay/identifier arithmetic.
    pub later: Vec<Instance>,
    /// Could not replicate from the candidate at all.
    pub cannot_replicate: Vec<Instance>,
    /// The promoted replica.
    pub candidate: Option<Instance>,
    /// Errors collected from partial failures along the way.
    pub errors: Vec<Error>,
}

/// Outcome of regrouping a pure binlog-server tier.
#[derive(Debug, Default)]
pub struct BinlogServerRegroupOutcome {
    /// Binlog servers repointed under the promoted one.
    pub repointed: Vec<Instance>,
    /// The promoted (most advanced) binlog server.
    pub promoted: Option<Instance>,
}

impl Topology {
    /// The most advanced healthy binlog server replicating from `main_key`,
    /// along with all binlog-server replicas.
    async fn most_up_to_date_binlog_server(
        &self,
        main_key: &InstanceKey,
    ) -> Result<(Option<Instance>, Vec<Instance>)> {
        let binlog_servers = self
            .repository
            .read_binlog_server_replica_instances(main_key)
            .await?;
        let mut most_advanced: Option<Instance> = None;
        for binlog_server in &binlog_servers {
            if !binlog_server.is_last_check_valid {
                continue;
            }
            let is_ahead = most_advanced.as_ref().map_or(true, |best| {
                best.exec_binlog_coordinates
                    .smaller_than(&binlog_server.exec_binlog_coordinates)
            });
            if is_ahead {
                most_advanced = Some(binlog_server.clone());
            }
        }
        Ok((most_advanced, binlog_servers))
    }

    /// Regroup replicas of `main_key` using pseudo-GTID: equal replicas are
    /// repointed at the candidate's own position with no log scan, later
    /// replicas are matched by replay, and everything operated on is
    /// restarted in parallel.
    pub async fn regroup_replicas_pseudo_gtid(
        &self,
        main_key: &InstanceKey,
        return_replica_even_on_failure: bool,
        on_candidate_chosen: Option<OnCandidateChosen<'_>>,
        postponed: Option<&PostponedFunctionsContainer>,
        postpone_all_matches: Option<PostponeAllMatches<'_>>,
    ) -> Result<RegroupOutcome> {
        let selection = self.get_candidate_replica(main_key, true).await?;
        if selection.fallback {
            let mut outcome = RegroupOutcome {
                ahead: selection.ahead,
                equal: selection.equal,
                later: selection.later,
                cannot_replicate: selection.cannot_replicate,
                candidate: selection.candidate.filter(|_| return_replica_even_on_failure),
                ..Default::default()
            };
            outcome
                .errors
                .push(Error::precondition("no candidate replica found"));
            return Ok(outcome);
        }
        let candidate = match selection.candidate {
            Some(candidate) => candidate,
            None => return Err(Error::precondition("no candidate replica found")),
        };
        if self.config.pseudo_gtid_pattern.is_empty() {
            return Err(Error::precondition(
                "pseudo-gtid pattern not configured; cannot use pseudo-gtid",
            ));
        }
        if let Some(on_chosen) = on_candidate_chosen {
            on_chosen(&candidate);
        }

        let mut outcome = RegroupOutcome {
            ahead: selection.ahead,
            equal: selection.equal.clone(),
            later: selection.later.clone(),
            cannot_replicate: selection.cannot_replicate,
            candidate: Some(candidate.clone()),
            ..Default::default()
        };

        if let (Some(container), Some(postpone_all)) = (postponed, postpone_all_matches) {
            if postpone_all(&candidate) {
                let topology = self.clone();
                let main_key = main_key.clone();
                let candidate = candidate.clone();
                let equal = selection.equal;
                let later = selection.later;
                container.add(
                    format!("regroup-replicas-pseudo-gtid {}", candidate.key),
                    move || async move {
                        let (_, errors) = topology
                            .match_regrouped_replicas_pseudo_gtid(
                                &main_key, &candidate, equal, later, None,
                            )
                            .await;
                        errors.into_iter().next().map_or(Ok(()), Err)
                    },
                );
                return Ok(outcome);
            }
        }

        let (matched_later, errors) = self
            .match_regrouped_replicas_pseudo_gtid(
                main_key,
                &candidate,
                selection.equal,
                selection.later,
                postponed,
            )
            .await;
        outcome.later = matched_later;
        outcome.errors = errors;
        debug!("regroup-replicas: done");
        // Ahead replicas are lost: they were more advanced than the
        // promoted candidate.
        Ok(outcome)
    }

    /// The matching half of a pseudo-GTID regroup: attach equals at the
    /// candidate's position, match laters by replay, restart everything.
    async fn match_regrouped_replicas_pseudo_gtid(
        &self,
        main_key: &InstanceKey,
        candidate: &Instance,
        equal: Vec<Instance>,
        later: Vec<Instance>,
        postponed: Option<&PostponedFunctionsContainer>,
    ) -> (Vec<Instance>, Vec<Error>) {
        let mut errors = Vec::new();

        debug!("regroup-replicas: working on {} equal replicas", equal.len());
        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrent_replica_operations,
        ));
        let shared_errors = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = JoinSet::new();
        for replica in &equal {
            // This replica has the exact same executing coordinates as the
            // candidate: it can attach at the candidate's own position
            // without any log scan.
            let topology = self.clone();
            let replica_key = replica.key.clone();
            let candidate = candidate.clone();
            let semaphore = Arc::clone(&semaphore);
            let shared_errors = Arc::clone(&shared_errors);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if let Err(err) = topology
                    .driver
                    .change_main_to(
                        &replica_key,
                        &candidate.key,
                        &candidate.self_binlog_coordinates,
                        false,
                        GtidHint::Deny,
                    )
                    .await
                {
                    warn!("regroup-replicas: failed to attach {replica_key}: {err}");
                    shared_errors.lock().push(err);
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        errors.append(&mut shared_errors.lock());

        debug!("regroup-replicas: multi matching {} later replicas", later.len());
        let matched_later = match self
            .multi_match_below(later, &candidate.key, postponed, true)
            .await
        {
            Ok((mut bulk, _)) => {
                errors.append(&mut bulk.errors);
                bulk.succeeded
            }
            Err(err) => {
                errors.push(err);
                Vec::new()
            }
        };

        let mut operated: Vec<InstanceKey> =
            equal.iter().map(|replica| replica.key.clone()).collect();
        operated.push(candidate.key.clone());
        operated.extend(matched_later.iter().map(|replica| replica.key.clone()));
        debug!("regroup-replicas: starting {} replicas", operated.len());
        let mut tasks = JoinSet::new();
        for key in operated.iter().cloned() {
            let topology = self.clone();
            tasks.spawn(async move {
                topology.start_replica_logged(&key).await;
            });
        }
        while tasks.join_next().await.is_some() {}

        self.audit(
            "regroup-replicas",
            main_key,
            &format!("regrouped {} replicas below {main_key}", operated.len()),
        )
        .await;
        (matched_later, errors)
    }

    /// Pseudo-GTID regroup that also drills into replicas of binlog-server
    /// intermediaries: when a binlog server is more advanced than the
    /// candidate, the candidate is run up through it first, then the binlog
    /// servers' own replicas are matched under the candidate.
    pub async fn regroup_replicas_pseudo_gtid_including_sub_replicas_of_binlog_servers(
        &self,
        main_key: &InstanceKey,
        return_replica_even_on_failure: bool,
        on_candidate_chosen: Option<OnCandidateChosen<'_>>,
        postponed: Option<&PostponedFunctionsContainer>,
        postpone_all_matches: Option<PostponeAllMatches<'_>>,
    ) -> Result<RegroupOutcome> {
        // Best effort: align candidate and binlog servers first. Failures
        // here are logged and the ordinary regroup still proceeds.
        if let Err(err) = self.align_with_binlog_servers(main_key).await {
            warn!("regroup-replicas-including-bls: binlog-server pre-pass failed for {main_key}: {err}");
        }
        self.regroup_replicas_pseudo_gtid(
            main_key,
            return_replica_even_on_failure,
            on_candidate_chosen,
            postponed,
            postpone_all_matches,
        )
        .await
    }

    async fn align_with_binlog_servers(&self, main_key: &InstanceKey) -> Result<()> {
        debug!("regroup-replicas-including-bls: starting on replicas of {main_key}");
        let (most_up_to_date, binlog_servers) =
            self.most_up_to_date_binlog_server(main_key).await?;
        let most_up_to_date = match most_up_to_date {
            Some(binlog_server) => binlog_server,
            None => {
                debug!("regroup-replicas-including-bls: no binlog server replicates from {main_key}");
                return Ok(());
            }
        };
        debug!(
            "regroup-replicas-including-bls: most up to date binlog server of {main_key}: {}",
            most_up_to_date.key
        );

        let selection = self.get_candidate_replica(main_key, true).await?;
        let candidate = match selection.candidate {
            Some(candidate) if !selection.fallback => candidate,
            _ => {
                debug!("regroup-replicas-including-bls: no candidate replica for {main_key}");
                return Ok(());
            }
        };
        debug!(
            "regroup-replicas-including-bls: candidate replica of {main_key}: {}",
            candidate.key
        );

        if candidate
            .exec_binlog_coordinates
            .smaller_than(&most_up_to_date.exec_binlog_coordinates)
        {
            // The candidate lags the binlog server. Advance it by running
            // it below the binlog server up to the server's position, then
            // park it back under the main.
            self.repoint(&candidate.key, Some(&most_up_to_date.key), GtidHint::Deny)
                .await?;
            self.driver
                .start_replica_until_coordinates(
                    &candidate.key,
                    &most_up_to_date.exec_binlog_coordinates,
                )
                .await?;
            self.repoint(&candidate.key, Some(main_key), GtidHint::Deny)
                .await?;
            return Ok(());
        }

        // The candidate is as (or more) up to date than every binlog
        // server; pull the binlog servers' replicas under it.
        for binlog_server in &binlog_servers {
            debug!(
                "regroup-replicas-including-bls: matching replicas of binlog server {} below {}",
                binlog_server.key, candidate.key
            );
            // At this point do what is doable; failures are tolerated.
            if let Err(err) = self
                .multi_match_replicas(&binlog_server.key, &candidate.key, "")
                .await
            {
                warn!(
                    "regroup-replicas-including-bls: failed matching replicas of {}: {err}",
                    binlog_server.key
                );
            }
        }
        self.audit(
            "regroup-replicas-including-bls",
            main_key,
            &format!(
                "matched replicas of binlog server replicas of {main_key} under {}",
                candidate.key
            ),
        )
        .await;
        Ok(())
    }

    /// Regroup replicas of `main_key` via a global-identifier strategy:
    /// equal and later replicas are moved below the candidate, ahead
    /// replicas are lost.
    pub async fn regroup_replicas_gtid(
        &self,
        main_key: &InstanceKey,
        return_replica_even_on_failure: bool,
        on_candidate_chosen: Option<OnCandidateChosen<'_>>,
        postponed: Option<&PostponedFunctionsContainer>,
        postpone_all_matches: Option<PostponeAllMatches<'_>>,
    ) -> Result<RegroupOutcome> {
        let selection = self.get_candidate_replica(main_key, true).await?;
        if selection.fallback {
            let mut outcome = RegroupOutcome {
                ahead: selection.ahead,
                cannot_replicate: selection.cannot_replicate,
                candidate: selection.candidate.filter(|_| return_replica_even_on_failure),
                ..Default::default()
            };
            outcome
                .errors
                .push(Error::precondition("no candidate replica found"));
            return Ok(outcome);
        }
        let candidate = match selection.candidate {
            Some(candidate) => candidate,
            None => return Err(Error::precondition("no candidate replica found")),
        };
        if let Some(on_chosen) = on_candidate_chosen {
            on_chosen(&candidate);
        }

        let mut outcome = RegroupOutcome {
            cannot_replicate: selection.cannot_replicate,
            candidate: Some(candidate.clone()),
            ..Default::default()
        };

        let mut replicas_to_move = selection.equal;
        replicas_to_move.extend(selection.later);
        let ahead = selection.ahead;

        let postpone_wholesale = matches!(
            (postponed, postpone_all_matches),
            (Some(_), Some(postpone_all)) if postpone_all(&candidate)
        );
        if postpone_wholesale {
            if let Some(container) = postponed {
                let topology = self.clone();
                let candidate_for_move = candidate.clone();
                container.add(
                    format!("regroup-replicas-gtid {}", candidate.key),
                    move || async move {
                        topology
                            .move_replicas_via_gtid(replicas_to_move, &candidate_for_move, None)
                            .await
                            .map(|_| ())
                    },
                );
            }
            outcome.ahead = ahead;
        } else {
            debug!(
                "regroup-replicas-gtid: working on {} replicas",
                replicas_to_move.len()
            );
            let mut bulk = self
                .move_replicas_via_gtid(replicas_to_move, &candidate, postponed)
                .await?;
            outcome.later = std::mem::take(&mut bulk.succeeded);
            outcome.ahead = ahead;
            outcome.ahead.append(&mut bulk.failed);
            outcome.errors = bulk.errors;
        }

        self.start_replica_logged(&candidate.key).await;
        debug!("regroup-replicas-gtid: done");
        self.audit(
            "regroup-replicas-gtid",
            main_key,
            &format!(
                "regrouped replicas of {main_key} via gtid; promoted {}",
                candidate.key
            ),
        )
        .await;
        Ok(outcome)
    }

    /// Regroup a binlog-server tier: promote the most advanced binlog
    /// server and repoint the rest below it.
    pub async fn regroup_replicas_binlog_servers(
        &self,
        main_key: &InstanceKey,
        return_replica_even_on_failure: bool,
    ) -> Result<BinlogServerRegroupOutcome> {
        let (promoted, binlog_servers) = self.most_up_to_date_binlog_server(main_key).await?;
        let promoted = match promoted {
            Some(promoted) => promoted,
            None => {
                return if return_replica_even_on_failure {
                    Ok(BinlogServerRegroupOutcome::default())
                } else {
                    Err(Error::precondition(format!(
                        "no active binlog server replicates from {main_key}"
                    )))
                }
            }
        };
        let bulk = self.repoint_to(binlog_servers, &promoted.key).await?;
        self.audit(
            "regroup-replicas-bls",
            main_key,
            &format!(
                "regrouped binlog server replicas of {main_key}; promoted {}",
                promoted.key
            ),
        )
        .await;
        Ok(BinlogServerRegroupOutcome {
            repointed: bulk.succeeded,
            promoted: Some(promoted),
        })
    }

    /// Smart regroup: inspect the replicas of `main_key` and dispatch to
    /// the global-identifier, binlog-server or pseudo-identifier variant,
    /// falling back to the combined pseudo-GTID + binlog-server walk.
    pub async fn regroup_replicas(
        &self,
        main_key: &InstanceKey,
        return_replica_even_on_failure: bool,
        on_candidate_chosen: Option<OnCandidateChosen<'_>>,
        postponed: Option<&PostponedFunctionsContainer>,
    ) -> Result<RegroupOutcome> {
        let replicas = self.repository.read_replica_instances(main_key).await?;
        if replicas.is_empty() {
            return Ok(RegroupOutcome::default());
        }
        if replicas.len() == 1 {
            return Ok(RegroupOutcome {
                candidate: Some(replicas.into_iter().next().unwrap_or_default()),
                ..Default::default()
            });
        }
        let all_gtid = replicas.iter().all(Instance::using_gtid);
        let all_binlog_servers = replicas.iter().all(|replica| replica.is_binlog_server);
        let all_pseudo_gtid = replicas.iter().all(|replica| replica.using_pseudo_gtid);

        if all_gtid {
            debug!("regroup-replicas: using gtid to regroup replicas of {main_key}");
            return self
                .regroup_replicas_gtid(
                    main_key,
                    return_replica_even_on_failure,
                    on_candidate_chosen,
                    None,
                    None,
                )
                .await;
        }
        if all_binlog_servers {
            debug!("regroup-replicas: using binlog servers to regroup replicas of {main_key}");
            let bls_outcome = self
                .regroup_replicas_binlog_servers(main_key, return_replica_even_on_failure)
                .await?;
            return Ok(RegroupOutcome {
                later: bls_outcome.repointed,
                candidate: bls_outcome.promoted,
                ..Default::default()
            });
        }
        if all_pseudo_gtid {
            debug!("regroup-replicas: using pseudo-gtid to regroup replicas of {main_key}");
            return self
                .regroup_replicas_pseudo_gtid(
                    main_key,
                    return_replica_even_on_failure,
                    on_candidate_chosen,
                    postponed,
                    None,
                )
                .await;
        }
        // Mixed bag; as a last resort, walk pseudo-GTID through the binlog
        // servers too.
        warn!("regroup-replicas: unsure what method to invoke for {main_key}; trying pseudo-gtid with binlog servers");
        self.regroup_replicas_pseudo_gtid_including_sub_replicas_of_binlog_servers(
            main_key,
            return_replica_even_on_failure,
            on_candidate_chosen,
            postponed,
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PromotionRule;
    use crate::testing::MockFleet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gtid_cluster(fleet: &MockFleet) -> (InstanceKey, InstanceKey, InstanceKey, InstanceKey) {
        let main = fleet.add_main("m");
        let replica_b = fleet.add_replica("b", &main);
        let replica_c = fleet.add_replica("c", &main);
        let replica_d = fleet.add_replica("d", &main);
        for (key, position) in [(&replica_b, 200), (&replica_c, 300), (&replica_d, 250)] {
            fleet.update_instance(key, |instance| {
                instance.using_oracle_gtid = true;
                instance.supports_oracle_gtid = true;
                instance.exec_binlog_coordinates.log_pos = position;
                instance.read_binlog_coordinates.log_pos = position;
            });
        }
        (main, replica_b, replica_c, replica_d)
    }

    #[tokio::test]
    async fn test_regroup_replicas_gtid_promotes_most_advanced() {
        let fleet = MockFleet::new();
        let (main, replica_b, replica_c, replica_d) = gtid_cluster(&fleet);
        let topology = fleet.topology();

        let chosen = AtomicUsize::new(0);
        let on_chosen = |_: &Instance| {
            chosen.fetch_add(1, Ordering::SeqCst);
        };
        let outcome = topology
            .regroup_replicas(&main, false, Some(&on_chosen), None)
            .await
            .unwrap();
        let candidate = outcome.candidate.unwrap();
        assert_eq!(candidate.key, replica_c);
        assert_eq!(chosen.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.later.len(), 2);
        assert!(outcome.errors.is_empty());
        assert_eq!(fleet.instance(&replica_b).main_key, replica_c);
        assert_eq!(fleet.instance(&replica_d).main_key, replica_c);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "regroup-replicas-gtid"));
    }

    #[tokio::test]
    async fn test_regroup_replicas_gtid_loses_banned_ahead_replica() {
        let fleet = MockFleet::new();
        let (main, _, replica_c, _) = gtid_cluster(&fleet);
        let ahead = fleet.add_replica("e", &main);
        fleet.update_instance(&ahead, |instance| {
            instance.using_oracle_gtid = true;
            instance.supports_oracle_gtid = true;
            instance.exec_binlog_coordinates.log_pos = 400;
            instance.read_binlog_coordinates.log_pos = 400;
            instance.promotion_rule = PromotionRule::MustNot;
        });
        let topology = fleet.topology();

        let outcome = topology
            .regroup_replicas(&main, false, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.candidate.unwrap().key, replica_c);
        // The banned, more advanced replica is reported ahead and unmoved.
        assert!(outcome.ahead.iter().any(|replica| replica.key == ahead));
        assert_eq!(fleet.instance(&ahead).main_key, main);
    }

    #[tokio::test]
    async fn test_regroup_replicas_binlog_servers() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let bls_a = fleet.add_binlog_server("bls-a", &main);
        let bls_b = fleet.add_binlog_server("bls-b", &main);
        fleet.update_instance(&bls_b, |instance| {
            instance.exec_binlog_coordinates.log_pos = 2000;
            instance.self_binlog_coordinates.log_pos = 2000;
        });
        let topology = fleet.topology();

        let outcome = topology
            .regroup_replicas(&main, false, None, None)
            .await
            .unwrap();
        // The most advanced binlog server won; its sibling went below it.
        assert_eq!(outcome.candidate.unwrap().key, bls_b);
        assert_eq!(fleet.instance(&bls_a).main_key, bls_b);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "regroup-replicas-bls"));
    }

    #[tokio::test]
    async fn test_regroup_replicas_pseudo_gtid() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let candidate = fleet.add_replica("cand", &main);
        let equal = fleet.add_replica("eq", &main);
        let later = fleet.add_replica("late", &main);
        for key in [&candidate, &equal, &later] {
            fleet.update_instance(key, |instance| {
                instance.using_pseudo_gtid = true;
            });
        }
        fleet.update_instance(&later, |instance| {
            instance.exec_binlog_coordinates.log_pos = 100;
            instance.read_binlog_coordinates.log_pos = 100;
        });
        // Pseudo-GTID scripting for the later replica's rematch.
        let marker = crate::instance::BinlogCoordinates::relay("late-relay.000002", 50);
        fleet.script_marker(&later, marker, "marker-late");
        fleet.script_marker_search(
            &candidate,
            "marker-late",
            crate::instance::BinlogCoordinates::new("cand-bin.000003", 90),
        );
        fleet.script_correlation(
            &later,
            &candidate,
            crate::instance::BinlogCoordinates::new("cand-bin.000003", 110),
            4,
        );
        let config = crate::config::TopologyConfig {
            pseudo_gtid_pattern: "marker".to_string(),
            ..MockFleet::test_config()
        };
        let topology = fleet.topology_with_config(config);

        let outcome = topology
            .regroup_replicas(&main, false, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.candidate.unwrap().key, candidate);
        // The equal replica attached at the candidate's own coordinates.
        assert_eq!(fleet.instance(&equal).main_key, candidate);
        assert_eq!(
            fleet.instance(&equal).exec_binlog_coordinates,
            fleet.instance(&candidate).self_binlog_coordinates
        );
        // The later replica was matched by replay.
        assert_eq!(fleet.instance(&later).main_key, candidate);
        assert!(fleet
            .audits()
            .iter()
            .any(|entry| entry.kind == "regroup-replicas"));
    }

    #[tokio::test]
    async fn test_regroup_single_replica_is_trivial() {
        let fleet = MockFleet::new();
        let main = fleet.add_main("m");
        let only = fleet.add_replica("only", &main);
        let topology = fleet.topology();

        let outcome = topology
            .regroup_replicas(&main, false, None, None)
            .await
            .unwrap();
        assert_eq!(outcome.candidate.unwrap().key, only);
        assert!(fleet.mutation_journal().is_empty());
    }
}
