//! Promotion-candidate selection and replica sorting.

use parking_lot::Mutex;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::TopologyConfig;
use crate::error::{Error, Result};
use crate::instance::{BinlogFormat, Instance, InstanceKey};
use crate::topology::Topology;

/// How (and whether) to stop replicas before sorting them by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReplicationMethod {
    /// Use positions as cached; do not touch the replicas.
    None,
    /// Plain stop.
    Normal,
    /// Let the SQL thread drain the relay log first, within a bounded wait.
    Nicely,
}

/// Outcome of candidate selection over a set of sibling replicas.
#[derive(Debug, Default)]
pub struct CandidateSelection {
    /// The chosen promotion target, when one exists.
    pub candidate: Option<Instance>,
    /// Strictly more advanced than the candidate; lost for rematch.
    pub ahead: Vec<Instance>,
    /// Identical coordinates; cheapest to attach.
    pub equal: Vec<Instance>,
    /// Behind the candidate; must be matched by replay.
    pub later: Vec<Instance>,
    /// Cannot replicate from the candidate at all.
    pub cannot_replicate: Vec<Instance>,
    /// The candidate was a last-resort pick (first non-banned), not a
    /// fully-qualified one.
    pub fallback: bool,
}

/// Fit to serve binary logs to others: healthy and writing its own logs
/// with replica updates included.
pub fn is_generally_valid_as_binlog_source(replica: &Instance) -> bool {
    replica.is_last_check_valid && replica.log_bin_enabled && replica.log_replica_updates_enabled
}

/// Fit to be promoted over its siblings. A binlog server cannot answer the
/// log-iteration queries that matching requires.
pub fn is_generally_valid_as_candidate_replica(replica: &Instance) -> bool {
    is_generally_valid_as_binlog_source(replica) && !replica.is_binlog_server
}

/// Fit to be promoted to main within a binlog-server topology. Replica
/// updates must be *disabled*: the binlog servers already carry the
/// original log stream and positions must stay aligned with it.
pub fn is_valid_as_candidate_main_in_binlog_server_topology(replica: &Instance) -> bool {
    replica.is_last_check_valid
        && replica.log_bin_enabled
        && !replica.log_replica_updates_enabled
        && !replica.is_binlog_server
}

/// Whether the replica is banned from candidacy by promotion rule or by a
/// configured hostname filter.
pub fn is_banned_from_being_candidate_replica(replica: &Instance, config: &TopologyConfig) -> bool {
    if replica.promotion_rule == crate::instance::PromotionRule::MustNot {
        debug!(
            "instance {} is banned because of promotion rule",
            replica.key
        );
        return true;
    }
    for filter in &config.promotion_ignore_hostname_filters {
        if let Ok(regex) = Regex::new(filter) {
            if regex.is_match(&replica.key.hostname) {
                return true;
            }
        }
    }
    false
}

/// The mode (most common) major version across the set.
fn priority_major_version(replicas: &[Instance]) -> Option<(u32, u32)> {
    let mut counts: HashMap<(u32, u32), usize> = HashMap::new();
    for replica in replicas {
        *counts.entry(replica.major_version()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(version, count)| (count, version))
        .map(|(version, _)| version)
}

/// The mode (most common) binlog format across the set.
fn priority_binlog_format(replicas: &[Instance]) -> Option<BinlogFormat> {
    let mut counts: HashMap<BinlogFormat, usize> = HashMap::new();
    for replica in replicas {
        *counts.entry(replica.binlog_format).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(format, count)| (count, format))
        .map(|(format, _)| format)
}

/// Order instances for promotion: most advanced execution position first,
/// then better promotion rule, then the preferred data center.
fn promotion_order(a: &Instance, b: &Instance, data_center_hint: &str) -> Ordering {
    if a.exec_binlog_coordinates.equals(&b.exec_binlog_coordinates) {
        let by_rule = b
            .promotion_rule
            .preference()
            .cmp(&a.promotion_rule.preference());
        if by_rule != Ordering::Equal {
            return by_rule;
        }
        if !data_center_hint.is_empty() {
            let a_in_hint = a.data_center == data_center_hint;
            let b_in_hint = b.data_center == data_center_hint;
            return b_in_hint.cmp(&a_in_hint);
        }
        return Ordering::Equal;
    }
    if a.exec_binlog_coordinates
        .smaller_than(&b.exec_binlog_coordinates)
    {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// Sort replicas most-advanced-first, with promotion-rule and data-center
/// tie-breaks.
pub(crate) fn sort_instances_data_center_hint(
    instances: &mut [Instance],
    data_center_hint: &str,
) {
    instances.sort_by(|a, b| promotion_order(a, b, data_center_hint));
}

/// Pick the single best promotion target out of pre-sorted sibling
/// replicas, and classify the rest relative to it.
pub fn choose_candidate_replica(
    replicas: &[Instance],
    config: &TopologyConfig,
) -> Result<CandidateSelection> {
    if replicas.is_empty() {
        return Err(Error::precondition(
            "no replicas given to choose-candidate-replica",
        ));
    }
    let priority_version = priority_major_version(replicas);
    let priority_format = priority_binlog_format(replicas);

    let candidate = replicas.iter().find(|replica| {
        is_generally_valid_as_candidate_replica(replica)
            && !is_banned_from_being_candidate_replica(replica, config)
            && priority_version.map_or(true, |version| replica.major_version() >= version)
            && priority_format.map_or(true, |format| replica.binlog_format >= format)
    });

    let candidate = match candidate {
        Some(candidate) => candidate.clone(),
        None => {
            // Nothing fully qualifies to main the others. Pick a single
            // non-banned replica so the caller at least has something to
            // salvage; everything else is reported as left behind.
            let fallback = replicas
                .iter()
                .find(|replica| !is_banned_from_being_candidate_replica(replica, config))
                .cloned();
            let remaining: Vec<Instance> = replicas
                .iter()
                .filter(|replica| {
                    fallback
                        .as_ref()
                        .map_or(true, |candidate| replica.key != candidate.key)
                })
                .cloned()
                .collect();
            return Ok(CandidateSelection {
                candidate: fallback,
                ahead: remaining,
                fallback: true,
                ..Default::default()
            });
        }
    };

    let mut selection = CandidateSelection {
        candidate: Some(candidate.clone()),
        ..Default::default()
    };
    for replica in replicas {
        if replica.key == candidate.key {
            continue;
        }
        if replica.can_replicate_from(&candidate).is_err() {
            selection.cannot_replicate.push(replica.clone());
        } else if replica
            .exec_binlog_coordinates
            .smaller_than(&candidate.exec_binlog_coordinates)
        {
            selection.later.push(replica.clone());
        } else if replica
            .exec_binlog_coordinates
            .equals(&candidate.exec_binlog_coordinates)
        {
            selection.equal.push(replica.clone());
        } else {
            // More advanced than the chosen candidate: lost.
            selection.ahead.push(replica.clone());
        }
    }
    Ok(selection)
}

impl Topology {
    /// Whether bulk relocation should defer this replica: it is lagging
    /// deeply, or discovery is struggling with it, and processing it now
    /// would hold everyone else back.
    pub(crate) fn should_postpone_relocating_replica(&self, replica: &Instance) -> bool {
        if let Some(lag_threshold) = self.config.postpone_replica_recovery_on_lag {
            if u64::from(replica.sql_delay) > lag_threshold.as_secs() {
                return true;
            }
        }
        replica.last_discovery_latency > self.config.reasonable_discovery_latency
    }

    /// Stop a set of replicas by the given method, in parallel, dropping
    /// any that fail to stop within the bounded wait.
    pub(crate) async fn stop_replicas(
        &self,
        replicas: Vec<Instance>,
        method: StopReplicationMethod,
        timeout: Duration,
    ) -> Vec<Instance> {
        if method == StopReplicationMethod::None || replicas.is_empty() {
            return replicas;
        }
        let results = Arc::new(Mutex::new(Vec::with_capacity(replicas.len())));
        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrent_replica_operations,
        ));
        let mut tasks = JoinSet::new();
        for replica in replicas {
            let topology = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let stopped = match method {
                    StopReplicationMethod::Nicely => {
                        topology
                            .driver
                            .stop_replica_nicely(&replica.key, timeout)
                            .await
                    }
                    _ => topology.driver.stop_replica(&replica.key).await,
                };
                match stopped {
                    Ok(stopped) => results.lock().push(stopped),
                    Err(err) => warn!("failed to stop replication on {}: {err}", replica.key),
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        let taken = std::mem::take(&mut *results.lock());
        taken
    }

    /// Stop (per `method`) and sort replicas most-advanced-first.
    pub(crate) async fn sorted_replicas_data_center_hint(
        &self,
        replicas: Vec<Instance>,
        method: StopReplicationMethod,
        data_center_hint: &str,
    ) -> Vec<Instance> {
        if replicas.is_empty() {
            return replicas;
        }
        let mut replicas = self
            .stop_replicas(replicas, method, self.config.bulk_operations_wait_timeout)
            .await;
        sort_instances_data_center_hint(&mut replicas, data_center_hint);
        for replica in &replicas {
            debug!(
                "- sorted replica: {} {}",
                replica.key, replica.exec_binlog_coordinates
            );
        }
        replicas
    }

    /// Replicas of a main, sorted by exec coordinates, most advanced first.
    pub async fn get_sorted_replicas(
        &self,
        main_key: &InstanceKey,
        method: StopReplicationMethod,
    ) -> Result<Vec<Instance>> {
        let replicas = self.repository.read_replica_instances(main_key).await?;
        let replicas = self
            .sorted_replicas_data_center_hint(replicas, method, "")
            .await;
        if replicas.is_empty() {
            return Err(Error::precondition(format!(
                "no replicas found for {main_key}"
            )));
        }
        Ok(replicas)
    }

    /// Choose the best replica to promote under a (possibly dead) main.
    /// `for_rematch_purposes` stops replicas nicely first so their
    /// positions settle.
    pub async fn get_candidate_replica(
        &self,
        main_key: &InstanceKey,
        for_rematch_purposes: bool,
    ) -> Result<CandidateSelection> {
        let data_center_hint = self
            .repository
            .read_instance(main_key)
            .await?
            .map(|main| main.data_center)
            .unwrap_or_default();

        let replicas = self.repository.read_replica_instances(main_key).await?;
        let method = if for_rematch_purposes {
            StopReplicationMethod::Nicely
        } else {
            StopReplicationMethod::None
        };
        let replicas = self
            .sorted_replicas_data_center_hint(replicas, method, &data_center_hint)
            .await;
        if replicas.is_empty() {
            return Err(Error::precondition(format!(
                "no replicas found for {main_key}"
            )));
        }
        let selection = choose_candidate_replica(&replicas, &self.config)?;
        if let Some(candidate) = &selection.candidate {
            let most_up_to_date = &replicas[0];
            if candidate
                .exec_binlog_coordinates
                .smaller_than(&most_up_to_date.exec_binlog_coordinates)
            {
                warn!(
                    "get-candidate-replica: chosen replica {} is behind most-up-to-date replica {}",
                    candidate.key, most_up_to_date.key
                );
            }
            debug!(
                "get-candidate-replica: candidate: {}, ahead: {}, equal: {}, late: {}, break: {}",
                candidate.key,
                selection.ahead.len(),
                selection.equal.len(),
                selection.later.len(),
                selection.cannot_replicate.len()
            );
        }
        Ok(selection)
    }

    /// Choose the best replica to promote in a binlog-server topology,
    /// considering the binlog servers' own replicas as well.
    pub async fn get_candidate_replica_of_binlog_server_topology(
        &self,
        main_key: &InstanceKey,
    ) -> Result<Instance> {
        let replicas = self
            .repository
            .read_replica_instances_including_binlog_server_sub_replicas(main_key)
            .await?;
        let replicas = self
            .sorted_replicas_data_center_hint(replicas, StopReplicationMethod::None, "")
            .await;
        let candidate = replicas.into_iter().find(|replica| {
            is_valid_as_candidate_main_in_binlog_server_topology(replica)
                && !is_banned_from_being_candidate_replica(replica, &self.config)
        });
        match candidate {
            Some(candidate) => {
                debug!(
                    "get-candidate-replica-of-binlog-server-topology: returning {} as candidate for {main_key}",
                    candidate.key
                );
                Ok(candidate)
            }
            None => Err(Error::precondition(format!(
                "no candidate replica found for binlog-server topology of {main_key}"
            ))),
        }
    }
}
