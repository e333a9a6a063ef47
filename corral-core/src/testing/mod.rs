//! Testing infrastructure for the topology core.
//!
//! [`MockFleet`] is an in-memory fleet implementing all three collaborator
//! seams (driver, repository and scanner) over one shared state map.
//! Driver calls mutate the fleet the way a live server would react, every
//! call lands in a journal for order/cleanup assertions, and individual
//! calls can be made to fail on demand.
//!
//! # Usage
//!
//! ```rust,no_run
//! use corral_core::testing::MockFleet;
//!
//! # async fn example() -> corral_core::Result<()> {
//! let fleet = MockFleet::new();
//! let main = fleet.add_main("m");
//! let replica = fleet.add_replica("a", &main);
//! let topology = fleet.topology();
//! topology.repoint(&replica, None, corral_core::GtidHint::Neutral).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::TopologyConfig;
use crate::error::{Error, Result};
use crate::instance::{
    BinlogCoordinates, BinlogFormat, GtidSet, Instance, InstanceKey, PromotionRule,
};
use crate::topology::{
    AuditEntry, BinlogScanner, GtidHint, InstanceRepository, ReplicationThreadState, Topology,
    TopologyDriver,
};

/// Driver operations that mutate server state; used to assert an operation
/// bailed out before touching anything.
const MUTATING_OPS: &[&str] = &[
    "stop_replica",
    "stop_replica_nicely",
    "start_replica",
    "start_replica_until_coordinates",
    "reset_replica",
    "reset_main",
    "change_main_to",
    "change_main_credentials",
    "enable_main_ssl",
    "inject_empty_gtid_transaction",
    "set_gtid_purged",
    "set_read_only",
    "purge_binary_logs_to",
];

#[derive(Default)]
struct FleetState {
    instances: HashMap<InstanceKey, Instance>,
    unreachable: HashSet<InstanceKey>,
    advance_on_stop: HashSet<InstanceKey>,
    fail_points: HashMap<String, usize>,
    journal: Vec<String>,
    audits: Vec<AuditEntry>,
    equivalences: HashMap<(InstanceKey, BinlogCoordinates, InstanceKey), BinlogCoordinates>,
    markers: HashMap<InstanceKey, (BinlogCoordinates, String)>,
    marker_search: HashMap<(InstanceKey, String), BinlogCoordinates>,
    correlations: HashMap<(InstanceKey, InstanceKey), (BinlogCoordinates, usize)>,
    binary_logs: HashMap<InstanceKey, Vec<String>>,
    previous_gtids: HashMap<(InstanceKey, String), GtidSet>,
    next_server_id: u32,
}

impl FleetState {
    fn record(&mut self, line: String) {
        self.journal.push(line);
    }

    fn take_failure(&mut self, op: &str, key: &InstanceKey) -> Option<Error> {
        let point = format!("{op} {key}");
        let count = self.fail_points.get_mut(&point)?;
        if *count == 0 {
            return None;
        }
        *count -= 1;
        if *count == 0 {
            self.fail_points.remove(&point);
        }
        Some(Error::remote(key, format!("injected failure for {op}")))
    }

    fn instance_mut(&mut self, key: &InstanceKey) -> Result<&mut Instance> {
        self.instances
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    fn instance(&self, key: &InstanceKey) -> Result<Instance> {
        self.instances
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    fn replicas_of(&self, key: &InstanceKey) -> Vec<Instance> {
        let mut replicas: Vec<Instance> = self
            .instances
            .values()
            .filter(|instance| instance.main_key == *key && instance.key != *key)
            .cloned()
            .collect();
        replicas.sort_by(|a, b| a.key.cmp(&b.key));
        replicas
    }

    fn replicas_including_binlog_server_sub_replicas(&self, key: &InstanceKey) -> Vec<Instance> {
        let mut replicas = self.replicas_of(key);
        let mut index = 0;
        while index < replicas.len() {
            if replicas[index].is_binlog_server {
                let sub_replicas = self.replicas_of(&replicas[index].key.clone());
                for sub_replica in sub_replicas {
                    if !replicas
                        .iter()
                        .any(|existing| existing.key == sub_replica.key)
                    {
                        replicas.push(sub_replica);
                    }
                }
            }
            index += 1;
        }
        replicas
    }
}

/// An in-memory fleet serving as driver, repository and scanner at once.
/// Cheap to clone; clones share the same fleet state.
#[derive(Clone, Default)]
pub struct MockFleet {
    state: Arc<Mutex<FleetState>>,
}

impl MockFleet {
    pub fn new() -> MockFleet {
        MockFleet::default()
    }

    /// A config with sub-second timings so retry/poll loops stay fast in
    /// tests.
    pub fn test_config() -> TopologyConfig {
        TopologyConfig {
            replication_state_poll_interval: Duration::from_millis(2),
            replication_state_timeout: Duration::from_millis(250),
            destructive_operation_retry_interval: Duration::from_millis(2),
            bulk_operations_wait_timeout: Duration::from_millis(250),
            ..Default::default()
        }
    }

    /// Build a [`Topology`] over this fleet with test timings.
    pub fn topology(&self) -> Topology {
        self.topology_with_config(Self::test_config())
    }

    pub fn topology_with_config(&self, config: TopologyConfig) -> Topology {
        Topology::new(
            Arc::new(self.clone()) as Arc<dyn TopologyDriver>,
            Arc::new(self.clone()) as Arc<dyn InstanceRepository>,
            Arc::new(self.clone()) as Arc<dyn BinlogScanner>,
            config,
        )
    }

    fn base_instance(&self, host: &str) -> Instance {
        let mut state = self.state.lock();
        state.next_server_id += 1;
        Instance {
            key: InstanceKey::new(host, 3306),
            version: "8.0.32".to_string(),
            server_id: state.next_server_id,
            server_uuid: format!("uuid-{host}"),
            binlog_format: BinlogFormat::Row,
            promotion_rule: PromotionRule::Neutral,
            log_bin_enabled: true,
            log_replica_updates_enabled: true,
            is_last_check_valid: true,
            is_recently_checked: true,
            ..Default::default()
        }
    }

    /// Add a writeable main with its own binary log position.
    pub fn add_main(&self, host: &str) -> InstanceKey {
        let mut instance = self.base_instance(host);
        instance.cluster_name = instance.key.to_string();
        instance.self_binlog_coordinates = BinlogCoordinates::new(format!("{host}-bin.000010"), 1000);
        let key = instance.key.clone();
        self.add_instance(instance);
        key
    }

    /// Add a healthy replica of `main`, positioned at the main's current
    /// self coordinates.
    pub fn add_replica(&self, host: &str, main_key: &InstanceKey) -> InstanceKey {
        let main = self.instance(main_key);
        let mut instance = self.base_instance(host);
        instance.cluster_name = main.cluster_name.clone();
        instance.main_key = main_key.clone();
        instance.exec_binlog_coordinates = main.self_binlog_coordinates.clone();
        instance.read_binlog_coordinates = main.self_binlog_coordinates.clone();
        instance.self_binlog_coordinates =
            BinlogCoordinates::new(format!("{host}-bin.000003"), 500);
        instance.relaylog_coordinates =
            BinlogCoordinates::relay(format!("{host}-relay.000002"), 400);
        instance.replication_sql_running = true;
        instance.replication_io_running = true;
        instance.read_only = true;
        let key = instance.key.clone();
        self.add_instance(instance);
        self.link_replica_host(main_key, &key);
        key
    }

    /// Add a binlog server below `main`: a transparent intermediary whose
    /// own binary log mirrors the main's, name and position alike.
    pub fn add_binlog_server(&self, host: &str, main_key: &InstanceKey) -> InstanceKey {
        let key = self.add_replica(host, main_key);
        self.update_instance(&key, |instance| {
            instance.is_binlog_server = true;
            instance.log_replica_updates_enabled = false;
            instance.self_binlog_coordinates = instance.exec_binlog_coordinates.clone();
        });
        key
    }

    pub fn add_instance(&self, instance: Instance) {
        self.state
            .lock()
            .instances
            .insert(instance.key.clone(), instance);
    }

    fn link_replica_host(&self, main_key: &InstanceKey, replica_key: &InstanceKey) {
        let mut state = self.state.lock();
        if let Some(main) = state.instances.get_mut(main_key) {
            main.replica_hosts.push(replica_key.clone());
        }
    }

    /// Current snapshot of an instance; panics when absent (test bug).
    pub fn instance(&self, key: &InstanceKey) -> Instance {
        self.state
            .lock()
            .instances
            .get(key)
            .cloned()
            .unwrap_or_else(|| panic!("no such instance in mock fleet: {key}"))
    }

    pub fn update_instance(&self, key: &InstanceKey, mutate: impl FnOnce(&mut Instance)) {
        let mut state = self.state.lock();
        if let Some(instance) = state.instances.get_mut(key) {
            mutate(instance);
        }
    }

    /// Make live reads of `key` fail; cached repository reads still work.
    pub fn set_unreachable(&self, key: &InstanceKey) {
        self.state.lock().unreachable.insert(key.clone());
    }

    /// Make the instance's execution position creep forward on the next
    /// stop, as if statements were still applying.
    pub fn advance_on_stop(&self, key: &InstanceKey) {
        self.state.lock().advance_on_stop.insert(key.clone());
    }

    /// Make the next `count` invocations of `op` against `key` fail.
    pub fn fail_next(&self, op: &str, key: &InstanceKey, count: usize) {
        self.state
            .lock()
            .fail_points
            .insert(format!("{op} {key}"), count);
    }

    /// All recorded driver calls, in order.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    /// Only the mutating driver calls.
    pub fn mutation_journal(&self) -> Vec<String> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|line| {
                MUTATING_OPS
                    .iter()
                    .any(|op| line.starts_with(&format!("{op} ")))
            })
            .cloned()
            .collect()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    pub fn audits(&self) -> Vec<AuditEntry> {
        self.state.lock().audits.clone()
    }

    pub fn script_equivalence(
        &self,
        main_key: &InstanceKey,
        coordinates: &BinlogCoordinates,
        other_key: &InstanceKey,
        equivalent: BinlogCoordinates,
    ) {
        self.state.lock().equivalences.insert(
            (main_key.clone(), coordinates.clone(), other_key.clone()),
            equivalent,
        );
    }

    /// Script the latest pseudo-GTID marker found on an instance.
    pub fn script_marker(&self, key: &InstanceKey, coordinates: BinlogCoordinates, text: &str) {
        self.state
            .lock()
            .markers
            .insert(key.clone(), (coordinates, text.to_string()));
    }

    /// Script where a marker text is found on another instance.
    pub fn script_marker_search(
        &self,
        key: &InstanceKey,
        text: &str,
        coordinates: BinlogCoordinates,
    ) {
        self.state
            .lock()
            .marker_search
            .insert((key.clone(), text.to_string()), coordinates);
    }

    /// Script the lock-step scan result between two instances.
    pub fn script_correlation(
        &self,
        instance_key: &InstanceKey,
        other_key: &InstanceKey,
        next_coordinates: BinlogCoordinates,
        count_matched: usize,
    ) {
        self.state.lock().correlations.insert(
            (instance_key.clone(), other_key.clone()),
            (next_coordinates, count_matched),
        );
    }

    pub fn script_binary_logs(&self, key: &InstanceKey, logs: Vec<String>) {
        self.state.lock().binary_logs.insert(key.clone(), logs);
    }

    pub fn script_previous_gtids(&self, key: &InstanceKey, logfile: &str, set: GtidSet) {
        self.state
            .lock()
            .previous_gtids
            .insert((key.clone(), logfile.to_string()), set);
    }
}

#[async_trait]
impl TopologyDriver for MockFleet {
    async fn read_topology_instance(&self, key: &InstanceKey) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("read_topology_instance {key}"));
        if state.unreachable.contains(key) {
            return Err(Error::Unreachable(key.clone()));
        }
        if let Some(err) = state.take_failure("read_topology_instance", key) {
            return Err(err);
        }
        state.instance(key)
    }

    async fn stop_replica(&self, key: &InstanceKey) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("stop_replica {key}"));
        if let Some(err) = state.take_failure("stop_replica", key) {
            return Err(err);
        }
        let advances = state.advance_on_stop.contains(key);
        let instance = state.instance_mut(key)?;
        if advances {
            // Simulate in-flight statements applying while the stop lands.
            instance.exec_binlog_coordinates.log_pos += 10;
        }
        instance.replication_sql_running = false;
        instance.replication_io_running = false;
        Ok(instance.clone())
    }

    async fn stop_replica_nicely(&self, key: &InstanceKey, _timeout: Duration) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("stop_replica_nicely {key}"));
        if let Some(err) = state.take_failure("stop_replica_nicely", key) {
            return Err(err);
        }
        let instance = state.instance_mut(key)?;
        // Nicely means the SQL thread drains first.
        instance.exec_binlog_coordinates = instance.read_binlog_coordinates.clone();
        instance.replication_sql_running = false;
        instance.replication_io_running = false;
        Ok(instance.clone())
    }

    async fn start_replica(&self, key: &InstanceKey) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("start_replica {key}"));
        if let Some(err) = state.take_failure("start_replica", key) {
            return Err(err);
        }
        let instance = state.instance_mut(key)?;
        if instance.is_replica() && !instance.main_key.is_detached() {
            instance.replication_sql_running = true;
            instance.replication_io_running = true;
        }
        Ok(instance.clone())
    }

    async fn start_replica_until_coordinates(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
    ) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("start_replica_until_coordinates {key} {coordinates}"));
        if let Some(err) = state.take_failure("start_replica_until_coordinates", key) {
            return Err(err);
        }
        let instance = state.instance_mut(key)?;
        // The SQL thread runs up to the given position then halts.
        instance.exec_binlog_coordinates = coordinates.clone();
        instance.read_binlog_coordinates = coordinates.clone();
        instance.replication_io_running = true;
        instance.replication_sql_running = false;
        Ok(instance.clone())
    }

    async fn reset_replica(&self, key: &InstanceKey) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("reset_replica {key}"));
        if let Some(err) = state.take_failure("reset_replica", key) {
            return Err(err);
        }
        let instance = state.instance_mut(key)?;
        instance.main_key = InstanceKey::default();
        instance.replication_sql_running = false;
        instance.replication_io_running = false;
        instance.exec_binlog_coordinates = BinlogCoordinates::default();
        instance.read_binlog_coordinates = BinlogCoordinates::default();
        Ok(instance.clone())
    }

    async fn reset_main(&self, key: &InstanceKey) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("reset_main {key}"));
        if let Some(err) = state.take_failure("reset_main", key) {
            return Err(err);
        }
        let instance = state.instance_mut(key)?;
        instance.executed_gtid_set.clear();
        instance.gtid_purged.clear();
        instance.self_binlog_coordinates =
            BinlogCoordinates::new(format!("{}-bin.000001", key.hostname), 4);
        Ok(instance.clone())
    }

    async fn change_main_to(
        &self,
        key: &InstanceKey,
        main_key: &InstanceKey,
        coordinates: &BinlogCoordinates,
        unresolve_hostname: bool,
        gtid_hint: GtidHint,
    ) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!(
            "change_main_to {key} -> {main_key} at {coordinates} unresolve={unresolve_hostname} hint={gtid_hint:?}"
        ));
        if let Some(err) = state.take_failure("change_main_to", key) {
            return Err(err);
        }
        let instance = state.instance_mut(key)?;
        instance.main_key = main_key.clone();
        instance.exec_binlog_coordinates = coordinates.clone();
        instance.read_binlog_coordinates = coordinates.clone();
        match gtid_hint {
            GtidHint::Force => {
                if instance.supports_oracle_gtid {
                    instance.using_oracle_gtid = true;
                } else if instance.is_mariadb {
                    instance.using_mariadb_gtid = true;
                }
            }
            GtidHint::Deny => {
                instance.using_oracle_gtid = false;
                instance.using_mariadb_gtid = false;
            }
            GtidHint::Neutral => {}
        }
        Ok(instance.clone())
    }

    async fn change_main_credentials(
        &self,
        key: &InstanceKey,
        _user: &str,
        _password: &str,
    ) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("change_main_credentials {key}"));
        if let Some(err) = state.take_failure("change_main_credentials", key) {
            return Err(err);
        }
        let instance = state.instance_mut(key)?;
        instance.replication_credentials_present = true;
        Ok(instance.clone())
    }

    async fn enable_main_ssl(&self, key: &InstanceKey) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("enable_main_ssl {key}"));
        if let Some(err) = state.take_failure("enable_main_ssl", key) {
            return Err(err);
        }
        state.instance(key)
    }

    async fn read_replication_credentials(&self, key: &InstanceKey) -> Result<(String, String)> {
        let mut state = self.state.lock();
        state.record(format!("read_replication_credentials {key}"));
        if let Some(err) = state.take_failure("read_replication_credentials", key) {
            return Err(err);
        }
        Ok(("repl".to_string(), "repl-password".to_string()))
    }

    async fn show_binary_logs(&self, key: &InstanceKey) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.record(format!("show_binary_logs {key}"));
        if let Some(logs) = state.binary_logs.get(key) {
            return Ok(logs.clone());
        }
        let instance = state.instance(key)?;
        Ok(vec![instance.self_binlog_coordinates.log_file])
    }

    async fn show_main_status(&self, key: &InstanceKey) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.record(format!("show_main_status {key}"));
        let instance = state.instance(key)?;
        Ok(Some(instance.executed_gtid_set))
    }

    async fn previous_gtids(&self, key: &InstanceKey, logfile: &str) -> Result<GtidSet> {
        let mut state = self.state.lock();
        state.record(format!("previous_gtids {key} {logfile}"));
        Ok(state
            .previous_gtids
            .get(&(key.clone(), logfile.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn gtid_subtract(
        &self,
        key: &InstanceKey,
        minuend: &str,
        subtrahend: &str,
    ) -> Result<String> {
        let mut state = self.state.lock();
        state.record(format!("gtid_subtract {key}"));
        if let Some(err) = state.take_failure("gtid_subtract", key) {
            return Err(err);
        }
        let minuend = GtidSet::parse(minuend)?;
        let subtrahend = GtidSet::parse(subtrahend)?;
        Ok(minuend.subtract(&subtrahend).to_string())
    }

    async fn inject_empty_gtid_transaction(&self, key: &InstanceKey, gtid: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record(format!("inject_empty_gtid_transaction {key} {gtid}"));
        if let Some(err) = state.take_failure("inject_empty_gtid_transaction", key) {
            return Err(err);
        }
        let injected = GtidSet::parse(gtid)?;
        let instance = state.instance_mut(key)?;
        let executed = GtidSet::parse(&instance.executed_gtid_set)?;
        instance.executed_gtid_set = executed.union(&injected).to_string();
        Ok(())
    }

    async fn set_gtid_purged(&self, key: &InstanceKey, gtid_purged: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.record(format!("set_gtid_purged {key} {gtid_purged}"));
        if let Some(err) = state.take_failure("set_gtid_purged", key) {
            return Err(err);
        }
        let instance = state.instance_mut(key)?;
        instance.gtid_purged = gtid_purged.to_string();
        Ok(())
    }

    async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("set_read_only {key} {read_only}"));
        if let Some(err) = state.take_failure("set_read_only", key) {
            return Err(err);
        }
        let instance = state.instance_mut(key)?;
        instance.read_only = read_only;
        Ok(instance.clone())
    }

    async fn replication_thread_state(&self, key: &InstanceKey) -> Result<ReplicationThreadState> {
        let state = self.state.lock();
        let instance = state.instance(key)?;
        if instance.replication_sql_running && instance.replication_io_running {
            Ok(ReplicationThreadState::Running)
        } else {
            Ok(ReplicationThreadState::Stopped)
        }
    }

    async fn purge_binary_logs_to(&self, key: &InstanceKey, logfile: &str) -> Result<Instance> {
        let mut state = self.state.lock();
        state.record(format!("purge_binary_logs_to {key} {logfile}"));
        if let Some(err) = state.take_failure("purge_binary_logs_to", key) {
            return Err(err);
        }
        state.instance(key)
    }
}

#[async_trait]
impl InstanceRepository for MockFleet {
    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>> {
        Ok(self.state.lock().instances.get(key).cloned())
    }

    async fn read_replica_instances(&self, key: &InstanceKey) -> Result<Vec<Instance>> {
        Ok(self.state.lock().replicas_of(key))
    }

    async fn read_replica_instances_including_binlog_server_sub_replicas(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>> {
        Ok(self
            .state
            .lock()
            .replicas_including_binlog_server_sub_replicas(key))
    }

    async fn read_binlog_server_replica_instances(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Instance>> {
        Ok(self
            .state
            .lock()
            .replicas_of(key)
            .into_iter()
            .filter(|replica| replica.is_binlog_server)
            .collect())
    }

    async fn read_cluster_instances(&self, cluster: &str) -> Result<Vec<Instance>> {
        let state = self.state.lock();
        let mut instances: Vec<Instance> = state
            .instances
            .values()
            .filter(|instance| instance.cluster_name == cluster)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(instances)
    }

    async fn read_cluster_writeable_main(&self, cluster: &str) -> Result<Vec<Instance>> {
        let state = self.state.lock();
        let mut mains: Vec<Instance> = state
            .instances
            .values()
            .filter(|instance| {
                instance.cluster_name == cluster
                    && !instance.read_only
                    && (!instance.is_replica() || instance.is_co_main)
            })
            .cloned()
            .collect();
        mains.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(mains)
    }

    async fn replace_alias_cluster_name(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.state
            .lock()
            .record(format!("replace_alias_cluster_name {old_name} -> {new_name}"));
        Ok(())
    }

    async fn equivalent_binlog_coordinates(
        &self,
        main_key: &InstanceKey,
        coordinates: &BinlogCoordinates,
        other_key: &InstanceKey,
    ) -> Result<Option<BinlogCoordinates>> {
        Ok(self
            .state
            .lock()
            .equivalences
            .get(&(main_key.clone(), coordinates.clone(), other_key.clone()))
            .cloned())
    }

    async fn audit(&self, kind: &str, key: &InstanceKey, message: &str) -> Result<()> {
        self.state.lock().audits.push(AuditEntry {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            key: key.clone(),
            message: message.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl BinlogScanner for MockFleet {
    async fn last_pseudo_gtid_in_binlogs(
        &self,
        instance: &Instance,
        _max_coordinates: Option<&BinlogCoordinates>,
        _exhaustive: bool,
    ) -> Result<Option<(BinlogCoordinates, String)>> {
        let mut state = self.state.lock();
        state.record(format!("last_pseudo_gtid_in_binlogs {}", instance.key));
        Ok(state.markers.get(&instance.key).cloned())
    }

    async fn last_pseudo_gtid_in_relay_logs(
        &self,
        instance: &Instance,
        _recorded_relay_coordinates: &BinlogCoordinates,
        _exhaustive: bool,
    ) -> Result<Option<(BinlogCoordinates, String)>> {
        let mut state = self.state.lock();
        state.record(format!("last_pseudo_gtid_in_relay_logs {}", instance.key));
        Ok(state.markers.get(&instance.key).cloned())
    }

    async fn search_entry_in_binlogs(
        &self,
        instance: &Instance,
        entry: &str,
        _monotonic: bool,
    ) -> Result<Option<BinlogCoordinates>> {
        let mut state = self.state.lock();
        state.record(format!("search_entry_in_binlogs {}", instance.key));
        Ok(state
            .marker_search
            .get(&(instance.key.clone(), entry.to_string()))
            .cloned())
    }

    async fn next_coordinates_to_match(
        &self,
        instance: &Instance,
        _instance_coordinates: &BinlogCoordinates,
        _recorded_relay_coordinates: &BinlogCoordinates,
        _max_coordinates: Option<&BinlogCoordinates>,
        other: &Instance,
        _other_coordinates: &BinlogCoordinates,
    ) -> Result<(BinlogCoordinates, usize)> {
        let mut state = self.state.lock();
        state.record(format!(
            "next_coordinates_to_match {} {}",
            instance.key, other.key
        ));
        state
            .correlations
            .get(&(instance.key.clone(), other.key.clone()))
            .cloned()
            .ok_or_else(|| {
                Error::position_mismatch(format!(
                    "no scripted correlation between {} and {}",
                    instance.key, other.key
                ))
            })
    }
}
