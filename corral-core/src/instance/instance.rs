//! Cached snapshot of one database server.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::instance::{BinlogCoordinates, InstanceKey};

/// Per-instance hint controlling whether an instance may be chosen as a
/// promotion candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionRule {
    Must,
    Prefer,
    #[default]
    Neutral,
    PreferNot,
    MustNot,
}

impl PromotionRule {
    /// Numeric preference; larger is better.
    pub fn preference(&self) -> u8 {
        match self {
            PromotionRule::Must => 4,
            PromotionRule::Prefer => 3,
            PromotionRule::Neutral => 2,
            PromotionRule::PreferNot => 1,
            PromotionRule::MustNot => 0,
        }
    }

    pub fn better_than(&self, other: &PromotionRule) -> bool {
        self.preference() > other.preference()
    }
}

/// Binary log event format. A replica may move under a main whose format is
/// smaller or equal; moving under a strictly larger format is unsafe.
/// The derived order is `Statement < Mixed < Row`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BinlogFormat {
    #[default]
    Statement,
    Mixed,
    Row,
}

impl fmt::Display for BinlogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BinlogFormat::Statement => "STATEMENT",
            BinlogFormat::Mixed => "MIXED",
            BinlogFormat::Row => "ROW",
        };
        write!(f, "{text}")
    }
}

/// Cached snapshot of one database server, produced by the discovery
/// subsystem and stored in the instance repository. Operations consume
/// snapshots, act on live servers via the driver, and return freshly-read
/// snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    // identity
    pub key: InstanceKey,
    pub cluster_name: String,
    pub data_center: String,
    pub version: String,
    pub is_mariadb: bool,
    pub server_id: u32,
    pub server_uuid: String,
    pub binlog_format: BinlogFormat,
    pub promotion_rule: PromotionRule,

    // replication source
    pub main_key: InstanceKey,
    pub replication_credentials_present: bool,
    pub allow_tls: bool,

    // replication state
    pub self_binlog_coordinates: BinlogCoordinates,
    pub read_binlog_coordinates: BinlogCoordinates,
    pub exec_binlog_coordinates: BinlogCoordinates,
    pub relaylog_coordinates: BinlogCoordinates,
    pub replication_sql_running: bool,
    pub replication_io_running: bool,
    pub sql_delay: u32,
    pub is_co_main: bool,

    // identity mode
    pub using_oracle_gtid: bool,
    pub using_mariadb_gtid: bool,
    pub supports_oracle_gtid: bool,
    pub using_pseudo_gtid: bool,
    pub is_binlog_server: bool,
    pub log_bin_enabled: bool,
    pub log_replica_updates_enabled: bool,

    // state
    pub executed_gtid_set: String,
    pub gtid_purged: String,
    pub gtid_errant: String,
    pub read_only: bool,
    pub is_last_check_valid: bool,
    pub is_recently_checked: bool,
    pub last_discovery_latency: Duration,
    pub replica_hosts: Vec<InstanceKey>,
}

impl Instance {
    /// Whether this instance replicates from something.
    pub fn is_replica(&self) -> bool {
        !self.main_key.hostname.is_empty()
    }

    /// Both replication threads are running.
    pub fn replica_running(&self) -> bool {
        self.is_replica() && self.replication_sql_running && self.replication_io_running
    }

    /// The SQL thread has applied everything the IO thread fetched.
    pub fn sql_thread_up_to_date(&self) -> bool {
        self.read_binlog_coordinates
            .equals(&self.exec_binlog_coordinates)
    }

    /// Any global-identifier mode is in effect.
    pub fn using_gtid(&self) -> bool {
        self.using_oracle_gtid || self.using_mariadb_gtid
    }

    /// First two components of the version, e.g. `(8, 0)` for "8.0.32".
    pub fn major_version(&self) -> (u32, u32) {
        let mut components = self
            .version
            .split('.')
            .map(|token| token.parse::<u32>().unwrap_or(0));
        (
            components.next().unwrap_or(0),
            components.next().unwrap_or(0),
        )
    }

    /// Short human description used by topology rendering.
    pub fn human_readable_description(&self) -> String {
        let mut state = String::new();
        if !self.replica_running() && self.is_replica() {
            state.push_str("nonreplicating,");
        }
        if self.read_only {
            state.push_str("ro,");
        }
        if self.using_oracle_gtid || self.using_mariadb_gtid {
            state.push_str("gtid,");
        }
        if self.using_pseudo_gtid {
            state.push_str("pseudo-gtid,");
        }
        if self.is_binlog_server {
            state.push_str("binlog-server,");
        }
        format!(
            "[{},{},{}{}]",
            self.version,
            self.binlog_format,
            state,
            self.exec_binlog_coordinates
        )
    }

    /// Whether the instance is fit to be moved around: healthy, checked
    /// recently, with both replication threads alive.
    pub fn can_move(&self) -> Result<()> {
        if !self.is_last_check_valid {
            return Err(Error::precondition(format!(
                "{}: instance is not up to date",
                self.key
            )));
        }
        if !self.is_recently_checked {
            return Err(Error::precondition(format!(
                "{}: instance is not recently checked",
                self.key
            )));
        }
        if !self.replication_sql_running {
            return Err(Error::precondition(format!(
                "{}: instance is not replicating (sql thread)",
                self.key
            )));
        }
        if !self.replication_io_running {
            return Err(Error::precondition(format!(
                "{}: instance is not replicating (io thread)",
                self.key
            )));
        }
        Ok(())
    }

    /// Fitness to become a co-main. A non-replicating main qualifies, hence
    /// no replication-thread requirement.
    pub fn can_move_as_co_main(&self) -> Result<()> {
        if !self.is_last_check_valid {
            return Err(Error::precondition(format!(
                "{}: instance is not up to date",
                self.key
            )));
        }
        if !self.is_recently_checked {
            return Err(Error::precondition(format!(
                "{}: instance is not recently checked",
                self.key
            )));
        }
        Ok(())
    }

    /// Fitness to be moved via log-entry matching. Matching operates on
    /// stopped replicas, so running threads are not required.
    pub fn can_move_via_match(&self) -> Result<()> {
        if !self.is_last_check_valid {
            return Err(Error::precondition(format!(
                "{}: instance is not up to date",
                self.key
            )));
        }
        if !self.is_recently_checked {
            return Err(Error::precondition(format!(
                "{}: instance is not recently checked",
                self.key
            )));
        }
        Ok(())
    }

    /// Whether this instance could replicate from `other`, looking only at
    /// snapshot fields: versions, log settings, binlog formats and server
    /// identity must all be compatible.
    pub fn can_replicate_from(&self, other: &Instance) -> Result<()> {
        if self.key == other.key {
            return Err(Error::precondition(format!(
                "instance cannot replicate from itself: {}",
                self.key
            )));
        }
        if !other.log_bin_enabled {
            return Err(Error::precondition(format!(
                "instance does not have binary logs enabled: {}",
                other.key
            )));
        }
        if other.is_replica() && !other.log_replica_updates_enabled && !other.is_binlog_server {
            // A binlog server mirrors its main's log verbatim and is exempt.
            return Err(Error::precondition(format!(
                "instance does not have log-replica-updates enabled: {}",
                other.key
            )));
        }
        if self.major_version() < other.major_version() && !self.is_binlog_server {
            return Err(Error::precondition(format!(
                "instance {} has version {}, which is lower than {} on {}",
                self.key, self.version, other.version, other.key
            )));
        }
        if self.log_bin_enabled
            && self.log_replica_updates_enabled
            && self.binlog_format < other.binlog_format
        {
            return Err(Error::precondition(format!(
                "instance {} has binlog_format {}, which is lower than {} on {}",
                self.key, self.binlog_format, other.binlog_format, other.key
            )));
        }
        if self.server_id == other.server_id && !self.is_binlog_server {
            return Err(Error::precondition(format!(
                "instance {} has same server-id ({}) as {}",
                self.key, self.server_id, other.key
            )));
        }
        if !self.server_uuid.is_empty()
            && self.server_uuid == other.server_uuid
            && !self.is_binlog_server
        {
            return Err(Error::precondition(format!(
                "instance {} has same server-uuid ({}) as {}",
                self.key, self.server_uuid, other.key
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_pair() -> (Instance, Instance) {
        let main = Instance {
            key: InstanceKey::new("main", 3306),
            version: "8.0.32".to_string(),
            server_id: 1,
            server_uuid: "uuid-main".to_string(),
            binlog_format: BinlogFormat::Row,
            log_bin_enabled: true,
            log_replica_updates_enabled: true,
            ..Default::default()
        };
        let replica = Instance {
            key: InstanceKey::new("replica", 3306),
            main_key: main.key.clone(),
            version: "8.0.32".to_string(),
            server_id: 2,
            server_uuid: "uuid-replica".to_string(),
            binlog_format: BinlogFormat::Row,
            log_bin_enabled: true,
            log_replica_updates_enabled: true,
            replication_sql_running: true,
            replication_io_running: true,
            is_last_check_valid: true,
            is_recently_checked: true,
            ..Default::default()
        };
        (main, replica)
    }

    #[test]
    fn test_is_replica() {
        let (main, replica) = healthy_pair();
        assert!(!main.is_replica());
        assert!(replica.is_replica());
        assert!(replica.replica_running());
    }

    #[test]
    fn test_major_version() {
        let (main, _) = healthy_pair();
        assert_eq!(main.major_version(), (8, 0));
    }

    #[test]
    fn test_can_replicate_from() {
        let (main, replica) = healthy_pair();
        assert!(replica.can_replicate_from(&main).is_ok());
        assert!(replica.can_replicate_from(&replica).is_err());
    }

    #[test]
    fn test_cannot_replicate_from_newer_version() {
        let (mut main, replica) = healthy_pair();
        main.version = "8.4.1".to_string();
        assert!(replica.can_replicate_from(&main).is_err());
    }

    #[test]
    fn test_cannot_replicate_into_larger_binlog_format() {
        let (mut main, mut replica) = healthy_pair();
        main.binlog_format = BinlogFormat::Row;
        replica.binlog_format = BinlogFormat::Statement;
        assert!(replica.can_replicate_from(&main).is_err());

        // A replica without its own binary logs does not care.
        replica.log_bin_enabled = false;
        assert!(replica.can_replicate_from(&main).is_ok());
    }

    #[test]
    fn test_cannot_replicate_from_same_server_id() {
        let (mut main, replica) = healthy_pair();
        main.server_id = replica.server_id;
        main.server_uuid = replica.server_uuid.clone();
        assert!(replica.can_replicate_from(&main).is_err());
    }

    #[test]
    fn test_can_move_requires_running_replication() {
        let (_, mut replica) = healthy_pair();
        assert!(replica.can_move().is_ok());
        replica.replication_sql_running = false;
        assert!(replica.can_move().is_err());
        // Matching tolerates stopped threads.
        assert!(replica.can_move_via_match().is_ok());
    }

    #[test]
    fn test_promotion_rule_order() {
        assert!(PromotionRule::Must.better_than(&PromotionRule::Prefer));
        assert!(PromotionRule::Neutral.better_than(&PromotionRule::PreferNot));
        assert!(!PromotionRule::MustNot.better_than(&PromotionRule::MustNot));
    }

    #[test]
    fn test_binlog_format_order() {
        assert!(BinlogFormat::Statement < BinlogFormat::Mixed);
        assert!(BinlogFormat::Mixed < BinlogFormat::Row);
    }

    #[test]
    fn test_sql_thread_up_to_date() {
        let (_, mut replica) = healthy_pair();
        replica.read_binlog_coordinates = BinlogCoordinates::new("bin.000003", 120);
        replica.exec_binlog_coordinates = BinlogCoordinates::new("bin.000003", 120);
        assert!(replica.sql_thread_up_to_date());
        replica.exec_binlog_coordinates.log_pos = 100;
        assert!(!replica.sql_thread_up_to_date());
    }
}
