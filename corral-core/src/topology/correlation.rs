//! Position correlation between two instances.
//!
//! Two strategies exist: pseudo-GTID marker matching over raw log streams,
//! and global-identifier arithmetic. Correlation itself never retries;
//! callers decide whether an error is worth another attempt.

use tracing::debug;

use crate::error::{Error, Result};
use crate::instance::{BinlogCoordinates, BinlogFormat, GtidSet, Instance};
use crate::topology::Topology;

/// GTID compatibility between a would-be replica and a would-be main:
/// `(oracle, mariadb, compatible)`.
pub fn instances_are_gtid_compatible(instance: &Instance, other: &Instance) -> (bool, bool, bool) {
    let oracle = instance.using_oracle_gtid && other.supports_oracle_gtid;
    let mariadb = instance.using_mariadb_gtid && other.is_mariadb;
    (oracle, mariadb, oracle || mariadb)
}

impl Topology {
    /// Verify that `instance` can be moved below `other` via a global
    /// identifier strategy. For the oracle flavor this additionally checks
    /// that nothing `other` purged is still missing on `instance`.
    pub async fn check_move_via_gtid(&self, instance: &Instance, other: &Instance) -> Result<()> {
        let (oracle, _, compatible) = instances_are_gtid_compatible(instance, other);
        if !compatible {
            return Err(Error::identity_mode(format!(
                "instances {}, {} not gtid compatible or not using gtid",
                instance.key, other.key
            )));
        }
        if oracle {
            let missing = self
                .driver
                .gtid_subtract(&instance.key, &other.gtid_purged, &instance.executed_gtid_set)
                .await?;
            if !GtidSet::parse(&missing)?.is_empty() {
                return Err(Error::precondition(format!(
                    "instance {} has purged gtid entries not found on {}",
                    other.key, instance.key
                )));
            }
        }
        Ok(())
    }

    /// Locate the latest pseudo-GTID marker on `instance` at or before
    /// `max_coordinates`, searching its binary logs when it writes its own
    /// (and the formats line up), falling back to its relay logs.
    pub async fn find_last_pseudo_gtid_entry(
        &self,
        instance: &Instance,
        recorded_relay_coordinates: &BinlogCoordinates,
        max_coordinates: Option<&BinlogCoordinates>,
        exhaustive: bool,
        expected_binlog_format: Option<BinlogFormat>,
    ) -> Result<(BinlogCoordinates, String)> {
        if self.config.pseudo_gtid_pattern.is_empty() {
            return Err(Error::precondition(
                "pseudo-gtid pattern not configured; cannot use pseudo-gtid",
            ));
        }
        let mut found = None;
        // If this instance's own binary logs only just began recording
        // replica updates, or its format differs from the main we intend to
        // compare against, its binary logs cannot be trusted for marker
        // comparison. Use the relay logs instead.
        let binlogs_searchable = instance.log_bin_enabled
            && instance.log_replica_updates_enabled
            && !self.config.skip_binlog_search
            && expected_binlog_format.map_or(true, |format| format == instance.binlog_format);
        if binlogs_searchable {
            match self
                .scanner
                .last_pseudo_gtid_in_binlogs(instance, max_coordinates, exhaustive)
                .await
            {
                Ok(entry) => found = entry,
                Err(err) => {
                    debug!(
                        "binary-log pseudo-gtid search failed on {}, trying relay logs: {err}",
                        instance.key
                    );
                }
            }
        }
        if found.is_none() {
            found = self
                .scanner
                .last_pseudo_gtid_in_relay_logs(instance, recorded_relay_coordinates, exhaustive)
                .await?;
        }
        found.ok_or_else(|| {
            Error::position_mismatch(format!("no pseudo-gtid entry found on {}", instance.key))
        })
    }

    /// Find the coordinates on `other` that correlate with the given
    /// position on `instance` (its execution position when
    /// `max_coordinates` is `None`). Returns the coordinate to attach at
    /// and the number of events validated along the way; matching zero
    /// events is a correlation failure.
    pub async fn correlate_binlog_coordinates(
        &self,
        instance: &Instance,
        max_coordinates: Option<&BinlogCoordinates>,
        other: &Instance,
    ) -> Result<(BinlogCoordinates, usize)> {
        // Record the relay-log position up front: a log flush on the
        // instance would move it under our feet.
        let recorded_relay_coordinates = instance.relaylog_coordinates.clone();
        let (marker_coordinates, marker_text) = self
            .find_last_pseudo_gtid_entry(
                instance,
                &recorded_relay_coordinates,
                max_coordinates,
                true,
                Some(other.binlog_format),
            )
            .await?;
        let monotonic = !self.config.pseudo_gtid_monotonic_hint.is_empty()
            && marker_text.contains(&self.config.pseudo_gtid_monotonic_hint);
        let other_marker_coordinates = self
            .scanner
            .search_entry_in_binlogs(other, &marker_text, monotonic)
            .await?
            .ok_or_else(|| {
                Error::position_mismatch(format!(
                    "pseudo-gtid entry of {} not found in binary logs of {}",
                    instance.key, other.key
                ))
            })?;
        let (next_coordinates, count_matched) = self
            .scanner
            .next_coordinates_to_match(
                instance,
                &marker_coordinates,
                &recorded_relay_coordinates,
                max_coordinates,
                other,
                &other_marker_coordinates,
            )
            .await?;
        if count_matched == 0 {
            return Err(Error::position_mismatch(format!(
                "0 events processed while iterating logs of {}; cannot correlate",
                other.key
            )));
        }
        debug!(
            "correlated {} onto {} at {next_coordinates}; validated events: {count_matched}",
            instance.key, other.key
        );
        Ok((next_coordinates, count_matched))
    }
}
