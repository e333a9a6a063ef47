//! Oracles over remote binary/relay log streams.
//!
//! These are the log-scanning primitives the pseudo-GTID correlation engine
//! builds on. Scans are expensive remote iterations; the engine decides
//! which log to scan and how to combine the answers.

use async_trait::async_trait;

use crate::error::Result;
use crate::instance::{BinlogCoordinates, Instance};

/// Log-scanning primitives for pseudo-GTID correlation.
#[async_trait]
pub trait BinlogScanner: Send + Sync {
    /// Latest pseudo-GTID marker in the instance's own binary logs at or
    /// before `max_coordinates` (unbounded when `None`), with its text.
    async fn last_pseudo_gtid_in_binlogs(
        &self,
        instance: &Instance,
        max_coordinates: Option<&BinlogCoordinates>,
        exhaustive: bool,
    ) -> Result<Option<(BinlogCoordinates, String)>>;

    /// Latest pseudo-GTID marker in the instance's relay logs, bounded by
    /// the relay-log position recorded when the instance was stopped.
    async fn last_pseudo_gtid_in_relay_logs(
        &self,
        instance: &Instance,
        recorded_relay_coordinates: &BinlogCoordinates,
        exhaustive: bool,
    ) -> Result<Option<(BinlogCoordinates, String)>>;

    /// Find the given marker text in another instance's binary logs.
    /// `monotonic` promises marker values only ever increase, allowing the
    /// search to bail out early.
    async fn search_entry_in_binlogs(
        &self,
        instance: &Instance,
        entry: &str,
        monotonic: bool,
    ) -> Result<Option<BinlogCoordinates>>;

    /// Walk both logs forward from the two matched markers in lock-step,
    /// matching events, and return the first coordinate on `other` that
    /// `instance` has not executed, along with the number of events
    /// matched along the way.
    #[allow(clippy::too_many_arguments)]
    async fn next_coordinates_to_match(
        &self,
        instance: &Instance,
        instance_coordinates: &BinlogCoordinates,
        recorded_relay_coordinates: &BinlogCoordinates,
        max_coordinates: Option<&BinlogCoordinates>,
        other: &Instance,
        other_coordinates: &BinlogCoordinates,
    ) -> Result<(BinlogCoordinates, usize)>;
}
