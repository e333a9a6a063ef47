//! Corral Core - Replication Topology Manipulation
//!
//! This crate is the topology core of the corral fleet orchestrator. It
//! safely rearranges a directed graph of database instances, where each
//! node replicates from at most one main, by issuing side-effectful control
//! operations against live servers:
//!
//! - Single-instance moves: move-up, move-below, repoint, match-below,
//!   identifier-based moves, co-main pairing, main takeover
//! - Bulk moves over replica sets with bounded concurrency
//! - Candidate selection for promotion
//! - Regroup and relocate meta-algorithms spanning all strategies
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │      Relocate / Regroup meta-algorithms     │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │      Single-instance and bulk moves         │
//! │   (stop → reparent → restart, always)       │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │        Position correlation engine          │
//! │    (pseudo-GTID markers, identifier sets)   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   Driver · Repository · Scanner seams       │
//! │  (live servers, cached snapshots, logs)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Three position-matching strategies coexist, each with its own
//! preconditions: global transaction identifiers, pseudo-identifier markers
//! embedded in the log stream, and raw logfile/offset coordinates. The
//! meta-algorithms pick whichever is cheapest for the topology at hand.

pub mod config;
pub mod error;
pub mod instance;
pub mod testing;
pub mod topology;

pub use config::TopologyConfig;
pub use error::{Error, Result};
pub use instance::{
    BinlogCoordinates, BinlogFormat, BinlogType, GtidSet, Instance, InstanceKey, PromotionRule,
};
pub use topology::{
    instance_is_main_of, instances_are_siblings, AuditEntry, BinlogScanner,
    BinlogServerRegroupOutcome, BulkOutcome, CandidateSelection, GtidHint, InstanceRepository,
    MaintenanceGuard, MaintenanceRegistry, MaintenanceToken, PostponedFunctionsContainer,
    RegroupOutcome, ReplicationThreadState, StopReplicationMethod, Topology, TopologyDriver,
};
