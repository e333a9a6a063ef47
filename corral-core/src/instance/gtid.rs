//! Global transaction identifier sets.
//!
//! A set maps a source uuid to a list of closed transaction-sequence
//! intervals, e.g. `3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:11-18`.
//! Interval lists are kept normalized (sorted, merged) so that set algebra
//! and formatting are deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// A set of (source-uuid, interval-list) pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    entries: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    /// Parse the textual representation. The empty string parses to the
    /// empty set. Malformed input is a precondition violation.
    pub fn parse(text: &str) -> Result<GtidSet> {
        let mut entries: BTreeMap<String, Vec<(u64, u64)>> = BTreeMap::new();
        for entry in text.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut tokens = entry.split(':');
            let uuid = tokens
                .next()
                .filter(|uuid| !uuid.is_empty())
                .ok_or_else(|| malformed(entry))?
                .to_string();
            let mut intervals = Vec::new();
            for interval in tokens {
                let (start, end) = match interval.split_once('-') {
                    Some((start, end)) => (
                        start.parse::<u64>().map_err(|_| malformed(entry))?,
                        end.parse::<u64>().map_err(|_| malformed(entry))?,
                    ),
                    None => {
                        let single = interval.parse::<u64>().map_err(|_| malformed(entry))?;
                        (single, single)
                    }
                };
                if start == 0 || end < start {
                    return Err(malformed(entry));
                }
                intervals.push((start, end));
            }
            if intervals.is_empty() {
                return Err(malformed(entry));
            }
            entries
                .entry(uuid)
                .or_default()
                .extend(intervals.into_iter());
        }
        for intervals in entries.values_mut() {
            normalize(intervals);
        }
        Ok(GtidSet { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of transactions covered by the set.
    pub fn count(&self) -> u64 {
        self.entries
            .values()
            .flatten()
            .map(|(start, end)| end - start + 1)
            .sum()
    }

    /// Whether `other` is a subset of `self`.
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.subtract(self).is_empty()
    }

    /// Set difference `self \ other`.
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut entries = BTreeMap::new();
        for (uuid, intervals) in &self.entries {
            let remaining = match other.entries.get(uuid) {
                None => intervals.clone(),
                Some(subtrahend) => subtract_intervals(intervals, subtrahend),
            };
            if !remaining.is_empty() {
                entries.insert(uuid.clone(), remaining);
            }
        }
        GtidSet { entries }
    }

    /// Set union.
    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut entries = self.entries.clone();
        for (uuid, intervals) in &other.entries {
            let merged = entries.entry(uuid.clone()).or_default();
            merged.extend(intervals.iter().copied());
            normalize(merged);
        }
        GtidSet { entries }
    }

    /// Explode into single-transaction identifiers, `uuid:sequence` each.
    pub fn explode(&self) -> Vec<String> {
        let mut singles = Vec::new();
        for (uuid, intervals) in &self.entries {
            for (start, end) in intervals {
                for sequence in *start..=*end {
                    singles.push(format!("{uuid}:{sequence}"));
                }
            }
        }
        singles
    }

    /// Source uuids present in the set.
    pub fn source_uuids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.entries {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{uuid}")?;
            for (start, end) in intervals {
                if start == end {
                    write!(f, ":{start}")?;
                } else {
                    write!(f, ":{start}-{end}")?;
                }
            }
        }
        Ok(())
    }
}

fn malformed(entry: &str) -> Error {
    Error::precondition(format!("malformed gtid set entry: {entry}"))
}

/// Sort and merge adjacent or overlapping intervals in place.
fn normalize(intervals: &mut Vec<(u64, u64)>) {
    intervals.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for &(start, end) in intervals.iter() {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    *intervals = merged;
}

fn subtract_intervals(minuend: &[(u64, u64)], subtrahend: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut result = Vec::new();
    for &(start, end) in minuend {
        let mut cursor = start;
        for &(sub_start, sub_end) in subtrahend {
            if sub_end < cursor || sub_start > end {
                continue;
            }
            if sub_start > cursor {
                result.push((cursor, sub_start - 1));
            }
            cursor = sub_end + 1;
            if cursor > end {
                break;
            }
        }
        if cursor <= end {
            result.push((cursor, end));
        }
    }
    result
}
