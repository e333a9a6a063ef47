//! Binary-log and relay-log coordinates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Which log stream a coordinate points into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinlogType {
    #[default]
    Binary,
    Relay,
}

/// A position in a binary or relay log: file name plus byte offset.
///
/// Positions within one file are totally ordered by offset. Across files the
/// order follows the file names, compared lexically except that equal-stem
/// numeric suffixes compare numerically (`bin.000009` < `bin.000010`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    pub log_file: String,
    pub log_pos: u64,
    pub kind: BinlogType,
}

impl BinlogCoordinates {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            kind: BinlogType::Binary,
        }
    }

    pub fn relay(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            kind: BinlogType::Relay,
        }
    }

    /// No position at all (e.g. a replica that never replicated).
    pub fn is_empty(&self) -> bool {
        self.log_file.is_empty()
    }

    pub fn equals(&self, other: &BinlogCoordinates) -> bool {
        self == other
    }

    pub fn file_smaller_than(&self, other: &BinlogCoordinates) -> bool {
        compare_log_files(&self.log_file, &other.log_file) == Ordering::Less
    }

    pub fn smaller_than(&self, other: &BinlogCoordinates) -> bool {
        match compare_log_files(&self.log_file, &other.log_file) {
            Ordering::Less => true,
            Ordering::Equal => self.log_pos < other.log_pos,
            Ordering::Greater => false,
        }
    }

    pub fn smaller_or_equal(&self, other: &BinlogCoordinates) -> bool {
        self.smaller_than(other) || self.equals(other)
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

/// Compare log file names. Equal stems with numeric suffixes compare by
/// suffix value; everything else falls back to plain lexical order.
fn compare_log_files(a: &str, b: &str) -> Ordering {
    if let (Some((stem_a, suffix_a)), Some((stem_b, suffix_b))) =
        (a.rsplit_once('.'), b.rsplit_once('.'))
    {
        if stem_a == stem_b {
            if let (Ok(num_a), Ok(num_b)) = (suffix_a.parse::<u64>(), suffix_b.parse::<u64>()) {
                return num_a.cmp(&num_b);
            }
        }
    }
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_within_file() {
        let a = BinlogCoordinates::new("bin.000007", 100);
        let b = BinlogCoordinates::new("bin.000007", 500);
        assert!(a.smaller_than(&b));
        assert!(!b.smaller_than(&a));
        assert!(a.smaller_or_equal(&b));
        assert!(a.smaller_or_equal(&a));
    }

    #[test]
    fn test_order_across_files() {
        let a = BinlogCoordinates::new("bin.000009", 99999);
        let b = BinlogCoordinates::new("bin.000010", 4);
        assert!(a.smaller_than(&b));
        assert!(a.file_smaller_than(&b));
    }

    #[test]
    fn test_numeric_suffix_beats_lexical() {
        // Lexically "bin.999" > "bin.1000" but numerically it is smaller.
        let a = BinlogCoordinates::new("bin.999", 0);
        let b = BinlogCoordinates::new("bin.1000", 0);
        assert!(a.smaller_than(&b));
    }

    #[test]
    fn test_kind_distinguishes_equality() {
        let binary = BinlogCoordinates::new("log.000001", 7);
        let relay = BinlogCoordinates::relay("log.000001", 7);
        assert!(!binary.equals(&relay));
    }

    #[test]
    fn test_empty() {
        assert!(BinlogCoordinates::default().is_empty());
        assert!(!BinlogCoordinates::new("bin.000001", 4).is_empty());
    }
}
