//! Instance addressing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hostname prefix marking a key as detached. Reversible by construction.
const DETACHED_HOSTNAME_PREFIX: &str = "//";

/// Host and port of one database instance. The value identity of everything
/// in the topology graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub hostname: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// A key is valid when it actually addresses something.
    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty() && self.port != 0
    }

    /// Whether this key has been mangled by [`InstanceKey::detached_key`].
    pub fn is_detached(&self) -> bool {
        self.hostname.starts_with(DETACHED_HOSTNAME_PREFIX)
    }

    /// Mangle the hostname so a replica pointed at this key cannot resume
    /// replication, while keeping the original recoverable.
    pub fn detached_key(&self) -> InstanceKey {
        if self.is_detached() {
            return self.clone();
        }
        InstanceKey {
            hostname: format!("{DETACHED_HOSTNAME_PREFIX}{}", self.hostname),
            port: self.port,
        }
    }

    /// Undo [`InstanceKey::detached_key`].
    pub fn reattached_key(&self) -> InstanceKey {
        if !self.is_detached() {
            return self.clone();
        }
        InstanceKey {
            hostname: self.hostname[DETACHED_HOSTNAME_PREFIX.len()..].to_string(),
            port: self.port,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let key = InstanceKey::new("db-0001.dc1", 3306);
        assert_eq!(key.to_string(), "db-0001.dc1:3306");
    }

    #[test]
    fn test_detach_round_trip() {
        let key = InstanceKey::new("db-0001.dc1", 3306);
        assert!(!key.is_detached());

        let detached = key.detached_key();
        assert!(detached.is_detached());
        assert_eq!(detached.hostname, "//db-0001.dc1");
        assert_eq!(detached.port, 3306);

        // Detaching twice is a no-op.
        assert_eq!(detached.detached_key(), detached);

        let reattached = detached.reattached_key();
        assert_eq!(reattached, key);
        // Reattaching a non-detached key is a no-op.
        assert_eq!(key.reattached_key(), key);
    }

    #[test]
    fn test_validity() {
        assert!(InstanceKey::new("db", 3306).is_valid());
        assert!(!InstanceKey::new("", 3306).is_valid());
        assert!(!InstanceKey::new("db", 0).is_valid());
    }
}
