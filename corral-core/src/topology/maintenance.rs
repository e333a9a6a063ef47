//! Advisory per-instance maintenance locks.
//!
//! While a token is outstanding for a key, no other operation may acquire
//! one for the same key. Tokens release through [`MaintenanceGuard`] so
//! that every exit path, including early returns, unlocks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::instance::InstanceKey;

/// Opaque handle to an acquired maintenance lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceToken {
    id: Uuid,
    key: InstanceKey,
}

impl MaintenanceToken {
    pub fn key(&self) -> &InstanceKey {
        &self.key
    }
}

#[derive(Debug)]
struct MaintenanceEntry {
    token_id: Uuid,
    owner: String,
    reason: String,
    begun: DateTime<Utc>,
}

/// In-memory registry of per-instance advisory locks.
#[derive(Debug, Default)]
pub struct MaintenanceRegistry {
    entries: Mutex<HashMap<InstanceKey, MaintenanceEntry>>,
}

impl MaintenanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a token for `key`. Fails while another token for the same
    /// key is outstanding.
    pub fn begin_maintenance(
        &self,
        key: &InstanceKey,
        owner: &str,
        reason: &str,
    ) -> Result<MaintenanceToken> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            return Err(Error::precondition(format!(
                "{key} is already under maintenance (owner: {}, reason: {})",
                existing.owner, existing.reason
            )));
        }
        let token_id = Uuid::new_v4();
        entries.insert(
            key.clone(),
            MaintenanceEntry {
                token_id,
                owner: owner.to_string(),
                reason: reason.to_string(),
                begun: Utc::now(),
            },
        );
        Ok(MaintenanceToken {
            id: token_id,
            key: key.clone(),
        })
    }

    /// Release a token. Returns whether the token was the one outstanding.
    pub fn end_maintenance(&self, token: &MaintenanceToken) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&token.key) {
            Some(entry) if entry.token_id == token.id => {
                entries.remove(&token.key);
                true
            }
            _ => false,
        }
    }

    /// Whether any token is outstanding for `key`.
    pub fn in_maintenance(&self, key: &InstanceKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// When the outstanding token for `key` was taken, if any.
    pub fn maintenance_begun(&self, key: &InstanceKey) -> Option<DateTime<Utc>> {
        self.entries.lock().get(key).map(|entry| entry.begun)
    }

}

/// RAII wrapper releasing a maintenance token on drop.
#[derive(Debug)]
pub struct MaintenanceGuard {
    registry: Arc<MaintenanceRegistry>,
    token: Option<MaintenanceToken>,
}

impl MaintenanceGuard {
    /// Acquire a token wrapped in a guard that releases on drop.
    pub fn acquire(
        registry: &Arc<MaintenanceRegistry>,
        key: &InstanceKey,
        owner: &str,
        reason: &str,
    ) -> Result<MaintenanceGuard> {
        let token = registry.begin_maintenance(key, owner, reason)?;
        Ok(MaintenanceGuard {
            registry: Arc::clone(registry),
            token: Some(token),
        })
    }
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.registry.end_maintenance(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(host: &str) -> InstanceKey {
        InstanceKey::new(host, 3306)
    }

    #[test]
    fn test_exclusive_acquisition() {
        let registry = MaintenanceRegistry::new();
        let token = registry
            .begin_maintenance(&key("db-1"), "tester", "move up")
            .unwrap();
        assert!(registry.in_maintenance(&key("db-1")));
        assert!(registry
            .begin_maintenance(&key("db-1"), "other", "repoint")
            .is_err());
        // A different key is unaffected.
        assert!(registry
            .begin_maintenance(&key("db-2"), "other", "repoint")
            .is_ok());

        assert!(registry.end_maintenance(&token));
        assert!(!registry.in_maintenance(&key("db-1")));
        // Double release is harmless.
        assert!(!registry.end_maintenance(&token));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = Arc::new(MaintenanceRegistry::new());
        {
            let _guard =
                MaintenanceGuard::acquire(&registry, &key("db-1"), "tester", "move below")
                    .unwrap();
            assert!(registry.in_maintenance(&key("db-1")));
            assert!(MaintenanceGuard::acquire(&registry, &key("db-1"), "tester", "again").is_err());
        }
        assert!(!registry.in_maintenance(&key("db-1")));
    }

    #[test]
    fn test_stale_token_does_not_release_new_lock() {
        let registry = MaintenanceRegistry::new();
        let stale = registry
            .begin_maintenance(&key("db-1"), "tester", "first")
            .unwrap();
        registry.end_maintenance(&stale);
        let _fresh = registry
            .begin_maintenance(&key("db-1"), "tester", "second")
            .unwrap();
        assert!(!registry.end_maintenance(&stale));
        assert!(registry.in_maintenance(&key("db-1")));
    }
}
