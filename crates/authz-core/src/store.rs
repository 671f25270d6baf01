//! Permission store abstraction
//!
//! The store is the source of truth for `(identity, module)` grants. It is
//! only consulted on cache miss; see [`crate::decision::check_authz`].

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

/// Opaque, stable identifier of an authenticated principal
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Named resource category permissions are evaluated against
/// (e.g. "vehicles", "customers"). The set of modules is open.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Module(String);

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Module {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Read/write/delete grants for one `(identity, module)` pair
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PermissionSet {
    pub can_read: bool,
    pub can_write: bool,
    pub can_delete: bool,
}

impl PermissionSet {
    /// The explicit result of a store lookup that found no row
    pub const DENY_ALL: PermissionSet = PermissionSet {
        can_read: false,
        can_write: false,
        can_delete: false,
    };

    pub fn new(can_read: bool, can_write: bool, can_delete: bool) -> Self {
        Self {
            can_read,
            can_write,
            can_delete,
        }
    }
}

/// Error returned by a permission store query
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("permission store unavailable: {0}")]
    Unavailable(String),

    #[error("permission store query timed out")]
    Timeout,

    #[error("permission store query failed: {0}")]
    Query(String),
}

/// Backend holding persisted permission rows
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Look up the grants for `(identity, module)`.
    ///
    /// `Ok(None)` means no row exists, which callers treat as deny-all.
    async fn fetch(
        &self,
        identity: &IdentityId,
        module: &Module,
    ) -> Result<Option<PermissionSet>, StoreError>;
}

/// In-memory permission store for development and tests
///
/// Counts queries and can be switched into a failing state to exercise the
/// store-unavailable paths.
#[derive(Default)]
pub struct MemoryPermissionStore {
    rows: RwLock<HashMap<(IdentityId, Module), PermissionSet>>,
    failing: AtomicBool,
    queries: AtomicUsize,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the row for `(identity, module)`
    pub fn grant(
        &self,
        identity: impl Into<IdentityId>,
        module: impl Into<Module>,
        perms: PermissionSet,
    ) {
        self.rows
            .write()
            .insert((identity.into(), module.into()), perms);
    }

    /// Delete the row for `(identity, module)`
    pub fn revoke(&self, identity: impl Into<IdentityId>, module: impl Into<Module>) {
        self.rows.write().remove(&(identity.into(), module.into()));
    }

    /// Make every subsequent query fail with [`StoreError::Unavailable`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `fetch` calls served so far (including failed ones)
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionStore for MemoryPermissionStore {
    async fn fetch(
        &self,
        identity: &IdentityId,
        module: &Module,
    ) -> Result<Option<PermissionSet>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(self
            .rows
            .read()
            .get(&(identity.clone(), module.clone()))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_missing_row() {
        let store = MemoryPermissionStore::new();
        let row = store
            .fetch(&IdentityId::from("u1"), &Module::from("vehicles"))
            .await
            .unwrap();
        assert!(row.is_none());
        assert_eq!(store.query_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_grant_and_revoke() {
        let store = MemoryPermissionStore::new();
        store.grant("u1", "vehicles", PermissionSet::new(true, false, false));

        let row = store
            .fetch(&IdentityId::from("u1"), &Module::from("vehicles"))
            .await
            .unwrap();
        assert_eq!(row, Some(PermissionSet::new(true, false, false)));

        // Grants are per module
        let other = store
            .fetch(&IdentityId::from("u1"), &Module::from("customers"))
            .await
            .unwrap();
        assert!(other.is_none());

        store.revoke("u1", "vehicles");
        let row = store
            .fetch(&IdentityId::from("u1"), &Module::from("vehicles"))
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_failing() {
        let store = MemoryPermissionStore::new();
        store.set_failing(true);

        let result = store
            .fetch(&IdentityId::from("u1"), &Module::from("vehicles"))
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.query_count(), 1);
    }
}
