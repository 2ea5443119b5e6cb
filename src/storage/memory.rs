// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory entity store.
//!
//! Used as a stand-in backend in tests and demos. Reachability and schema
//! sync can be switched off at runtime to simulate outages, and every write
//! is counted so tests can assert that a pass did nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{Connector, EntityStore, StorageError};
use crate::config::{BackendConfig, BackendFamily};
use crate::entity::{Entity, EntityFamily, FieldPatch};

pub struct InMemoryStore {
    family: BackendFamily,
    /// uuid -> (insertion sequence, entity), per entity family
    tables: HashMap<EntityFamily, DashMap<String, (u64, Entity)>>,
    next_seq: AtomicU64,
    reachable: AtomicBool,
    fail_schema_sync: AtomicBool,
    schema_syncs: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_family(BackendFamily::Relational)
    }

    /// Report a different adapter family (stores behave identically).
    #[must_use]
    pub fn with_family(family: BackendFamily) -> Self {
        Self {
            family,
            tables: EntityFamily::ALL.iter().map(|f| (*f, DashMap::new())).collect(),
            next_seq: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
            fail_schema_sync: AtomicBool::new(false),
            schema_syncs: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn set_schema_sync_failure(&self, fail: bool) {
        self.fail_schema_sync.store(fail, Ordering::SeqCst);
    }

    /// Number of completed schema syncs
    #[must_use]
    pub fn schema_syncs(&self) -> u64 {
        self.schema_syncs.load(Ordering::SeqCst)
    }

    /// Number of successful inserts, updates and deletes
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Get current item count across families
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.values().map(DashMap::len).sum()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all items
    pub fn clear(&self) {
        for table in self.tables.values() {
            table.clear();
        }
    }

    /// Synchronous snapshot of a family, for assertions.
    #[must_use]
    pub fn snapshot(&self, family: EntityFamily) -> Vec<Entity> {
        let mut rows: Vec<(u64, Entity)> = self
            .table(family)
            .iter()
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, e)| e).collect()
    }

    /// Insert without touching the write counter or reachability (test setup).
    pub fn seed(&self, entity: impl Into<Entity>) {
        let entity = entity.into();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.table(entity.family())
            .insert(entity.uuid().to_string(), (seq, entity));
    }

    fn table(&self, family: EntityFamily) -> &DashMap<String, (u64, Entity)> {
        // Every family is created in `with_family`
        &self.tables[&family]
    }

    fn check_reachable(&self) -> Result<(), StorageError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory backend switched off".into()))
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    fn family(&self) -> BackendFamily {
        self.family
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_reachable()
    }

    async fn sync_schema(&self) -> Result<(), StorageError> {
        self.check_reachable()?;
        if self.fail_schema_sync.load(Ordering::SeqCst) {
            return Err(StorageError::Schema("schema sync disabled for this store".into()));
        }
        self.schema_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, family: EntityFamily) -> Result<Vec<Entity>, StorageError> {
        self.check_reachable()?;
        Ok(self.snapshot(family))
    }

    async fn get(&self, family: EntityFamily, uuid: &str) -> Result<Option<Entity>, StorageError> {
        self.check_reachable()?;
        Ok(self.table(family).get(uuid).map(|r| r.value().1.clone()))
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StorageError> {
        self.check_reachable()?;
        let table = self.table(entity.family());
        match table.entry(entity.uuid().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StorageError::Duplicate {
                family: entity.family(),
                uuid: entity.uuid().to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                slot.insert((seq, entity.clone()));
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn update(&self, family: EntityFamily, uuid: &str, patch: &FieldPatch) -> Result<bool, StorageError> {
        self.check_reachable()?;
        let Some(mut row) = self.table(family).get_mut(uuid) else {
            return Ok(false);
        };
        let mut updated = row.1.clone();
        updated.apply_patch(patch)?;
        row.1 = updated;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn delete(&self, family: EntityFamily, uuid: &str) -> Result<bool, StorageError> {
        self.check_reachable()?;
        let removed = self.table(family).remove(uuid).is_some();
        if removed {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn count(&self, family: EntityFamily) -> Result<u64, StorageError> {
        self.check_reachable()?;
        Ok(self.table(family).len() as u64)
    }
}

/// Connector resolving backend names to registered in-memory stores.
///
/// Connecting to a name with no registered store, or to a store that is
/// switched off, fails like an unreachable server.
#[derive(Default)]
pub struct MemoryConnector {
    stores: DashMap<String, Arc<InMemoryStore>>,
    attempts: Mutex<Vec<String>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the store behind a backend name.
    pub fn register(&self, name: impl Into<String>, store: Arc<InMemoryStore>) -> Arc<InMemoryStore> {
        self.stores.insert(name.into(), store.clone());
        store
    }

    #[must_use]
    pub fn store(&self, name: &str) -> Option<Arc<InMemoryStore>> {
        self.stores.get(name).map(|r| r.value().clone())
    }

    /// Backend names passed to `connect`, in call order.
    #[must_use]
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, name: &str, _config: &BackendConfig) -> Result<Arc<dyn EntityStore>, StorageError> {
        self.attempts.lock().push(name.to_string());
        let store = self
            .store(name)
            .ok_or_else(|| StorageError::Unavailable(format!("no in-memory backend registered as '{}'", name)))?;
        store.ping().await?;
        Ok(store as Arc<dyn EntityStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, Role};
    use crate::entity::{Badge, User};
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_get_delete() {
        let store = InMemoryStore::new();
        let user = Entity::from(User::new("u1", "ada", "a@b", "p"));

        store.insert(&user).await.unwrap();
        assert_eq!(store.get(EntityFamily::User, "u1").await.unwrap(), Some(user.clone()));
        assert_eq!(store.count(EntityFamily::User).await.unwrap(), 1);

        assert!(store.delete(EntityFamily::User, "u1").await.unwrap());
        assert!(!store.delete(EntityFamily::User, "u1").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemoryStore::new();
        let badge = Entity::from(Badge::new("b1", "star", "Star"));
        store.insert(&badge).await.unwrap();

        let err = store.insert(&badge).await.unwrap_err();
        assert!(matches!(err, StorageError::Duplicate { .. }));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_update_applies_patch() {
        let store = InMemoryStore::new();
        store.seed(User::new("u1", "ada", "a@b", "p"));

        let patch = json!({ "username": "lovelace" }).as_object().cloned().unwrap();
        assert!(store.update(EntityFamily::User, "u1", &patch).await.unwrap());
        assert!(!store.update(EntityFamily::User, "u2", &patch).await.unwrap());

        match store.get(EntityFamily::User, "u1").await.unwrap() {
            Some(Entity::User(u)) => assert_eq!(u.username, "lovelace"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let store = InMemoryStore::new();
        for uuid in ["c", "a", "b"] {
            store.seed(Badge::new(uuid, "i", "n"));
        }
        let uuids: Vec<_> = store
            .list(EntityFamily::Badge)
            .await
            .unwrap()
            .iter()
            .map(|e| e.uuid().to_string())
            .collect();
        assert_eq!(uuids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_reachable(false);
        assert!(store.ping().await.unwrap_err().is_unavailable());
        assert!(store.list(EntityFamily::User).await.unwrap_err().is_unavailable());

        store.set_reachable(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_connector_unknown_and_unreachable() {
        let connector = MemoryConnector::new();
        let config = BackendConfig::new(BackendKind::Sqlite, Role::Master);
        assert!(connector.connect("ghost", &config).await.is_err());

        let store = connector.register("db", Arc::new(InMemoryStore::new()));
        assert!(connector.connect("db", &config).await.is_ok());

        store.set_reachable(false);
        assert!(connector.connect("db", &config).await.is_err());
        assert_eq!(connector.attempts(), vec!["ghost", "db", "db"]);
    }
}
