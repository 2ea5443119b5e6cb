//! Shared fixtures for the integration tests.
//!
//! - [`FailingStore`]: wraps any store and injects write failures per family
//! - [`StaticConnector`]: resolves backend names to prebuilt stores of any kind
//! - [`HangingConnector`]: memory connector whose selected backends never answer
//! - [`RecordingPointer`]: pointer store that records what a backend held at each write
//! - [`Cluster`]: a master plus backups wired into a [`StoreEngine`]

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use async_trait::async_trait;
use parking_lot::Mutex;

use failover_store::{
    BackendConfig, BackendFamily, BackendKind, BackendTable, Connector, EngineConfig, Entity, EntityFamily,
    EntityStore, FieldPatch, InMemoryStore, MemoryConnector, MemoryPointerStore, PointerError, PointerStore,
    ReplicationPointer, Role, StorageError, StoreEngine,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Delegates to `inner`, failing writes for selected families.
pub struct FailingStore {
    inner: Arc<dyn EntityStore>,
    fail_families: Mutex<Vec<EntityFamily>>,
    fail_all_writes: AtomicBool,
    /// Families whose next write reports the backend unreachable
    drop_once: Mutex<Vec<EntityFamily>>,
    failures: AtomicU64,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn EntityStore>) -> Self {
        Self {
            inner,
            fail_families: Mutex::new(Vec::new()),
            fail_all_writes: AtomicBool::new(false),
            drop_once: Mutex::new(Vec::new()),
            failures: AtomicU64::new(0),
        }
    }

    pub fn fail_family(&self, family: EntityFamily) {
        self.fail_families.lock().push(family);
    }

    /// The next write to `family` fails as if the connection dropped.
    pub fn fail_once_unavailable(&self, family: EntityFamily) {
        self.drop_once.lock().push(family);
    }

    pub fn fail_all_writes(&self, fail: bool) {
        self.fail_all_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes rejected so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, family: EntityFamily) -> Result<(), StorageError> {
        {
            let mut drop_once = self.drop_once.lock();
            if let Some(pos) = drop_once.iter().position(|f| *f == family) {
                drop_once.remove(pos);
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(StorageError::Unavailable(format!("connection dropped writing {}", family)));
            }
        }
        if self.fail_all_writes.load(Ordering::SeqCst) || self.fail_families.lock().contains(&family) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Backend(format!("injected failure writing {}", family)));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for FailingStore {
    fn family(&self) -> BackendFamily {
        self.inner.family()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }

    async fn sync_schema(&self) -> Result<(), StorageError> {
        self.inner.sync_schema().await
    }

    async fn list(&self, family: EntityFamily) -> Result<Vec<Entity>, StorageError> {
        self.inner.list(family).await
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StorageError> {
        self.check(entity.family())?;
        self.inner.insert(entity).await
    }

    async fn update(&self, family: EntityFamily, uuid: &str, patch: &FieldPatch) -> Result<bool, StorageError> {
        self.check(family)?;
        self.inner.update(family, uuid, patch).await
    }

    async fn delete(&self, family: EntityFamily, uuid: &str) -> Result<bool, StorageError> {
        self.check(family)?;
        self.inner.delete(family, uuid).await
    }
}

// =============================================================================
// Connector over prebuilt stores
// =============================================================================

#[derive(Default)]
pub struct StaticConnector {
    stores: Mutex<HashMap<String, Arc<dyn EntityStore>>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, store: Arc<dyn EntityStore>) {
        self.stores.lock().insert(name.to_string(), store);
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(&self, name: &str, _config: &BackendConfig) -> Result<Arc<dyn EntityStore>, StorageError> {
        let store = self
            .stores
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::Unavailable(format!("backend '{}' not registered", name)))?;
        store.ping().await?;
        Ok(store)
    }
}

// =============================================================================
// Connector with backends that never answer
// =============================================================================

pub struct HangingConnector {
    inner: Arc<MemoryConnector>,
    hung: Mutex<HashSet<String>>,
}

impl HangingConnector {
    pub fn new(inner: Arc<MemoryConnector>) -> Self {
        Self {
            inner,
            hung: Mutex::new(HashSet::new()),
        }
    }

    /// Connects to `name` wait forever, until the engine's connect timeout.
    pub fn hang(&self, name: &str) {
        self.hung.lock().insert(name.to_string());
    }
}

#[async_trait]
impl Connector for HangingConnector {
    async fn connect(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn EntityStore>, StorageError> {
        let hung = self.hung.lock().contains(name);
        if hung {
            std::future::pending::<()>().await;
        }
        self.inner.connect(name, config).await
    }
}

// =============================================================================
// Pointer store that snapshots a backend on every write
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerWrite {
    pub backend: String,
    /// Sorted user uuids of the watched store at write time
    pub users: Vec<String>,
    pub thread: ThreadId,
}

#[derive(Default)]
pub struct RecordingPointer {
    inner: MemoryPointerStore,
    watched: Option<Arc<InMemoryStore>>,
    writes: Mutex<Vec<PointerWrite>>,
}

impl RecordingPointer {
    pub fn new(inner: MemoryPointerStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn watching(mut self, store: Arc<InMemoryStore>) -> Self {
        self.watched = Some(store);
        self
    }

    pub fn writes(&self) -> Vec<PointerWrite> {
        self.writes.lock().clone()
    }

    pub fn history(&self) -> Vec<String> {
        self.inner.history()
    }
}

impl PointerStore for RecordingPointer {
    fn load(&self) -> Result<Option<ReplicationPointer>, PointerError> {
        self.inner.load()
    }

    fn store(&self, pointer: &ReplicationPointer) -> Result<(), PointerError> {
        let users = self
            .watched
            .as_ref()
            .map(|store| uuids(store, EntityFamily::User))
            .unwrap_or_default();
        self.writes.lock().push(PointerWrite {
            backend: pointer.last_database_loaded.clone(),
            users,
            thread: std::thread::current().id(),
        });
        self.inner.store(pointer)
    }
}

// =============================================================================
// Engine fixtures
// =============================================================================

pub fn config(table: BackendTable) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.databases = table;
    config.liveness_interval_ms = 20;
    config.connect_timeout_ms = 500;
    config
}

/// `primary` master followed by the given backups, all memory-backed.
pub fn table(backups: &[&str]) -> BackendTable {
    let mut table = BackendTable::new().with("primary", BackendConfig::new(BackendKind::Mysql, Role::Master).with_url("mysql://primary/app"));
    for name in backups {
        table.insert(*name, BackendConfig::new(BackendKind::Sqlite, Role::Backup));
    }
    table
}

pub struct Cluster {
    pub engine: Arc<StoreEngine>,
    pub connector: Arc<MemoryConnector>,
    pub pointer: Arc<MemoryPointerStore>,
}

impl Cluster {
    /// Engine over `table`; stores are registered only for `reachable`.
    pub fn new(table: BackendTable, reachable: &[&str], pointer: MemoryPointerStore) -> Self {
        let connector = Arc::new(MemoryConnector::new());
        for name in reachable {
            connector.register(*name, Arc::new(InMemoryStore::new()));
        }
        Self::with_connector(table, connector, pointer)
    }

    pub fn with_connector(table: BackendTable, connector: Arc<MemoryConnector>, pointer: MemoryPointerStore) -> Self {
        let pointer = Arc::new(pointer);
        let engine = Arc::new(StoreEngine::new(config(table), connector.clone(), pointer.clone()));
        Self {
            engine,
            connector,
            pointer,
        }
    }

    pub fn store(&self, name: &str) -> Arc<InMemoryStore> {
        self.connector.store(name).expect("store registered")
    }

    pub fn masters(&self) -> Vec<String> {
        self.engine
            .roles()
            .into_iter()
            .filter(|r| r.enabled && r.role == Role::Master)
            .map(|r| r.name)
            .collect()
    }
}

/// Sorted uuids of a family.
pub fn uuids(store: &InMemoryStore, family: EntityFamily) -> Vec<String> {
    let mut uuids: Vec<String> = store.snapshot(family).iter().map(|e| e.uuid().to_string()).collect();
    uuids.sort();
    uuids
}

/// Every family holds the same records with the same fields.
pub fn assert_converged(master: &InMemoryStore, backup: &InMemoryStore) {
    for family in EntityFamily::ALL {
        let mut expected = master.snapshot(family);
        let mut actual = backup.snapshot(family);
        expected.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        actual.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        assert_eq!(expected, actual, "{} differs", family);
    }
}
