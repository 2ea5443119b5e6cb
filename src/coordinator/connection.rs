// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection manager: role table, master handle and backend handles.
//!
//! The manager never decides on its own to fail over. Connect and probe
//! failures are reported to the caller; [`super::FailoverController`] acts
//! on them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::types::{BackendHandle, ConnectionState, RoleEntry};
use crate::config::{BackendConfig, BackendTable, Role};
use crate::error::EngineError;
use crate::storage::traits::{Connector, EntityStore, StorageError};

pub struct ConnectionManager {
    /// Role table; `role` is the only field mutated after start
    backends: RwLock<BackendTable>,
    connector: Arc<dyn Connector>,
    master: RwLock<Option<BackendHandle>>,
    /// Open handles by backend name (master included)
    handles: DashMap<String, Arc<dyn EntityStore>>,
    /// Backups holding writes the master has not pulled yet
    held_back: Mutex<BTreeSet<String>>,
    /// Master named in the settings file, if exactly one was
    configured_master: Option<String>,
    connect_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(backends: BackendTable, connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        let masters: Vec<&str> = backends
            .iter()
            .filter(|b| b.config.enabled && b.config.role == Role::Master)
            .map(|b| b.name.as_str())
            .collect();
        let configured_master = match masters.as_slice() {
            [only] => Some(only.to_string()),
            _ => None,
        };
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            backends: RwLock::new(backends),
            connector,
            master: RwLock::new(None),
            handles: DashMap::new(),
            held_back: Mutex::new(BTreeSet::new()),
            configured_master,
            connect_timeout,
            state,
            state_rx,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        if *self.state_rx.borrow() != state {
            debug!(state = %state, "Connection state changed");
            crate::metrics::set_connection_state(&state.to_string());
        }
        let _ = self.state.send(state);
    }

    /// The single enabled backend with `role = master`.
    pub fn select_master(&self) -> Result<String, EngineError> {
        let backends = self.backends.read();
        let masters: Vec<String> = backends
            .iter()
            .filter(|b| b.config.enabled && b.config.role == Role::Master)
            .map(|b| b.name.clone())
            .collect();
        match masters.len() {
            0 => Err(EngineError::NoMasterConfigured),
            1 => Ok(masters.into_iter().next().unwrap_or_default()),
            _ => Err(EngineError::MultipleMasters { backends: masters }),
        }
    }

    /// Master named by the settings file (before any failover).
    #[must_use]
    pub fn configured_master(&self) -> Option<&str> {
        self.configured_master.as_deref()
    }

    /// Open a backend, running schema sync when its config asks for it.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self, name: &str) -> Result<Arc<dyn EntityStore>, EngineError> {
        let config = self.backend_config(name).ok_or_else(|| EngineError::UnknownBackend(name.to_string()))?;
        let store = self.open(name, &config).await?;

        if config.auto_schema_sync {
            match store.sync_schema().await {
                Ok(()) => {
                    crate::metrics::record_schema_sync(name, true);
                    debug!(backend = %name, "Schema synchronized");
                }
                Err(cause) => {
                    crate::metrics::record_schema_sync(name, false);
                    self.handles.remove(name);
                    return Err(EngineError::SchemaSync {
                        backend: name.to_string(),
                        cause,
                    });
                }
            }
        }
        Ok(store)
    }

    /// Open without schema sync, bounded by the connect timeout.
    async fn open(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn EntityStore>, EngineError> {
        info!(backend = %name, kind = %config.kind, "Connecting to backend");
        let result = match timeout(self.connect_timeout, self.connector.connect(name, config)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Unavailable(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            ))),
        };
        crate::metrics::record_connect(name, result.is_ok());
        crate::metrics::set_backend_healthy(name, result.is_ok());
        match result {
            Ok(store) => {
                self.handles.insert(name.to_string(), store.clone());
                Ok(store)
            }
            Err(cause) => {
                self.handles.remove(name);
                Err(EngineError::Connection {
                    backend: name.to_string(),
                    cause,
                })
            }
        }
    }

    /// Cheap probe; any failure (or a probe exceeding the connect timeout) is `false`.
    pub async fn is_alive(&self, name: &str, store: &dyn EntityStore) -> bool {
        let alive = match timeout(self.connect_timeout, store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(backend = %name, error = %e, "Liveness probe failed");
                false
            }
            Err(_) => {
                warn!(backend = %name, timeout = ?self.connect_timeout, "Liveness probe timed out");
                false
            }
        };
        crate::metrics::record_probe(name, alive);
        crate::metrics::set_backend_healthy(name, alive);
        alive
    }

    /// Probe the current master. `false` when there is none.
    pub async fn is_connection_established(&self) -> bool {
        match self.master() {
            Some(handle) => self.is_alive(&handle.name, handle.store.as_ref()).await,
            None => false,
        }
    }

    /// Handle for a backup, reusing a cached one while it answers probes.
    /// Schema sync is left to the replication pass.
    pub async fn handle_for(&self, name: &str) -> Result<BackendHandle, EngineError> {
        let config = self.backend_config(name).ok_or_else(|| EngineError::UnknownBackend(name.to_string()))?;
        let cached = self.handles.get(name).map(|r| r.value().clone());
        if let Some(store) = cached {
            if self.is_alive(name, store.as_ref()).await {
                return Ok(BackendHandle {
                    name: name.to_string(),
                    config,
                    store,
                });
            }
            debug!(backend = %name, "Cached handle failed probe, reopening");
        }
        let store = self.open(name, &config).await?;
        Ok(BackendHandle {
            name: name.to_string(),
            config,
            store,
        })
    }

    #[must_use]
    pub fn master(&self) -> Option<BackendHandle> {
        self.master.read().clone()
    }

    #[must_use]
    pub fn master_name(&self) -> Option<String> {
        self.master.read().as_ref().map(|h| h.name.clone())
    }

    /// Make `name` the master: every other master entry becomes a backup.
    /// Returns the names that were demoted.
    pub(crate) fn install_master(&self, name: &str, store: Arc<dyn EntityStore>) -> Result<Vec<String>, EngineError> {
        let mut demoted = Vec::new();
        let config = {
            let mut backends = self.backends.write();
            if backends.get(name).is_none() {
                return Err(EngineError::UnknownBackend(name.to_string()));
            }
            for backend in backends.iter_mut() {
                if backend.name == name {
                    backend.config.role = Role::Master;
                } else if backend.config.role == Role::Master {
                    backend.config.role = Role::Backup;
                    demoted.push(backend.name.clone());
                }
            }
            backends.get(name).cloned()
        };
        let Some(config) = config else {
            return Err(EngineError::UnknownBackend(name.to_string()));
        };

        for other in &demoted {
            crate::metrics::set_master(other, false);
        }
        crate::metrics::set_master(name, true);

        self.handles.insert(name.to_string(), store.clone());
        *self.master.write() = Some(BackendHandle {
            name: name.to_string(),
            config,
            store,
        });
        self.set_state(ConnectionState::Connected);
        Ok(demoted)
    }

    /// Drop the master handle (the role table is left alone).
    pub(crate) fn clear_master(&self) {
        *self.master.write() = None;
        self.set_state(ConnectionState::Disconnected);
    }

    #[must_use]
    pub fn role_of(&self, name: &str) -> Option<Role> {
        self.backends.read().get(name).map(|c| c.role)
    }

    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.backends.read().get(name).is_some_and(|c| c.enabled)
    }

    #[must_use]
    pub fn backend_config(&self, name: &str) -> Option<BackendConfig> {
        self.backends.read().get(name).cloned()
    }

    /// The role table, in declaration order.
    #[must_use]
    pub fn roles(&self) -> Vec<RoleEntry> {
        self.backends
            .read()
            .iter()
            .map(|b| RoleEntry {
                name: b.name.clone(),
                kind: b.config.kind,
                role: b.config.role,
                enabled: b.config.enabled,
            })
            .collect()
    }

    /// Enabled backups in declaration order.
    #[must_use]
    pub fn enabled_backups(&self) -> Vec<String> {
        self.backends
            .read()
            .iter()
            .filter(|b| b.config.enabled && b.config.role == Role::Backup)
            .map(|b| b.name.clone())
            .collect()
    }

    /// Enabled backups a replication pass may overwrite: held-back backends
    /// are left out until the master has pulled from them.
    #[must_use]
    pub fn replication_targets(&self) -> Vec<String> {
        let held = self.held_back.lock();
        self.enabled_backups()
            .into_iter()
            .filter(|name| !held.contains(name))
            .collect()
    }

    /// Keep `name` out of replication passes.
    pub(crate) fn hold_back(&self, name: &str) {
        self.held_back.lock().insert(name.to_string());
    }

    /// Return `name` to replication passes. False if it was not held back.
    pub(crate) fn release(&self, name: &str) -> bool {
        self.held_back.lock().remove(name)
    }

    #[must_use]
    pub fn is_held_back(&self, name: &str) -> bool {
        self.held_back.lock().contains(name)
    }

    /// Backends waiting for the master to pull their writes.
    #[must_use]
    pub fn held_back(&self) -> Vec<String> {
        self.held_back.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::storage::memory::{InMemoryStore, MemoryConnector};

    fn table() -> BackendTable {
        BackendTable::new()
            .with("primary", BackendConfig::new(BackendKind::Postgres, Role::Master).with_url("postgres://x"))
            .with("b1", BackendConfig::new(BackendKind::Sqlite, Role::Backup))
            .with("off", BackendConfig::new(BackendKind::Sqlite, Role::Backup).disabled())
            .with("b2", BackendConfig::new(BackendKind::Redis, Role::Backup).with_url("redis://x"))
    }

    fn manager(table: BackendTable) -> (ConnectionManager, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new());
        let manager = ConnectionManager::new(table, connector.clone(), Duration::from_millis(200));
        (manager, connector)
    }

    #[test]
    fn test_select_master() {
        let (m, _) = manager(table());
        assert_eq!(m.select_master().unwrap(), "primary");
        assert_eq!(m.configured_master(), Some("primary"));
        assert_eq!(m.enabled_backups(), vec!["b1", "b2"]);
    }

    #[test]
    fn test_select_master_rejects_zero_and_many() {
        let none = BackendTable::new().with("b", BackendConfig::new(BackendKind::Sqlite, Role::Backup));
        assert!(matches!(manager(none).0.select_master(), Err(EngineError::NoMasterConfigured)));

        let many = BackendTable::new()
            .with("a", BackendConfig::new(BackendKind::Sqlite, Role::Master))
            .with("b", BackendConfig::new(BackendKind::Sqlite, Role::Master));
        match manager(many).0.select_master() {
            Err(EngineError::MultipleMasters { backends }) => assert_eq!(backends, vec!["a", "b"]),
            other => panic!("unexpected {:?}", other),
        }

        let disabled_master = BackendTable::new()
            .with("a", BackendConfig::new(BackendKind::Sqlite, Role::Master).disabled());
        assert!(manager(disabled_master).0.select_master().is_err());
    }

    #[tokio::test]
    async fn test_connect_runs_schema_sync_when_configured() {
        let table = BackendTable::new()
            .with("a", BackendConfig::new(BackendKind::Sqlite, Role::Master).with_schema_sync(true));
        let (m, connector) = manager(table);
        let store = connector.register("a", Arc::new(InMemoryStore::new()));

        m.connect("a").await.unwrap();
        assert_eq!(store.schema_syncs(), 1);

        store.set_schema_sync_failure(true);
        assert!(matches!(m.connect("a").await, Err(EngineError::SchemaSync { .. })));
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let (m, _) = manager(table());
        match m.connect("b1").await {
            Err(EngineError::Connection { backend, .. }) => assert_eq!(backend, "b1"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(matches!(m.connect("ghost").await, Err(EngineError::UnknownBackend(_))));
    }

    #[tokio::test]
    async fn test_install_master_demotes_others() {
        let (m, connector) = manager(table());
        let store = connector.register("b2", Arc::new(InMemoryStore::new()));

        let demoted = m.install_master("b2", store).unwrap();
        assert_eq!(demoted, vec!["primary"]);
        assert_eq!(m.role_of("b2"), Some(Role::Master));
        assert_eq!(m.role_of("primary"), Some(Role::Backup));
        assert_eq!(m.master_name().as_deref(), Some("b2"));
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.enabled_backups(), vec!["primary", "b1"]);

        let masters = m.roles().into_iter().filter(|r| r.role == Role::Master).count();
        assert_eq!(masters, 1);
    }

    #[test]
    fn test_held_back_backups_are_not_replication_targets() {
        let (m, _) = manager(table());
        m.hold_back("b1");
        assert!(m.is_held_back("b1"));
        assert_eq!(m.replication_targets(), vec!["b2"]);
        // Still a promotion candidate
        assert_eq!(m.enabled_backups(), vec!["b1", "b2"]);

        assert!(m.release("b1"));
        assert!(!m.release("b1"));
        assert_eq!(m.replication_targets(), vec!["b1", "b2"]);
        assert!(m.held_back().is_empty());
    }

    #[tokio::test]
    async fn test_is_connection_established_follows_master() {
        let (m, connector) = manager(table());
        assert!(!m.is_connection_established().await);

        let store = connector.register("primary", Arc::new(InMemoryStore::new()));
        m.install_master("primary", store.clone()).unwrap();
        assert!(m.is_connection_established().await);

        store.set_reachable(false);
        assert!(!m.is_connection_established().await);
    }

    #[tokio::test]
    async fn test_handle_for_reopens_after_failed_probe() {
        let (m, connector) = manager(table());
        let store = connector.register("b1", Arc::new(InMemoryStore::new()));

        m.handle_for("b1").await.unwrap();
        m.handle_for("b1").await.unwrap();
        assert_eq!(connector.attempts(), vec!["b1"]);

        store.set_reachable(false);
        assert!(m.handle_for("b1").await.is_err());
        store.set_reachable(true);
        m.handle_for("b1").await.unwrap();
        assert_eq!(connector.attempts(), vec!["b1", "b1", "b1"]);
    }
}
