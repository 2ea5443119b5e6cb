// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failover store coordinator.
//!
//! The [`StoreEngine`] ties the components together:
//! - [`ConnectionManager`]: role table, master handle, liveness probes
//! - [`FailoverController`]: promotion, restart restore, catch-up
//! - [`ReplicationEngine`]: master → backup diffing
//! - [`DataAccess`]: CRUD contract on the current master
//!
//! # Lifecycle
//!
//! ```text
//! new → start (initialize → reconcile_on_restart → catch_up_pending) → health monitor → shutdown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use failover_store::{EngineConfig, StoreEngine};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = EngineConfig::load_from("config.json").expect("config");
//! let engine = Arc::new(StoreEngine::from_config(config));
//!
//! let master = engine.start().await.expect("no backend could be reached");
//! println!("serving from {}", master);
//!
//! let monitor = engine.spawn_health_monitor();
//! // ... serve requests through engine.access() ...
//! engine.shutdown();
//! let _ = monitor.await;
//! # }
//! ```

mod types;
mod connection;
mod failover;
mod api;
mod lifecycle;

pub use types::{BackendHandle, ConnectionState, ReconcileDirection, RoleEntry};
pub use connection::ConnectionManager;
pub use failover::FailoverController;
pub use api::{is_mutating_method, AccessError, DataAccess};

use std::sync::Arc;

use tokio::sync::watch;

use crate::adapter::AdapterConnector;
use crate::config::EngineConfig;
use crate::pointer::{FilePointerStore, PointerStore};
use crate::replication::ReplicationEngine;
use crate::storage::traits::Connector;

/// Main coordinator.
///
/// `Send + Sync`; share it behind an `Arc`.
pub struct StoreEngine {
    pub(super) config: EngineConfig,
    pub(super) manager: Arc<ConnectionManager>,
    pub(super) failover: Arc<FailoverController>,
    pub(super) replication: Arc<ReplicationEngine>,
    pub(super) access: DataAccess,
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) shutdown_rx: watch::Receiver<bool>,
}

impl StoreEngine {
    /// Build an engine with explicit connector and pointer store.
    ///
    /// Nothing is opened until [`start()`](Self::start).
    pub fn new(config: EngineConfig, connector: Arc<dyn Connector>, pointer: Arc<dyn PointerStore>) -> Self {
        let manager = Arc::new(ConnectionManager::new(
            config.databases.clone(),
            connector,
            config.connect_timeout(),
        ));
        let replication = Arc::new(ReplicationEngine::new());
        let failover = Arc::new(FailoverController::new(manager.clone(), pointer, replication.clone()));
        let access = DataAccess::new(manager.clone(), failover.clone(), replication.clone(), config.replication);
        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            config,
            manager,
            failover,
            replication,
            access,
            shutdown,
            shutdown_rx,
        }
    }

    /// Engine backed by the real adapters and the pointer file named in the config.
    pub fn from_config(config: EngineConfig) -> Self {
        let pointer = Arc::new(FilePointerStore::new(config.pointer_path.clone()));
        Self::new(config, Arc::new(AdapterConnector), pointer)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn access(&self) -> &DataAccess {
        &self.access
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    #[must_use]
    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    #[must_use]
    pub fn replication(&self) -> &Arc<ReplicationEngine> {
        &self.replication
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Role table for external collaborators.
    #[must_use]
    pub fn roles(&self) -> Vec<RoleEntry> {
        self.manager.roles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, BackendKind, BackendTable, Role};
    use crate::entity::{EntityFamily, User};
    use crate::pointer::MemoryPointerStore;
    use crate::storage::memory::{InMemoryStore, MemoryConnector};

    fn engine(pointer: Arc<MemoryPointerStore>) -> (Arc<StoreEngine>, Arc<MemoryConnector>) {
        let mut config = EngineConfig::default();
        config.liveness_interval_ms = 20;
        config.connect_timeout_ms = 200;
        config.databases = BackendTable::new()
            .with("primary", BackendConfig::new(BackendKind::Mysql, Role::Master).with_url("mysql://x"))
            .with("secondary", BackendConfig::new(BackendKind::Sqlite, Role::Backup));
        let connector = Arc::new(MemoryConnector::new());
        (Arc::new(StoreEngine::new(config, connector.clone(), pointer)), connector)
    }

    #[tokio::test]
    async fn test_start_connects_configured_master() {
        let pointer = Arc::new(MemoryPointerStore::new());
        let (engine, connector) = engine(pointer.clone());
        connector.register("primary", Arc::new(InMemoryStore::new()));
        connector.register("secondary", Arc::new(InMemoryStore::new()));

        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert_eq!(engine.start().await.unwrap(), "primary");
        assert_eq!(engine.state(), ConnectionState::Connected);
        assert_eq!(pointer.current().as_deref(), Some("primary"));
        assert!(engine.access().is_connection_established().await);
    }

    #[tokio::test]
    async fn test_health_monitor_fails_over_and_stops() {
        let (engine, connector) = engine(Arc::new(MemoryPointerStore::new()));
        let primary = connector.register("primary", Arc::new(InMemoryStore::new()));
        let secondary = connector.register("secondary", Arc::new(InMemoryStore::new()));
        engine.start().await.unwrap();
        secondary.seed(User::new("u1", "ada", "a@b", "p"));

        let monitor = engine.spawn_health_monitor();
        primary.set_reachable(false);

        let mut state = engine.manager().state_receiver();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while engine.manager().master_name().as_deref() != Some("secondary") {
                let _ = state.changed().await;
            }
        })
        .await
        .unwrap();

        let users = engine.access().list_entities(EntityFamily::User).await.unwrap();
        assert_eq!(users.len(), 1);

        engine.shutdown();
        monitor.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_health_monitor_reports_exhaustion() {
        let (engine, connector) = engine(Arc::new(MemoryPointerStore::new()));
        let primary = connector.register("primary", Arc::new(InMemoryStore::new()));
        engine.start().await.unwrap();

        primary.set_reachable(false);
        let result = engine.spawn_health_monitor().await.unwrap();
        assert!(matches!(result, Err(crate::EngineError::ExhaustedBackups { .. })));
    }
}
