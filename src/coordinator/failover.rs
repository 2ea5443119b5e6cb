// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failover: master selection at startup, promotion of backups, and the
//! reconcile runs that bring a returning backend back in line.
//!
//! # State machine
//!
//! ```text
//! Disconnected → Connecting → Connected(master) ─probe failure→ Disconnected → Connecting → ...
//! ```
//!
//! # Catch-up
//!
//! The pointer names the backend that served last. When a promotion picks a
//! different backup, that backup is missing whatever the pointer backend
//! took since the last pass, so the promoted backup pulls from it first.
//! A pointer backend that does not answer is held back: replication passes
//! leave it alone until [`FailoverController::catch_up_pending`] has merged
//! its records into the master.
//!
//! # Pointer writes
//!
//! - on the first successful connect when no pointer exists yet
//! - once per promotion, after any pull from the pointer backend came back
//!   clean (otherwise the pointer keeps naming it)
//! - once per clean catch-up
//! - once per clean restore
//!
//! A failed pull, catch-up or restore leaves it untouched so the next run
//! retries.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::connection::ConnectionManager;
use super::types::{BackendHandle, ConnectionState, ReconcileDirection};
use crate::config::Role;
use crate::error::EngineError;
use crate::pointer::{PointerStore, ReplicationPointer};
use crate::replication::{ReplicationEngine, ReplicationReport};
use crate::storage::traits::EntityStore;

pub struct FailoverController {
    manager: Arc<ConnectionManager>,
    pointer: Arc<dyn PointerStore>,
    replication: Arc<ReplicationEngine>,
    /// Serializes initialize / promote / reconcile
    failover_lock: Mutex<()>,
}

impl FailoverController {
    pub fn new(
        manager: Arc<ConnectionManager>,
        pointer: Arc<dyn PointerStore>,
        replication: Arc<ReplicationEngine>,
    ) -> Self {
        Self {
            manager,
            pointer,
            replication,
            failover_lock: Mutex::new(()),
        }
    }

    /// Backends the master still has to pull from.
    #[must_use]
    pub fn pending_catch_ups(&self) -> Vec<String> {
        self.manager.held_back()
    }

    async fn load_pointer(&self) -> Option<String> {
        let store = Arc::clone(&self.pointer);
        match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(Ok(pointer)) => pointer.map(|p| p.last_database_loaded),
            Ok(Err(e)) => {
                warn!(error = %e, "Replication pointer unreadable, treating as absent");
                None
            }
            Err(e) => {
                error!(error = %e, "Replication pointer read task failed");
                None
            }
        }
    }

    async fn persist_pointer(&self, backend: &str) {
        let store = Arc::clone(&self.pointer);
        let pointer = ReplicationPointer::new(backend);
        match tokio::task::spawn_blocking(move || store.store(&pointer)).await {
            Ok(Ok(())) => info!(backend = %backend, "Replication pointer updated"),
            Ok(Err(e)) => error!(backend = %backend, error = %e, "Failed to persist replication pointer"),
            Err(e) => error!(backend = %backend, error = %e, "Replication pointer write task failed"),
        }
    }

    /// Connect to the configured master, falling back to the backups.
    ///
    /// Errors are fatal: either every backup failed too, or the master's
    /// schema sync failed and nothing else could be brought up.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<String, EngineError> {
        let _guard = self.failover_lock.lock().await;
        self.manager.set_state(ConnectionState::Connecting);

        let mut schema_failure = None;
        match self.manager.select_master() {
            Ok(name) => match self.manager.connect(&name).await {
                Ok(store) => {
                    self.manager.install_master(&name, store)?;
                    info!(backend = %name, "Connected to master backend");
                    if self.load_pointer().await.is_none() {
                        self.persist_pointer(&name).await;
                    }
                    return Ok(name);
                }
                Err(e @ EngineError::SchemaSync { .. }) => {
                    error!(error = %e, "Master schema sync failed, falling back to backups");
                    schema_failure = Some(e);
                }
                Err(e) => error!(error = %e, "Master backend unreachable, falling back to backups"),
            },
            Err(e) => error!(error = %e, "Master selection failed, falling back to backups"),
        }

        match self.promote_locked().await {
            Ok(name) => Ok(name),
            Err(e) => Err(schema_failure.unwrap_or(e)),
        }
    }

    /// Promote the first reachable enabled backup.
    pub async fn promote_backup(&self) -> Result<String, EngineError> {
        let _guard = self.failover_lock.lock().await;
        self.promote_locked().await
    }

    async fn promote_locked(&self) -> Result<String, EngineError> {
        self.manager.set_state(ConnectionState::Connecting);
        let previous = self.load_pointer().await;
        let candidates = self.manager.enabled_backups();
        warn!(candidates = ?candidates, "Attempting to promote a backup backend");

        for name in &candidates {
            let store = match self.manager.connect(name).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(backend = %name, error = %e, "Backup backend unavailable");
                    continue;
                }
            };

            let owed = previous.clone().filter(|p| self.owes_catch_up(p, name));
            // Pulled before install so no request writes to the backup first
            let pulled = match &owed {
                Some(source) if !self.manager.is_held_back(source) => {
                    self.pull_before_install(source, name, &store).await
                }
                Some(_) => false,
                None => true,
            };

            let demoted = self.manager.install_master(name, store)?;
            self.manager.release(name);
            crate::metrics::record_failover(name);
            info!(backend = %name, demoted = ?demoted, "Promoted backup backend to master");

            match owed {
                Some(source) if !pulled => {
                    warn!(
                        backend = %source,
                        master = %name,
                        "Last master not reachable, holding it back until its writes are pulled"
                    );
                    self.manager.hold_back(&source);
                }
                _ => self.persist_pointer(name).await,
            }
            return Ok(name.clone());
        }

        self.manager.clear_master();
        crate::metrics::record_exhausted();
        error!(attempted = ?candidates, "Failed to connect to any backup backend");
        Err(EngineError::ExhaustedBackups { attempted: candidates })
    }

    /// The pointer backend served after `promoted` last received a pass.
    /// A pointer that still holds the master role is the backend being
    /// replaced, not one to pull from.
    fn owes_catch_up(&self, pointer: &str, promoted: &str) -> bool {
        pointer != promoted && self.manager.role_of(pointer) == Some(Role::Backup) && self.manager.is_enabled(pointer)
    }

    /// Mirror `source` into the backup about to be promoted.
    async fn pull_before_install(&self, source: &str, name: &str, store: &Arc<dyn EntityStore>) -> bool {
        let Some(config) = self.manager.backend_config(name) else {
            return false;
        };
        let source = match self.manager.handle_for(source).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(backend = %source, error = %e, "Last master unreachable, cannot pull before promotion");
                return false;
            }
        };
        warn!(
            source = %source.name,
            backend = %name,
            "Backup is out of sync after the last disruption, pulling from the last master"
        );
        let target = BackendHandle {
            name: name.to_string(),
            config,
            store: Arc::clone(store),
        };
        let report = self.replication.replicate(&source, &[target]).await;
        if report.is_clean() {
            info!(source = %source.name, backend = %name, ops = report.total_ops(), "Backup brought up to date");
        }
        report.is_clean()
    }

    /// Probe the master; promote a backup when it does not answer.
    pub async fn ensure_master(&self) -> Result<String, EngineError> {
        if let Some(name) = self.live_master().await {
            return Ok(name);
        }

        let _guard = self.failover_lock.lock().await;
        // Another caller may have promoted while we waited
        if let Some(name) = self.live_master().await {
            return Ok(name);
        }

        match self.manager.master_name() {
            Some(name) => warn!(backend = %name, "Connection to master backend lost"),
            None => warn!("No master backend connected"),
        }
        self.manager.set_state(ConnectionState::Disconnected);
        self.promote_locked().await
    }

    async fn live_master(&self) -> Option<String> {
        let master = self.manager.master()?;
        if self.manager.is_alive(&master.name, master.store.as_ref()).await {
            Some(master.name)
        } else {
            None
        }
    }

    /// Run a reconcile in the given direction.
    ///
    /// A catch-up source is opened before the failover lock is taken, so a
    /// source that does not answer never delays a promotion.
    #[tracing::instrument(skip(self), fields(direction = %direction))]
    pub async fn reconcile(&self, direction: ReconcileDirection) -> Result<ReplicationReport, EngineError> {
        match direction {
            ReconcileDirection::CatchUp { source } => {
                if self.manager.master().is_none() {
                    return Err(EngineError::NotConnected);
                }
                let source = self.manager.handle_for(&source).await?;
                let _guard = self.failover_lock.lock().await;
                self.catch_up_locked(source).await
            }
            ReconcileDirection::Restore { source } => {
                let _guard = self.failover_lock.lock().await;
                self.restore_locked(&source).await
            }
        }
    }

    async fn catch_up_locked(&self, source: BackendHandle) -> Result<ReplicationReport, EngineError> {
        let master = self.manager.master().ok_or(EngineError::NotConnected)?;
        if master.name == source.name {
            self.manager.release(&source.name);
            return Ok(ReplicationReport::default());
        }

        let outcome = self.replication.merge(&source, &master).await;
        let clean = outcome.is_clean();
        let report = ReplicationReport {
            master: Some(source.name.clone()),
            backups: vec![outcome],
        };
        if clean {
            self.manager.release(&source.name);
            self.persist_pointer(&master.name).await;
            info!(
                source = %source.name,
                master = %master.name,
                ops = report.total_ops(),
                "Writes of the last master pulled, backend released to replication"
            );
        } else {
            warn!(source = %source.name, master = %master.name, "Catch-up incomplete, backend stays held back");
        }
        Ok(report)
    }

    async fn restore_locked(&self, source: &str) -> Result<ReplicationReport, EngineError> {
        let configured = self.manager.master().ok_or(EngineError::NotConnected)?;
        if configured.name == source {
            return Ok(ReplicationReport::default());
        }
        let source_store = self.manager.connect(source).await?;

        // Source serves as master while the configured master is refilled
        self.manager.install_master(source, source_store)?;
        let Some(source_handle) = self.manager.master() else {
            return Err(EngineError::NotConnected);
        };
        let report = self.replication.replicate(&source_handle, &[configured.clone()]).await;

        self.manager.install_master(&configured.name, configured.store.clone())?;
        if report.is_clean() {
            self.persist_pointer(&configured.name).await;
            info!(
                source = %source,
                master = %configured.name,
                ops = report.total_ops(),
                "Configured master restored"
            );
        } else {
            warn!(
                source = %source,
                master = %configured.name,
                "Restore incomplete, pointer left unchanged for next startup"
            );
        }
        Ok(report)
    }

    /// Detect a session that ended mid-failover and restore from the
    /// backend that served during it. Runs once, before serving.
    pub async fn reconcile_on_restart(&self) -> Result<Option<ReplicationReport>, EngineError> {
        let _guard = self.failover_lock.lock().await;

        let Some(current) = self.manager.master_name() else {
            return Ok(None);
        };
        let Some(pointer) = self.load_pointer().await else {
            return Ok(None);
        };
        if pointer == current || self.manager.role_of(&pointer) != Some(Role::Backup) {
            return Ok(None);
        }
        if !self.manager.is_enabled(&pointer) {
            warn!(backend = %pointer, "Pointer names a disabled backend, skipping restore");
            return Ok(None);
        }
        if self.manager.is_held_back(&pointer) {
            // Left to the catch-up
            return Ok(None);
        }

        warn!(
            master = %current,
            pointer = %pointer,
            "Master may be out of sync after the last disruption, restoring"
        );
        self.restore_locked(&pointer).await.map(Some)
    }

    /// Try every pending catch-up. Unreachable backends stay held back.
    pub async fn catch_up_pending(&self) -> usize {
        let mut caught_up = 0;
        for source in self.pending_catch_ups() {
            match self.reconcile(ReconcileDirection::CatchUp { source: source.clone() }).await {
                Ok(report) if report.is_clean() => caught_up += 1,
                Ok(_) => warn!(backend = %source, "Catch-up incomplete, will retry"),
                Err(e) => warn!(backend = %source, error = %e, "Catch-up deferred"),
            }
        }
        caught_up
    }
}
