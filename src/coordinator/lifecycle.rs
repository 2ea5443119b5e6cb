// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: startup sequence, health monitor, shutdown.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::StoreEngine;
use crate::error::EngineError;

impl StoreEngine {
    /// Connect and reconcile before serving.
    ///
    /// Startup flow:
    /// 1. Connect to the configured master, falling back to the backups
    /// 2. Restore the configured master if the last session ended mid-failover
    /// 3. Pull from the last master if a promotion in step 1 could not
    ///
    /// Only step 1 can fail; a failed restore is logged and retried on the
    /// next start.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<String, EngineError> {
        let started = Instant::now();
        info!(backends = self.manager.roles().len(), "Starting failover store engine");

        let master = self.failover.initialize().await?;

        match self.failover.reconcile_on_restart().await {
            Ok(Some(report)) if !report.is_clean() => {
                warn!(errors = report.errors().count(), "Restart restore incomplete");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Restart restore failed, will retry on next start"),
        }

        let caught_up = self.failover.catch_up_pending().await;
        let master = self.manager.master_name().unwrap_or(master);
        info!(
            master = %master,
            caught_up,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Failover store engine ready"
        );
        Ok(master)
    }

    /// Background loop probing the master every liveness interval.
    ///
    /// Resolves to `Err` only on a fatal error (no backend could take the
    /// master role); resolves to `Ok` after [`shutdown()`](Self::shutdown).
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<Result<(), EngineError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_health_monitor().await })
    }

    #[tracing::instrument(skip(self))]
    async fn run_health_monitor(&self) -> Result<(), EngineError> {
        let mut shutdown = self.shutdown_rx.clone();
        let mut interval = tokio::time::interval(self.config.liveness_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.config.liveness_interval_ms, "Health monitor running");

        loop {
            if *shutdown.borrow_and_update() {
                info!("Health monitor stopped");
                return Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }

                _ = interval.tick() => {
                    match self.failover.ensure_master().await {
                        Ok(_) => {
                            self.failover.catch_up_pending().await;
                        }
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "No backend can take the master role");
                            return Err(e);
                        }
                        Err(e) => warn!(error = %e, "Health check failed"),
                    }
                }
            }
        }
    }

    /// Stop the health monitor. In-flight replication passes run to completion.
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self) {
        info!("Initiating failover store engine shutdown");
        let _ = self.shutdown.send(true);
    }
}
