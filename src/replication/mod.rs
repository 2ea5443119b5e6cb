// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication from the master into backups.
//!
//! A pass diffs full entity sets (see [`diff`]) and applies the difference
//! to each backup, phase by phase:
//!
//! ```text
//! Users → Badges → InterestGroups → Interests → Edges
//! ```
//!
//! The first four phases insert, update scalar fields and delete (through
//! the cascade rules). The edge phase then patches the uuid lists of every
//! family, once all referenced records exist on the backup.
//!
//! Failures are isolated: a failed family is recorded and the pass moves on
//! to the next family; a failed backup never affects another. Whatever was
//! missed is picked up by the next pass.
//!
//! [`ReplicationEngine::merge`] runs the other way: the master pulls the
//! records it lacks from a backend that served before it, without touching
//! anything it already holds.

pub mod diff;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::{BackendHandle, ConnectionManager};
use crate::entity::{Entity, EntityFamily};
use crate::error::EngineError;
use crate::storage::cascade;
use crate::storage::traits::StorageError;
use diff::{plan, FieldScope, ReplicationOp};

/// Replication phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPhase {
    Users,
    Badges,
    InterestGroups,
    Interests,
    Edges,
}

impl ReplicationPhase {
    pub const ORDER: [ReplicationPhase; 5] = [
        ReplicationPhase::Users,
        ReplicationPhase::Badges,
        ReplicationPhase::InterestGroups,
        ReplicationPhase::Interests,
        ReplicationPhase::Edges,
    ];

    /// `(family, scope)` steps run by this phase.
    #[must_use]
    pub fn steps(&self) -> Vec<(EntityFamily, FieldScope)> {
        match self {
            Self::Users => vec![(EntityFamily::User, FieldScope::Scalars)],
            Self::Badges => vec![(EntityFamily::Badge, FieldScope::Scalars)],
            Self::InterestGroups => vec![(EntityFamily::InterestGroup, FieldScope::Scalars)],
            Self::Interests => vec![(EntityFamily::Interest, FieldScope::Scalars)],
            Self::Edges => EntityFamily::ALL
                .iter()
                .filter(|f| !f.edge_fields().is_empty())
                .map(|f| (*f, FieldScope::Edges))
                .collect(),
        }
    }
}

/// Operations applied to one backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl OpCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    fn add(&mut self, other: OpCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}

/// Result of one backup within a pass.
#[derive(Debug)]
pub struct BackupOutcome {
    pub backend: String,
    pub counts: OpCounts,
    /// Schema sync, connect or per-family failures
    pub errors: Vec<EngineError>,
    /// Another pass was already replicating into this backup
    pub skipped: bool,
}

impl BackupOutcome {
    fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            counts: OpCounts::default(),
            errors: Vec::new(),
            skipped: false,
        }
    }

    fn failed(backend: &str, error: EngineError) -> Self {
        let mut outcome = Self::new(backend);
        outcome.errors.push(error);
        outcome
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.skipped && self.errors.is_empty()
    }
}

/// Result of a pass.
#[derive(Debug, Default)]
pub struct ReplicationReport {
    pub master: Option<String>,
    pub backups: Vec<BackupOutcome>,
}

impl ReplicationReport {
    /// Every backup was replicated without error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.backups.iter().all(BackupOutcome::is_clean)
    }

    #[must_use]
    pub fn total_ops(&self) -> usize {
        self.backups.iter().map(|b| b.counts.total()).sum()
    }

    #[must_use]
    pub fn outcome(&self, backend: &str) -> Option<&BackupOutcome> {
        self.backups.iter().find(|b| b.backend == backend)
    }

    pub fn errors(&self) -> impl Iterator<Item = &EngineError> {
        self.backups.iter().flat_map(|b| b.errors.iter())
    }
}

/// Master entity sets, fetched once per pass.
type Snapshot = HashMap<EntityFamily, Result<Vec<Entity>, String>>;

#[derive(Default)]
pub struct ReplicationEngine {
    /// Per-backup skip-if-running locks
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    passes: AtomicU64,
}

impl ReplicationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes started so far.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    fn lock_for(&self, backend: &str) -> Arc<Mutex<()>> {
        self.in_flight
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start a detached pass from the current master into every enabled backup.
    pub fn spawn_pass(self: &Arc<Self>, manager: Arc<ConnectionManager>) -> JoinHandle<ReplicationReport> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_pass(&manager).await })
    }

    /// Replicate from the current master into every enabled backup.
    #[tracing::instrument(skip(self, manager))]
    pub async fn run_pass(&self, manager: &ConnectionManager) -> ReplicationReport {
        let Some(master) = manager.master() else {
            warn!("No master connected, skipping replication pass");
            return ReplicationReport::default();
        };
        let backups = manager.replication_targets();
        if backups.is_empty() {
            debug!("No enabled backups to replicate into");
            return ReplicationReport {
                master: Some(master.name),
                backups: Vec::new(),
            };
        }

        let mut handles = Vec::with_capacity(backups.len());
        let mut unreachable = Vec::new();
        for name in backups {
            match manager.handle_for(&name).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(backend = %name, error = %e, "Backup unreachable, skipping this pass");
                    crate::metrics::record_backup_pass(&name, "unreachable");
                    unreachable.push(BackupOutcome::failed(&name, e));
                }
            }
        }

        let mut report = self.replicate(&master, &handles).await;
        report.backups.extend(unreachable);
        report
    }

    /// Replicate `master` into each of `backups`.
    pub async fn replicate(&self, master: &BackendHandle, backups: &[BackendHandle]) -> ReplicationReport {
        let started = Instant::now();
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = ReplicationReport {
            master: Some(master.name.clone()),
            backups: Vec::with_capacity(backups.len()),
        };
        let mut snapshot: Snapshot = HashMap::new();

        for backup in backups.iter().filter(|b| b.name != master.name) {
            let lock = self.lock_for(&backup.name);
            let Ok(_guard) = lock.try_lock() else {
                debug!(backend = %backup.name, "Replication already running for backup, skipping");
                crate::metrics::record_backup_pass(&backup.name, "skipped");
                let mut outcome = BackupOutcome::new(&backup.name);
                outcome.skipped = true;
                report.backups.push(outcome);
                continue;
            };

            let outcome = self.replicate_into(master, backup, &mut snapshot).await;
            crate::metrics::record_backup_pass(
                &backup.name,
                if outcome.errors.is_empty() { "success" } else { "error" },
            );
            report.backups.push(outcome);
        }

        crate::metrics::record_pass_duration(started.elapsed());
        info!(
            pass,
            master = %master.name,
            backups = report.backups.len(),
            ops = report.total_ops(),
            clean = report.is_clean(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Replication pass finished"
        );
        report
    }

    /// Insert into `target` every record of `source` that `target` lacks.
    /// Records `target` already holds are left as they are and nothing is
    /// deleted, so writes `target` took since the two diverged survive.
    #[tracing::instrument(skip(self, source, target), fields(source = %source.name, target = %target.name))]
    pub async fn merge(&self, source: &BackendHandle, target: &BackendHandle) -> BackupOutcome {
        let started = Instant::now();
        let mut outcome = BackupOutcome::new(&target.name);

        let families = ReplicationPhase::ORDER
            .iter()
            .flat_map(|p| p.steps())
            .filter(|(_, scope)| *scope == FieldScope::Scalars)
            .map(|(family, _)| family);
        for family in families {
            match self.merge_family(source, target, family).await {
                Ok(inserted) => {
                    crate::metrics::record_replication_ops(&target.name, &family.to_string(), "insert", inserted);
                    outcome.counts.inserted += inserted;
                }
                Err(cause) => self.record_failure(&mut outcome, target, family, cause),
            }
        }

        crate::metrics::record_pass_duration(started.elapsed());
        info!(
            inserted = outcome.counts.inserted,
            clean = outcome.is_clean(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Merge finished"
        );
        outcome
    }

    async fn merge_family(
        &self,
        source: &BackendHandle,
        target: &BackendHandle,
        family: EntityFamily,
    ) -> Result<usize, StorageError> {
        let present: HashSet<String> = target
            .store
            .list(family)
            .await?
            .iter()
            .map(|e| e.uuid().to_string())
            .collect();
        let mut inserted = 0;
        for entity in source.store.list(family).await? {
            if present.contains(entity.uuid()) {
                continue;
            }
            target.store.insert(&entity).await?;
            if let Entity::Interest(interest) = &entity {
                cascade::link_interest(target.store.as_ref(), &interest.uuid, &interest.group).await?;
            }
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn replicate_into(
        &self,
        master: &BackendHandle,
        backup: &BackendHandle,
        snapshot: &mut Snapshot,
    ) -> BackupOutcome {
        let mut outcome = BackupOutcome::new(&backup.name);

        if backup.config.auto_schema_sync {
            if let Err(cause) = backup.store.sync_schema().await {
                error!(backend = %backup.name, error = %cause, "Schema sync failed, skipping backup");
                crate::metrics::record_schema_sync(&backup.name, false);
                outcome.errors.push(EngineError::SchemaSync {
                    backend: backup.name.clone(),
                    cause,
                });
                return outcome;
            }
            crate::metrics::record_schema_sync(&backup.name, true);
        }

        for phase in ReplicationPhase::ORDER {
            for (family, scope) in phase.steps() {
                if !snapshot.contains_key(&family) {
                    let fetched = master.store.list(family).await.map_err(|e| e.to_string());
                    snapshot.insert(family, fetched);
                }
                let master_set = match snapshot.get(&family) {
                    Some(Ok(set)) => set,
                    Some(Err(cause)) => {
                        self.record_failure(
                            &mut outcome,
                            backup,
                            family,
                            StorageError::Backend(format!("reading master '{}': {}", master.name, cause)),
                        );
                        continue;
                    }
                    None => continue,
                };

                match self.sync_family(backup, family, master_set, scope).await {
                    Ok(counts) => {
                        crate::metrics::record_replication_ops(&backup.name, &family.to_string(), "insert", counts.inserted);
                        crate::metrics::record_replication_ops(&backup.name, &family.to_string(), "update", counts.updated);
                        crate::metrics::record_replication_ops(&backup.name, &family.to_string(), "delete", counts.deleted);
                        outcome.counts.add(counts);
                    }
                    Err(cause) => self.record_failure(&mut outcome, backup, family, cause),
                }
            }
        }

        if outcome.counts.total() > 0 {
            info!(
                backend = %backup.name,
                inserted = outcome.counts.inserted,
                updated = outcome.counts.updated,
                deleted = outcome.counts.deleted,
                "Backup replicated"
            );
        }
        outcome
    }

    fn record_failure(&self, outcome: &mut BackupOutcome, backup: &BackendHandle, family: EntityFamily, cause: StorageError) {
        error!(backend = %backup.name, family = %family, error = %cause, "Replication failed for family");
        crate::metrics::record_replication_error(&backup.name, &family.to_string());
        outcome.errors.push(EngineError::Replication {
            backend: backup.name.clone(),
            backend_family: backup.store.family(),
            family,
            cause,
        });
    }

    async fn sync_family(
        &self,
        backup: &BackendHandle,
        family: EntityFamily,
        master_set: &[Entity],
        scope: FieldScope,
    ) -> Result<OpCounts, StorageError> {
        let backup_set = backup.store.list(family).await?;
        let plan = plan(family, master_set, &backup_set, scope);
        let mut counts = OpCounts::default();

        for op in plan.ops {
            match op {
                ReplicationOp::Insert(entity) => {
                    backup.store.insert(&entity).await?;
                    counts.inserted += 1;
                }
                ReplicationOp::Update { uuid, patch } => {
                    if backup.store.update(family, &uuid, &patch).await? {
                        counts.updated += 1;
                    }
                }
                ReplicationOp::Delete { uuid } => {
                    // An earlier cascade in this pass may already have removed it
                    if cascade::remove(backup.store.as_ref(), family, &uuid).await? {
                        counts.deleted += 1;
                    }
                }
            }
        }
        Ok(counts)
    }
}
