// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{BackendConfig, BackendFamily};
use crate::entity::{Entity, EntityError, EntityFamily, FieldPatch};

#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend could not be reached (refused, dropped, timed out).
    #[error("Backend unreachable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Duplicate uuid '{uuid}' in {family}")]
    Duplicate { family: EntityFamily, uuid: String },
    #[error("Invalid record: {0}")]
    Invalid(#[from] EntityError),
}

impl StorageError {
    /// True when the error means "the backend is gone", as opposed to a
    /// rejected statement or a bad record.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Worth retrying in place.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Backend(_))
    }
}

/// One open backend, any family.
///
/// Every operation is keyed by `uuid`; surrogate keys never leave the store.
#[async_trait]
pub trait EntityStore: Send + Sync {
    fn family(&self) -> BackendFamily;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Create or repair tables / indexes for every entity family.
    async fn sync_schema(&self) -> Result<(), StorageError>;

    /// Full entity set of a family. Order is store-specific but stable.
    async fn list(&self, family: EntityFamily) -> Result<Vec<Entity>, StorageError>;

    async fn get(&self, family: EntityFamily, uuid: &str) -> Result<Option<Entity>, StorageError> {
        Ok(self.list(family).await?.into_iter().find(|e| e.uuid() == uuid))
    }

    /// Insert a new record. Fails with [`StorageError::Duplicate`] when the uuid exists.
    async fn insert(&self, entity: &Entity) -> Result<(), StorageError>;

    /// Partial update keyed by uuid. Returns false when no record matched.
    async fn update(&self, family: EntityFamily, uuid: &str, patch: &FieldPatch) -> Result<bool, StorageError>;

    /// Returns false when no record matched.
    async fn delete(&self, family: EntityFamily, uuid: &str) -> Result<bool, StorageError>;

    async fn count(&self, family: EntityFamily) -> Result<u64, StorageError> {
        Ok(self.list(family).await?.len() as u64)
    }
}

/// Opens a store for a configured backend.
///
/// Production code uses [`crate::adapter::AdapterConnector`]; tests plug in
/// [`super::memory::MemoryConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn EntityStore>, StorageError>;
}
