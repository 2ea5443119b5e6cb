// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operational errors of the connection manager, failover and replication.
//!
//! None of these reach end clients; data-access callers see
//! [`crate::AccessError`] instead.

use thiserror::Error;

use crate::config::BackendFamily;
use crate::entity::EntityFamily;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// More than one enabled backend claims the master role.
    #[error("Multiple enabled master backends configured: {}", backends.join(", "))]
    MultipleMasters { backends: Vec<String> },

    #[error("No enabled master backend configured")]
    NoMasterConfigured,

    #[error("Failed to connect to backend '{backend}': {cause}")]
    Connection {
        backend: String,
        #[source]
        cause: StorageError,
    },

    #[error("Schema sync failed on backend '{backend}': {cause}")]
    SchemaSync {
        backend: String,
        #[source]
        cause: StorageError,
    },

    #[error("Replication of {family} into {backend_family} backend '{backend}' failed: {cause}")]
    Replication {
        backend: String,
        backend_family: BackendFamily,
        family: EntityFamily,
        #[source]
        cause: StorageError,
    },

    /// No backup could be brought up. The process cannot serve.
    #[error("All backup backends exhausted (attempted: {})", attempted.join(", "))]
    ExhaustedBackups { attempted: Vec<String> },

    #[error("No master backend is connected")]
    NotConnected,

    #[error("Unknown backend '{0}'")]
    UnknownBackend(String),
}

impl EngineError {
    /// Errors the embedding process must treat as terminal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ExhaustedBackups { .. } | Self::SchemaSync { .. })
    }

    /// Backend the error is about, if any.
    #[must_use]
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::Connection { backend, .. }
            | Self::SchemaSync { backend, .. }
            | Self::Replication { backend, .. } => Some(backend),
            Self::UnknownBackend(name) => Some(name),
            _ => None,
        }
    }
}
