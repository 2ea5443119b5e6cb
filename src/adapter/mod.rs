// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend adapters.
//!
//! An adapter is the only code that knows vendor record shapes: the
//! relational family stores rows with a numeric surrogate `id`, the document
//! family stores JSON documents with an opaque `_id`. Both expose the same
//! [`Entity`] values keyed by `uuid`.
//!
//! [`adapter_for`] picks the adapter from [`BackendKind`]; the adapter then
//! builds connection options and opens the matching store.

pub mod relational;
pub mod document;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::{BackendConfig, BackendFamily, BackendKind, ConfigError};
use crate::entity::{Entity, EntityFamily};
use crate::storage::traits::{Connector, EntityStore, StorageError};

pub use document::DocumentAdapter;
pub use relational::{Dialect, RelationalAdapter, RelationalRecord, SqlValue};

/// SQLite file used when a sqlite backend names no database.
pub const DEFAULT_SQLITE_FILE: &str = "database-store.db";

/// Vendor record form produced by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeRecord {
    Row(RelationalRecord),
    Document(Map<String, Value>),
}

/// Where a backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    Url(String),
    File(PathBuf),
}

impl ConnectionTarget {
    /// Driver connection string.
    #[must_use]
    pub fn connection_string(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::File(path) => format!("sqlite://{}?mode=rwc", path.display()),
        }
    }
}

/// Everything a store needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub family: BackendFamily,
    pub target: ConnectionTarget,
    pub dialect: Option<Dialect>,
    pub auto_schema_sync: bool,
    pub query_logging: bool,
    pub key_prefix: String,
}

/// Per-family translation between entities and native records.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn family(&self) -> BackendFamily;

    fn to_native(&self, entity: &Entity) -> Result<NativeRecord, StorageError>;

    fn from_native(&self, native: NativeRecord, family: EntityFamily) -> Result<Entity, StorageError>;

    fn connection_options(&self, name: &str, config: &BackendConfig) -> Result<ConnectionOptions, ConfigError>;

    /// Open a store for the backend. Schema sync is left to the caller.
    async fn open(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn EntityStore>, StorageError>;
}

static RELATIONAL: RelationalAdapter = RelationalAdapter;
static DOCUMENT: DocumentAdapter = DocumentAdapter;

/// Adapter for a backend kind.
#[must_use]
pub fn adapter_for(kind: BackendKind) -> &'static dyn BackendAdapter {
    match kind.family() {
        BackendFamily::Relational => &RELATIONAL,
        BackendFamily::Document => &DOCUMENT,
    }
}

/// Connector that dispatches on the configured kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdapterConnector;

#[async_trait]
impl Connector for AdapterConnector {
    async fn connect(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn EntityStore>, StorageError> {
        adapter_for(config.kind).open(name, config).await
    }
}

pub(crate) fn config_error(err: ConfigError) -> StorageError {
    StorageError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;

    #[test]
    fn test_factory_keys_on_kind() {
        for kind in [
            BackendKind::Mysql,
            BackendKind::Mariadb,
            BackendKind::Postgres,
            BackendKind::Cockroachdb,
            BackendKind::Sqlite,
        ] {
            assert_eq!(adapter_for(kind).family(), BackendFamily::Relational);
        }
        assert_eq!(adapter_for(BackendKind::Redis).family(), BackendFamily::Document);
    }

    #[test]
    fn test_sqlite_file_target() {
        let config = BackendConfig::new(BackendKind::Sqlite, Role::Backup);
        let options = adapter_for(config.kind).connection_options("local", &config).unwrap();
        assert_eq!(options.target, ConnectionTarget::File(PathBuf::from(DEFAULT_SQLITE_FILE)));
        assert_eq!(
            options.target.connection_string(),
            format!("sqlite://{}?mode=rwc", DEFAULT_SQLITE_FILE)
        );
        assert_eq!(options.dialect, Some(Dialect::Sqlite));
    }

    #[test]
    fn test_url_target_and_flags() {
        let config = BackendConfig::new(BackendKind::Cockroachdb, Role::Master)
            .with_url("postgres://root@crdb:26257/app")
            .with_schema_sync(true);
        let options = adapter_for(config.kind).connection_options("crdb", &config).unwrap();
        assert_eq!(options.target, ConnectionTarget::Url("postgres://root@crdb:26257/app".into()));
        assert_eq!(options.dialect, Some(Dialect::Postgres));
        assert!(options.auto_schema_sync);
        assert!(!options.query_logging);
    }

    #[test]
    fn test_document_target_requires_url() {
        let config = BackendConfig::new(BackendKind::Redis, Role::Backup);
        assert!(adapter_for(config.kind).connection_options("cache", &config).is_err());
    }
}
