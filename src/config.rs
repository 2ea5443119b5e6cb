// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the failover store.
//!
//! The settings file is JSON. Backends are keyed by name and their
//! declaration order is preserved: failover walks backups in that order.
//!
//! # Example
//!
//! ```
//! use failover_store::{EngineConfig, Role};
//!
//! let config = EngineConfig::from_json_str(r#"{
//!     "replication": true,
//!     "databases": {
//!         "primary": { "type": "postgres", "url": "postgres://app@db1/app", "role": "master", "synchronize": true },
//!         "local":   { "type": "sqlite", "database": "store.db", "role": "backup" },
//!         "cache":   { "type": "redis", "url": "redis://localhost:6379", "role": "backup", "enabled": false }
//!     }
//! }"#).unwrap();
//!
//! assert_eq!(config.databases.names(), vec!["primary", "local", "cache"]);
//! assert_eq!(config.databases.get("primary").unwrap().role, Role::Master);
//! assert_eq!(config.connect_timeout_ms, 10_000);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config for backend '{backend}': {message}")]
    Backend { backend: String, message: String },

    #[error("Config declares no backends")]
    Empty,
}

/// Storage technology of a configured backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mysql,
    Mariadb,
    Postgres,
    Cockroachdb,
    Sqlite,
    Redis,
}

impl BackendKind {
    #[must_use]
    pub fn family(&self) -> BackendFamily {
        match self {
            Self::Redis => BackendFamily::Document,
            _ => BackendFamily::Relational,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Postgres => "postgres",
            Self::Cockroachdb => "cockroachdb",
            Self::Sqlite => "sqlite",
            Self::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter family a backend kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendFamily {
    Relational,
    Document,
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relational => write!(f, "relational"),
            Self::Document => write!(f, "document"),
        }
    }
}

/// Role a backend plays. Mutated at runtime by failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Backup,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Backup => write!(f, "backup"),
        }
    }
}

/// One backend entry of the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: BackendKind,

    /// Network URL (all kinds except sqlite)
    #[serde(default)]
    pub url: Option<String>,

    /// Local database file (sqlite only)
    #[serde(default)]
    pub database: Option<PathBuf>,

    pub role: Role,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Create/repair schema on connect
    #[serde(default, alias = "synchronize")]
    pub auto_schema_sync: bool,

    /// Log every statement the driver executes
    #[serde(default, alias = "logging")]
    pub query_logging: bool,

    /// Key prefix for document backends
    #[serde(default)]
    pub key_prefix: Option<String>,
}

fn default_enabled() -> bool { true }

impl BackendConfig {
    /// Enabled backend without schema sync or statement logging.
    #[must_use]
    pub fn new(kind: BackendKind, role: Role) -> Self {
        Self {
            kind,
            url: None,
            database: None,
            role,
            enabled: true,
            auto_schema_sync: false,
            query_logging: false,
            key_prefix: None,
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_schema_sync(mut self, enabled: bool) -> Self {
        self.auto_schema_sync = enabled;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let fail = |message: &str| ConfigError::Backend {
            backend: name.to_string(),
            message: message.to_string(),
        };
        match self.kind {
            BackendKind::Sqlite => {
                if self.url.is_some() && self.database.is_some() {
                    return Err(fail("set either 'url' or 'database', not both"));
                }
            }
            _ => {
                match self.url.as_deref() {
                    None | Some("") => return Err(fail("'url' is required")),
                    Some(_) => {}
                }
                if self.database.is_some() {
                    return Err(fail("'database' only applies to sqlite"));
                }
            }
        }
        if self.key_prefix.is_some() && self.kind != BackendKind::Redis {
            return Err(fail("'keyPrefix' only applies to redis"));
        }
        Ok(())
    }
}

/// A backend entry together with its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedBackend {
    pub name: String,
    pub config: BackendConfig,
}

/// Backends keyed by name, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendTable(Vec<NamedBackend>);

impl BackendTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a backend. Replaces the config if the name is already present.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, config: BackendConfig) -> Self {
        self.insert(name, config);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, config: BackendConfig) {
        let name = name.into();
        match self.0.iter_mut().find(|b| b.name == name) {
            Some(existing) => existing.config = config,
            None => self.0.push(NamedBackend { name, config }),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BackendConfig> {
        self.0.iter().find(|b| b.name == name).map(|b| &b.config)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedBackend> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NamedBackend> {
        self.0.iter_mut()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|b| b.name.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for BackendTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = BackendTable;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of backend name to backend config")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<NamedBackend> = Vec::new();
                while let Some((name, config)) = map.next_entry::<String, BackendConfig>()? {
                    if entries.iter().any(|b| b.name == name) {
                        return Err(de::Error::custom(format!("duplicate backend '{}'", name)));
                    }
                    entries.push(NamedBackend { name, config });
                }
                Ok(BackendTable(entries))
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Run a replication pass after every mutating request
    #[serde(default = "default_replication")]
    pub replication: bool,

    /// Configured backends, in declaration order
    #[serde(default)]
    pub databases: BackendTable,

    /// File holding the last backend that served as master
    #[serde(default = "default_pointer_path")]
    pub pointer_path: PathBuf,

    /// Master liveness probe interval
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Upper bound for one connect attempt (and one probe)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_replication() -> bool { true }
fn default_pointer_path() -> PathBuf { PathBuf::from("cache.json") }
fn default_liveness_interval_ms() -> u64 { 5_000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replication: default_replication(),
            databases: BackendTable::default(),
            pointer_path: default_pointer_path(),
            liveness_interval_ms: default_liveness_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Read and validate a JSON settings file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check connection targets. Role conflicts are not rejected here;
    /// master selection reports them and falls back to failover.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.databases.is_empty() {
            return Err(ConfigError::Empty);
        }
        for backend in self.databases.iter() {
            backend.config.validate(&backend.name)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn liveness_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.liveness_interval_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }
}
