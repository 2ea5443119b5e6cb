// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational adapter: entities as rows.
//!
//! Each family maps to one table with a numeric surrogate `id` plus one
//! column per field. List fields are stored as JSON text (the sqlx `Any`
//! driver has no array or JSON type). The `group` field of an interest is
//! stored as `group_uuid` to stay clear of the reserved word.
//!
//! Dialects only differ in DDL and bind placeholders:
//!
//! | Dialect  | Kinds                  | Placeholder | Surrogate key                      |
//! |----------|------------------------|-------------|------------------------------------|
//! | Sqlite   | sqlite                 | `?`         | `INTEGER PRIMARY KEY AUTOINCREMENT`|
//! | MySql    | mysql, mariadb         | `?`         | `BIGINT AUTO_INCREMENT`            |
//! | Postgres | postgres, cockroachdb  | `$n`        | `BIGSERIAL`                        |

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{config_error, BackendAdapter, ConnectionOptions, ConnectionTarget, NativeRecord, DEFAULT_SQLITE_FILE};
use crate::config::{BackendConfig, BackendFamily, BackendKind, ConfigError};
use crate::entity::{Entity, EntityError, EntityFamily, FieldPatch};
use crate::storage::sql::SqlStore;
use crate::storage::traits::{EntityStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    MySql,
    Postgres,
}

impl Dialect {
    #[must_use]
    pub fn for_kind(kind: BackendKind) -> Option<Self> {
        match kind {
            BackendKind::Sqlite => Some(Self::Sqlite),
            BackendKind::Mysql | BackendKind::Mariadb => Some(Self::MySql),
            BackendKind::Postgres | BackendKind::Cockroachdb => Some(Self::Postgres),
            BackendKind::Redis => None,
        }
    }

    /// Bind placeholder for the 1-based parameter `index`.
    #[must_use]
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${}", index),
            Self::Sqlite | Self::MySql => "?".to_string(),
        }
    }

    fn column_type(&self, column: &Column) -> &'static str {
        match (self, column.kind) {
            (_, ColumnKind::Int) => match self {
                Self::Sqlite => "INTEGER NOT NULL DEFAULT 0",
                Self::MySql | Self::Postgres => "BIGINT NOT NULL DEFAULT 0",
            },
            (Self::MySql, ColumnKind::List) => "LONGTEXT",
            (Self::MySql, _) if column.name == "uuid" => "VARCHAR(64) NOT NULL UNIQUE",
            (_, _) if column.name == "uuid" => "TEXT NOT NULL UNIQUE",
            (_, _) => "TEXT",
        }
    }

    fn surrogate_key(&self) -> &'static str {
        match self {
            Self::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            Self::MySql => "id BIGINT AUTO_INCREMENT PRIMARY KEY",
            Self::Postgres => "id BIGSERIAL PRIMARY KEY",
        }
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for a family.
    #[must_use]
    pub fn create_table(&self, family: EntityFamily) -> String {
        let mut parts = vec![self.surrogate_key().to_string()];
        for column in columns(family) {
            parts.push(format!("{} {}", column.name, self.column_type(column)));
        }
        let suffix = match self {
            Self::MySql => " ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            Self::Sqlite | Self::Postgres => "",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}){}",
            family.collection(),
            parts.join(", "),
            suffix
        )
    }

    /// Comma-separated placeholders `start..start+count`.
    #[must_use]
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    OptionalText,
    Int,
    /// uuid list, stored as JSON text
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub field: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, field: &'static str, kind: ColumnKind) -> Column {
    Column { name, field, kind }
}

const USER_COLUMNS: &[Column] = &[
    col("uuid", "uuid", ColumnKind::Text),
    col("username", "username", ColumnKind::Text),
    col("tag", "tag", ColumnKind::Text),
    col("email", "email", ColumnKind::Text),
    col("password", "password", ColumnKind::Text),
    col("description", "description", ColumnKind::Text),
    col("profile_picture", "profilePicture", ColumnKind::OptionalText),
    col("banner_picture", "bannerPicture", ColumnKind::OptionalText),
    col("location", "location", ColumnKind::OptionalText),
    col("badges", "badges", ColumnKind::List),
    col("joined_date", "joinedDate", ColumnKind::OptionalText),
    col("followed_interests", "followedInterests", ColumnKind::List),
    col("followers_count", "followersCount", ColumnKind::Int),
    col("following_count", "followingCount", ColumnKind::Int),
    col("followers", "followers", ColumnKind::List),
    col("following", "following", ColumnKind::List),
];

const BADGE_COLUMNS: &[Column] = &[
    col("uuid", "uuid", ColumnKind::Text),
    col("icon", "icon", ColumnKind::Text),
    col("name", "name", ColumnKind::Text),
    col("description", "description", ColumnKind::Text),
];

const GROUP_COLUMNS: &[Column] = &[
    col("uuid", "uuid", ColumnKind::Text),
    col("name", "name", ColumnKind::Text),
    col("description", "description", ColumnKind::Text),
    col("interests", "interests", ColumnKind::List),
];

const INTEREST_COLUMNS: &[Column] = &[
    col("uuid", "uuid", ColumnKind::Text),
    col("name", "name", ColumnKind::Text),
    col("description", "description", ColumnKind::Text),
    col("followers", "followers", ColumnKind::List),
    col("group_uuid", "group", ColumnKind::Text),
];

/// Columns of a family's table, surrogate key excluded.
#[must_use]
pub fn columns(family: EntityFamily) -> &'static [Column] {
    match family {
        EntityFamily::User => USER_COLUMNS,
        EntityFamily::Badge => BADGE_COLUMNS,
        EntityFamily::InterestGroup => GROUP_COLUMNS,
        EntityFamily::Interest => INTEREST_COLUMNS,
    }
}

/// A bindable column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(Option<String>),
    Int(i64),
}

/// A row: surrogate key (absent before insert) plus values aligned with
/// [`columns`] of its family.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationalRecord {
    pub id: Option<i64>,
    pub values: Vec<SqlValue>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RelationalAdapter;

impl RelationalAdapter {
    pub fn to_row(&self, entity: &Entity) -> Result<RelationalRecord, StorageError> {
        let family = entity.family();
        let fields = entity.to_fields();
        let values = columns(family)
            .iter()
            .map(|column| encode(family, column, fields.get(column.field).unwrap_or(&Value::Null)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RelationalRecord { id: None, values })
    }

    pub fn from_row(&self, family: EntityFamily, record: RelationalRecord) -> Result<Entity, StorageError> {
        let columns = columns(family);
        if record.values.len() != columns.len() {
            return Err(EntityError::Malformed {
                family,
                reason: format!("expected {} columns, got {}", columns.len(), record.values.len()),
            }
            .into());
        }
        let mut fields = Map::new();
        for (column, value) in columns.iter().zip(record.values) {
            fields.insert(column.field.to_string(), decode(family, column, value)?);
        }
        Ok(Entity::from_fields(family, fields)?)
    }

    /// Translate a patch into `(column, value)` pairs.
    pub fn patch_columns(
        &self,
        family: EntityFamily,
        patch: &FieldPatch,
    ) -> Result<Vec<(&'static Column, SqlValue)>, StorageError> {
        let mut out = Vec::with_capacity(patch.len());
        for (field, value) in patch {
            if field == "uuid" {
                return Err(EntityError::UuidImmutable(family).into());
            }
            let column = columns(family)
                .iter()
                .find(|c| c.field == field)
                .ok_or_else(|| EntityError::UnknownField {
                    family,
                    field: field.clone(),
                })?;
            out.push((column, encode(family, column, value)?));
        }
        Ok(out)
    }
}

fn encode(family: EntityFamily, column: &Column, value: &Value) -> Result<SqlValue, StorageError> {
    let mismatch = |expected: &str| -> StorageError {
        EntityError::Malformed {
            family,
            reason: format!("field '{}' expects {}, got {}", column.field, expected, value),
        }
        .into()
    };
    match column.kind {
        ColumnKind::Text => value
            .as_str()
            .map(|s| SqlValue::Text(Some(s.to_string())))
            .ok_or_else(|| mismatch("a string")),
        ColumnKind::OptionalText => match value {
            Value::Null => Ok(SqlValue::Text(None)),
            Value::String(s) => Ok(SqlValue::Text(Some(s.clone()))),
            _ => Err(mismatch("a string or null")),
        },
        ColumnKind::Int => value.as_i64().map(SqlValue::Int).ok_or_else(|| mismatch("an integer")),
        ColumnKind::List => match value {
            Value::Array(items) if items.iter().all(Value::is_string) => {
                Ok(SqlValue::Text(Some(value.to_string())))
            }
            _ => Err(mismatch("a list of uuids")),
        },
    }
}

fn decode(family: EntityFamily, column: &Column, value: SqlValue) -> Result<Value, StorageError> {
    Ok(match (column.kind, value) {
        (ColumnKind::Int, SqlValue::Int(n)) => Value::from(n),
        (ColumnKind::Int, SqlValue::Text(Some(s))) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| EntityError::Malformed {
                family,
                reason: format!("column '{}': {}", column.name, e),
            })?,
        (ColumnKind::Int, SqlValue::Text(None)) => Value::from(0),
        (ColumnKind::Text, SqlValue::Text(text)) => Value::String(text.unwrap_or_default()),
        (ColumnKind::OptionalText, SqlValue::Text(text)) => text.map_or(Value::Null, Value::String),
        (ColumnKind::List, SqlValue::Text(None)) => Value::Array(Vec::new()),
        (ColumnKind::List, SqlValue::Text(Some(raw))) if raw.trim().is_empty() => Value::Array(Vec::new()),
        (ColumnKind::List, SqlValue::Text(Some(raw))) => {
            serde_json::from_str(&raw).map_err(|e| EntityError::Malformed {
                family,
                reason: format!("column '{}' is not a JSON list: {}", column.name, e),
            })?
        }
        (_, SqlValue::Int(n)) => Value::String(n.to_string()),
    })
}

#[async_trait]
impl BackendAdapter for RelationalAdapter {
    fn family(&self) -> BackendFamily {
        BackendFamily::Relational
    }

    fn to_native(&self, entity: &Entity) -> Result<NativeRecord, StorageError> {
        self.to_row(entity).map(NativeRecord::Row)
    }

    fn from_native(&self, native: NativeRecord, family: EntityFamily) -> Result<Entity, StorageError> {
        match native {
            NativeRecord::Row(row) => self.from_row(family, row),
            NativeRecord::Document(_) => Err(StorageError::Backend(
                "relational adapter cannot read a document record".into(),
            )),
        }
    }

    fn connection_options(&self, name: &str, config: &BackendConfig) -> Result<ConnectionOptions, ConfigError> {
        let dialect = Dialect::for_kind(config.kind).ok_or_else(|| ConfigError::Backend {
            backend: name.to_string(),
            message: format!("'{}' is not a relational backend", config.kind),
        })?;
        let target = match (config.kind, config.url.as_deref()) {
            (BackendKind::Sqlite, Some(url)) if !url.is_empty() => ConnectionTarget::Url(url.to_string()),
            (BackendKind::Sqlite, _) => ConnectionTarget::File(
                config
                    .database
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_FILE)),
            ),
            (_, Some(url)) if !url.is_empty() => ConnectionTarget::Url(url.to_string()),
            (_, _) => {
                return Err(ConfigError::Backend {
                    backend: name.to_string(),
                    message: "'url' is required".into(),
                })
            }
        };
        Ok(ConnectionOptions {
            family: BackendFamily::Relational,
            target,
            dialect: Some(dialect),
            auto_schema_sync: config.auto_schema_sync,
            query_logging: config.query_logging,
            key_prefix: String::new(),
        })
    }

    async fn open(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn EntityStore>, StorageError> {
        let options = self.connection_options(name, config).map_err(config_error)?;
        let store = SqlStore::connect(&options).await?;
        Ok(Arc::new(store))
    }
}
