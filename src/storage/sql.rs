// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational entity store (SQLite, MySQL/MariaDB, PostgreSQL/CockroachDB).
//!
//! One table per entity family:
//! ```sql
//! CREATE TABLE interests (
//!   id INTEGER PRIMARY KEY AUTOINCREMENT,  -- surrogate, never leaves the store
//!   uuid TEXT NOT NULL UNIQUE,             -- cross-backend key
//!   name TEXT,
//!   description TEXT,
//!   followers TEXT,                        -- JSON list of user uuids
//!   group_uuid TEXT
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! Lists are TEXT holding JSON because the `Any` driver has no JSON or
//! array mapping, and MySQL TEXT columns come back as bytes, so text is
//! read as `String` first and `Vec<u8>` second.

use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyConnectOptions, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, ConnectOptions, Row};
use tracing::debug;

use super::traits::{EntityStore, StorageError};
use crate::adapter::relational::{columns, ColumnKind, Dialect, RelationalAdapter, RelationalRecord, SqlValue};
use crate::adapter::ConnectionOptions;
use crate::config::BackendFamily;
use crate::entity::{Entity, FieldPatch, EntityFamily};
use crate::resilience::retry::{retry_when, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Classify a driver error. Transport and pool failures mean the backend is gone.
fn map_sqlx(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
        other => StorageError::Backend(other.to_string()),
    }
}

fn bind_values<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    values: &'q [SqlValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in values {
        query = match value {
            SqlValue::Text(text) => query.bind(text.clone()),
            SqlValue::Int(n) => query.bind(*n),
        };
    }
    query
}

/// Text column, `String` first (SQLite/Postgres), then bytes (MySQL).
fn read_text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
    adapter: RelationalAdapter,
    retry: RetryConfig,
}

impl SqlStore {
    /// Open a pool. A single attempt: unreachable servers go to failover.
    pub async fn connect(options: &ConnectionOptions) -> Result<Self, StorageError> {
        install_drivers();

        let dialect = options
            .dialect
            .ok_or_else(|| StorageError::Backend("relational store needs a dialect".into()))?;
        let url = options.target.connection_string();

        let mut connect_options =
            AnyConnectOptions::from_str(&url).map_err(|e| StorageError::Backend(e.to_string()))?;
        if !options.query_logging {
            connect_options = connect_options.disable_statement_logging();
        }

        let pool = AnyPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let store = Self::from_pool(pool, dialect);
        if dialect == Dialect::Sqlite {
            store.enable_wal_mode().await?;
        }
        Ok(store)
    }

    /// Wrap an existing pool (drivers must already be installed).
    #[must_use]
    pub fn from_pool(pool: AnyPool, dialect: Dialect) -> Self {
        Self {
            pool,
            dialect,
            adapter: RelationalAdapter,
            retry: RetryConfig::query(),
        }
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// WAL mode lets readers run during replication writes.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        Ok(())
    }

    fn column_list(family: EntityFamily) -> String {
        columns(family).iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
    }

    fn select_sql(&self, family: EntityFamily) -> String {
        format!("SELECT id, {} FROM {}", Self::column_list(family), family.collection())
    }

    fn decode_row(&self, family: EntityFamily, row: &AnyRow) -> Result<Entity, StorageError> {
        let id: i64 = row.try_get("id").map_err(map_sqlx)?;
        let values = columns(family)
            .iter()
            .map(|column| match column.kind {
                ColumnKind::Int => row
                    .try_get::<Option<i64>, _>(column.name)
                    .map(|n| SqlValue::Int(n.unwrap_or(0)))
                    .or_else(|_| Ok(SqlValue::Text(read_text(row, column.name)))),
                ColumnKind::Text | ColumnKind::OptionalText | ColumnKind::List => {
                    Ok::<_, StorageError>(SqlValue::Text(read_text(row, column.name)))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.adapter.from_row(family, RelationalRecord { id: Some(id), values })
    }

    async fn exists(&self, family: EntityFamily, uuid: &str) -> Result<bool, StorageError> {
        Ok(self.get(family, uuid).await?.is_some())
    }
}

#[async_trait]
impl EntityStore for SqlStore {
    fn family(&self) -> BackendFamily {
        BackendFamily::Relational
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx)
    }

    async fn sync_schema(&self) -> Result<(), StorageError> {
        for family in EntityFamily::ALL {
            let ddl = self.dialect.create_table(family);
            retry_when(
                "sql_sync_schema",
                &RetryConfig::schema(),
                || async {
                    sqlx::query(&ddl)
                        .execute(&self.pool)
                        .await
                        .map_err(map_sqlx)
                },
                StorageError::is_unavailable,
            )
            .await
            .map_err(|e| match e {
                StorageError::Unavailable(msg) => StorageError::Unavailable(msg),
                other => StorageError::Schema(format!("{}: {}", family.collection(), other)),
            })?;
            debug!(table = family.collection(), "Table ready");
        }
        Ok(())
    }

    async fn list(&self, family: EntityFamily) -> Result<Vec<Entity>, StorageError> {
        let sql = format!("{} ORDER BY id", self.select_sql(family));
        let rows = retry_when(
            "sql_list",
            &self.retry,
            || async { sqlx::query(&sql).fetch_all(&self.pool).await.map_err(map_sqlx) },
            StorageError::is_transient,
        )
        .await?;
        rows.iter().map(|row| self.decode_row(family, row)).collect()
    }

    async fn get(&self, family: EntityFamily, uuid: &str) -> Result<Option<Entity>, StorageError> {
        let sql = format!("{} WHERE uuid = {}", self.select_sql(family), self.dialect.placeholder(1));
        let row = retry_when(
            "sql_get",
            &self.retry,
            || async {
                sqlx::query(&sql)
                    .bind(uuid.to_string())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx)
            },
            StorageError::is_transient,
        )
        .await?;
        row.map(|row| self.decode_row(family, &row)).transpose()
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StorageError> {
        let family = entity.family();
        let record = self.adapter.to_row(entity)?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            family.collection(),
            Self::column_list(family),
            self.dialect.placeholders(1, record.values.len())
        );
        retry_when(
            "sql_insert",
            &self.retry,
            || async {
                bind_values(sqlx::query(&sql), &record.values)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| match e {
                        sqlx::Error::Database(ref db) if db.is_unique_violation() => StorageError::Duplicate {
                            family,
                            uuid: entity.uuid().to_string(),
                        },
                        other => map_sqlx(other),
                    })
            },
            StorageError::is_unavailable,
        )
        .await?;
        Ok(())
    }

    async fn update(&self, family: EntityFamily, uuid: &str, patch: &FieldPatch) -> Result<bool, StorageError> {
        let assignments = self.adapter.patch_columns(family, patch)?;
        if assignments.is_empty() {
            return self.exists(family, uuid).await;
        }
        let set_clause = assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = {}", column.name, self.dialect.placeholder(i + 1)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE uuid = {}",
            family.collection(),
            set_clause,
            self.dialect.placeholder(assignments.len() + 1)
        );
        let mut values: Vec<SqlValue> = assignments.into_iter().map(|(_, v)| v).collect();
        values.push(SqlValue::Text(Some(uuid.to_string())));

        let result = retry_when(
            "sql_update",
            &self.retry,
            || async {
                bind_values(sqlx::query(&sql), &values)
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx)
            },
            StorageError::is_transient,
        )
        .await?;

        // MySQL reports changed rows, not matched rows
        if result.rows_affected() > 0 {
            Ok(true)
        } else {
            self.exists(family, uuid).await
        }
    }

    async fn delete(&self, family: EntityFamily, uuid: &str) -> Result<bool, StorageError> {
        let sql = format!("DELETE FROM {} WHERE uuid = {}", family.collection(), self.dialect.placeholder(1));
        let result = retry_when(
            "sql_delete",
            &self.retry,
            || async {
                sqlx::query(&sql)
                    .bind(uuid.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(map_sqlx)
            },
            StorageError::is_transient,
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self, family: EntityFamily) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {}", family.collection());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await.map_err(map_sqlx)?;
        let count: i64 = row.try_get("cnt").map_err(map_sqlx)?;
        Ok(count.max(0) as u64)
    }
}
