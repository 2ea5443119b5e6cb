// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document entity store on Redis.
//!
//! Layout, per entity family:
//! ```text
//! {prefix}users            SET    of user uuids (collection index)
//! {prefix}users:{uuid}     STRING JSON document { "_id": "...", "uuid": "...", ... }
//! ```
//!
//! Writes touch the document and the index in one `MULTI` pipeline.
//! Schema sync rebuilds each index from a key scan, so documents written
//! by an interrupted pipeline or by hand are picked up again.

use std::collections::HashSet;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client, RedisError};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::traits::{EntityStore, StorageError};
use crate::adapter::document::DocumentAdapter;
use crate::adapter::ConnectionOptions;
use crate::config::BackendFamily;
use crate::entity::{Entity, EntityFamily, FieldPatch};
use crate::resilience::retry::{retry_when, RetryConfig};

/// Classify a client error. Transport failures mean the backend is gone.
fn map_redis(err: RedisError) -> StorageError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        StorageError::Unavailable(err.to_string())
    } else {
        StorageError::Backend(err.to_string())
    }
}

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "myapp:" → "myapp:users:u1")
    prefix: String,
    adapter: DocumentAdapter,
    log_commands: bool,
    retry: RetryConfig,
}

impl RedisStore {
    /// Open a managed connection. A single attempt: unreachable servers go to failover.
    pub async fn connect(options: &ConnectionOptions) -> Result<Self, StorageError> {
        let url = options.target.connection_string();
        let client = Client::open(url.as_str()).map_err(|e| StorageError::Backend(e.to_string()))?;
        let connection = ConnectionManager::new(client).await.map_err(map_redis)?;

        Ok(Self {
            connection,
            prefix: options.key_prefix.clone(),
            adapter: DocumentAdapter,
            log_commands: options.query_logging,
            retry: RetryConfig::query(),
        })
    }

    fn index_key(&self, family: EntityFamily) -> String {
        DocumentAdapter::collection_key(&self.prefix, family)
    }

    fn document_key(&self, family: EntityFamily, uuid: &str) -> String {
        DocumentAdapter::document_key(&self.prefix, family, uuid)
    }

    fn trace(&self, command: &str, key: &str) {
        if self.log_commands {
            debug!(command, key, "redis command");
        }
    }

    fn parse_document(&self, family: EntityFamily, raw: &str) -> Result<(Option<String>, Entity), StorageError> {
        let doc: Map<String, Value> = serde_json::from_str(raw)
            .map_err(|e| StorageError::Backend(format!("Invalid JSON document: {}", e)))?;
        self.adapter.from_document(family, doc)
    }

    async fn read_raw(&self, family: EntityFamily, uuid: &str) -> Result<Option<String>, StorageError> {
        let key = self.document_key(family, uuid);
        self.trace("GET", &key);
        retry_when(
            "redis_get",
            &self.retry,
            || async {
                let mut conn = self.connection.clone();
                let raw: Option<String> = conn.get(&key).await.map_err(map_redis)?;
                Ok(raw)
            },
            StorageError::is_transient,
        )
        .await
    }

    async fn write_document(
        &self,
        family: EntityFamily,
        uuid: &str,
        doc: &Map<String, Value>,
    ) -> Result<(), StorageError> {
        let key = self.document_key(family, uuid);
        let index = self.index_key(family);
        let json = Value::Object(doc.clone()).to_string();
        self.trace("SET+SADD", &key);
        retry_when(
            "redis_write",
            &self.retry,
            || async {
                let mut conn = self.connection.clone();
                pipe()
                    .atomic()
                    .set(&key, &json)
                    .ignore()
                    .sadd(&index, uuid)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(map_redis)
            },
            StorageError::is_transient,
        )
        .await
    }

    async fn scan_documents(&self, family: EntityFamily) -> Result<HashSet<String>, StorageError> {
        let pattern = format!("{}:*", self.index_key(family));
        let doc_prefix = format!("{}:", self.index_key(family));
        let mut conn = self.connection.clone();
        let mut uuids = HashSet::new();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await.map_err(map_redis)?;
        while let Some(key) = iter.next_item().await {
            if let Some(uuid) = key.strip_prefix(&doc_prefix) {
                uuids.insert(uuid.to_string());
            }
        }
        Ok(uuids)
    }
}

#[async_trait]
impl EntityStore for RedisStore {
    fn family(&self) -> BackendFamily {
        BackendFamily::Document
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(map_redis)
    }

    async fn sync_schema(&self) -> Result<(), StorageError> {
        for family in EntityFamily::ALL {
            let index = self.index_key(family);
            let on_disk = self.scan_documents(family).await?;

            let mut conn = self.connection.clone();
            let indexed: HashSet<String> = conn.smembers(&index).await.map_err(map_redis)?;

            let missing: Vec<&String> = on_disk.difference(&indexed).collect();
            let dangling: Vec<&String> = indexed.difference(&on_disk).collect();
            if missing.is_empty() && dangling.is_empty() {
                continue;
            }

            let mut pipeline = pipe();
            pipeline.atomic();
            if !missing.is_empty() {
                pipeline.sadd(&index, &missing).ignore();
            }
            if !dangling.is_empty() {
                pipeline.srem(&index, &dangling).ignore();
            }
            pipeline
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| StorageError::Schema(format!("{}: {}", index, e)))?;
            info!(
                index = %index,
                added = missing.len(),
                removed = dangling.len(),
                "Repaired collection index"
            );
        }
        Ok(())
    }

    async fn list(&self, family: EntityFamily) -> Result<Vec<Entity>, StorageError> {
        let index = self.index_key(family);
        self.trace("SMEMBERS+MGET", &index);
        let mut conn = self.connection.clone();
        let mut uuids: Vec<String> = conn.smembers(&index).await.map_err(map_redis)?;
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        uuids.sort();

        let keys: Vec<String> = uuids.iter().map(|u| self.document_key(family, u)).collect();
        let docs: Vec<Option<String>> = cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;

        let mut entities = Vec::with_capacity(docs.len());
        for raw in docs.into_iter().flatten() {
            let (_, entity) = self.parse_document(family, &raw)?;
            entities.push(entity);
        }
        Ok(entities)
    }

    async fn get(&self, family: EntityFamily, uuid: &str) -> Result<Option<Entity>, StorageError> {
        match self.read_raw(family, uuid).await? {
            Some(raw) => Ok(Some(self.parse_document(family, &raw)?.1)),
            None => Ok(None),
        }
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StorageError> {
        let family = entity.family();
        if self.read_raw(family, entity.uuid()).await?.is_some() {
            return Err(StorageError::Duplicate {
                family,
                uuid: entity.uuid().to_string(),
            });
        }
        let doc = self.adapter.to_document(entity, &DocumentAdapter::new_object_id());
        self.write_document(family, entity.uuid(), &doc).await
    }

    async fn update(&self, family: EntityFamily, uuid: &str, patch: &FieldPatch) -> Result<bool, StorageError> {
        let Some(raw) = self.read_raw(family, uuid).await? else {
            return Ok(false);
        };
        let (object_id, mut entity) = self.parse_document(family, &raw)?;
        entity.apply_patch(patch)?;
        let object_id = object_id.unwrap_or_else(DocumentAdapter::new_object_id);
        let doc = self.adapter.to_document(&entity, &object_id);
        self.write_document(family, uuid, &doc).await?;
        Ok(true)
    }

    async fn delete(&self, family: EntityFamily, uuid: &str) -> Result<bool, StorageError> {
        let key = self.document_key(family, uuid);
        let index = self.index_key(family);
        self.trace("DEL+SREM", &key);
        let (deleted, _): (i64, i64) = retry_when(
            "redis_delete",
            &self.retry,
            || async {
                let mut conn = self.connection.clone();
                pipe()
                    .atomic()
                    .del(&key)
                    .srem(&index, uuid)
                    .query_async::<(i64, i64)>(&mut conn)
                    .await
                    .map_err(map_redis)
            },
            StorageError::is_transient,
        )
        .await?;
        Ok(deleted > 0)
    }

    async fn count(&self, family: EntityFamily) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let count: u64 = conn.scard(self.index_key(family)).await.map_err(map_redis)?;
        Ok(count)
    }
}
