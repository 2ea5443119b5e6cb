// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document adapter: entities as JSON documents.
//!
//! A document is the entity's wire-named fields plus an opaque `_id`
//! (24 hex characters, assigned on insert and kept across updates).
//! Documents live at `{prefix}{collection}:{uuid}`; each collection keeps
//! an index set of its uuids at `{prefix}{collection}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{config_error, BackendAdapter, ConnectionOptions, ConnectionTarget, NativeRecord};
use crate::config::{BackendConfig, BackendFamily, BackendKind, ConfigError};
use crate::entity::{Entity, EntityFamily};
use crate::storage::redis::RedisStore;
use crate::storage::traits::{EntityStore, StorageError};

pub const OBJECT_ID_FIELD: &str = "_id";

#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentAdapter;

impl DocumentAdapter {
    /// Fresh opaque document identity.
    #[must_use]
    pub fn new_object_id() -> String {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(24);
        id
    }

    #[must_use]
    pub fn to_document(&self, entity: &Entity, object_id: &str) -> Map<String, Value> {
        let mut doc = entity.to_fields();
        doc.insert(OBJECT_ID_FIELD.to_string(), Value::String(object_id.to_string()));
        doc
    }

    /// Split a document into its `_id` (if any) and entity.
    pub fn from_document(
        &self,
        family: EntityFamily,
        mut doc: Map<String, Value>,
    ) -> Result<(Option<String>, Entity), StorageError> {
        let object_id = match doc.remove(OBJECT_ID_FIELD) {
            Some(Value::String(id)) => Some(id),
            _ => None,
        };
        Ok((object_id, Entity::from_fields(family, doc)?))
    }

    #[must_use]
    pub fn collection_key(prefix: &str, family: EntityFamily) -> String {
        format!("{}{}", prefix, family.collection())
    }

    #[must_use]
    pub fn document_key(prefix: &str, family: EntityFamily, uuid: &str) -> String {
        format!("{}{}:{}", prefix, family.collection(), uuid)
    }
}

#[async_trait]
impl BackendAdapter for DocumentAdapter {
    fn family(&self) -> BackendFamily {
        BackendFamily::Document
    }

    fn to_native(&self, entity: &Entity) -> Result<NativeRecord, StorageError> {
        Ok(NativeRecord::Document(self.to_document(entity, &Self::new_object_id())))
    }

    fn from_native(&self, native: NativeRecord, family: EntityFamily) -> Result<Entity, StorageError> {
        match native {
            NativeRecord::Document(doc) => self.from_document(family, doc).map(|(_, entity)| entity),
            NativeRecord::Row(_) => Err(StorageError::Backend(
                "document adapter cannot read a relational row".into(),
            )),
        }
    }

    fn connection_options(&self, name: &str, config: &BackendConfig) -> Result<ConnectionOptions, ConfigError> {
        if config.kind != BackendKind::Redis {
            return Err(ConfigError::Backend {
                backend: name.to_string(),
                message: format!("'{}' is not a document backend", config.kind),
            });
        }
        let url = match config.url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => {
                return Err(ConfigError::Backend {
                    backend: name.to_string(),
                    message: "'url' is required".into(),
                })
            }
        };
        Ok(ConnectionOptions {
            family: BackendFamily::Document,
            target: ConnectionTarget::Url(url),
            dialect: None,
            auto_schema_sync: config.auto_schema_sync,
            query_logging: config.query_logging,
            key_prefix: config.key_prefix.clone().unwrap_or_default(),
        })
    }

    async fn open(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn EntityStore>, StorageError> {
        let options = self.connection_options(name, config).map_err(config_error)?;
        let store = RedisStore::connect(&options).await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{InterestGroup, User};

    #[test]
    fn test_object_id_shape() {
        let id = DocumentAdapter::new_object_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, DocumentAdapter::new_object_id());
    }

    #[test]
    fn test_document_roundtrip_keeps_object_id() {
        let mut group = InterestGroup::new("g1", "Music");
        group.interests = vec!["i1".into()];
        let entity = Entity::from(group);

        let doc = DocumentAdapter.to_document(&entity, "0123456789abcdef01234567");
        assert_eq!(doc[OBJECT_ID_FIELD], Value::String("0123456789abcdef01234567".into()));
        assert_eq!(doc["uuid"], Value::String("g1".into()));

        let (id, back) = DocumentAdapter.from_document(EntityFamily::InterestGroup, doc).unwrap();
        assert_eq!(id.as_deref(), Some("0123456789abcdef01234567"));
        assert_eq!(back, entity);
    }

    #[test]
    fn test_native_dispatch() {
        let entity = Entity::from(User::new("u1", "ada", "a@b", "p"));
        let native = DocumentAdapter.to_native(&entity).unwrap();
        assert!(matches!(native, NativeRecord::Document(_)));
        assert_eq!(DocumentAdapter.from_native(native, EntityFamily::User).unwrap(), entity);
    }

    #[test]
    fn test_keys() {
        assert_eq!(DocumentAdapter::collection_key("app:", EntityFamily::InterestGroup), "app:interests_groups");
        assert_eq!(DocumentAdapter::document_key("", EntityFamily::User, "u1"), "users:u1");
    }
}
