//! Integration tests against real backends.
//!
//! Tests use testcontainers for portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # Requires Docker
//! cargo test --test integration -- --ignored
//! ```
//!
//! # Test Organization
//! - `happy_*` - store operations and replication across families
//! - `failure_*` - backend death and failover to another technology

mod common;

use std::sync::Arc;

use failover_store::adapter::{adapter_for, BackendAdapter};
use failover_store::storage::cascade;
use failover_store::{
    BackendConfig, BackendFamily, BackendHandle, BackendKind, BackendTable, Entity, EntityFamily, EntityStore,
    Interest, InterestGroup, MemoryPointerStore, ReplicationEngine, Role, StoreEngine, User,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

use common::StaticConnector;

// =============================================================================
// Container Helpers
// =============================================================================

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn redis_config(container: &Container<'_, GenericImage>, prefix: &str) -> BackendConfig {
    let port = container.get_host_port_ipv4(6379);
    let mut config = BackendConfig::new(BackendKind::Redis, Role::Backup).with_url(format!("redis://127.0.0.1:{}", port));
    config.key_prefix = Some(prefix.to_string());
    config
}

async fn open(name: &str, config: &BackendConfig) -> Arc<dyn EntityStore> {
    let store = adapter_for(config.kind).open(name, config).await.expect("open store");
    store.sync_schema().await.expect("schema sync");
    store
}

fn handle(name: &str, config: BackendConfig, store: Arc<dyn EntityStore>) -> BackendHandle {
    BackendHandle {
        name: name.to_string(),
        config,
        store,
    }
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
#[ignore]
async fn happy_redis_store_roundtrip() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let store = open("redis", &redis_config(&redis, "roundtrip:")).await;
    assert_eq!(store.family(), BackendFamily::Document);

    let mut group = InterestGroup::new("g1", "Music");
    group.interests = vec!["i1".into()];
    store.insert(&group.into()).await.unwrap();
    store.insert(&Interest::new("i1", "Jazz", "g1").into()).await.unwrap();
    let mut user = User::new("u1", "ada", "a@b", "p");
    user.followed_interests = vec!["i1".into()];
    store.insert(&user.into()).await.unwrap();

    assert!(store.insert(&User::new("u1", "dup", "d@b", "p").into()).await.is_err());
    assert_eq!(store.count(EntityFamily::User).await.unwrap(), 1);

    let patch = serde_json::json!({ "username": "lovelace" }).as_object().cloned().unwrap();
    assert!(store.update(EntityFamily::User, "u1", &patch).await.unwrap());
    assert!(!store.update(EntityFamily::User, "ghost", &patch).await.unwrap());

    assert!(cascade::remove(store.as_ref(), EntityFamily::InterestGroup, "g1").await.unwrap());
    assert_eq!(store.count(EntityFamily::Interest).await.unwrap(), 0);
    let Some(Entity::User(u1)) = store.get(EntityFamily::User, "u1").await.unwrap() else {
        panic!("u1 missing");
    };
    assert_eq!(u1.username, "lovelace");
    assert!(u1.followed_interests.is_empty());
}

#[tokio::test]
#[ignore]
async fn happy_sqlite_master_replicates_into_redis() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let dir = tempfile::TempDir::new().unwrap();

    let sql_config = BackendConfig::new(BackendKind::Sqlite, Role::Master).with_database(dir.path().join("master.db"));
    let sql = open("sqlite", &sql_config).await;
    let redis_config = redis_config(&redis, "replica:");
    let doc = open("redis", &redis_config).await;

    sql.insert(&InterestGroup::new("g1", "Music").into()).await.unwrap();
    sql.insert(&Interest::new("i1", "Jazz", "g1").into()).await.unwrap();
    sql.insert(&User::new("u1", "ada", "a@b", "p").into()).await.unwrap();
    doc.insert(&User::new("u9", "stale", "s@b", "p").into()).await.unwrap();

    let engine = ReplicationEngine::new();
    let master = handle("sqlite", sql_config, sql.clone());
    let backups = [handle("redis", redis_config, doc.clone())];

    let report = engine.replicate(&master, &backups).await;
    assert!(report.is_clean(), "{:?}", report.errors().collect::<Vec<_>>());
    for family in EntityFamily::ALL {
        let mut expected = sql.list(family).await.unwrap();
        let mut actual = doc.list(family).await.unwrap();
        expected.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        actual.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        assert_eq!(expected, actual, "{}", family);
    }

    assert_eq!(engine.replicate(&master, &backups).await.total_ops(), 0);
}

// =============================================================================
// Failure scenarios
// =============================================================================

#[tokio::test]
#[ignore]
async fn failure_redis_master_death_promotes_sqlite_backup() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let dir = tempfile::TempDir::new().unwrap();

    let mut redis_config = redis_config(&redis, "failover:");
    redis_config.role = Role::Master;
    let sql_config = BackendConfig::new(BackendKind::Sqlite, Role::Backup)
        .with_database(dir.path().join("backup.db"))
        .with_schema_sync(true);

    let connector = Arc::new(StaticConnector::new());
    connector.register("cache", open("cache", &redis_config).await);
    connector.register("local", open("local", &sql_config).await);

    let table = BackendTable::new().with("cache", redis_config).with("local", sql_config);
    let pointer = Arc::new(MemoryPointerStore::new());
    let engine = StoreEngine::new(common::config(table), connector.clone(), pointer.clone());

    assert_eq!(engine.start().await.unwrap(), "cache");
    engine.access().add_entity(User::new("u1", "ada", "a@b", "p").into()).await.unwrap();
    engine.access().on_mutating_request_completed().unwrap().await.unwrap();

    drop(redis);

    assert_eq!(engine.failover().ensure_master().await.unwrap(), "local");
    assert_eq!(pointer.history(), vec!["cache", "local"]);
    let users = engine.access().list_entities(EntityFamily::User).await.unwrap();
    assert_eq!(users.len(), 1);
}
