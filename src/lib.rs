//! # Failover Store
//!
//! Connection management, failover and replication across interchangeable
//! storage backends.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Data Access (CRUD)                      │
//! │  • fetch / add / edit / remove on the current master       │
//! │  • re-resolves the master when it stops answering          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Connection Manager                       │
//! │  • role table (exactly one master when settled)            │
//! │  • liveness probes, bounded connects                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               (master lost / unreachable at start)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Failover Controller                       │
//! │  • promotes the first reachable backup                     │
//! │  • durable pointer to the last master                      │
//! │  • restart restore and last-master catch-up                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                  (after every mutating request)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Replication Engine                        │
//! │  • full-set diff per entity family                         │
//! │  • Users → Badges → Groups → Interests → edges             │
//! │  • per-backup isolation, skip-if-running                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Backends come in two families: relational (SQLite, MySQL/MariaDB,
//! PostgreSQL/CockroachDB through sqlx) and document (Redis). The
//! [`adapter`] module is the only place that knows either record shape.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use failover_store::{EngineConfig, EntityFamily, StoreEngine, User};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::from_json_str(r#"{
//!         "databases": {
//!             "primary": { "type": "postgres", "url": "postgres://app@db/app", "role": "master" },
//!             "local":   { "type": "sqlite", "database": "backup.db", "role": "backup", "synchronize": true }
//!         }
//!     }"#).expect("Invalid config");
//!
//!     let engine = Arc::new(StoreEngine::from_config(config));
//!     engine.start().await.expect("No backend reachable");
//!
//!     let access = engine.access();
//!     access.add_entity(User::new("u1", "ada", "ada@example.com", "hash").into()).await.unwrap();
//!     access.on_mutating_request_completed();
//!
//!     let users = access.list_entities(EntityFamily::User).await.unwrap();
//!     println!("{} users", users.len());
//!
//!     engine.shutdown();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: [`StoreEngine`], connection manager, failover, data access
//! - [`replication`]: diff planning and replication passes
//! - [`adapter`]: relational / document translation and connection options
//! - [`storage`]: entity stores (SQL, Redis, memory) and cascading deletes
//! - [`pointer`]: durable replication pointer
//! - [`resilience`]: retry logic for transient statement failures

pub mod config;
pub mod entity;
pub mod error;
pub mod adapter;
pub mod storage;
pub mod resilience;
pub mod pointer;
pub mod replication;
pub mod coordinator;
pub mod metrics;

pub use config::{BackendConfig, BackendFamily, BackendKind, BackendTable, ConfigError, EngineConfig, Role};
pub use entity::{Badge, Entity, EntityError, EntityFamily, EntityFilter, FieldPatch, Interest, InterestGroup, User};
pub use error::EngineError;
pub use storage::traits::{Connector, EntityStore, StorageError};
pub use storage::memory::{InMemoryStore, MemoryConnector};
pub use resilience::retry::RetryConfig;
pub use pointer::{FilePointerStore, MemoryPointerStore, PointerError, PointerStore, ReplicationPointer};
pub use replication::{BackupOutcome, OpCounts, ReplicationEngine, ReplicationReport};
pub use coordinator::{
    is_mutating_method, AccessError, BackendHandle, ConnectionManager, ConnectionState, DataAccess,
    FailoverController, ReconcileDirection, RoleEntry, StoreEngine,
};
pub use adapter::AdapterConnector;
pub use metrics::LatencyTimer;
