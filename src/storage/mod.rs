// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity stores: one implementation per storage technology.
//!
//! - [`sql::SqlStore`]: relational backends through the sqlx `Any` driver
//! - [`redis::RedisStore`]: document backend, one JSON value per entity
//! - [`memory::InMemoryStore`]: DashMap-backed store for tests and demos

pub mod traits;
pub mod sql;
pub mod redis;
pub mod memory;
pub mod cascade;

pub use traits::{Connector, EntityStore, StorageError};
