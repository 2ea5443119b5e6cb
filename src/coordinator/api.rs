// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Data-access contract: entity CRUD and relationship operations against the
//! current master.
//!
//! Every call resolves the master at call time. When the master turns out to
//! be unreachable mid-call the master is re-resolved through
//! [`FailoverController::ensure_master`] and the call is retried once on
//! whichever backend now holds the role.
//!
//! Callers see [`AccessError`]: `NotFound` and `Unavailable` are distinct, and
//! malformed patches are `Invalid`. Failover and replication problems never
//! show up here.

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::failover::FailoverController;
use crate::entity::{Entity, EntityFamily, EntityFilter, FieldPatch, User};
use crate::metrics::LatencyTimer;
use crate::replication::{ReplicationEngine, ReplicationReport};
use crate::storage::cascade;
use crate::storage::traits::{EntityStore, StorageError};

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("{family} '{uuid}' not found")]
    NotFound { family: EntityFamily, uuid: String },

    /// No backend can serve right now.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("{family} '{uuid}' already exists")]
    Duplicate { family: EntityFamily, uuid: String },

    /// Malformed patch or record.
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for AccessError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable(msg) => Self::Unavailable(msg),
            StorageError::Duplicate { family, uuid } => Self::Duplicate { family, uuid },
            StorageError::Invalid(inner) => Self::Invalid(inner.to_string()),
            other => Self::Storage(other),
        }
    }
}

/// True for request methods that mutate state and should trigger replication.
#[must_use]
pub fn is_mutating_method(method: &str) -> bool {
    ["POST", "PUT", "PATCH", "DELETE"]
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
}

pub struct DataAccess {
    manager: Arc<ConnectionManager>,
    failover: Arc<FailoverController>,
    replication: Arc<ReplicationEngine>,
    replication_enabled: bool,
}

impl DataAccess {
    pub fn new(
        manager: Arc<ConnectionManager>,
        failover: Arc<FailoverController>,
        replication: Arc<ReplicationEngine>,
        replication_enabled: bool,
    ) -> Self {
        Self {
            manager,
            failover,
            replication,
            replication_enabled,
        }
    }

    /// Probe the current master.
    pub async fn is_connection_established(&self) -> bool {
        self.manager.is_connection_established().await
    }

    async fn master_store(&self) -> Result<Arc<dyn EntityStore>, AccessError> {
        if let Some(handle) = self.manager.master() {
            return Ok(handle.store);
        }
        self.re_resolve().await
    }

    async fn re_resolve(&self) -> Result<Arc<dyn EntityStore>, AccessError> {
        self.failover
            .ensure_master()
            .await
            .map_err(|e| AccessError::Unavailable(e.to_string()))?;
        self.manager
            .master()
            .map(|h| h.store)
            .ok_or_else(|| AccessError::Unavailable("no master backend connected".into()))
    }

    /// Run `op` on the master, re-resolving and retrying once if the master
    /// reports itself unreachable. `op` must be a single write or safe to
    /// repeat.
    async fn with_master<T, F, Fut>(&self, op: F) -> Result<T, AccessError>
    where
        F: Fn(Arc<dyn EntityStore>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let store = self.master_store().await?;
        match op(store).await {
            Err(e) if e.is_unavailable() => {
                warn!(error = %e, "Master unreachable during data access, re-resolving");
                let store = self.re_resolve().await?;
                op(store).await.map_err(AccessError::from)
            }
            other => other.map_err(AccessError::from),
        }
    }

    /// First entity of `family` matching `filter`.
    pub async fn fetch_entity(&self, family: EntityFamily, filter: &EntityFilter) -> Result<Option<Entity>, AccessError> {
        let _timer = LatencyTimer::new("fetch", family);
        self.with_master(|store| async move {
            match filter.uuid_value() {
                Some(uuid) => Ok(store.get(family, uuid).await?.filter(|e| filter.matches(e))),
                None => Ok(store.list(family).await?.into_iter().find(|e| filter.matches(e))),
            }
        })
        .await
    }

    pub async fn list_entities(&self, family: EntityFamily) -> Result<Vec<Entity>, AccessError> {
        let _timer = LatencyTimer::new("list", family);
        self.with_master(|store| async move { store.list(family).await }).await
    }

    /// Insert a new entity. An interest is also appended to its group's
    /// `interests` list.
    ///
    /// The insert and the group link are retried separately, so a master
    /// lost between the two never re-runs the insert.
    pub async fn add_entity(&self, entity: Entity) -> Result<(), AccessError> {
        let family = entity.family();
        let _timer = LatencyTimer::new("add", family);
        let entity = &entity;
        self.with_master(|store| async move { store.insert(entity).await })
            .await?;
        if let Entity::Interest(interest) = entity {
            self.with_master(|store| async move {
                cascade::link_interest(store.as_ref(), &interest.uuid, &interest.group).await
            })
            .await?;
        }
        debug!(family = %family, uuid = %entity.uuid(), "Entity added");
        Ok(())
    }

    /// Partial update keyed by uuid. The uuid itself cannot be patched.
    pub async fn edit_entity(&self, family: EntityFamily, uuid: &str, patch: &FieldPatch) -> Result<(), AccessError> {
        let _timer = LatencyTimer::new("edit", family);
        if patch.contains_key("uuid") {
            return Err(AccessError::Invalid(format!("{} uuid is immutable", family)));
        }
        if let Some(field) = patch.keys().find(|f| !family.fields().contains(&f.as_str())) {
            return Err(AccessError::Invalid(format!("unknown {} field '{}'", family, field)));
        }

        let found = self
            .with_master(|store| async move { store.update(family, uuid, patch).await })
            .await?;
        if found {
            Ok(())
        } else {
            Err(AccessError::NotFound {
                family,
                uuid: uuid.to_string(),
            })
        }
    }

    /// Delete an entity together with its cascade.
    pub async fn remove_entity(&self, family: EntityFamily, uuid: &str) -> Result<(), AccessError> {
        let _timer = LatencyTimer::new("remove", family);
        let found = self
            .with_master(|store| async move { cascade::remove(store.as_ref(), family, uuid).await })
            .await?;
        if found {
            Ok(())
        } else {
            Err(AccessError::NotFound {
                family,
                uuid: uuid.to_string(),
            })
        }
    }

    /// Add `user` to the interest's followers and the interest to the user's
    /// followed interests. Returns false when either does not exist.
    pub async fn follow_interest(&self, interest: &str, user: &str) -> Result<bool, AccessError> {
        let _timer = LatencyTimer::new("follow_interest", EntityFamily::Interest);
        self.with_master(|store| async move { set_interest_follow(store.as_ref(), interest, user, true).await })
            .await
    }

    pub async fn unfollow_interest(&self, interest: &str, user: &str) -> Result<bool, AccessError> {
        let _timer = LatencyTimer::new("unfollow_interest", EntityFamily::Interest);
        self.with_master(|store| async move { set_interest_follow(store.as_ref(), interest, user, false).await })
            .await
    }

    /// `follower` starts following `user`; both counters are kept in step
    /// with the lists. Returns false when either user does not exist.
    pub async fn follow_user(&self, user: &str, follower: &str) -> Result<bool, AccessError> {
        let _timer = LatencyTimer::new("follow_user", EntityFamily::User);
        self.with_master(|store| async move { set_user_follow(store.as_ref(), user, follower, true).await })
            .await
    }

    pub async fn unfollow_user(&self, user: &str, follower: &str) -> Result<bool, AccessError> {
        let _timer = LatencyTimer::new("unfollow_user", EntityFamily::User);
        self.with_master(|store| async move { set_user_follow(store.as_ref(), user, follower, false).await })
            .await
    }

    /// Users following an interest. Follower uuids with no matching user are skipped.
    pub async fn interest_followers(&self, interest: &str) -> Result<Vec<User>, AccessError> {
        let _timer = LatencyTimer::new("interest_followers", EntityFamily::Interest);
        let followers = self
            .with_master(|store| async move {
                let Some(Entity::Interest(found)) = store.get(EntityFamily::Interest, interest).await? else {
                    return Ok(None);
                };
                let mut users = Vec::with_capacity(found.followers.len());
                for uuid in &found.followers {
                    if let Some(Entity::User(user)) = store.get(EntityFamily::User, uuid).await? {
                        users.push(user);
                    }
                }
                Ok(Some(users))
            })
            .await?;
        followers.ok_or_else(|| AccessError::NotFound {
            family: EntityFamily::Interest,
            uuid: interest.to_string(),
        })
    }

    /// Schedule a detached replication pass after a mutating request.
    ///
    /// `None` when replication is switched off or no master is connected.
    pub fn on_mutating_request_completed(&self) -> Option<JoinHandle<ReplicationReport>> {
        if !self.replication_enabled {
            return None;
        }
        if self.manager.master().is_none() {
            debug!("No master connected, replication trigger ignored");
            return None;
        }
        Some(self.replication.spawn_pass(self.manager.clone()))
    }

    /// Trigger replication if `method` mutates state.
    pub fn on_request_completed(&self, method: &str) -> Option<JoinHandle<ReplicationReport>> {
        if is_mutating_method(method) {
            self.on_mutating_request_completed()
        } else {
            None
        }
    }
}

fn list_patch(field: &str, values: &[String]) -> FieldPatch {
    let mut patch = FieldPatch::new();
    patch.insert(field.to_string(), json!(values));
    patch
}

fn toggle(list: &mut Vec<String>, uuid: &str, present: bool) -> bool {
    let had = list.iter().any(|u| u == uuid);
    match (present, had) {
        (true, false) => list.push(uuid.to_string()),
        (false, true) => list.retain(|u| u != uuid),
        _ => return false,
    }
    true
}

async fn set_interest_follow(store: &dyn EntityStore, interest: &str, user: &str, follow: bool) -> Result<bool, StorageError> {
    let (Some(Entity::Interest(mut i)), Some(Entity::User(mut u))) = (
        store.get(EntityFamily::Interest, interest).await?,
        store.get(EntityFamily::User, user).await?,
    ) else {
        return Ok(false);
    };

    if toggle(&mut i.followers, user, follow) {
        store
            .update(EntityFamily::Interest, interest, &list_patch("followers", &i.followers))
            .await?;
    }
    if toggle(&mut u.followed_interests, interest, follow) {
        store
            .update(EntityFamily::User, user, &list_patch("followedInterests", &u.followed_interests))
            .await?;
    }
    Ok(true)
}

async fn set_user_follow(store: &dyn EntityStore, user: &str, follower: &str, follow: bool) -> Result<bool, StorageError> {
    if user == follower {
        return Ok(false);
    }
    let (Some(Entity::User(mut followed)), Some(Entity::User(mut fan))) = (
        store.get(EntityFamily::User, user).await?,
        store.get(EntityFamily::User, follower).await?,
    ) else {
        return Ok(false);
    };

    if toggle(&mut followed.followers, follower, follow) {
        let mut patch = list_patch("followers", &followed.followers);
        patch.insert("followersCount".into(), Value::from(followed.followers.len() as i64));
        store.update(EntityFamily::User, user, &patch).await?;
    }
    if toggle(&mut fan.following, user, follow) {
        let mut patch = list_patch("following", &fan.following);
        patch.insert("followingCount".into(), Value::from(fan.following.len() as i64));
        store.update(EntityFamily::User, follower, &patch).await?;
    }
    Ok(true)
}
