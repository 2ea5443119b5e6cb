// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cascading deletes.
//!
//! The same rules run on the master (data access) and on every backup
//! (replication), so referencing lists end up identical everywhere:
//!
//! | Deleted        | Also removed                                                    |
//! |----------------|-----------------------------------------------------------------|
//! | interest group | its interests; their uuids from every `user.followedInterests` |
//! | interest       | its uuid from the group's `interests` and `user.followedInterests` |
//! | badge          | its uuid from every `user.badges`                               |
//! | user           | nothing                                                         |
//!
//! [`link_interest`] is the insert-side counterpart: a new interest joins its
//! group's `interests` list.

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::traits::{EntityStore, StorageError};
use crate::entity::{Entity, EntityFamily, FieldPatch};

/// Delete an entity and apply its cascade. Returns false when the entity
/// did not exist (nothing else is touched in that case).
pub async fn remove(store: &dyn EntityStore, family: EntityFamily, uuid: &str) -> Result<bool, StorageError> {
    match family {
        EntityFamily::InterestGroup => remove_group(store, uuid).await,
        EntityFamily::Interest => remove_interest(store, uuid).await,
        EntityFamily::Badge => {
            if store.get(family, uuid).await?.is_none() {
                return Ok(false);
            }
            strip_from_users(store, "badges", &[uuid.to_string()]).await?;
            store.delete(family, uuid).await
        }
        EntityFamily::User => store.delete(family, uuid).await,
    }
}

async fn remove_group(store: &dyn EntityStore, uuid: &str) -> Result<bool, StorageError> {
    let Some(Entity::InterestGroup(group)) = store.get(EntityFamily::InterestGroup, uuid).await? else {
        return Ok(false);
    };

    // Interests pointing at the group but missing from its list go too
    let mut interests = group.interests.clone();
    for entity in store.list(EntityFamily::Interest).await? {
        if let Entity::Interest(interest) = entity {
            if interest.group == uuid && !interests.contains(&interest.uuid) {
                interests.push(interest.uuid);
            }
        }
    }

    for interest in &interests {
        store.delete(EntityFamily::Interest, interest).await?;
    }
    strip_from_users(store, "followedInterests", &interests).await?;
    debug!(group = %uuid, interests = interests.len(), "Cascaded group delete");
    store.delete(EntityFamily::InterestGroup, uuid).await
}

async fn remove_interest(store: &dyn EntityStore, uuid: &str) -> Result<bool, StorageError> {
    let Some(Entity::Interest(interest)) = store.get(EntityFamily::Interest, uuid).await? else {
        return Ok(false);
    };

    if let Some(Entity::InterestGroup(group)) = store.get(EntityFamily::InterestGroup, &interest.group).await? {
        if group.interests.iter().any(|i| i == uuid) {
            let remaining: Vec<&String> = group.interests.iter().filter(|i| *i != uuid).collect();
            store
                .update(EntityFamily::InterestGroup, &group.uuid, &patch("interests", json!(remaining)))
                .await?;
        }
    }
    strip_from_users(store, "followedInterests", &[uuid.to_string()]).await?;
    store.delete(EntityFamily::Interest, uuid).await
}

/// Append `interest` to its group's `interests` list. Idempotent; returns
/// false when the list already held it or the group does not exist.
pub async fn link_interest(store: &dyn EntityStore, interest: &str, group: &str) -> Result<bool, StorageError> {
    let Some(Entity::InterestGroup(mut found)) = store.get(EntityFamily::InterestGroup, group).await? else {
        warn!(interest = %interest, group = %group, "Interest added to a group that does not exist");
        return Ok(false);
    };
    if found.interests.iter().any(|i| i == interest) {
        return Ok(false);
    }
    found.interests.push(interest.to_string());
    store
        .update(EntityFamily::InterestGroup, group, &patch("interests", json!(found.interests)))
        .await?;
    Ok(true)
}

/// Remove `uuids` from a list field of every user holding any of them.
async fn strip_from_users(store: &dyn EntityStore, field: &str, uuids: &[String]) -> Result<usize, StorageError> {
    if uuids.is_empty() {
        return Ok(0);
    }
    let mut touched = 0;
    for user in store.list(EntityFamily::User).await? {
        let current = user.edge(field);
        if !current.iter().any(|u| uuids.contains(u)) {
            continue;
        }
        let kept: Vec<String> = current.into_iter().filter(|u| !uuids.contains(u)).collect();
        store
            .update(EntityFamily::User, user.uuid(), &patch(field, json!(kept)))
            .await?;
        touched += 1;
    }
    Ok(touched)
}

fn patch(field: &str, value: Value) -> FieldPatch {
    let mut patch = FieldPatch::new();
    patch.insert(field.to_string(), value);
    patch
}
