// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend-independent entity model.
//!
//! Four families are stored on every backend: users, badges, interest
//! groups and interests. The `uuid` of an entity is the only key that
//! correlates records across backends; surrogate keys (`id`, `_id`) stay
//! inside the adapters.
//!
//! Fields fall into two classes:
//! - **scalar** fields, compared and copied during the per-family phases
//! - **edge** fields (uuid lists referencing other entities), reconciled
//!   in the final edge phase once every family exists on the backup
//!
//! # Example
//!
//! ```
//! use failover_store::entity::{Entity, EntityFamily, User};
//! use serde_json::json;
//!
//! let mut user = Entity::from(User::new("u1", "ada", "ada@example.com", "hash"));
//! let patch = json!({ "followersCount": 3 }).as_object().unwrap().clone();
//! user.apply_patch(&patch).unwrap();
//!
//! assert_eq!(user.family(), EntityFamily::User);
//! assert_eq!(user.compared_fields()["followersCount"], json!(3));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Partial update: field name to new value.
pub type FieldPatch = Map<String, Value>;

pub const DEFAULT_DESCRIPTION: &str = "No description yet";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error("Unknown field '{field}' for {family}")]
    UnknownField { family: EntityFamily, field: String },

    #[error("The uuid of a {0} cannot be changed")]
    UuidImmutable(EntityFamily),

    #[error("Malformed {family} record: {reason}")]
    Malformed { family: EntityFamily, reason: String },
}

/// Entity family. `ALL` is the replication order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityFamily {
    User,
    Badge,
    InterestGroup,
    Interest,
}

impl EntityFamily {
    pub const ALL: [EntityFamily; 4] = [
        EntityFamily::User,
        EntityFamily::Badge,
        EntityFamily::InterestGroup,
        EntityFamily::Interest,
    ];

    /// Table / collection name on every backend.
    #[must_use]
    pub fn collection(&self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Badge => "badges",
            Self::InterestGroup => "interests_groups",
            Self::Interest => "interests",
        }
    }

    /// Fields holding uuid lists of other entities.
    #[must_use]
    pub fn edge_fields(&self) -> &'static [&'static str] {
        match self {
            Self::User => &["badges", "followedInterests", "followers", "following"],
            Self::Badge => &[],
            Self::InterestGroup => &["interests"],
            Self::Interest => &["followers"],
        }
    }

    #[must_use]
    pub fn is_edge_field(&self, field: &str) -> bool {
        self.edge_fields().contains(&field)
    }

    /// Patchable fields (wire names, `uuid` excluded).
    #[must_use]
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::User => &[
                "username",
                "tag",
                "email",
                "password",
                "description",
                "profilePicture",
                "bannerPicture",
                "location",
                "badges",
                "joinedDate",
                "followedInterests",
                "followersCount",
                "followingCount",
                "followers",
                "following",
            ],
            Self::Badge => &["icon", "name", "description"],
            Self::InterestGroup => &["name", "description", "interests"],
            Self::Interest => &["name", "description", "followers", "group"],
        }
    }
}

impl fmt::Display for EntityFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Badge => write!(f, "badge"),
            Self::InterestGroup => write!(f, "interest_group"),
            Self::Interest => write!(f, "interest"),
        }
    }
}

fn default_description() -> String {
    DEFAULT_DESCRIPTION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uuid: String,
    pub username: String,
    #[serde(default)]
    pub tag: String,
    pub email: String,
    pub password: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub banner_picture: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub badges: Vec<String>,
    #[serde(default)]
    pub joined_date: Option<String>,
    #[serde(default)]
    pub followed_interests: Vec<String>,
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub following_count: i64,
    #[serde(default)]
    pub followers: Vec<String>,
    #[serde(default)]
    pub following: Vec<String>,
}

impl User {
    #[must_use]
    pub fn new(
        uuid: impl Into<String>,
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            username: username.into(),
            tag: String::new(),
            email: email.into(),
            password: password.into(),
            description: default_description(),
            profile_picture: None,
            banner_picture: None,
            location: None,
            badges: Vec::new(),
            joined_date: None,
            followed_interests: Vec::new(),
            followers_count: 0,
            following_count: 0,
            followers: Vec::new(),
            following: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    pub uuid: String,
    pub icon: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Badge {
    #[must_use]
    pub fn new(uuid: impl Into<String>, icon: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            icon: icon.into(),
            name: name.into(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestGroup {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub interests: Vec<String>,
}

impl InterestGroup {
    #[must_use]
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            description: String::new(),
            interests: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interest {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub followers: Vec<String>,
    /// uuid of the owning group
    pub group: String,
}

impl Interest {
    #[must_use]
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            description: String::new(),
            followers: Vec::new(),
            group: group.into(),
        }
    }
}

/// An entity of any family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    User(User),
    Badge(Badge),
    InterestGroup(InterestGroup),
    Interest(Interest),
}

impl From<User> for Entity {
    fn from(value: User) -> Self { Self::User(value) }
}

impl From<Badge> for Entity {
    fn from(value: Badge) -> Self { Self::Badge(value) }
}

impl From<InterestGroup> for Entity {
    fn from(value: InterestGroup) -> Self { Self::InterestGroup(value) }
}

impl From<Interest> for Entity {
    fn from(value: Interest) -> Self { Self::Interest(value) }
}

fn strings(list: &[String]) -> Value {
    Value::Array(list.iter().cloned().map(Value::String).collect())
}

fn optional(value: &Option<String>) -> Value {
    value.clone().map_or(Value::Null, Value::String)
}

impl Entity {
    #[must_use]
    pub fn family(&self) -> EntityFamily {
        match self {
            Self::User(_) => EntityFamily::User,
            Self::Badge(_) => EntityFamily::Badge,
            Self::InterestGroup(_) => EntityFamily::InterestGroup,
            Self::Interest(_) => EntityFamily::Interest,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        match self {
            Self::User(u) => &u.uuid,
            Self::Badge(b) => &b.uuid,
            Self::InterestGroup(g) => &g.uuid,
            Self::Interest(i) => &i.uuid,
        }
    }

    /// Every field, keyed by its wire name, including `uuid`.
    #[must_use]
    pub fn to_fields(&self) -> Map<String, Value> {
        let value = match self {
            Self::User(u) => json!({
                "uuid": u.uuid,
                "username": u.username,
                "tag": u.tag,
                "email": u.email,
                "password": u.password,
                "description": u.description,
                "profilePicture": optional(&u.profile_picture),
                "bannerPicture": optional(&u.banner_picture),
                "location": optional(&u.location),
                "badges": strings(&u.badges),
                "joinedDate": optional(&u.joined_date),
                "followedInterests": strings(&u.followed_interests),
                "followersCount": u.followers_count,
                "followingCount": u.following_count,
                "followers": strings(&u.followers),
                "following": strings(&u.following),
            }),
            Self::Badge(b) => json!({
                "uuid": b.uuid,
                "icon": b.icon,
                "name": b.name,
                "description": b.description,
            }),
            Self::InterestGroup(g) => json!({
                "uuid": g.uuid,
                "name": g.name,
                "description": g.description,
                "interests": strings(&g.interests),
            }),
            Self::Interest(i) => json!({
                "uuid": i.uuid,
                "name": i.name,
                "description": i.description,
                "followers": strings(&i.followers),
                "group": i.group,
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Fields compared across backends (everything but `uuid`).
    #[must_use]
    pub fn compared_fields(&self) -> Map<String, Value> {
        let mut fields = self.to_fields();
        fields.remove("uuid");
        fields
    }

    /// Build an entity of `family` from wire-named fields.
    pub fn from_fields(family: EntityFamily, fields: Map<String, Value>) -> Result<Self, EntityError> {
        let value = Value::Object(fields);
        let malformed = |e: serde_json::Error| EntityError::Malformed {
            family,
            reason: e.to_string(),
        };
        Ok(match family {
            EntityFamily::User => Self::User(serde_json::from_value(value).map_err(malformed)?),
            EntityFamily::Badge => Self::Badge(serde_json::from_value(value).map_err(malformed)?),
            EntityFamily::InterestGroup => {
                Self::InterestGroup(serde_json::from_value(value).map_err(malformed)?)
            }
            EntityFamily::Interest => Self::Interest(serde_json::from_value(value).map_err(malformed)?),
        })
    }

    /// Apply a partial update. Unknown fields and `uuid` changes are rejected,
    /// and the entity is left untouched on error.
    pub fn apply_patch(&mut self, patch: &FieldPatch) -> Result<(), EntityError> {
        let family = self.family();
        let mut fields = self.to_fields();
        for (name, value) in patch {
            if name == "uuid" {
                if value.as_str() == Some(self.uuid()) {
                    continue;
                }
                return Err(EntityError::UuidImmutable(family));
            }
            if !fields.contains_key(name) {
                return Err(EntityError::UnknownField {
                    family,
                    field: name.clone(),
                });
            }
            fields.insert(name.clone(), value.clone());
        }
        *self = Self::from_fields(family, fields)?;
        Ok(())
    }

    /// Value of an edge field as a uuid list (empty for non-list fields).
    #[must_use]
    pub fn edge(&self, field: &str) -> Vec<String> {
        match (self, field) {
            (Self::User(u), "badges") => u.badges.clone(),
            (Self::User(u), "followedInterests") => u.followed_interests.clone(),
            (Self::User(u), "followers") => u.followers.clone(),
            (Self::User(u), "following") => u.following.clone(),
            (Self::InterestGroup(g), "interests") => g.interests.clone(),
            (Self::Interest(i), "followers") => i.followers.clone(),
            _ => Vec::new(),
        }
    }
}

/// Field-equality predicate used by entity lookups.
///
/// An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFilter {
    fields: Map<String, Value>,
}

impl EntityFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn uuid(uuid: impl Into<String>) -> Self {
        Self::new().and("uuid", Value::String(uuid.into()))
    }

    #[must_use]
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// The uuid this filter pins, if any.
    #[must_use]
    pub fn uuid_value(&self) -> Option<&str> {
        self.fields.get("uuid").and_then(Value::as_str)
    }

    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        if self.fields.is_empty() {
            return true;
        }
        let fields = entity.to_fields();
        self.fields
            .iter()
            .all(|(name, expected)| fields.get(name) == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(value: Value) -> FieldPatch {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fields_roundtrip_through_from_fields() {
        let mut user = User::new("u1", "ada", "ada@example.com", "hash");
        user.badges = vec!["b1".into()];
        user.location = Some("London".into());
        let entity = Entity::from(user);

        let rebuilt = Entity::from_fields(EntityFamily::User, entity.to_fields()).unwrap();
        assert_eq!(rebuilt, entity);
    }

    #[test]
    fn test_user_description_default() {
        let fields = patch(json!({
            "uuid": "u1", "username": "ada", "email": "a@b", "password": "p"
        }));
        match Entity::from_fields(EntityFamily::User, fields).unwrap() {
            Entity::User(u) => assert_eq!(u.description, DEFAULT_DESCRIPTION),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_compared_fields_exclude_uuid() {
        let entity = Entity::from(Badge::new("b1", "star.png", "Star"));
        let fields = entity.compared_fields();
        assert!(!fields.contains_key("uuid"));
        assert_eq!(fields["icon"], json!("star.png"));
    }

    #[test]
    fn test_apply_patch_rejects_unknown_field() {
        let mut entity = Entity::from(InterestGroup::new("g1", "Music"));
        let err = entity.apply_patch(&patch(json!({ "colour": "red" }))).unwrap_err();
        assert!(matches!(err, EntityError::UnknownField { .. }));
        assert_eq!(entity, Entity::from(InterestGroup::new("g1", "Music")));
    }

    #[test]
    fn test_apply_patch_rejects_uuid_change() {
        let mut entity = Entity::from(Interest::new("i1", "Jazz", "g1"));
        let err = entity.apply_patch(&patch(json!({ "uuid": "i2" }))).unwrap_err();
        assert_eq!(err, EntityError::UuidImmutable(EntityFamily::Interest));

        // Restating the same uuid is a no-op
        entity.apply_patch(&patch(json!({ "uuid": "i1", "name": "Bebop" }))).unwrap();
        match entity {
            Entity::Interest(i) => assert_eq!(i.name, "Bebop"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_apply_patch_type_mismatch_is_malformed() {
        let mut entity = Entity::from(User::new("u1", "ada", "a@b", "p"));
        let err = entity.apply_patch(&patch(json!({ "followersCount": "many" }))).unwrap_err();
        assert!(matches!(err, EntityError::Malformed { family: EntityFamily::User, .. }));
    }

    #[test]
    fn test_edge_fields_per_family() {
        assert!(EntityFamily::User.is_edge_field("followedInterests"));
        assert!(!EntityFamily::User.is_edge_field("followersCount"));
        assert!(EntityFamily::Badge.edge_fields().is_empty());
        assert!(EntityFamily::Interest.is_edge_field("followers"));
        assert!(!EntityFamily::Interest.is_edge_field("group"));
    }

    #[test]
    fn test_filter_matches_on_fields() {
        let entity = Entity::from(Interest::new("i1", "Jazz", "g1"));
        assert!(EntityFilter::new().matches(&entity));
        assert!(EntityFilter::uuid("i1").matches(&entity));
        assert!(EntityFilter::new().and("group", "g1").and("name", "Jazz").matches(&entity));
        assert!(!EntityFilter::new().and("group", "g2").matches(&entity));
        assert_eq!(EntityFilter::uuid("i1").uuid_value(), Some("i1"));
    }

    #[test]
    fn test_collection_names() {
        let names: Vec<_> = EntityFamily::ALL.iter().map(|f| f.collection()).collect();
        assert_eq!(names, vec!["users", "badges", "interests_groups", "interests"]);
    }
}
