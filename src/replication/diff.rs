// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full-set diff between a master family and a backup family.
//!
//! Pure: takes both entity sets, returns the operations that make the
//! backup match. Records are matched by uuid only.

use std::collections::{HashMap, HashSet};

use crate::entity::{Entity, EntityFamily, FieldPatch};

/// Which fields a plan looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldScope {
    /// Everything but edge fields; inserts and deletes allowed.
    Scalars,
    /// Edge fields only; updates of shared records only.
    Edges,
}

impl FieldScope {
    fn includes(&self, family: EntityFamily, field: &str) -> bool {
        match self {
            Self::Scalars => !family.is_edge_field(field),
            Self::Edges => family.is_edge_field(field),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationOp {
    /// Full record missing from the backup.
    Insert(Entity),
    /// Fields that differ on a shared record.
    Update { uuid: String, patch: FieldPatch },
    /// Record the master no longer holds (apply through the cascade).
    Delete { uuid: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffPlan {
    pub family: EntityFamily,
    pub ops: Vec<ReplicationOp>,
}

impl DiffPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Fields of `master` in `scope` whose value differs on `backup`.
#[must_use]
pub fn changed_fields(master: &Entity, backup: &Entity, scope: FieldScope) -> FieldPatch {
    let family = master.family();
    let theirs = backup.compared_fields();
    master
        .compared_fields()
        .into_iter()
        .filter(|(field, value)| scope.includes(family, field) && theirs.get(field) != Some(value))
        .collect()
}

/// Operations that bring `backup` in line with `master` for `scope`.
///
/// Order: inserts and updates in master order, then deletes in backup order.
#[must_use]
pub fn plan(family: EntityFamily, master: &[Entity], backup: &[Entity], scope: FieldScope) -> DiffPlan {
    let on_backup: HashMap<&str, &Entity> = backup.iter().map(|e| (e.uuid(), e)).collect();
    let mut ops = Vec::new();

    for entity in master {
        match on_backup.get(entity.uuid()) {
            None if scope == FieldScope::Scalars => ops.push(ReplicationOp::Insert(entity.clone())),
            None => {}
            Some(theirs) => {
                let patch = changed_fields(entity, theirs, scope);
                if !patch.is_empty() {
                    ops.push(ReplicationOp::Update {
                        uuid: entity.uuid().to_string(),
                        patch,
                    });
                }
            }
        }
    }

    if scope == FieldScope::Scalars {
        let on_master: HashSet<&str> = master.iter().map(Entity::uuid).collect();
        ops.extend(
            backup
                .iter()
                .filter(|e| !on_master.contains(e.uuid()))
                .map(|e| ReplicationOp::Delete {
                    uuid: e.uuid().to_string(),
                }),
        );
    }

    DiffPlan { family, ops }
}
