// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the coordinator.

use std::fmt;
use std::sync::Arc;

use crate::config::{BackendConfig, BackendKind, Role};
use crate::storage::traits::EntityStore;

/// Master connection state.
///
/// Use [`super::ConnectionManager::state()`] to check the current state or
/// [`super::ConnectionManager::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No master handle
    Disconnected,
    /// Selecting / connecting / promoting
    Connecting,
    /// A master is installed
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// An open backend together with its identity.
#[derive(Clone)]
pub struct BackendHandle {
    pub name: String,
    pub config: BackendConfig,
    pub store: Arc<dyn EntityStore>,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("name", &self.name)
            .field("kind", &self.config.kind)
            .field("role", &self.config.role)
            .finish_non_exhaustive()
    }
}

/// One row of the role table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleEntry {
    pub name: String,
    pub kind: BackendKind,
    pub role: Role,
    pub enabled: bool,
}

/// Direction of a reconcile run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileDirection {
    /// Backend that served before the current master, merged into it: the
    /// master gains the records it lacks and keeps everything it holds.
    CatchUp { source: String },
    /// Backend that served during a crashed session back into the
    /// configured master, which then resumes the master role.
    Restore { source: String },
}

impl fmt::Display for ReconcileDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CatchUp { source } => write!(f, "catch-up from '{}'", source),
            Self::Restore { source } => write!(f, "restore from '{}'", source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
    }

    #[test]
    fn test_direction_display() {
        let d = ReconcileDirection::Restore { source: "backup".into() };
        assert_eq!(d.to_string(), "restore from 'backup'");
        let d = ReconcileDirection::CatchUp { source: "b1".into() };
        assert_eq!(d.to_string(), "catch-up from 'b1'");
    }
}
