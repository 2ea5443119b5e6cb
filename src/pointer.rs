// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable record of the backend that last served as master.
//!
//! The file is a JSON object shared with other settings:
//! ```json
//! { "lastDatabaseLoaded": "primary", "theme": "dark" }
//! ```
//! Only `lastDatabaseLoaded` is owned here; other keys are carried over on
//! every write. Writers take an advisory lock on a sidecar `.lock` file and
//! replace the file through a rename, so readers never see a torn write.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;

pub const POINTER_KEY: &str = "lastDatabaseLoaded";

#[derive(Error, Debug)]
pub enum PointerError {
    #[error("Pointer file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Pointer file {path} is not a JSON object: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Which backend was last active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationPointer {
    pub last_database_loaded: String,
}

impl ReplicationPointer {
    #[must_use]
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            last_database_loaded: backend.into(),
        }
    }
}

/// Persistence for the replication pointer.
pub trait PointerStore: Send + Sync {
    /// `None` when there was no prior session (absent file or empty value).
    fn load(&self) -> Result<Option<ReplicationPointer>, PointerError>;

    fn store(&self, pointer: &ReplicationPointer) -> Result<(), PointerError>;
}

/// Pointer kept in a JSON file next to other settings.
#[derive(Debug, Clone)]
pub struct FilePointerStore {
    path: PathBuf,
}

impl FilePointerStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sidecar(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn io(&self, source: std::io::Error) -> PointerError {
        PointerError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_object(&self) -> Result<Option<Map<String, Value>>, PointerError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io(e)),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(other) => Err(PointerError::Parse {
                path: self.path.clone(),
                reason: format!("found {}", other),
            }),
            Err(e) => Err(PointerError::Parse {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn lock(&self) -> Result<File, PointerError> {
        let lock_path = self.sidecar(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| self.io(e))?;
        file.lock_exclusive().map_err(|e| self.io(e))?;
        Ok(file)
    }
}

impl PointerStore for FilePointerStore {
    fn load(&self) -> Result<Option<ReplicationPointer>, PointerError> {
        let Some(map) = self.read_object()? else {
            return Ok(None);
        };
        Ok(match map.get(POINTER_KEY) {
            Some(Value::String(name)) if !name.is_empty() => Some(ReplicationPointer::new(name.clone())),
            _ => None,
        })
    }

    fn store(&self, pointer: &ReplicationPointer) -> Result<(), PointerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io(e))?;
        }
        let lock = self.lock()?;

        // Unreadable content is replaced rather than blocking failover
        let mut map = self.read_object().ok().flatten().unwrap_or_default();
        map.insert(
            POINTER_KEY.to_string(),
            Value::String(pointer.last_database_loaded.clone()),
        );
        let body = serde_json::to_string_pretty(&Value::Object(map)).map_err(|e| PointerError::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let tmp = self.sidecar(".tmp");
        let mut file = File::create(&tmp).map_err(|e| self.io(e))?;
        file.write_all(body.as_bytes()).map_err(|e| self.io(e))?;
        file.sync_all().map_err(|e| self.io(e))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|e| self.io(e))?;

        FileExt::unlock(&lock).map_err(|e| self.io(e))?;
        Ok(())
    }
}

/// In-process pointer that records every write. Used by tests and demos.
#[derive(Debug, Default)]
pub struct MemoryPointerStore {
    current: Mutex<Option<ReplicationPointer>>,
    history: Mutex<Vec<String>>,
}

impl MemoryPointerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing pointer without recording a write.
    #[must_use]
    pub fn with_pointer(backend: impl Into<String>) -> Self {
        let store = Self::default();
        *store.current.lock() = Some(ReplicationPointer::new(backend));
        store
    }

    /// Every backend name written, in order.
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.current.lock().as_ref().map(|p| p.last_database_loaded.clone())
    }
}

impl PointerStore for MemoryPointerStore {
    fn load(&self) -> Result<Option<ReplicationPointer>, PointerError> {
        Ok(self.current.lock().clone())
    }

    fn store(&self, pointer: &ReplicationPointer) -> Result<(), PointerError> {
        *self.current.lock() = Some(pointer.clone());
        self.history.lock().push(pointer.last_database_loaded.clone());
        Ok(())
    }
}
