//! File-backed environments
//!
//! A snapshot is a YAML file holding every entity of one environment,
//! handles included. `SnapshotStore` serves it through the same
//! `RemoteStore` interface a live platform client would, and writes the
//! file back after every successful create or update.

use anyhow::{Context, Result};
use assetkit::{
    Entity, EntityFilter, EntityKind, Handle, MemoryStore, RemoteStore, StoreError, WriteRequest,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    environment: Option<String>,
    #[serde(default)]
    entities: Vec<Entity>,
}

pub struct SnapshotStore {
    name: String,
    path: PathBuf,
    inner: MemoryStore,
}

impl SnapshotStore {
    /// Open a snapshot; a missing file is an empty environment.
    pub fn open(name: &str, path: &Path) -> Result<Self> {
        let file: SnapshotFile = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Could not read snapshot {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid snapshot {}", path.display()))?
        } else {
            log::info!(
                "snapshot {} does not exist yet, starting empty",
                path.display()
            );
            SnapshotFile::default()
        };

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            inner: MemoryStore::with_entities(file.entities),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entity_count(&self) -> usize {
        self.inner.len()
    }

    fn persist(&self) -> std::result::Result<(), StoreError> {
        let file = SnapshotFile {
            environment: Some(self.name.clone()),
            entities: self.inner.entities(),
        };
        let rejected = |message: String| StoreError::Rejected { message };
        let content = serde_yaml::to_string(&file)
            .map_err(|e| rejected(format!("could not serialize snapshot: {e}")))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| rejected(format!("could not create {}: {e}", parent.display())))?;
        }
        fs::write(&self.path, content)
            .map_err(|e| rejected(format!("could not write {}: {e}", self.path.display())))
    }

    /// Undo an in-memory write whose snapshot file could not be saved, so
    /// memory and file keep agreeing.
    fn roll_back(
        &self,
        kind: EntityKind,
        handle: Handle,
        previous: Option<Entity>,
        error: StoreError,
    ) -> StoreError {
        match previous {
            Some(entity) => {
                self.inner.insert(entity);
            }
            None => {
                self.inner.remove(kind, handle);
            }
        }
        log::warn!("rolled back {kind} {handle}: {error}");
        match error {
            StoreError::Rejected { message } => StoreError::Rejected {
                message: format!("{message}; the write was not applied"),
            },
            other => other,
        }
    }
}

impl RemoteStore for SnapshotStore {
    fn list(&self, kind: EntityKind, filter: &EntityFilter) -> Result<Vec<Entity>, StoreError> {
        self.inner.list(kind, filter)
    }

    fn get(&self, kind: EntityKind, handle: Handle) -> Result<Entity, StoreError> {
        self.inner.get(kind, handle)
    }

    fn create(&self, kind: EntityKind, request: &WriteRequest) -> Result<Handle, StoreError> {
        let previous = self.inner.find_by_uuid(kind, request.uuid)?;
        let handle = self.inner.create(kind, request)?;
        self.persist().map_err(|e| self.roll_back(kind, handle, previous, e))?;
        Ok(handle)
    }

    fn update(
        &self,
        kind: EntityKind,
        handle: Handle,
        request: &WriteRequest,
    ) -> Result<(), StoreError> {
        let previous = self.inner.get(kind, handle).ok();
        self.inner.update(kind, handle, request)?;
        self.persist().map_err(|e| self.roll_back(kind, handle, previous, e))
    }
}
