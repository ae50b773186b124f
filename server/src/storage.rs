//! Durable room snapshots.
//!
//! Only the shared room state goes through here. Player data rides on the
//! connections instead, so a snapshot stays small and there is a single
//! source of truth for each roster entry.

use crate::game::RoomSnapshot;
use bincode::{deserialize, serialize};
use log::debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Codec(#[from] bincode::Error),
    #[error("snapshot store lock poisoned")]
    Poisoned,
}

pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<Option<RoomSnapshot>, StoreError>;
    fn save(&self, snapshot: &RoomSnapshot) -> Result<(), StoreError>;
}

/// Keeps the encoded snapshot in memory. Clones share the same cell, so a
/// test can hand one clone to a room and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    cell: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<RoomSnapshot>, StoreError> {
        let cell = self.cell.lock().map_err(|_| StoreError::Poisoned)?;
        match cell.as_deref() {
            Some(bytes) => Ok(Some(deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        let bytes = serialize(snapshot)?;
        let mut cell = self.cell.lock().map_err(|_| StoreError::Poisoned)?;
        *cell = Some(bytes);
        Ok(())
    }
}

/// Writes the snapshot to a single file, replacing it atomically.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<RoomSnapshot>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(deserialize(&bytes)?))
    }

    fn save(&self, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        let bytes = serialize(snapshot)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let temp = self.temp_path();
        fs::write(&temp, &bytes)?;
        fs::rename(&temp, &self.path)?;
        debug!("Saved {} byte snapshot to {}", bytes.len(), self.path.display());
        Ok(())
    }
}
