//! Checkpoints for resumable loads.
//!
//! After each table commits, the coordinator persists how many tables (in
//! resolved order) are done together with a snapshot of the id registry. A
//! later run of the same plan skips those tables and resumes with the saved
//! keys. Progress is tracked per table; a table interrupted half-way is
//! loaded again from its first row.
//!
//! Checkpoint I/O never fails a load. An unreadable or foreign checkpoint is
//! treated as a fresh start, and a failed save only costs resumability.

use crate::error::LoadError;
use crate::load::registry::RegistrySnapshot;
use crate::model::TableConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Tables fully committed, counted from the start of the resolved order
    pub completed_table_count: usize,
    /// Registry contents when the checkpoint was written
    pub id_mapping: RegistrySnapshot,
    pub written_at: DateTime<Utc>,
    /// Identifies the plan this checkpoint belongs to
    #[serde(default)]
    pub plan_fingerprint: String,
}

impl Checkpoint {
    pub fn new(completed_table_count: usize, id_mapping: RegistrySnapshot, plan_fingerprint: &str) -> Self {
        Self {
            completed_table_count,
            id_mapping,
            written_at: Utc::now(),
            plan_fingerprint: plan_fingerprint.to_string(),
        }
    }

    /// The zero checkpoint: nothing completed, empty registry.
    pub fn empty() -> Self {
        Self::new(0, RegistrySnapshot::default(), "")
    }

    pub fn is_empty(&self) -> bool {
        self.completed_table_count == 0 && self.id_mapping.is_empty()
    }
}

/// Fingerprint of a resolved plan: table names, columns and row counts, in order.
pub fn plan_fingerprint(tables: &[TableConfig]) -> String {
    let mut hasher = Sha256::new();
    for table in tables {
        hasher.update(table.name.as_bytes());
        hasher.update([0u8]);
        for column in &table.columns {
            hasher.update(column.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update((table.rows.len() as u64).to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// JSON checkpoint file at a fixed path.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, message: impl ToString) -> LoadError {
        LoadError::CheckpointIo {
            path: self.path.clone(),
            message: message.to_string(),
        }
    }

    /// Read the checkpoint file. `Ok(None)` when there is none.
    pub fn try_load(&self) -> Result<Option<Checkpoint>, LoadError> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| self.io_error(format!("cannot decode: {}", e)))
    }

    /// Load the checkpoint for the plan identified by `fingerprint`.
    ///
    /// Falls back to [`Checkpoint::empty`] when the file is missing, unreadable,
    /// or was written for a different plan.
    pub fn load(&self, fingerprint: &str) -> Checkpoint {
        match self.try_load() {
            Ok(Some(checkpoint)) if checkpoint.plan_fingerprint == fingerprint => {
                log::info!(
                    "resuming from checkpoint {} ({} tables completed)",
                    self.path.display(),
                    checkpoint.completed_table_count
                );
                checkpoint
            }
            Ok(Some(_)) => {
                log::warn!(
                    "ignoring checkpoint {}: written for a different plan",
                    self.path.display()
                );
                Checkpoint::empty()
            }
            Ok(None) => Checkpoint::empty(),
            Err(e) => {
                log::warn!("ignoring {}", e);
                Checkpoint::empty()
            }
        }
    }

    /// Atomically replace the checkpoint file.
    pub fn try_save(&self, checkpoint: &Checkpoint) -> Result<(), LoadError> {
        let json = serde_json::to_vec_pretty(checkpoint).map_err(|e| self.io_error(e))?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        file.write_all(&json).map_err(|e| self.io_error(e))?;
        file.as_file().sync_all().map_err(|e| self.io_error(e))?;
        file.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    /// Save, logging instead of failing.
    pub fn save(&self, checkpoint: &Checkpoint) {
        match self.try_save(checkpoint) {
            Ok(()) => log::debug!(
                "checkpoint saved: {} tables completed",
                checkpoint.completed_table_count
            ),
            Err(e) => log::warn!("failed to save {}", e),
        }
    }

    /// Remove the checkpoint file, if any.
    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("checkpoint {} cleared", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to clear {}", self.io_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::registry::IdRegistry;
    use crate::model::Key;

    fn snapshot() -> RegistrySnapshot {
        let registry = IdRegistry::new();
        registry.record("users", "user001".into(), Key::Int(1)).unwrap();
        registry.snapshot()
    }

    #[test]
    fn test_missing_file_is_a_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

        assert!(store.try_load().unwrap().is_none());
        assert!(store.load("abc").is_empty());
    }

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

        store.save(&Checkpoint::new(2, snapshot(), "plan-a"));
        let loaded = store.load("plan-a");
        assert_eq!(loaded.completed_table_count, 2);
        assert_eq!(loaded.id_mapping, snapshot());

        store.clear();
        assert!(!store.path().exists());
        store.clear();
    }

    #[test]
    fn test_foreign_plan_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));

        store.save(&Checkpoint::new(1, snapshot(), "plan-a"));
        assert!(store.load("plan-b").is_empty());
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = CheckpointStore::new(&path);
        assert!(matches!(store.try_load(), Err(LoadError::CheckpointIo { .. })));
        assert!(store.load("plan-a").is_empty());
    }

    #[test]
    fn test_save_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("missing").join("checkpoint.json"));

        assert!(store.try_save(&Checkpoint::empty()).is_err());
        store.save(&Checkpoint::empty());
    }

    #[test]
    fn test_fingerprint_tracks_plan_shape() {
        let users = TableConfig::new("users", ["code"]).with_rows(vec![vec!["u1".into()]]);
        let orders = TableConfig::new("orders", ["code"]);

        let a = plan_fingerprint(&[users.clone(), orders.clone()]);
        assert_eq!(a, plan_fingerprint(&[users.clone(), orders.clone()]));
        assert_ne!(a, plan_fingerprint(&[orders, users.clone()]));
        assert_ne!(a, plan_fingerprint(&[users.with_rows(Vec::new())]));
    }
}
