//! Logical-to-physical key registry shared across tables and workers.
//!
//! Each table that publishes keys gets its own map under its
//! `id_mapping_key`. Entries are append-only: recording a logical key twice is
//! an error rather than an overwrite. A single mutex guards every map, so
//! concurrent workers of one table can record their batches safely.

use crate::error::LoadError;
use crate::model::Key;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Serializable copy of the registry, stored in checkpoints.
///
/// Entries are kept as sorted `[logical, physical]` pairs so that integer and
/// text keys survive a JSON round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrySnapshot(BTreeMap<String, Vec<(Key, Key)>>);

impl RegistrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn mapping_keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn entries(&self, mapping_key: &str) -> &[(Key, Key)] {
        self.0.get(mapping_key).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Default)]
pub struct IdRegistry {
    tables: Mutex<HashMap<String, HashMap<Key, Key>>>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let registry = Self::new();
        registry.restore(snapshot);
        registry
    }

    /// Record one mapping. Fails if `logical` is already mapped for `mapping_key`.
    pub fn record(&self, mapping_key: &str, logical: Key, physical: Key) -> Result<(), LoadError> {
        self.record_all(mapping_key, vec![(logical, physical)])
    }

    /// Record a batch of mappings atomically: either every pair is added or none is.
    pub fn record_all(&self, mapping_key: &str, pairs: Vec<(Key, Key)>) -> Result<(), LoadError> {
        let mut tables = self.tables.lock();

        {
            let existing = tables.get(mapping_key);
            let mut seen = HashSet::with_capacity(pairs.len());
            for (logical, _) in &pairs {
                let recorded = existing.is_some_and(|table| table.contains_key(logical));
                if recorded || !seen.insert(logical) {
                    return Err(LoadError::DuplicateKey {
                        mapping_key: mapping_key.to_string(),
                        key: logical.clone(),
                    });
                }
            }
        }

        tables
            .entry(mapping_key.to_string())
            .or_default()
            .extend(pairs);
        Ok(())
    }

    /// Look up the physical key for `logical`.
    pub fn resolve(&self, mapping_key: &str, logical: &Key) -> Result<Key, LoadError> {
        self.tables
            .lock()
            .get(mapping_key)
            .and_then(|table| table.get(logical))
            .cloned()
            .ok_or_else(|| LoadError::MissingMapping {
                parent: mapping_key.to_string(),
                key: logical.clone(),
            })
    }

    pub fn contains(&self, mapping_key: &str, logical: &Key) -> bool {
        self.tables
            .lock()
            .get(mapping_key)
            .is_some_and(|table| table.contains_key(logical))
    }

    pub fn len(&self, mapping_key: &str) -> usize {
        self.tables
            .lock()
            .get(mapping_key)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.lock().values().all(HashMap::is_empty)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let tables = self.tables.lock();
        let mut snapshot = BTreeMap::new();
        for (mapping_key, table) in tables.iter() {
            let mut entries: Vec<(Key, Key)> = table
                .iter()
                .map(|(logical, physical)| (logical.clone(), physical.clone()))
                .collect();
            entries.sort();
            snapshot.insert(mapping_key.clone(), entries);
        }
        RegistrySnapshot(snapshot)
    }

    /// Replace the registry's contents with `snapshot`.
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        let mut tables = self.tables.lock();
        tables.clear();
        for (mapping_key, entries) in snapshot.0 {
            tables.insert(mapping_key, entries.into_iter().collect());
        }
    }
}
