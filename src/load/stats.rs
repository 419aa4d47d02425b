//! Load statistics.
//!
//! Tracks rows and batches committed per table during a run.

use crate::load::registry::RegistrySnapshot;
use serde::Serialize;

/// Statistics for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    /// Rows committed by this run
    pub rows_inserted: u64,
    /// Batches committed by this run
    pub batches: usize,
    /// Completed by an earlier run and skipped on resume
    pub resumed: bool,
}

/// Statistics for a whole run, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub tables: Vec<TableReport>,
    pub rows_inserted: u64,
    pub batches: usize,
    pub tables_skipped: usize,
    /// Final key mappings of a successful run
    #[serde(skip)]
    pub id_mapping: RegistrySnapshot,
}

impl LoadReport {
    pub fn record(&mut self, table: TableReport) {
        self.rows_inserted += table.rows_inserted;
        self.batches += table.batches;
        if table.resumed {
            self.tables_skipped += 1;
        }
        self.tables.push(table);
    }

    /// Merge another report into this one by appending its tables and summing all counts.
    pub fn merge(&mut self, other: LoadReport) {
        for table in other.tables {
            self.record(table);
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// Rows this run inserted into `name`; 0 for unknown or resumed tables.
    pub fn rows_for(&self, name: &str) -> u64 {
        self.table(name).map(|t| t.rows_inserted).unwrap_or(0)
    }
}
