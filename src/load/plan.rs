//! Validated, ordered load plan.
//!
//! Turns caller-supplied [`TableConfig`]s into [`TablePlan`]s: tables in
//! insertion order, insert statements built, foreign keys linked to their
//! parents' mapping keys and key capture decided. Everything here runs before
//! a connection is opened, so configuration errors never touch the database.

use crate::db::InsertTemplate;
use crate::error::LoadError;
use crate::load::checkpoint::plan_fingerprint;
use crate::load::executor::{KeyCapture, KeyOrigin};
use crate::load::resolver;
use crate::load::rewriter::{ForeignKeyLink, plan_links};
use crate::model::{KeySource, Row, TableConfig};

#[derive(Debug)]
pub struct TablePlan {
    pub name: String,
    pub insert: InsertTemplate,
    pub links: Vec<ForeignKeyLink>,
    pub capture: Option<KeyCapture>,
    pub batch_size: usize,
    pub rows: Vec<Row>,
}

#[derive(Debug)]
pub struct LoadPlan {
    /// Tables in insertion order
    pub tables: Vec<TablePlan>,
    pub fingerprint: String,
}

impl LoadPlan {
    /// Validate and order `tables`, using `default_batch_size` where a table has none.
    pub fn build(tables: Vec<TableConfig>, default_batch_size: usize) -> Result<Self, LoadError> {
        for table in &tables {
            table.validate()?;
        }

        let ordered = resolver::resolve(tables)?;
        let fingerprint = plan_fingerprint(&ordered);

        let mut prepared = Vec::with_capacity(ordered.len());
        for table in &ordered {
            let links = plan_links(table, &ordered)?;
            let mut insert = InsertTemplate::new(&table.name, &table.columns)?;
            let capture = key_capture(table);
            if let (Some(_), KeySource::Generated { id_column }) = (&capture, &table.physical_key) {
                insert = insert.returning(&table.columns[table.mapping_key_column], id_column)?;
            }
            prepared.push((links, insert, capture));
        }

        let tables = ordered
            .into_iter()
            .zip(prepared)
            .map(|(table, (links, insert, capture))| TablePlan {
                batch_size: table.effective_batch_size(default_batch_size),
                name: table.name,
                insert,
                links,
                capture,
                rows: table.rows,
            })
            .collect();

        Ok(Self { tables, fingerprint })
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

fn key_capture(table: &TableConfig) -> Option<KeyCapture> {
    let mapping_key = table.id_mapping_key.as_ref()?;

    let origin = match &table.physical_key {
        KeySource::Generated { .. } => KeyOrigin::Generated,
        KeySource::Supplied { column } => KeyOrigin::Column(*column),
    };

    Some(KeyCapture {
        mapping_key: mapping_key.clone(),
        logical_column: table.mapping_key_column,
        origin,
    })
}
