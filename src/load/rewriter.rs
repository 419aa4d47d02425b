//! Foreign-key rewriting.
//!
//! Child rows arrive holding their parents' logical keys. Before any of a
//! table's rows are inserted, every dependency column is replaced with the
//! physical key the parent's batches recorded in the [`IdRegistry`].

use crate::error::LoadError;
use crate::load::registry::IdRegistry;
use crate::model::{Key, Row, TableConfig, Value};
use rayon::prelude::*;
use std::collections::HashMap;

/// A resolved dependency: which column to rewrite and where its keys live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyLink {
    pub column_index: usize,
    pub column: String,
    pub parent_table: String,
    /// The parent's `id_mapping_key`.
    pub mapping_key: String,
}

/// Resolve `table`'s dependencies against the tables of the run.
///
/// Every referenced parent must publish its keys, otherwise there is nothing
/// to rewrite against.
pub fn plan_links(table: &TableConfig, all: &[TableConfig]) -> Result<Vec<ForeignKeyLink>, LoadError> {
    let mapping_keys: HashMap<&str, Option<&str>> = all
        .iter()
        .map(|t| (t.name.as_str(), t.id_mapping_key.as_deref()))
        .collect();

    table
        .dependencies
        .iter()
        .map(|dependency| {
            let column_index = table.column_index(&dependency.column).ok_or_else(|| {
                LoadError::InvalidConfig(format!(
                    "table {}: dependency column {} is not a declared column",
                    table.name, dependency.column
                ))
            })?;

            let mapping_key = match mapping_keys.get(dependency.parent_table.as_str()) {
                Some(Some(key)) => key.to_string(),
                Some(None) => {
                    return Err(LoadError::InvalidConfig(format!(
                        "table {} references {}, which does not publish an id_mapping_key",
                        table.name, dependency.parent_table
                    )));
                }
                None => {
                    return Err(LoadError::InvalidConfig(format!(
                        "table {} depends on unknown table {}",
                        table.name, dependency.parent_table
                    )));
                }
            };

            Ok(ForeignKeyLink {
                column_index,
                column: dependency.column.clone(),
                parent_table: dependency.parent_table.clone(),
                mapping_key,
            })
        })
        .collect()
}

/// Rewrite one row. NULL foreign keys are optional relations and stay NULL.
pub fn rewrite_row(
    table: &str,
    row: &Row,
    links: &[ForeignKeyLink],
    registry: &IdRegistry,
) -> Result<Row, LoadError> {
    let mut rewritten = row.clone();

    for link in links {
        let value = &row[link.column_index];
        if value.is_null() {
            continue;
        }

        let logical = Key::from_value(value).ok_or_else(|| LoadError::UnsupportedKey {
            table: table.to_string(),
            column: link.column.clone(),
            value: value.to_string(),
        })?;

        let physical = registry
            .resolve(&link.mapping_key, &logical)
            .map_err(|_| LoadError::MissingMapping {
                parent: link.parent_table.clone(),
                key: logical,
            })?;
        rewritten[link.column_index] = Value::from(physical);
    }

    Ok(rewritten)
}

/// Rewrite every row of a table. Fails as a whole if any row cannot be rewritten.
pub fn rewrite_rows(
    table: &str,
    rows: &[Row],
    links: &[ForeignKeyLink],
    registry: &IdRegistry,
) -> Result<Vec<Row>, LoadError> {
    if links.is_empty() {
        return Ok(rows.to_vec());
    }

    rows.par_iter()
        .map(|row| rewrite_row(table, row, links, registry))
        .collect()
}
