//! Table configurations and row values supplied by callers.
//!
//! A load is described as a list of [`TableConfig`]s. Each table names its
//! columns, carries its rows, and declares which of its columns hold logical
//! keys of parent tables. Tables that other tables point at publish their
//! physical keys under an `id_mapping_key`.

use crate::error::LoadError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// A single scalar field of a row.
///
/// Serialized untagged: `null`, integers, floats, strings. Strings that parse
/// as RFC 3339 timestamps deserialize as [`Value::Timestamp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    /// Binary floating point, bound as double precision.
    Decimal(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Text(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Decimal(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Int(v) => Value::Integer(v),
            Key::Text(v) => Value::Text(v),
        }
    }
}

/// The subset of [`Value`] usable as a logical or physical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Convert a row value into a key. NULL, decimals and timestamps are not keys.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Integer(v) => Some(Key::Int(*v)),
            Value::Text(v) => Some(Key::Text(v.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{}", v),
            Key::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

/// Fixed-arity tuple aligned positionally with a table's columns.
pub type Row = Vec<Value>;

/// A foreign key declared by a child table: `column` holds logical keys of `parent_table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub column: String,
    pub parent_table: String,
}

/// Where a table's physical keys come from once its rows are inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeySource {
    /// Assigned by the database; read back from `id_column` after insertion.
    Generated { id_column: String },
    /// Supplied by the row itself at column index `column`.
    Supplied { column: usize },
}

impl Default for KeySource {
    fn default() -> Self {
        KeySource::Generated {
            id_column: "id".to_string(),
        }
    }
}

/// Everything the loader needs to insert one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Row>,
    /// Rows per batch; falls back to the run-wide batch size.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Scales the run-wide batch size when `batch_size` is unset.
    #[serde(default)]
    pub batch_multiplier: Option<f64>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Registry key this table's physical keys are published under.
    #[serde(default)]
    pub id_mapping_key: Option<String>,
    /// Column holding each row's logical key.
    #[serde(default)]
    pub mapping_key_column: usize,
    #[serde(default)]
    pub physical_key: KeySource,
}

impl TableConfig {
    pub fn new<S: Into<String>>(name: impl Into<String>, columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
            batch_size: None,
            batch_multiplier: None,
            dependencies: Vec::new(),
            id_mapping_key: None,
            mapping_key_column: 0,
            physical_key: KeySource::default(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_batch_multiplier(mut self, multiplier: f64) -> Self {
        self.batch_multiplier = Some(multiplier);
        self
    }

    pub fn depends_on(mut self, column: impl Into<String>, parent_table: impl Into<String>) -> Self {
        self.dependencies.push(Dependency {
            column: column.into(),
            parent_table: parent_table.into(),
        });
        self
    }

    /// Publish this table's physical keys under `mapping_key`.
    pub fn publish_keys(mut self, mapping_key: impl Into<String>) -> Self {
        self.id_mapping_key = Some(mapping_key.into());
        self
    }

    pub fn with_mapping_key_column(mut self, column: usize) -> Self {
        self.mapping_key_column = column;
        self
    }

    pub fn with_physical_key(mut self, source: KeySource) -> Self {
        self.physical_key = source;
        self
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// Batch size for this table given the run-wide default.
    pub fn effective_batch_size(&self, default: usize) -> usize {
        if let Some(size) = self.batch_size {
            return size;
        }
        match self.batch_multiplier {
            Some(multiplier) if multiplier.is_finite() && multiplier > 0.0 => {
                ((default as f64 * multiplier) as usize).max(1)
            }
            _ => default,
        }
    }

    /// Check the table's shape. Cross-table checks live in the resolver.
    pub fn validate(&self) -> Result<(), LoadError> {
        let invalid = |message: String| LoadError::InvalidConfig(format!("table {}: {}", self.name, message));

        if self.name.is_empty() {
            return Err(LoadError::InvalidConfig("table name is empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(invalid("no columns".to_string()));
        }
        if self.batch_size == Some(0) {
            return Err(invalid("batch_size must be positive".to_string()));
        }
        if self.mapping_key_column >= self.columns.len() {
            return Err(invalid(format!(
                "mapping_key_column {} is out of range",
                self.mapping_key_column
            )));
        }
        if let KeySource::Supplied { column } = self.physical_key {
            if column >= self.columns.len() {
                return Err(invalid(format!("physical key column {} is out of range", column)));
            }
        }
        for dependency in &self.dependencies {
            if self.column_index(&dependency.column).is_none() {
                return Err(invalid(format!(
                    "dependency column {} is not a declared column",
                    dependency.column
                )));
            }
        }
        if let Some(position) = self.rows.iter().position(|row| row.len() != self.columns.len()) {
            return Err(invalid(format!(
                "row {} has {} fields, expected {}",
                position,
                self.rows[position].len(),
                self.columns.len()
            )));
        }
        Ok(())
    }
}

/// A JSON load manifest: `{"tables": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadManifest {
    pub tables: Vec<TableConfig>,
}

impl LoadManifest {
    pub fn from_json(json: &str) -> Result<Self, LoadError> {
        serde_json::from_str(json)
            .map_err(|e| LoadError::InvalidConfig(format!("invalid manifest: {}", e)))
    }

    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            LoadError::InvalidConfig(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }
}
