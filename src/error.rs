use crate::load::stats::LoadReport;
use crate::model::Key;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a database backend.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{0}")]
    Backend(String),
}

impl DbError {
    pub fn backend(message: impl Into<String>) -> Self {
        DbError::Backend(message.into())
    }
}

/// Everything that can stop a load.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot connect to database: {0}")]
    Connection(#[source] DbError),

    #[error("dependency cycle between tables: {}", tables.join(", "))]
    DependencyCycle { tables: Vec<String> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no physical key recorded in {parent} for logical key {key}")]
    MissingMapping { parent: String, key: Key },

    #[error("logical key {key} is already mapped in {mapping_key}")]
    DuplicateKey { mapping_key: String, key: Key },

    #[error("table {table}, column {column}: {value} cannot be used as a key")]
    UnsupportedKey {
        table: String,
        column: String,
        value: String,
    },

    #[error("table {table}: batch {batch} failed: {source}")]
    BatchExecution {
        table: String,
        batch: usize,
        #[source]
        source: DbError,
    },

    #[error("session settings could not be applied: {0}")]
    Session(#[source] DbError),

    #[error("worker for table {table} aborted: {message}")]
    Worker { table: String, message: String },

    #[error("load cancelled")]
    Cancelled,

    #[error("checkpoint {}: {message}", path.display())]
    CheckpointIo { path: PathBuf, message: String },
}

/// One failed batch, kept in the failure payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub table: String,
    pub batch: usize,
    pub rows: usize,
    pub message: String,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table {} batch {} ({} rows): {}",
            self.table, self.batch, self.rows, self.message
        )
    }
}

/// The structured failure returned by [`crate::BulkLoader::run`].
///
/// Identifies the table and batch that failed (when the failure is tied to
/// one), every batch failure observed before the run stopped, and the work
/// that did commit.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct LoadFailure {
    #[source]
    pub error: LoadError,
    pub table: Option<String>,
    pub batch: Option<usize>,
    pub batch_failures: Vec<BatchFailure>,
    pub report: LoadReport,
}

impl LoadFailure {
    pub fn new(error: LoadError) -> Self {
        Self {
            error,
            table: None,
            batch: None,
            batch_failures: Vec::new(),
            report: LoadReport::default(),
        }
    }

    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn at_batch(mut self, batch: Option<usize>) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_batch_failures(mut self, failures: Vec<BatchFailure>) -> Self {
        self.batch_failures = failures;
        self
    }

    pub fn with_report(mut self, report: LoadReport) -> Self {
        self.report = report;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, LoadError::Cancelled)
    }
}

impl From<LoadError> for LoadFailure {
    fn from(error: LoadError) -> Self {
        LoadFailure::new(error)
    }
}
