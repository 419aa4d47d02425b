//! Batch execution for a single table.
//!
//! A table's rows are split into contiguous batches of at most `batch_size`
//! rows. Each batch is one transaction:
//!
//! 1. `BEGIN`
//! 2. insert every row of the batch, returning generated keys when the
//!    table publishes them
//! 3. `COMMIT`, or `ROLLBACK` on any failure
//! 4. record the keys in the [`IdRegistry`]
//!
//! Keys are only recorded once their batch has committed, so the registry
//! never points at rows that were rolled back.
//!
//! # Modes
//!
//! - [`ExecutionMode::Sequential`]: one connection, batches in order, stops
//!   at the first failure.
//! - [`ExecutionMode::Concurrent`]: up to `workers` tasks drain a shared queue
//!   of batches. After a failure no new batch is started, in-flight batches
//!   finish, and every failure is reported.

use crate::db::{Connection, ConnectionPool, InsertTemplate};
use crate::error::{BatchFailure, DbError, LoadError};
use crate::load::registry::IdRegistry;
use crate::model::{Key, Row};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Concurrent { workers: usize },
}

impl ExecutionMode {
    pub fn for_concurrency(concurrency: usize) -> Self {
        if concurrency <= 1 {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Concurrent {
                workers: concurrency,
            }
        }
    }
}

/// A contiguous slice of a table's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    pub rows: Range<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Split `row_count` rows into `ceil(row_count / batch_size)` batches.
pub fn partition(row_count: usize, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    (0..row_count)
        .step_by(batch_size)
        .enumerate()
        .map(|(index, start)| Batch {
            index,
            rows: start..(start + batch_size).min(row_count),
        })
        .collect()
}

/// Where a batch's physical keys come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrigin {
    /// Generated by the database and returned by the batch's own insert.
    Generated,
    /// Supplied in the row at this column.
    Column(usize),
}

/// How to publish a table's keys after each batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCapture {
    pub mapping_key: String,
    pub logical_column: usize,
    pub origin: KeyOrigin,
}

/// One table, ready to insert: rows already rewritten.
#[derive(Debug)]
pub struct TableJob {
    pub table: String,
    pub insert: InsertTemplate,
    pub rows: Vec<Row>,
    pub batch_size: usize,
    pub capture: Option<KeyCapture>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableOutcome {
    pub rows_inserted: u64,
    pub batches: usize,
}

impl TableOutcome {
    fn add(&mut self, rows: u64) {
        self.rows_inserted += rows;
        self.batches += 1;
    }

    fn merge(&mut self, other: TableOutcome) {
        self.rows_inserted += other.rows_inserted;
        self.batches += other.batches;
    }
}

/// Why a table stopped, and what it committed before it did.
#[derive(Debug)]
pub struct TableFailure {
    pub error: LoadError,
    pub batch: Option<usize>,
    pub failures: Vec<BatchFailure>,
    pub committed: TableOutcome,
}

pub struct BatchExecutor<C> {
    pool: Arc<ConnectionPool<C>>,
    registry: Arc<IdRegistry>,
    cancel: CancellationToken,
    mode: ExecutionMode,
}

impl<C: Connection> BatchExecutor<C> {
    pub fn new(
        pool: Arc<ConnectionPool<C>>,
        registry: Arc<IdRegistry>,
        cancel: CancellationToken,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            pool,
            registry,
            cancel,
            mode,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Insert every row of `job`.
    pub async fn execute(&self, job: TableJob) -> Result<TableOutcome, TableFailure> {
        let batches = partition(job.rows.len(), job.batch_size);
        if batches.is_empty() {
            log::debug!("table {}: no rows", job.table);
            return Ok(TableOutcome::default());
        }

        check_keys(&job, &self.registry).map_err(|error| TableFailure {
            error,
            batch: None,
            failures: Vec::new(),
            committed: TableOutcome::default(),
        })?;

        match self.mode {
            ExecutionMode::Sequential => self.execute_sequential(job, batches).await,
            ExecutionMode::Concurrent { workers } => {
                self.execute_concurrent(Arc::new(job), batches, workers).await
            }
        }
    }

    async fn execute_sequential(&self, job: TableJob, batches: Vec<Batch>) -> Result<TableOutcome, TableFailure> {
        let total = batches.len();
        let mut committed = TableOutcome::default();

        let mut conn = self.pool.acquire().await.map_err(|error| TableFailure {
            error,
            batch: None,
            failures: Vec::new(),
            committed,
        })?;

        for batch in batches {
            if self.cancel.is_cancelled() {
                log::info!("table {}: cancelled before batch {}", job.table, batch.index);
                return Err(TableFailure {
                    error: LoadError::Cancelled,
                    batch: Some(batch.index),
                    failures: Vec::new(),
                    committed,
                });
            }

            match run_batch(&mut *conn, &job, &batch, &self.registry).await {
                Ok(rows) => {
                    committed.add(rows);
                    log::debug!("table {}: committed batch {}/{}", job.table, batch.index + 1, total);
                }
                Err(error) => {
                    log::error!("table {}: batch {} failed: {}", job.table, batch.index, error);
                    return Err(TableFailure {
                        failures: vec![batch_failure(&job.table, &batch, &error)],
                        batch: Some(batch.index),
                        error,
                        committed,
                    });
                }
            }
        }

        Ok(committed)
    }

    async fn execute_concurrent(
        &self,
        job: Arc<TableJob>,
        batches: Vec<Batch>,
        workers: usize,
    ) -> Result<TableOutcome, TableFailure> {
        let total = batches.len();
        let workers = workers.min(total).max(1);
        let queue = Arc::new(Mutex::new(VecDeque::from(batches)));
        let halted = Arc::new(AtomicBool::new(false));

        log::debug!("table {}: {} batches across {} workers", job.table, total, workers);

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let job = Arc::clone(&job);
            let queue = Arc::clone(&queue);
            let halted = Arc::clone(&halted);
            let pool = Arc::clone(&self.pool);
            let registry = Arc::clone(&self.registry);
            let cancel = self.cancel.clone();

            tasks.spawn(async move {
                let mut report = WorkerReport::default();

                while !halted.load(Ordering::SeqCst) {
                    if cancel.is_cancelled() {
                        report.cancelled = true;
                        halted.store(true, Ordering::SeqCst);
                        break;
                    }

                    let next = queue.lock().pop_front();
                    let Some(batch) = next else {
                        break;
                    };

                    let result = match pool.acquire().await {
                        Ok(mut conn) => run_batch(&mut *conn, &job, &batch, &registry).await,
                        Err(error) => Err(error),
                    };

                    match result {
                        Ok(rows) => {
                            report.committed.add(rows);
                            log::debug!(
                                "table {}: worker {} committed batch {}/{}",
                                job.table,
                                worker,
                                batch.index + 1,
                                total
                            );
                        }
                        Err(error) => {
                            log::error!("table {}: batch {} failed: {}", job.table, batch.index, error);
                            halted.store(true, Ordering::SeqCst);
                            report.failures.push((batch, error));
                        }
                    }
                }

                report
            });
        }

        let mut committed = TableOutcome::default();
        let mut cancelled = false;
        let mut failures: Vec<(Option<Batch>, LoadError)> = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    committed.merge(report.committed);
                    cancelled |= report.cancelled;
                    failures.extend(report.failures.into_iter().map(|(b, e)| (Some(b), e)));
                }
                Err(e) => {
                    log::error!("table {}: worker aborted: {}", job.table, e);
                    failures.push((
                        None,
                        LoadError::Worker {
                            table: job.table.clone(),
                            message: e.to_string(),
                        },
                    ));
                }
            }
        }

        if failures.is_empty() {
            if cancelled && !queue.lock().is_empty() {
                return Err(TableFailure {
                    error: LoadError::Cancelled,
                    batch: None,
                    failures: Vec::new(),
                    committed,
                });
            }
            return Ok(committed);
        }

        // Report in batch order; worker aborts (no batch) go last.
        failures.sort_by_key(|(batch, _)| batch.as_ref().map_or(usize::MAX, |b| b.index));
        let summaries = failures
            .iter()
            .map(|(batch, error)| match batch {
                Some(batch) => batch_failure(&job.table, batch, error),
                None => BatchFailure {
                    table: job.table.clone(),
                    batch: usize::MAX,
                    rows: 0,
                    message: error.to_string(),
                },
            })
            .collect();

        let (batch, error) = failures.swap_remove(0);
        Err(TableFailure {
            error,
            batch: batch.map(|b| b.index),
            failures: summaries,
            committed,
        })
    }
}

#[derive(Default)]
struct WorkerReport {
    committed: TableOutcome,
    failures: Vec<(Batch, LoadError)>,
    cancelled: bool,
}

fn batch_failure(table: &str, batch: &Batch, error: &LoadError) -> BatchFailure {
    BatchFailure {
        table: table.to_string(),
        batch: batch.index,
        rows: batch.len(),
        message: error.to_string(),
    }
}

fn logical_key(job: &TableJob, row: &Row, column: usize) -> Result<Key, LoadError> {
    let value = &row[column];
    Key::from_value(value).ok_or_else(|| LoadError::UnsupportedKey {
        table: job.table.clone(),
        column: job.insert.columns()[column].clone(),
        value: value.to_string(),
    })
}

/// Checked for the whole table before its first batch runs.
///
/// Logical keys must be usable, unique within the table and not already
/// published. Supplied physical keys must be usable.
fn check_keys(job: &TableJob, registry: &IdRegistry) -> Result<(), LoadError> {
    let Some(capture) = &job.capture else {
        return Ok(());
    };

    let mut seen = HashSet::with_capacity(job.rows.len());
    for row in &job.rows {
        let key = logical_key(job, row, capture.logical_column)?;
        if registry.contains(&capture.mapping_key, &key) || !seen.insert(key.clone()) {
            return Err(LoadError::DuplicateKey {
                mapping_key: capture.mapping_key.clone(),
                key,
            });
        }
        if let KeyOrigin::Column(column) = capture.origin {
            logical_key(job, row, column)?;
        }
    }
    Ok(())
}

/// Run one batch in its own transaction. Returns the number of rows inserted.
pub async fn run_batch<C: Connection>(
    conn: &mut C,
    job: &TableJob,
    batch: &Batch,
    registry: &IdRegistry,
) -> Result<u64, LoadError> {
    let failed = |source: DbError| LoadError::BatchExecution {
        table: job.table.clone(),
        batch: batch.index,
        source,
    };

    conn.begin().await.map_err(failed)?;

    let (inserted, keys) = match insert_and_capture(conn, job, batch).await {
        Ok(result) => result,
        Err(e) => {
            rollback(conn, job, batch).await;
            return Err(e);
        }
    };

    if let Err(e) = conn.commit().await {
        rollback(conn, job, batch).await;
        return Err(failed(e));
    }

    if let Some(capture) = &job.capture {
        registry.record_all(&capture.mapping_key, keys)?;
    }
    Ok(inserted)
}

async fn rollback<C: Connection>(conn: &mut C, job: &TableJob, batch: &Batch) {
    if let Err(e) = conn.rollback().await {
        log::warn!("table {}: rollback of batch {} failed: {}", job.table, batch.index, e);
    }
}

async fn insert_and_capture<C: Connection>(
    conn: &mut C,
    job: &TableJob,
    batch: &Batch,
) -> Result<(u64, Vec<(Key, Key)>), LoadError> {
    let failed = |source: DbError| LoadError::BatchExecution {
        table: job.table.clone(),
        batch: batch.index,
        source,
    };

    let rows = &job.rows[batch.rows.clone()];

    let Some(capture) = &job.capture else {
        let inserted = conn.execute_many(&job.insert, rows).await.map_err(failed)?;
        return Ok((inserted, Vec::new()));
    };

    let logical = rows
        .iter()
        .map(|row| logical_key(job, row, capture.logical_column))
        .collect::<Result<Vec<_>, _>>()?;

    match &capture.origin {
        KeyOrigin::Column(column) => {
            let inserted = conn.execute_many(&job.insert, rows).await.map_err(failed)?;
            let mut pairs = Vec::with_capacity(rows.len());
            for (row, logical) in rows.iter().zip(logical) {
                pairs.push((logical, logical_key(job, row, *column)?));
            }
            Ok((inserted, pairs))
        }
        KeyOrigin::Generated => {
            let returned = conn.insert_returning(&job.insert, rows).await.map_err(failed)?;

            let mut physical = HashMap::with_capacity(returned.len());
            for (key, id) in returned {
                if physical.insert(key.clone(), id).is_some() {
                    return Err(LoadError::DuplicateKey {
                        mapping_key: capture.mapping_key.clone(),
                        key,
                    });
                }
            }

            let mut pairs = Vec::with_capacity(logical.len());
            for key in logical {
                let id = physical.remove(&key).ok_or_else(|| {
                    failed(DbError::backend(format!(
                        "no generated key returned for logical key {}",
                        key
                    )))
                })?;
                pairs.push((key, id));
            }
            Ok((pairs.len() as u64, pairs))
        }
    }
}
