//! The load coordinator.
//!
//! [`BulkLoader::run`] drives a whole load:
//!
//! 1. validate and order the tables (no connection is opened before this passes)
//! 2. load the checkpoint, when resumable
//! 3. open the connection pool and apply session settings
//! 4. for each table in order: check cancellation, rewrite foreign keys,
//!    execute batches, save the checkpoint
//! 5. restore session settings, whatever happened in step 4
//! 6. clear the checkpoint once every table has committed
//!
//! Tables are a strict barrier: a table starts only after every batch of the
//! previous table committed and published its keys.

use crate::config::LoaderConfig;
use crate::db::{ConnectionPool, Database};
use crate::error::{LoadError, LoadFailure};
use crate::load::checkpoint::{Checkpoint, CheckpointStore};
use crate::load::executor::{BatchExecutor, ExecutionMode, TableJob};
use crate::load::plan::{LoadPlan, TablePlan};
use crate::load::registry::IdRegistry;
use crate::load::rewriter::rewrite_rows;
use crate::load::stats::{LoadReport, TableReport};
use crate::model::TableConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct BulkLoader<D: Database> {
    db: D,
    config: LoaderConfig,
    cancel: CancellationToken,
}

impl<D: Database> BulkLoader<D> {
    pub fn new(db: D, config: LoaderConfig) -> Self {
        Self {
            db,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run at the next batch or table boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    /// Load `tables`, parents before children.
    ///
    /// On failure the returned [`LoadFailure`] names the failing table and
    /// batch and carries the report of everything that did commit. Committed
    /// batches are never rolled back.
    pub async fn run(&self, tables: Vec<TableConfig>) -> Result<LoadReport, LoadFailure> {
        let run_id = Uuid::new_v4();

        let plan = LoadPlan::build(tables, self.config.batch_size).inspect_err(|e| {
            log::error!("run {}: invalid load plan: {}", run_id, e);
        })?;
        log::info!(
            "run {}: loading {} tables in order: {}",
            run_id,
            plan.len(),
            plan.table_names().join(", ")
        );

        let store = self
            .config
            .resumable
            .then(|| CheckpointStore::new(&self.config.checkpoint_path));
        let checkpoint = match &store {
            Some(store) => store.load(&plan.fingerprint),
            None => Checkpoint::empty(),
        };
        let completed = checkpoint.completed_table_count.min(plan.len());
        let registry = Arc::new(IdRegistry::from_snapshot(checkpoint.id_mapping));

        let pool = Arc::new(ConnectionPool::open(&self.db, self.config.concurrency.max(1)).await?);
        let optimizer = self.config.session_optimizer();
        let saved = optimizer.apply(&pool).await?;

        let mode = ExecutionMode::for_concurrency(self.config.concurrency);
        let executor = BatchExecutor::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            self.cancel.clone(),
            mode,
        );
        log::debug!("run {}: executing with {:?}", run_id, mode);

        let result = self
            .load_tables(run_id, plan, completed, &executor, &registry, store.as_ref())
            .await;

        optimizer.restore(&pool, &saved).await;

        match result {
            Ok(report) => {
                if let Some(store) = &store {
                    store.clear();
                }
                log::info!(
                    "run {}: loaded {} rows in {} batches ({} tables resumed)",
                    run_id,
                    report.rows_inserted,
                    report.batches,
                    report.tables_skipped
                );
                Ok(report)
            }
            Err(failure) => {
                if failure.is_cancelled() {
                    log::warn!("run {}: cancelled", run_id);
                } else {
                    log::error!("run {}: failed: {}", run_id, failure);
                }
                Err(failure)
            }
        }
    }

    async fn load_tables(
        &self,
        run_id: Uuid,
        plan: LoadPlan,
        completed: usize,
        executor: &BatchExecutor<D::Connection>,
        registry: &IdRegistry,
        store: Option<&CheckpointStore>,
    ) -> Result<LoadReport, LoadFailure> {
        let LoadPlan { tables, fingerprint } = plan;
        let total = tables.len();
        let mut report = LoadReport::default();

        for (index, table) in tables.into_iter().enumerate() {
            if index < completed {
                log::info!("run {}: skipping {} (completed by an earlier run)", run_id, table.name);
                report.record(TableReport {
                    table: table.name,
                    resumed: true,
                    ..Default::default()
                });
                continue;
            }

            if self.cancel.is_cancelled() {
                return Err(LoadFailure::new(LoadError::Cancelled)
                    .in_table(table.name)
                    .with_report(report));
            }

            let name = table.name.clone();
            let job = match prepare_job(table, registry) {
                Ok(job) => job,
                Err(e) => {
                    return Err(LoadFailure::new(e).in_table(name).with_report(report));
                }
            };

            log::info!(
                "run {}: table {} ({}/{}): {} rows",
                run_id,
                name,
                index + 1,
                total,
                job.rows.len()
            );

            match executor.execute(job).await {
                Ok(outcome) => {
                    report.record(TableReport {
                        table: name.clone(),
                        rows_inserted: outcome.rows_inserted,
                        batches: outcome.batches,
                        resumed: false,
                    });
                    log::info!(
                        "run {}: table {} done ({} rows, {} batches)",
                        run_id,
                        name,
                        outcome.rows_inserted,
                        outcome.batches
                    );

                    if let Some(store) = store {
                        save_checkpoint(store, Checkpoint::new(index + 1, registry.snapshot(), &fingerprint)).await;
                    }
                }
                Err(failure) => {
                    report.record(TableReport {
                        table: name.clone(),
                        rows_inserted: failure.committed.rows_inserted,
                        batches: failure.committed.batches,
                        resumed: false,
                    });
                    return Err(LoadFailure::new(failure.error)
                        .in_table(name)
                        .at_batch(failure.batch)
                        .with_batch_failures(failure.failures)
                        .with_report(report));
                }
            }
        }

        report.id_mapping = registry.snapshot();
        Ok(report)
    }
}

/// Rewrite the table's foreign keys; the whole table is rewritten before any row is inserted.
fn prepare_job(table: TablePlan, registry: &IdRegistry) -> Result<TableJob, LoadError> {
    let rows = if table.links.is_empty() {
        table.rows
    } else {
        rewrite_rows(&table.name, &table.rows, &table.links, registry)?
    };

    Ok(TableJob {
        table: table.name,
        insert: table.insert,
        rows,
        batch_size: table.batch_size,
        capture: table.capture,
    })
}

async fn save_checkpoint(store: &CheckpointStore, checkpoint: Checkpoint) {
    let store = store.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || store.save(&checkpoint)).await {
        log::warn!("checkpoint writer aborted: {}", e);
    }
}
