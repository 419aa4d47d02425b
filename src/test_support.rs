//! In-memory [`Database`] for tests.
//!
//! [`MemoryDatabase`] behaves like a small transactional store: tables are
//! created on first insert, rows get auto-increment ids at insert time, and
//! uncommitted rows are visible only to the connection that wrote them. It
//! also records what the loader did (statements, batch sizes, session
//! settings) and can inject failures.

use crate::db::{Connection, Database, InsertTemplate};
use crate::error::DbError;
use crate::model::{Key, Row, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Session variables every new connection starts with.
const DEFAULT_SESSION: &[(&str, &str)] = &[
    ("synchronous_commit", "on"),
    ("session_replication_role", "origin"),
    ("lock_timeout", "0"),
    ("work_mem", "4MB"),
];

#[derive(Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<(i64, Row)>,
    next_id: i64,
}

impl MemoryTable {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    connections_opened: usize,
    refuse_connections: bool,
    failing_values: Vec<(String, usize, Value)>,
    /// `(connection, setting)`; no connection means every connection
    failing_settings: Vec<(Option<usize>, String)>,
    cancel_on_insert: Vec<(String, CancellationToken)>,
    sessions: HashMap<usize, HashMap<String, String>>,
    session_writes: usize,
    insert_batches: HashMap<String, Vec<usize>>,
    latency: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every new connection.
    pub fn fail_connections(&self) {
        self.state.lock().refuse_connections = true;
    }

    /// Fail any insert into `table` whose row holds `value` at `column`.
    pub fn fail_on_value(&self, table: &str, column: usize, value: impl Into<Value>) {
        self.state
            .lock()
            .failing_values
            .push((table.to_string(), column, value.into()));
    }

    /// Fail writes of session variable `name` on connection `connection`.
    pub fn fail_session_variable(&self, connection: usize, name: &str) {
        self.state
            .lock()
            .failing_settings
            .push((Some(connection), name.to_string()));
    }

    /// Reject writes of session variable `name` on every connection, as a
    /// server does for a role lacking the privilege.
    pub fn deny_session_variable(&self, name: &str) {
        self.state.lock().failing_settings.push((None, name.to_string()));
    }

    /// Cancel `token` after the first successful insert into `table`.
    pub fn cancel_on_insert(&self, table: &str, token: CancellationToken) {
        self.state
            .lock()
            .cancel_on_insert
            .push((table.to_string(), token));
    }

    /// Sleep this long in every insert, so concurrent batches overlap.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = Some(latency);
        self
    }

    /// Drop every injected failure and cancellation hook.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.refuse_connections = false;
        state.failing_values.clear();
        state.failing_settings.clear();
        state.cancel_on_insert.clear();
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    /// Number of successful insert calls against `table`.
    pub fn insert_statements(&self, table: &str) -> usize {
        self.insert_batch_sizes(table).len()
    }

    /// Row count of each successful insert call against `table`, in call order.
    pub fn insert_batch_sizes(&self, table: &str) -> Vec<usize> {
        self.state
            .lock()
            .insert_batches
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Committed rows of `table`, in id order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| {
                let mut rows = t.rows.clone();
                rows.sort_by_key(|(id, _)| *id);
                rows.into_iter().map(|(_, row)| row).collect()
            })
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Committed `(id, value of column)` pairs of `table`, in id order.
    pub fn column(&self, table: &str, column: &str) -> Vec<(i64, Value)> {
        let state = self.state.lock();
        let Some(t) = state.tables.get(table) else {
            return Vec::new();
        };
        let Some(index) = t.columns.iter().position(|c| c == column) else {
            return Vec::new();
        };
        let mut values: Vec<(i64, Value)> = t
            .rows
            .iter()
            .map(|(id, row)| (*id, row[index].clone()))
            .collect();
        values.sort_by_key(|(id, _)| *id);
        values
    }

    /// Current value of a session variable on connection `connection`.
    pub fn session_value(&self, connection: usize, name: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .sessions
            .get(&connection)
            .and_then(|session| session.get(name))
            .cloned()
    }

    /// Number of successful session variable writes across all connections.
    pub fn session_writes(&self) -> usize {
        self.state.lock().session_writes
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, DbError> {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return Err(DbError::backend("connection refused"));
        }

        let id = state.connections_opened;
        state.connections_opened += 1;
        state.sessions.insert(
            id,
            DEFAULT_SESSION
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        );

        Ok(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            transaction: None,
        })
    }
}

struct PendingInsert {
    table: String,
    rows: Vec<(i64, Row)>,
}

pub struct MemoryConnection {
    id: usize,
    state: Arc<Mutex<State>>,
    transaction: Option<Vec<PendingInsert>>,
}

impl MemoryConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Insert `rows` and return their `(logical key, id)` pairs when `insert` asks for them.
    fn insert(&mut self, insert: &InsertTemplate, rows: &[Row]) -> Result<Vec<(Key, Key)>, DbError> {
        let mut state = self.state.lock();

        for row in rows {
            if row.len() != insert.arity() {
                return Err(DbError::backend(format!(
                    "expected {} values, got {}",
                    insert.arity(),
                    row.len()
                )));
            }
            let injected = state.failing_values.iter().any(|(table, column, value)| {
                table == insert.table() && row.get(*column) == Some(value)
            });
            if injected {
                return Err(DbError::backend(format!(
                    "injected failure inserting into {}",
                    insert.table()
                )));
            }
        }

        let table = state.tables.entry(insert.table().to_string()).or_default();
        if table.columns.is_empty() {
            table.columns = insert.columns().to_vec();
        } else if table.columns != insert.columns() {
            return Err(DbError::backend(format!(
                "column list does not match table {}",
                insert.table()
            )));
        }

        let inserted: Vec<(i64, Row)> = rows
            .iter()
            .map(|row| (table.allocate_id(), row.clone()))
            .collect();

        let mut returned = Vec::new();
        if let Some(returning) = insert.returned() {
            let position = |column: &str| insert.columns().iter().position(|c| c == column);
            let key_index = position(&returning.key_column).ok_or_else(|| {
                DbError::backend(format!("column {} does not exist", returning.key_column))
            })?;
            // An id column that was not inserted explicitly is the auto-increment id.
            let id_index = position(&returning.id_column);

            for (id, row) in &inserted {
                let key = Key::from_value(&row[key_index])
                    .ok_or_else(|| DbError::backend("key column holds a non-key value"))?;
                let physical = match id_index {
                    Some(index) => Key::from_value(&row[index])
                        .ok_or_else(|| DbError::backend("id column holds a non-key value"))?,
                    None => Key::Int(*id),
                };
                returned.push((key, physical));
            }
        }

        match &mut self.transaction {
            Some(pending) => pending.push(PendingInsert {
                table: insert.table().to_string(),
                rows: inserted,
            }),
            None => table.rows.extend(inserted),
        }

        state
            .insert_batches
            .entry(insert.table().to_string())
            .or_default()
            .push(rows.len());
        for (table, token) in &state.cancel_on_insert {
            if table == insert.table() {
                token.cancel();
            }
        }

        Ok(returned)
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), DbError> {
        if self.transaction.is_some() {
            return Err(DbError::backend("transaction already in progress"));
        }
        self.transaction = Some(Vec::new());
        Ok(())
    }

    async fn execute_many(&mut self, insert: &InsertTemplate, rows: &[Row]) -> Result<u64, DbError> {
        self.delay().await;
        self.insert(insert, rows)?;
        Ok(rows.len() as u64)
    }

    async fn insert_returning(&mut self, insert: &InsertTemplate, rows: &[Row]) -> Result<Vec<(Key, Key)>, DbError> {
        if insert.returned().is_none() {
            return Err(DbError::backend("insert has no RETURNING clause"));
        }
        self.delay().await;
        self.insert(insert, rows)
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let pending = self
            .transaction
            .take()
            .ok_or_else(|| DbError::backend("no transaction in progress"))?;

        let mut state = self.state.lock();
        for insert in pending {
            state
                .tables
                .entry(insert.table)
                .or_default()
                .rows
                .extend(insert.rows);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.transaction = None;
        Ok(())
    }

    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if state
            .failing_settings
            .iter()
            .any(|(conn, setting)| conn.is_none_or(|conn| conn == self.id) && setting == name)
        {
            return Err(DbError::backend(format!("permission denied to set {}", name)));
        }

        state
            .sessions
            .entry(self.id)
            .or_default()
            .insert(name.to_string(), value.to_string());
        state.session_writes += 1;
        Ok(())
    }

    async fn session_variable(&mut self, name: &str) -> Result<String, DbError> {
        self.state
            .lock()
            .sessions
            .get(&self.id)
            .and_then(|session| session.get(name))
            .cloned()
            .ok_or_else(|| DbError::backend(format!("unrecognized configuration parameter {}", name)))
    }
}
