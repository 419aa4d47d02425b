//! PostgreSQL backend built on sqlx.
//!
//! Each [`PgSession`] wraps one dedicated `PgConnection` (not a pool
//! checkout) so session settings stay attached to the connection for the
//! whole run.
//!
//! Inserts are multi-row `VALUES` statements, split so no statement binds
//! more than [`MAX_BIND_PARAMS`](crate::db::statement::MAX_BIND_PARAMS)
//! values. Every placeholder is cast to its column's catalog type, read once
//! per table and session.

use crate::db::statement::quote;
use crate::db::{Connection, Database, InsertTemplate};
use crate::error::DbError;
use crate::model::{Key, Row, Value};
use async_trait::async_trait;
use log::LevelFilter;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, PgConnection, Postgres, Row as _, TypeInfo};
use std::collections::HashMap;

/// Connection factory for a PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    options: PgConnectOptions,
}

impl PgDatabase {
    pub fn new(url: &str) -> Result<Self, DbError> {
        let options: PgConnectOptions = url.parse()?;
        Ok(Self::from_options(options))
    }

    pub fn from_options(options: PgConnectOptions) -> Self {
        Self {
            options: options.log_statements(LevelFilter::Trace),
        }
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Connection = PgSession;

    async fn connect(&self) -> Result<PgSession, DbError> {
        let conn = self.options.connect().await?;
        Ok(PgSession {
            conn,
            column_types: HashMap::new(),
        })
    }
}

pub struct PgSession {
    conn: PgConnection,
    /// table -> column -> `format_type` output
    column_types: HashMap<String, HashMap<String, String>>,
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        // Text converts explicitly to every type, and the placeholder cast supplies the target.
        Value::Null => query.bind(None::<String>),
        Value::Integer(v) => query.bind(*v),
        Value::Decimal(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
    }
}

fn bind_rows<'q>(sql: &'q str, rows: &[Row]) -> Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for row in rows {
        for value in row {
            query = bind_value(query, value);
        }
    }
    query
}

async fn fetch_column_types(conn: &mut PgConnection, table: &str) -> Result<HashMap<String, String>, DbError> {
    let columns: Vec<(String, String)> = sqlx::query_as(
        r#"SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
           FROM pg_attribute a
           WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped"#,
    )
    .bind(quote(table))
    .fetch_all(conn)
    .await?;

    if columns.is_empty() {
        return Err(DbError::backend(format!("relation {} does not exist", table)));
    }
    log::debug!("read {} column types for {}", columns.len(), table);
    Ok(columns.into_iter().collect())
}

fn decode_key(row: &PgRow, index: usize) -> Result<Key, DbError> {
    let type_name = row.column(index).type_info().name().to_string();
    match type_name.as_str() {
        "INT2" => Ok(Key::Int(row.try_get::<i16, _>(index)?.into())),
        "INT4" => Ok(Key::Int(row.try_get::<i32, _>(index)?.into())),
        "INT8" => Ok(Key::Int(row.try_get::<i64, _>(index)?)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Ok(Key::Text(row.try_get::<String, _>(index)?)),
        "UUID" => Ok(Key::Text(row.try_get::<uuid::Uuid, _>(index)?.to_string())),
        other => Err(DbError::backend(format!(
            "column {} has type {}, which cannot be used as a key",
            row.column(index).name(),
            other
        ))),
    }
}

impl PgSession {
    /// Catalog types of `insert`'s columns, in column order.
    async fn column_types(&mut self, insert: &InsertTemplate) -> Result<Vec<String>, DbError> {
        if !self.column_types.contains_key(insert.table()) {
            let fetched = fetch_column_types(&mut self.conn, insert.table()).await?;
            self.column_types.insert(insert.table().to_string(), fetched);
        }

        let table_types = self
            .column_types
            .get(insert.table())
            .ok_or_else(|| DbError::backend(format!("no column types for {}", insert.table())))?;
        insert
            .columns()
            .iter()
            .map(|column| {
                table_types.get(column).cloned().ok_or_else(|| {
                    DbError::backend(format!(
                        "column {} of relation {} does not exist",
                        column,
                        insert.table()
                    ))
                })
            })
            .collect()
    }
}

#[async_trait]
impl Connection for PgSession {
    async fn begin(&mut self) -> Result<(), DbError> {
        sqlx::query("BEGIN").execute(&mut self.conn).await?;
        Ok(())
    }

    async fn execute_many(&mut self, insert: &InsertTemplate, rows: &[Row]) -> Result<u64, DbError> {
        let types = self.column_types(insert).await?;
        let mut affected = 0;

        for chunk in rows.chunks(insert.rows_per_statement()) {
            let sql = insert.sql_with_casts(chunk.len(), &types);
            affected += bind_rows(&sql, chunk).execute(&mut self.conn).await?.rows_affected();
        }

        log::trace!("inserted {} rows into {}", affected, insert.table());
        Ok(affected)
    }

    async fn insert_returning(&mut self, insert: &InsertTemplate, rows: &[Row]) -> Result<Vec<(Key, Key)>, DbError> {
        if insert.returned().is_none() {
            return Err(DbError::backend(format!(
                "insert into {} has no RETURNING clause",
                insert.table()
            )));
        }

        let types = self.column_types(insert).await?;
        let mut keys = Vec::with_capacity(rows.len());

        for chunk in rows.chunks(insert.rows_per_statement()) {
            let sql = insert.sql_with_casts(chunk.len(), &types);
            for row in bind_rows(&sql, chunk).fetch_all(&mut self.conn).await? {
                keys.push((decode_key(&row, 0)?, decode_key(&row, 1)?));
            }
        }

        log::trace!("inserted {} rows into {}", keys.len(), insert.table());
        Ok(keys)
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        sqlx::query("COMMIT").execute(&mut self.conn).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        sqlx::query("ROLLBACK").execute(&mut self.conn).await?;
        Ok(())
    }

    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), DbError> {
        // SET cannot take bind parameters; set_config can.
        sqlx::query("SELECT set_config($1, $2, false)")
            .bind(name)
            .bind(value)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn session_variable(&mut self, name: &str) -> Result<String, DbError> {
        let value: String = sqlx::query_scalar("SELECT current_setting($1)")
            .bind(name)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(value)
    }
}
