//! Database collaborator consumed by the loader.
//!
//! The loader never talks to a driver directly. It opens connections through a
//! [`Database`] and drives transactions through [`Connection`]. Statements are
//! always built from validated identifiers ([`InsertTemplate`]) and row
//! values are always bound as parameters.
//!
//! - [`postgres`]: sqlx-backed PostgreSQL implementation
//! - [`pool`]: fixed-size connection pool shared by the executor's workers
//! - [`statement`]: parameterized statement builders

pub mod pool;
pub mod postgres;
pub mod statement;

use crate::error::DbError;
use crate::model::{Key, Row};
use async_trait::async_trait;

pub use pool::{ConnectionPool, PooledConnection};
pub use postgres::{PgDatabase, PgSession};
pub use statement::{InsertTemplate, Returning};

/// Opens independent connections to the target database.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self) -> Result<Self::Connection, DbError>;
}

/// A single exclusive database session.
#[async_trait]
pub trait Connection: Send + 'static {
    async fn begin(&mut self) -> Result<(), DbError>;

    /// Insert every row; returns rows affected.
    async fn execute_many(&mut self, insert: &InsertTemplate, rows: &[Row]) -> Result<u64, DbError>;

    /// Insert every row and return the `(logical key, generated key)` pair of
    /// each row this call wrote. `insert` must carry a [`Returning`] clause.
    async fn insert_returning(&mut self, insert: &InsertTemplate, rows: &[Row]) -> Result<Vec<(Key, Key)>, DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;

    async fn set_session_variable(&mut self, name: &str, value: &str) -> Result<(), DbError>;

    /// Current value of a session variable.
    async fn session_variable(&mut self, name: &str) -> Result<String, DbError>;
}
