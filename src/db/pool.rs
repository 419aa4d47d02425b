//! Fixed-size connection pool for the executor's workers.
//!
//! All connections are opened up front, so a database that cannot be reached
//! fails the run before any table starts. A [`PooledConnection`] guard hands
//! its connection back on drop, on every exit path.

use crate::db::{Connection, Database};
use crate::error::{DbError, LoadError};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ConnectionPool<C> {
    idle: Mutex<Vec<(usize, C)>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl<C: Connection> ConnectionPool<C> {
    /// Open `size` connections. Fails with [`LoadError::Connection`] if any cannot be opened.
    pub async fn open<D>(db: &D, size: usize) -> Result<Self, LoadError>
    where
        D: Database<Connection = C>,
    {
        let size = size.max(1);
        let mut idle = Vec::with_capacity(size);
        for id in 0..size {
            let conn = db.connect().await.map_err(LoadError::Connection)?;
            idle.push((id, conn));
        }
        // Hand out the lowest ids first.
        idle.reverse();

        log::debug!("opened {} database connections", size);
        Ok(Self::from_connections(idle))
    }

    fn from_connections(idle: Vec<(usize, C)>) -> Self {
        let size = idle.len();
        Self {
            idle: Mutex::new(idle),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Wait for a free connection.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<C>, LoadError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| LoadError::Connection(DbError::backend("connection pool is closed")))?;

        let (id, conn) = self.idle.lock().pop().ok_or_else(|| {
            LoadError::Connection(DbError::backend("connection pool is exhausted"))
        })?;

        Ok(PooledConnection {
            id,
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Check out every connection, waiting for in-flight users to return theirs.
    pub async fn acquire_all(self: &Arc<Self>) -> Result<Vec<PooledConnection<C>>, LoadError> {
        let mut conns = Vec::with_capacity(self.size);
        for _ in 0..self.size {
            conns.push(self.acquire().await?);
        }
        Ok(conns)
    }
}

/// A checked-out connection; returned to the pool when dropped.
pub struct PooledConnection<C> {
    id: usize,
    conn: Option<C>,
    pool: Arc<ConnectionPool<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C> PooledConnection<C> {
    /// Stable id of the underlying connection within its pool.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection is held until drop")
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection is held until drop")
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        // Runs before `_permit` is released, so a waiter always finds this connection idle.
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push((self.id, conn));
        }
    }
}
