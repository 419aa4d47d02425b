//! Session-level tuning for bulk inserts.
//!
//! Bulk loads run faster with deferred commits and with foreign-key triggers
//! disabled. These are session settings, so they are applied to every pooled
//! connection before the first table and written back to their original
//! values once the run ends, whatever the outcome.
//!
//! The settings only speed the load up. One the server rejects on the first
//! connection (typically `session_replication_role`, which needs superuser)
//! is skipped with a warning and left alone on every connection.

use crate::db::{Connection, ConnectionPool, PooledConnection};
use crate::error::{DbError, LoadError};
use std::sync::Arc;
use std::time::Duration;

/// One session variable and the value to use during the load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetting {
    pub name: String,
    pub value: String,
}

impl SessionSetting {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Original values captured by [`SessionOptimizer::apply`], per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedSessions {
    connections: Vec<(usize, Vec<(String, String)>)>,
}

impl SavedSessions {
    pub fn is_empty(&self) -> bool {
        self.connections.iter().all(|(_, originals)| originals.is_empty())
    }

    /// Original value of `name` on pooled connection `connection`.
    pub fn original(&self, connection: usize, name: &str) -> Option<&str> {
        self.connections
            .iter()
            .find(|(id, _)| *id == connection)
            .and_then(|(_, originals)| originals.iter().find(|(n, _)| n == name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptimizer {
    settings: Vec<SessionSetting>,
}

impl SessionOptimizer {
    pub fn new(settings: Vec<SessionSetting>) -> Self {
        Self { settings }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// PostgreSQL settings for bulk loading.
    ///
    /// - `synchronous_commit = off`: commits return before the WAL flush
    /// - `session_replication_role = replica`: FK and user triggers do not fire
    ///   (superuser only, skipped otherwise)
    /// - `lock_timeout`: bounds how long a batch waits on a lock
    pub fn bulk_defaults(lock_timeout: Option<Duration>) -> Self {
        let mut settings = vec![
            SessionSetting::new("synchronous_commit", "off"),
            SessionSetting::new("session_replication_role", "replica"),
        ];
        if let Some(timeout) = lock_timeout {
            settings.push(SessionSetting::new(
                "lock_timeout",
                format!("{}ms", timeout.as_millis()),
            ));
        }
        Self { settings }
    }

    pub fn settings(&self) -> &[SessionSetting] {
        &self.settings
    }

    /// Apply the settings to every pooled connection.
    ///
    /// Settings rejected by the first connection are skipped. A setting that
    /// the first connection accepted but a later one rejects leaves the
    /// connections inconsistent: the connections already changed are restored
    /// before [`LoadError::Session`] is returned.
    pub async fn apply<C: Connection>(
        &self,
        pool: &Arc<ConnectionPool<C>>,
    ) -> Result<SavedSessions, LoadError> {
        let mut saved = SavedSessions::default();
        if self.settings.is_empty() {
            return Ok(saved);
        }

        let mut settings = self.settings.clone();
        let mut conns = pool.acquire_all().await?;
        for index in 0..conns.len() {
            let id = conns[index].id();
            let (originals, result) = apply_to(&mut *conns[index], &mut settings, index == 0).await;
            saved.connections.push((id, originals));

            if let Err(e) = result {
                log::error!("failed to apply session settings on connection {}: {}", id, e);
                restore_on(&mut conns, &saved).await;
                return Err(LoadError::Session(e));
            }
        }

        log::info!(
            "applied {} of {} session settings on {} connections",
            settings.len(),
            self.settings.len(),
            conns.len()
        );
        Ok(saved)
    }

    /// Write the captured originals back. Errors are logged, never returned.
    pub async fn restore<C: Connection>(&self, pool: &Arc<ConnectionPool<C>>, saved: &SavedSessions) {
        if saved.is_empty() {
            return;
        }

        match pool.acquire_all().await {
            Ok(mut conns) => {
                let failures = restore_on(&mut conns, saved).await;
                if failures == 0 {
                    log::info!("restored session settings on {} connections", conns.len());
                }
            }
            Err(e) => log::error!("cannot restore session settings: {}", e),
        }
    }
}

/// Settings changed on `conn` (with their originals), and the first error.
///
/// With `skip_rejected`, a setting the server refuses is dropped from
/// `settings` instead of failing.
async fn apply_to<C: Connection>(
    conn: &mut C,
    settings: &mut Vec<SessionSetting>,
    skip_rejected: bool,
) -> (Vec<(String, String)>, Result<(), DbError>) {
    let mut originals = Vec::with_capacity(settings.len());
    let mut rejected = Vec::new();

    for setting in settings.iter() {
        let result = match conn.session_variable(&setting.name).await {
            Ok(original) => conn
                .set_session_variable(&setting.name, &setting.value)
                .await
                .map(|()| original),
            Err(e) => Err(e),
        };

        match result {
            Ok(original) => {
                log::debug!("set {} = {} (was {})", setting.name, setting.value, original);
                originals.push((setting.name.clone(), original));
            }
            Err(e) if skip_rejected => {
                log::warn!("skipping session setting {} = {}: {}", setting.name, setting.value, e);
                rejected.push(setting.name.clone());
            }
            Err(e) => return (originals, Err(e)),
        }
    }

    settings.retain(|setting| !rejected.contains(&setting.name));
    (originals, Ok(()))
}

/// Restore in reverse order of application; returns the number of failed writes.
async fn restore_on<C: Connection>(conns: &mut [PooledConnection<C>], saved: &SavedSessions) -> usize {
    let mut failures = 0;

    for (id, originals) in saved.connections.iter().rev() {
        let Some(conn) = conns.iter_mut().find(|conn| conn.id() == *id) else {
            log::error!("connection {} is no longer in the pool", id);
            failures += originals.len();
            continue;
        };

        for (name, value) in originals.iter().rev() {
            if let Err(e) = conn.set_session_variable(name, value).await {
                log::error!("failed to restore {} on connection {}: {}", name, id, e);
                failures += 1;
            }
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryDatabase;

    async fn pool(db: &MemoryDatabase, size: usize) -> Arc<ConnectionPool<crate::test_support::MemoryConnection>> {
        Arc::new(ConnectionPool::open(db, size).await.unwrap())
    }

    #[test]
    fn test_bulk_defaults() {
        let optimizer = SessionOptimizer::bulk_defaults(Some(Duration::from_secs(3600)));
        let names: Vec<&str> = optimizer.settings().iter().map(|s| s.name.as_str()).collect();

        assert_eq!(names, vec!["synchronous_commit", "session_replication_role", "lock_timeout"]);
        assert_eq!(optimizer.settings()[2].value, "3600000ms");
        assert_eq!(SessionOptimizer::bulk_defaults(None).settings().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_then_restore() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 3).await;
        let optimizer = SessionOptimizer::bulk_defaults(None);

        let saved = optimizer.apply(&pool).await.unwrap();
        for id in 0..3 {
            assert_eq!(db.session_value(id, "synchronous_commit").as_deref(), Some("off"));
            assert_eq!(db.session_value(id, "session_replication_role").as_deref(), Some("replica"));
            assert_eq!(saved.original(id, "synchronous_commit"), Some("on"));
        }

        optimizer.restore(&pool, &saved).await;
        for id in 0..3 {
            assert_eq!(db.session_value(id, "synchronous_commit").as_deref(), Some("on"));
            assert_eq!(db.session_value(id, "session_replication_role").as_deref(), Some("origin"));
        }
    }

    #[tokio::test]
    async fn test_partial_failure_restores_changed_connections() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 2).await;
        db.fail_session_variable(1, "session_replication_role");

        let optimizer = SessionOptimizer::bulk_defaults(None);
        let err = optimizer.apply(&pool).await.unwrap_err();

        assert!(matches!(err, LoadError::Session(_)));
        for id in 0..2 {
            assert_eq!(db.session_value(id, "synchronous_commit").as_deref(), Some("on"));
            assert_eq!(db.session_value(id, "session_replication_role").as_deref(), Some("origin"));
        }
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_setting_rejected_everywhere_is_skipped() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 2).await;
        db.deny_session_variable("session_replication_role");

        let optimizer = SessionOptimizer::bulk_defaults(None);
        let saved = optimizer.apply(&pool).await.unwrap();

        for id in 0..2 {
            assert_eq!(db.session_value(id, "synchronous_commit").as_deref(), Some("off"));
            assert_eq!(db.session_value(id, "session_replication_role").as_deref(), Some("origin"));
            assert_eq!(saved.original(id, "session_replication_role"), None);
        }
        // Skipped on the second connection without another attempt.
        assert_eq!(db.session_writes(), 2);

        optimizer.restore(&pool, &saved).await;
        for id in 0..2 {
            assert_eq!(db.session_value(id, "synchronous_commit").as_deref(), Some("on"));
        }
    }

    #[tokio::test]
    async fn test_disabled_optimizer_touches_nothing() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 1).await;

        let saved = SessionOptimizer::disabled().apply(&pool).await.unwrap();
        assert!(saved.is_empty());
        assert_eq!(db.session_writes(), 0);
    }
}
