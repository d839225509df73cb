//! Async connection management.
//!
//! Two access paths for async code:
//! - [`AsyncPool`]: the process-wide pool on the master role, created on first
//!   acquisition and cleared by `close` so the next acquisition builds a new one.
//! - [`ConnectionManager`]: one physical connection per scope, not pooled, for
//!   diagnostics and tests. The connection is closed when the scope ends.
//!
//! Pool queries go through sqlx's own acquire/release, so a cancelled future
//! still returns its connection to the pool.

use crate::config::parse_role;
use crate::db::connection::{
    ConnectOptions, DbConnection, connection_suggestion, mysql_options, postgres_options,
    sqlite_options,
};
use crate::db::engine::{PidProvider, default_pid_provider};
use crate::db::params::{mysql_query, postgres_query, sqlite_query};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Row, RoleConfig, Statement};
use chrono::{DateTime, Utc};
use futures_util::future::LocalBoxFuture;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool, Transaction};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

/// Sizing for [`DbPool::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub test_before_acquire: bool,
}

impl PoolSizing {
    /// `min = pool_size - max_overflow`, `max = pool_size + max_overflow`.
    pub fn from_role(config: &RoleConfig, acquire_timeout: Duration) -> Self {
        let (min_connections, max_connections) = config.async_pool_bounds();
        Self {
            min_connections,
            max_connections: max_connections.max(1),
            acquire_timeout,
            test_before_acquire: config.pre_ping,
        }
    }
}

impl DbPool {
    /// Create a connection pool for a role.
    pub async fn connect(
        config: &RoleConfig,
        options: &ConnectOptions,
        sizing: PoolSizing,
    ) -> DbResult<Self> {
        let connect_err = |e: sqlx::Error| {
            DbError::connection(
                format!("Failed to connect: {}", e),
                connection_suggestion(config.db_type, &e),
            )
        };

        let pool = match config.db_type {
            DatabaseType::MySQL => DbPool::MySql(
                MySqlPoolOptions::new()
                    .min_connections(sizing.min_connections)
                    .max_connections(sizing.max_connections)
                    .acquire_timeout(sizing.acquire_timeout)
                    .test_before_acquire(sizing.test_before_acquire)
                    .connect_with(mysql_options(config, options)?)
                    .await
                    .map_err(connect_err)?,
            ),
            DatabaseType::PostgreSQL => DbPool::Postgres(
                PgPoolOptions::new()
                    .min_connections(sizing.min_connections)
                    .max_connections(sizing.max_connections)
                    .acquire_timeout(sizing.acquire_timeout)
                    .test_before_acquire(sizing.test_before_acquire)
                    .connect_with(postgres_options(config, options)?)
                    .await
                    .map_err(connect_err)?,
            ),
            DatabaseType::SQLite => DbPool::SQLite(
                SqlitePoolOptions::new()
                    .min_connections(sizing.min_connections)
                    .max_connections(sizing.max_connections)
                    .acquire_timeout(sizing.acquire_timeout)
                    .test_before_acquire(sizing.test_before_acquire)
                    .connect_with(sqlite_options(config, options)?)
                    .await
                    .map_err(connect_err)?,
            ),
        };
        Ok(pool)
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        impl_db_dispatch!(self, DbPool, {
            MySql(pool) => pool.close().await,
            Postgres(pool) => pool.close().await,
            SQLite(pool) => pool.close().await,
        })
    }

    pub fn is_closed(&self) -> bool {
        impl_db_dispatch!(self, DbPool, {
            MySql(pool) => pool.is_closed(),
            Postgres(pool) => pool.is_closed(),
            SQLite(pool) => pool.is_closed(),
        })
    }

    /// Connections currently open, idle or in use.
    pub fn size(&self) -> u32 {
        impl_db_dispatch!(self, DbPool, {
            MySql(pool) => pool.size(),
            Postgres(pool) => pool.size(),
            SQLite(pool) => pool.size(),
        })
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Execute a statement on a pooled connection.
    pub async fn execute(&self, stmt: &Statement) -> DbResult<u64> {
        let result = impl_db_dispatch!(self, DbPool, {
            MySql(pool) => mysql_query(stmt).execute(pool).await?.rows_affected(),
            Postgres(pool) => postgres_query(stmt).execute(pool).await?.rows_affected(),
            SQLite(pool) => sqlite_query(stmt).execute(pool).await?.rows_affected(),
        });
        Ok(result)
    }

    /// Run a query on a pooled connection and decode every row.
    pub async fn fetch_all(&self, stmt: &Statement) -> DbResult<Vec<Row>> {
        let rows: Vec<Row> = impl_db_dispatch!(self, DbPool, {
            MySql(pool) => mysql_query(stmt)
                .fetch_all(pool)
                .await?
                .iter()
                .map(|r| r.to_json_map())
                .collect(),
            Postgres(pool) => postgres_query(stmt)
                .fetch_all(pool)
                .await?
                .iter()
                .map(|r| r.to_json_map())
                .collect(),
            SQLite(pool) => sqlite_query(stmt)
                .fetch_all(pool)
                .await?
                .iter()
                .map(|r| r.to_json_map())
                .collect(),
        });
        Ok(rows)
    }

    /// Begin a transaction on a pooled connection.
    ///
    /// Dropping the transaction without committing rolls it back.
    pub async fn begin(&self) -> DbResult<DbTransaction> {
        let tx = impl_db_dispatch!(self, DbPool, {
            MySql(pool) => DbTransaction::MySql(pool.begin().await?),
            Postgres(pool) => DbTransaction::Postgres(pool.begin().await?),
            SQLite(pool) => DbTransaction::SQLite(pool.begin().await?),
        });
        Ok(tx)
    }
}

/// Transaction on a pooled connection.
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbTransaction").field(&self.db_type()).finish()
    }
}

impl DbTransaction {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySQL,
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn execute(&mut self, stmt: &Statement) -> DbResult<u64> {
        let result = impl_db_dispatch!(self, DbTransaction, {
            MySql(tx) => mysql_query(stmt).execute(&mut **tx).await?.rows_affected(),
            Postgres(tx) => postgres_query(stmt).execute(&mut **tx).await?.rows_affected(),
            SQLite(tx) => sqlite_query(stmt).execute(&mut **tx).await?.rows_affected(),
        });
        Ok(result)
    }

    pub async fn fetch_all(&mut self, stmt: &Statement) -> DbResult<Vec<Row>> {
        let rows: Vec<Row> = impl_db_dispatch!(self, DbTransaction, {
            MySql(tx) => mysql_query(stmt)
                .fetch_all(&mut **tx)
                .await?
                .iter()
                .map(|r| r.to_json_map())
                .collect(),
            Postgres(tx) => postgres_query(stmt)
                .fetch_all(&mut **tx)
                .await?
                .iter()
                .map(|r| r.to_json_map())
                .collect(),
            SQLite(tx) => sqlite_query(stmt)
                .fetch_all(&mut **tx)
                .await?
                .iter()
                .map(|r| r.to_json_map())
                .collect(),
        });
        Ok(rows)
    }

    pub async fn commit(self) -> DbResult<()> {
        impl_db_dispatch!(self, DbTransaction, {
            MySql(tx) => tx.commit().await?,
            Postgres(tx) => tx.commit().await?,
            SQLite(tx) => tx.commit().await?,
        });
        Ok(())
    }

    pub async fn rollback(self) -> DbResult<()> {
        impl_db_dispatch!(self, DbTransaction, {
            MySql(tx) => tx.rollback().await?,
            Postgres(tx) => tx.rollback().await?,
            SQLite(tx) => tx.rollback().await?,
        });
        Ok(())
    }
}

/// A live instance of the process-wide pool.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    id: Uuid,
    owner_pid: u32,
    created_at: DateTime<Utc>,
    pool: DbPool,
}

impl PoolHandle {
    /// Unique per pool instance; changes after close and reacquire.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Process-wide async pool on the master role.
pub struct AsyncPool {
    config: RoleConfig,
    options: ConnectOptions,
    acquire_timeout: Duration,
    pid: PidProvider,
    slot: Mutex<Option<PoolHandle>>,
}

impl std::fmt::Debug for AsyncPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPool")
            .field("url", &self.config.masked_connection_string())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl AsyncPool {
    pub fn new(
        config: RoleConfig,
        application_name: Option<&str>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            config,
            options: ConnectOptions {
                application_name: application_name.map(|name| format!("{}:async", name)),
                statement_cache_size: None,
                read_only: false,
            },
            acquire_timeout,
            pid: default_pid_provider(),
            slot: Mutex::new(None),
        }
    }

    pub fn with_pid_provider(mut self, pid: PidProvider) -> Self {
        self.pid = pid;
        self
    }

    /// Return the pool, creating it on first use in this process.
    ///
    /// A pool created by another process is forgotten without being closed
    /// and replaced.
    pub async fn acquire(&self) -> DbResult<PoolHandle> {
        let mut slot = self.slot.lock().await;
        let current = (self.pid)();

        if let Some(handle) = slot.as_ref() {
            if handle.owner_pid == current {
                return Ok(handle.clone());
            }
            let violation = DbError::fork_safety_violation(handle.owner_pid, current);
            warn!(pool_id = %handle.id, error = %violation, "Discarding inherited async pool");
            std::mem::forget(slot.take());
        }

        let sizing = PoolSizing::from_role(&self.config, self.acquire_timeout);
        let pool = DbPool::connect(&self.config, &self.options, sizing).await?;
        let handle = PoolHandle {
            id: Uuid::new_v4(),
            owner_pid: current,
            created_at: Utc::now(),
            pool,
        };
        info!(
            pool_id = %handle.id,
            db_type = %self.config.db_type,
            min_connections = sizing.min_connections,
            max_connections = sizing.max_connections,
            "Created async pool"
        );
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// The live pool, without creating one.
    pub async fn current(&self) -> Option<PoolHandle> {
        self.slot.lock().await.clone()
    }

    /// Close the pool and clear the slot. Returns whether a pool was open.
    pub async fn close(&self) -> bool {
        let Some(handle) = self.slot.lock().await.take() else {
            return false;
        };
        if handle.owner_pid == (self.pid)() {
            handle.pool.close().await;
            info!(pool_id = %handle.id, "Closed async pool");
        } else {
            debug!(pool_id = %handle.id, "Forgot async pool owned by another process");
        }
        true
    }

    /// Forget the pool without closing it. For use in a forked child.
    ///
    /// Callable from blocking code. If the slot is busy the inherited pool is
    /// still replaced on the next `acquire`, which checks the owner pid.
    pub fn reset_after_fork(&self) {
        match self.slot.try_lock() {
            Ok(mut slot) => {
                if let Some(handle) = slot.take() {
                    info!(pool_id = %handle.id, "Forgot async pool after fork");
                    // Its connections and reaper belong to the parent's runtime.
                    std::mem::forget(handle);
                }
            }
            Err(_) => debug!("Async pool slot busy, inherited pool is replaced on next acquire"),
        }
    }
}

/// Opens one physical connection per scope.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    config: RoleConfig,
    options: ConnectOptions,
}

impl ConnectionManager {
    /// Prepared statement caching is disabled by default.
    pub fn new(config: RoleConfig) -> Self {
        Self {
            config,
            options: ConnectOptions {
                application_name: None,
                statement_cache_size: Some(0),
                read_only: false,
            },
        }
    }

    /// Build from a role URL, pool options included.
    pub fn from_dsn(dsn: &str) -> DbResult<Self> {
        parse_role(dsn)
            .map(Self::new)
            .map_err(DbError::configuration)
    }

    pub fn with_statement_cache_size(mut self, size: usize) -> Self {
        self.options.statement_cache_size = Some(size);
        self
    }

    pub fn with_application_name(mut self, name: Option<String>) -> Self {
        self.options.application_name = name;
        self
    }

    /// Open sqlite files read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.read_only = read_only;
        self
    }

    pub fn db_type(&self) -> DatabaseType {
        self.config.db_type
    }

    /// Open a connection. Prefer [`ConnectionManager::with_connection`], or
    /// call [`ScopedConnection::close`] when done.
    pub async fn acquire(&self) -> DbResult<ScopedConnection> {
        let conn = DbConnection::connect(&self.config, &self.options).await?;
        let scoped = ScopedConnection {
            id: Uuid::new_v4(),
            conn: Some(conn),
        };
        debug!(
            connection_id = %scoped.id,
            db_type = %self.config.db_type,
            "Opened scoped connection"
        );
        Ok(scoped)
    }

    /// Run `f` on a fresh connection and close it afterwards, whatever the outcome.
    ///
    /// The error from `f` wins over a failure to close. The future returned by
    /// `f` may hold the connection's executor across awaits, so it is not
    /// required to be `Send`.
    pub async fn with_connection<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut ScopedConnection) -> LocalBoxFuture<'c, DbResult<T>>,
    {
        let mut conn = self.acquire().await?;
        let result = f(&mut conn).await;
        let closed = conn.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(error = %close_err, "Failed to close scoped connection after error");
                Err(e)
            }
        }
    }

    /// Round-trip time of a connect, ping and close.
    pub async fn ping(&self) -> DbResult<Duration> {
        let started = Instant::now();
        self.with_connection(|conn| Box::pin(async move { conn.ping().await }))
            .await?;
        Ok(started.elapsed())
    }
}

/// One physical connection owned by a scope.
///
/// Dropping it without [`ScopedConnection::close`] still shuts the socket, but
/// skips the graceful goodbye.
pub struct ScopedConnection {
    id: Uuid,
    conn: Option<DbConnection>,
}

impl std::fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedConnection")
            .field("id", &self.id)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl ScopedConnection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn conn(&mut self) -> DbResult<&mut DbConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("Scoped connection is already closed"))
    }

    pub async fn execute(&mut self, stmt: &Statement) -> DbResult<u64> {
        self.conn()?.execute(stmt).await
    }

    pub async fn fetch_all(&mut self, stmt: &Statement) -> DbResult<Vec<Row>> {
        self.conn()?.fetch_all(stmt).await
    }

    pub async fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
        self.conn()?.execute_raw(sql).await
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        self.conn()?.ping().await
    }

    pub async fn server_version(&mut self) -> DbResult<Option<String>> {
        Ok(self.conn()?.server_version().await)
    }

    /// Close the connection gracefully.
    pub async fn close(mut self) -> DbResult<()> {
        match self.conn.take() {
            Some(conn) => {
                conn.close().await?;
                debug!(connection_id = %self.id, "Closed scoped connection");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            warn!(
                connection_id = %self.id,
                "Scoped connection dropped without close - consider using explicit close()"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::engine::testing::fake_pid;
    use std::sync::atomic::Ordering;

    fn sqlite_role(dir: &tempfile::TempDir, name: &str) -> RoleConfig {
        let url = format!("sqlite:{}", dir.path().join(name).display());
        RoleConfig::new(url).unwrap()
    }

    #[test]
    fn test_pool_sizing_bounds() {
        let config = RoleConfig::new("postgres://localhost/db")
            .unwrap()
            .with_pool_size(5)
            .with_max_overflow(4);
        let sizing = PoolSizing::from_role(&config, Duration::from_secs(3));
        assert_eq!(sizing.min_connections, 1);
        assert_eq!(sizing.max_connections, 9);

        let small = config.with_pool_size(2);
        let sizing = PoolSizing::from_role(&small, Duration::from_secs(3));
        assert_eq!(sizing.min_connections, 0);
        assert_eq!(sizing.max_connections, 6);
    }

    #[tokio::test]
    async fn test_async_pool_is_singleton_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AsyncPool::new(sqlite_role(&dir, "pool.db"), None, Duration::from_secs(5));
        assert!(pool.current().await.is_none());

        let first = pool.acquire().await.unwrap();
        let again = pool.acquire().await.unwrap();
        assert_eq!(first.id(), again.id());

        assert!(pool.close().await);
        assert!(first.pool().is_closed());
        assert!(pool.current().await.is_none());
        assert!(!pool.close().await);

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), first.id());
        assert!(!fresh.pool().is_closed());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_async_pool_replaced_in_child_process() {
        let dir = tempfile::tempdir().unwrap();
        let (pid, provider) = fake_pid(10);
        let pool = AsyncPool::new(sqlite_role(&dir, "fork.db"), None, Duration::from_secs(5))
            .with_pid_provider(provider);

        let parent = pool.acquire().await.unwrap();
        pid.store(11, Ordering::SeqCst);
        let child = pool.acquire().await.unwrap();

        assert_ne!(parent.id(), child.id());
        assert_eq!(child.owner_pid(), 11);
        // Inherited pool is forgotten, not closed.
        assert!(!parent.pool().is_closed());

        pool.reset_after_fork();
        assert!(pool.current().await.is_none());
        assert!(!child.pool().is_closed());

        child.pool().close().await;
        parent.pool().close().await;
    }

    #[tokio::test]
    async fn test_pool_queries_and_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AsyncPool::new(sqlite_role(&dir, "tx.db"), None, Duration::from_secs(5));
        let handle = pool.acquire().await.unwrap();
        let db = handle.pool();

        db.execute(&Statement::new("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)"))
            .await
            .unwrap();

        let mut tx = db.begin().await.unwrap();
        tx.execute(&Statement::new("INSERT INTO t (v) VALUES (?)").bind("kept"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        tx.execute(&Statement::new("INSERT INTO t (v) VALUES (?)").bind("dropped"))
            .await
            .unwrap();
        let inside = tx.fetch_all(&Statement::new("SELECT v FROM t")).await.unwrap();
        assert_eq!(inside.len(), 2);
        tx.rollback().await.unwrap();

        let rows = db.fetch_all(&Statement::new("SELECT v FROM t")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["v"], "kept");
        pool.close().await;
    }

    #[tokio::test]
    async fn test_scoped_connection_closes_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new(sqlite_role(&dir, "scoped.db"));

        let err = manager
            .with_connection(|conn| {
                Box::pin(async move {
                    conn.execute_raw("CREATE TABLE t (id INTEGER)").await?;
                    conn.execute(&Statement::new("INSERT INTO missing VALUES (1)"))
                        .await
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));

        // The table created before the failure is there: the scope is not a transaction.
        let count = manager
            .with_connection(|conn| {
                Box::pin(async move { conn.fetch_all(&Statement::new("SELECT id FROM t")).await })
            })
            .await
            .unwrap();
        assert!(count.is_empty());
    }

    #[tokio::test]
    async fn test_scoped_connection_ping_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::from_dsn(&format!(
            "sqlite:{}",
            dir.path().join("ping.db").display()
        ))
        .unwrap()
        .with_statement_cache_size(16);

        manager.ping().await.unwrap();

        let mut conn = manager.acquire().await.unwrap();
        assert!(conn.server_version().await.unwrap().is_some());
        conn.close().await.unwrap();
    }

    #[test]
    fn test_from_dsn_rejects_unknown_scheme() {
        assert!(matches!(
            ConnectionManager::from_dsn("oracle://localhost/db"),
            Err(DbError::Configuration { .. })
        ));
    }
}
