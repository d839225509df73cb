//! Synchronous connection pools, one per database role.
//!
//! An [`Engine`] wraps an `r2d2` pool of up to `pool_size + max_overflow`
//! connections. Every physical connection is stamped with the id of the
//! process that opened it. Checkout rejects a connection stamped by another
//! process and checkin discards it; either way it is dropped without the
//! graceful close handshake, which would end the parent's server session.
//!
//! The pool belongs to one process too. The first engine call in a forked
//! child replaces the inherited pool, whose helper threads did not survive the
//! fork, with a fresh one and leaves the parent's connections untouched.
//!
//! Physical connections come from a [`Connector`]. The production connector
//! drives the async sqlx driver on a runtime owned by the calling process, so
//! engine calls block the calling thread and must not be made from inside an
//! async task.

use crate::db::connection::{ConnectOptions, DbConnection};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel, Role, RoleConfig, Row, Statement};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One blocking physical connection.
pub trait RawConnection: Send {
    fn execute(&mut self, stmt: &Statement) -> DbResult<u64>;
    fn fetch_all(&mut self, stmt: &Statement) -> DbResult<Vec<Row>>;
    /// Unprepared SQL such as transaction control.
    fn execute_raw(&mut self, sql: &str) -> DbResult<()>;
    fn ping(&mut self) -> DbResult<()>;
    /// Graceful close. Dropping the box instead abandons the connection.
    fn close(self: Box<Self>) -> DbResult<()>;
}

/// Opens physical connections for an engine.
pub trait Connector: Send + Sync {
    fn db_type(&self) -> DatabaseType;
    fn connect(&self) -> DbResult<Box<dyn RawConnection>>;
}

/// Returns the id of the running process.
pub type PidProvider = Arc<dyn Fn() -> u32 + Send + Sync>;

pub fn default_pid_provider() -> PidProvider {
    Arc::new(std::process::id)
}

/// Connection ids are unique across every engine of the process.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// Guarded data is replaced wholesale, so a poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tokio runtime used to drive sqlx from blocking code.
///
/// A runtime belongs to the process that built it. Its I/O driver shares the
/// epoll instance with every forked child, so a child never drives it and
/// never shuts it down.
struct BlockingRuntime {
    pid: u32,
    runtime: Option<tokio::runtime::Runtime>,
}

impl BlockingRuntime {
    fn new() -> DbResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("dbroute-engine")
            .enable_all()
            .build()
            .map_err(|e| DbError::internal(format!("Failed to start engine runtime: {}", e)))?;
        Ok(Self {
            pid: std::process::id(),
            runtime: Some(runtime),
        })
    }

    fn is_inherited(&self) -> bool {
        self.pid != std::process::id()
    }

    fn runtime(&self) -> DbResult<&tokio::runtime::Runtime> {
        if self.is_inherited() {
            return Err(DbError::fork_safety_violation(self.pid, std::process::id()));
        }
        self.runtime
            .as_ref()
            .ok_or_else(|| DbError::internal("Engine runtime has been shut down"))
    }

    fn block_on<F: Future>(&self, future: F) -> DbResult<F::Output> {
        Ok(self.runtime()?.block_on(future))
    }
}

impl Drop for BlockingRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            if self.is_inherited() {
                std::mem::forget(runtime);
            } else {
                // Background shutdown so engines may be dropped from async code.
                runtime.shutdown_background();
            }
        }
    }
}

/// Connector backed by [`DbConnection`].
pub struct SqlxConnector {
    config: RoleConfig,
    options: ConnectOptions,
    runtime: Mutex<Arc<BlockingRuntime>>,
}

impl SqlxConnector {
    pub fn new(config: RoleConfig, options: ConnectOptions) -> DbResult<Self> {
        Ok(Self {
            config,
            options,
            runtime: Mutex::new(Arc::new(BlockingRuntime::new()?)),
        })
    }

    /// The runtime of the calling process, started anew after a fork.
    fn runtime(&self) -> DbResult<Arc<BlockingRuntime>> {
        let mut runtime = lock(&self.runtime);
        if runtime.is_inherited() {
            info!(
                owner_pid = runtime.pid,
                pid = std::process::id(),
                "Starting engine runtime in forked process"
            );
            *runtime = Arc::new(BlockingRuntime::new()?);
        }
        Ok(Arc::clone(&runtime))
    }
}

impl std::fmt::Debug for SqlxConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxConnector")
            .field("connection_string", &self.config.masked_connection_string())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Connector for SqlxConnector {
    fn db_type(&self) -> DatabaseType {
        self.config.db_type
    }

    fn connect(&self) -> DbResult<Box<dyn RawConnection>> {
        let runtime = self.runtime()?;
        let conn = runtime.block_on(DbConnection::connect(&self.config, &self.options))??;
        Ok(Box::new(BlockingConnection {
            conn: Some(conn),
            runtime,
        }))
    }
}

struct BlockingConnection {
    conn: Option<DbConnection>,
    runtime: Arc<BlockingRuntime>,
}

fn live(conn: &mut Option<DbConnection>) -> DbResult<&mut DbConnection> {
    conn.as_mut()
        .ok_or_else(|| DbError::internal("Connection already closed"))
}

impl RawConnection for BlockingConnection {
    fn execute(&mut self, stmt: &Statement) -> DbResult<u64> {
        self.runtime.block_on(live(&mut self.conn)?.execute(stmt))?
    }

    fn fetch_all(&mut self, stmt: &Statement) -> DbResult<Vec<Row>> {
        self.runtime.block_on(live(&mut self.conn)?.fetch_all(stmt))?
    }

    fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
        self.runtime.block_on(live(&mut self.conn)?.execute_raw(sql))?
    }

    fn ping(&mut self) -> DbResult<()> {
        self.runtime.block_on(live(&mut self.conn)?.ping())?
    }

    fn close(mut self: Box<Self>) -> DbResult<()> {
        let runtime = self.runtime.runtime()?;
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            // Blocking inside a runtime context panics; the engine runtime finishes the close.
            let _close = runtime.spawn(async move {
                if let Err(e) = conn.close().await {
                    warn!(error = %e, "Error while closing connection");
                }
            });
            return Ok(());
        }
        runtime.block_on(conn.close())
    }
}

impl Drop for BlockingConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.runtime.is_inherited() {
                // Dropping would deregister the socket from the parent's epoll instance.
                std::mem::forget(conn);
            }
        }
    }
}

/// Sizing and checkout behavior of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout: Duration,
    pub pre_ping: bool,
    pub isolation_level: IsolationLevel,
}

impl EngineOptions {
    pub fn from_role(config: &RoleConfig, pool_timeout: Duration) -> Self {
        Self {
            pool_size: config.pool_size,
            max_overflow: config.max_overflow,
            pool_timeout,
            pre_ping: config.pre_ping,
            isolation_level: config.isolation_level,
        }
    }

    /// Most connections that may exist at once.
    pub fn capacity(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }
}

/// Snapshot of an engine's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub checked_out: usize,
    pub capacity: usize,
    /// Incremented every time the pool is replaced (dispose or fork).
    pub generation: u64,
}

/// A physical connection as the pool holds it.
struct Tracked {
    id: u64,
    owner_pid: u32,
    created_at: Instant,
    checkouts: u64,
    /// Leave without the close handshake; the protocol state is unknown.
    discard: bool,
    /// Close instead of going back to the idle list.
    retire: bool,
    role: Role,
    pid: PidProvider,
    conn: Option<Box<dyn RawConnection>>,
}

impl Tracked {
    fn raw(&mut self) -> DbResult<&mut (dyn RawConnection + 'static)> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| DbError::internal("Connection already released"))
    }

    fn is_foreign(&self) -> bool {
        self.owner_pid != (self.pid)()
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.is_foreign() {
            debug!(
                role = %self.role,
                connection_id = self.id,
                owner_pid = self.owner_pid,
                "Abandoned connection of another process"
            );
            drop(conn);
            return;
        }
        if self.discard {
            debug!(role = %self.role, connection_id = self.id, "Dropped invalidated connection");
            drop(conn);
            return;
        }
        match conn.close() {
            Ok(()) => debug!(role = %self.role, connection_id = self.id, "Closed connection"),
            Err(e) => warn!(
                role = %self.role,
                connection_id = self.id,
                error = %e,
                "Error while closing connection"
            ),
        }
    }
}

/// Opens, stamps and checks the connections of one engine's pool.
#[derive(Clone)]
struct ConnectionFactory {
    role: Role,
    connector: Arc<dyn Connector>,
    pid: PidProvider,
    pre_ping: bool,
    /// Most recent connect failure, reported when a checkout times out.
    last_error: Arc<Mutex<Option<DbError>>>,
}

impl r2d2::ManageConnection for ConnectionFactory {
    type Connection = Tracked;
    type Error = DbError;

    fn connect(&self) -> DbResult<Tracked> {
        let conn = match self.connector.connect() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(role = %self.role, error = %e, "Failed to open connection");
                *lock(&self.last_error) = Some(e.clone());
                return Err(e);
            }
        };
        *lock(&self.last_error) = None;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let owner_pid = (self.pid)();
        debug!(role = %self.role, connection_id = id, pid = owner_pid, "Opened connection");
        Ok(Tracked {
            id,
            owner_pid,
            created_at: Instant::now(),
            checkouts: 0,
            discard: false,
            retire: false,
            role: self.role,
            pid: Arc::clone(&self.pid),
            conn: Some(conn),
        })
    }

    /// Checkout guard. A connection opened by another process is rejected;
    /// a connection that has been used before is pinged when `pre_ping` is set.
    fn is_valid(&self, conn: &mut Tracked) -> DbResult<()> {
        let current = (self.pid)();
        if conn.owner_pid != current {
            let violation = DbError::fork_safety_violation(conn.owner_pid, current);
            warn!(
                role = %self.role,
                connection_id = conn.id,
                error = %violation,
                "Discarding connection inherited from another process"
            );
            return Err(violation);
        }

        conn.checkouts += 1;
        if self.pre_ping && conn.checkouts > 1 {
            if let Err(e) = conn.raw()?.ping() {
                warn!(
                    role = %self.role,
                    connection_id = conn.id,
                    age_secs = conn.created_at.elapsed().as_secs(),
                    error = %e,
                    "Pre-ping failed, replacing connection"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Checkin guard.
    fn has_broken(&self, conn: &mut Tracked) -> bool {
        if conn.is_foreign() {
            warn!(
                role = %self.role,
                connection_id = conn.id,
                owner_pid = conn.owner_pid,
                "Discarding connection returned in another process"
            );
            return true;
        }
        conn.discard || conn.retire
    }
}

/// Routes pool errors to tracing instead of the `log` crate.
#[derive(Debug)]
struct TracingErrorHandler {
    role: Role,
}

impl r2d2::HandleError<DbError> for TracingErrorHandler {
    fn handle_error(&self, error: DbError) {
        debug!(role = %self.role, error = %error, "Engine pool error");
    }
}

fn build_pool(factory: ConnectionFactory, options: &EngineOptions) -> r2d2::Pool<ConnectionFactory> {
    let role = factory.role;
    r2d2::Pool::builder()
        .max_size(options.capacity().max(1))
        .min_idle(Some(0))
        .max_lifetime(None)
        .connection_timeout(options.pool_timeout.max(Duration::from_millis(1)))
        .test_on_check_out(true)
        .error_handler(Box::new(TracingErrorHandler { role }))
        .build_unchecked(factory)
}

/// Close the idle connections of a pool that is being replaced.
///
/// Connections still checked out are closed when the last of them returns.
fn retire_idle(pool: &r2d2::Pool<ConnectionFactory>) -> usize {
    let mut retired = 0;
    while let Some(mut conn) = pool.try_get() {
        conn.retire = true;
        retired += 1;
    }
    retired
}

/// The pool of the process that built it.
struct PoolSlot {
    pid: u32,
    generation: u64,
    pool: r2d2::Pool<ConnectionFactory>,
}

struct EngineInner {
    role: Role,
    db_type: DatabaseType,
    options: EngineOptions,
    factory: ConnectionFactory,
    slot: RwLock<PoolSlot>,
}

impl EngineInner {
    fn current_pid(&self) -> u32 {
        (self.factory.pid)()
    }

    fn fresh_slot(&self, pid: u32, generation: u64) -> PoolSlot {
        PoolSlot {
            pid,
            generation,
            pool: build_pool(self.factory.clone(), &self.options),
        }
    }

    /// The pool of the calling process, replacing an inherited one.
    fn pool(&self) -> r2d2::Pool<ConnectionFactory> {
        let current = self.current_pid();
        {
            let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
            if slot.pid == current {
                return slot.pool.clone();
            }
        }

        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.pid != current {
            let violation = DbError::fork_safety_violation(slot.pid, current);
            warn!(
                role = %self.role,
                error = %violation,
                "Engine pool inherited from another process, replacing it"
            );
            let fresh = self.fresh_slot(current, slot.generation + 1);
            // The inherited pool's locks and threads belong to the parent.
            std::mem::forget(std::mem::replace(&mut *slot, fresh));
        }
        slot.pool.clone()
    }

    /// Install a fresh pool and hand back the previous one.
    fn replace_pool(&self) -> PoolSlot {
        let current = self.current_pid();
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let fresh = self.fresh_slot(current, slot.generation + 1);
        std::mem::replace(&mut *slot, fresh)
    }
}

/// Pooled handle to one database role. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("role", &self.inner.role)
            .field("db_type", &self.inner.db_type)
            .field("options", &self.inner.options)
            .field("status", &self.status())
            .finish()
    }
}

impl Engine {
    /// Create the engine for a configured role.
    ///
    /// Connections are opened lazily on first checkout. Slave engines open
    /// SQLite files read-only.
    pub fn new(
        role: Role,
        config: &RoleConfig,
        application_name: Option<&str>,
        pool_timeout: Duration,
    ) -> DbResult<Self> {
        let connect_options = ConnectOptions {
            application_name: application_name.map(|name| format!("{}:{}", name, role)),
            statement_cache_size: None,
            read_only: !role.is_master(),
        };
        let connector = SqlxConnector::new(config.clone(), connect_options)?;
        info!(
            role = %role,
            db_type = %config.db_type,
            url = %config.masked_connection_string(),
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            isolation_level = %config.isolation_level,
            "Created engine"
        );
        Ok(Self::with_connector(
            role,
            EngineOptions::from_role(config, pool_timeout),
            Box::new(connector),
            default_pid_provider(),
        ))
    }

    /// Create an engine over an arbitrary connector.
    pub fn with_connector(
        role: Role,
        options: EngineOptions,
        connector: Box<dyn Connector>,
        pid: PidProvider,
    ) -> Self {
        let db_type = connector.db_type();
        let factory = ConnectionFactory {
            role,
            connector: Arc::from(connector),
            pid,
            pre_ping: options.pre_ping,
            last_error: Arc::new(Mutex::new(None)),
        };
        let slot = PoolSlot {
            pid: (factory.pid)(),
            generation: 0,
            pool: build_pool(factory.clone(), &options),
        };
        Self {
            inner: Arc::new(EngineInner {
                role,
                db_type,
                options,
                factory,
                slot: RwLock::new(slot),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn db_type(&self) -> DatabaseType {
        self.inner.db_type
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.inner.options.isolation_level
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    pub fn status(&self) -> PoolStatus {
        let slot = self.inner.slot.read().unwrap_or_else(PoisonError::into_inner);
        let state = slot.pool.state();
        PoolStatus {
            idle: state.idle_connections as usize,
            checked_out: state.connections.saturating_sub(state.idle_connections) as usize,
            capacity: self.inner.options.capacity() as usize,
            generation: slot.generation,
        }
    }

    /// Check out a connection, blocking up to `pool_timeout` when exhausted.
    ///
    /// When connections cannot be opened, the last connect error is returned
    /// once the timeout expires.
    pub fn checkout(&self) -> DbResult<PooledConnection> {
        let pool = self.inner.pool();
        let conn = pool.get().map_err(|e| {
            let last_error = lock(&self.inner.factory.last_error).take();
            last_error.unwrap_or_else(|| {
                debug!(role = %self.inner.role, error = %e, "Checkout timed out");
                DbError::timeout(
                    format!("checkout from {} engine", self.inner.role),
                    self.inner.options.pool_timeout.as_secs(),
                )
            })
        })?;
        Ok(PooledConnection {
            role: self.inner.role,
            db_type: self.inner.db_type,
            conn,
        })
    }

    /// Close every idle connection and start a fresh pool.
    ///
    /// Connections checked out at this point are closed once returned.
    pub fn dispose(&self) {
        let previous = self.inner.replace_pool();
        if previous.pid != self.inner.current_pid() {
            std::mem::forget(previous);
            info!(role = %self.inner.role, "Abandoned inherited engine pool");
            return;
        }
        let closed = retire_idle(&previous.pool);
        drop(previous);
        info!(role = %self.inner.role, closed, "Disposed engine");
    }

    /// Forget every inherited connection without closing it and start a fresh pool.
    ///
    /// Meant for a freshly forked child: the sockets stay open for the parent.
    pub fn reset_after_fork(&self) {
        let previous = self.inner.replace_pool();
        let generation = previous.generation + 1;
        // The previous pool's locks and threads may belong to the parent.
        std::mem::forget(previous);
        info!(
            role = %self.inner.role,
            generation,
            pid = self.inner.current_pid(),
            "Reset engine after fork"
        );
    }
}

/// A connection checked out of an [`Engine`]; returned to it on drop.
pub struct PooledConnection {
    role: Role,
    db_type: DatabaseType,
    conn: r2d2::PooledConnection<ConnectionFactory>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.id)
            .field("role", &self.role)
            .field("owner_pid", &self.conn.owner_pid)
            .finish()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.conn.id
    }

    pub fn owner_pid(&self) -> u32 {
        self.conn.owner_pid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn execute(&mut self, stmt: &Statement) -> DbResult<u64> {
        self.conn.raw()?.execute(stmt)
    }

    pub fn fetch_all(&mut self, stmt: &Statement) -> DbResult<Vec<Row>> {
        self.conn.raw()?.fetch_all(stmt)
    }

    pub fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
        self.conn.raw()?.execute_raw(sql)
    }

    pub fn ping(&mut self) -> DbResult<()> {
        self.conn.raw()?.ping()
    }

    /// Drop the physical connection instead of returning it, freeing its slot.
    ///
    /// Used when the connection may be left in an unknown protocol state.
    pub fn invalidate(mut self) {
        warn!(role = %self.role, connection_id = self.conn.id, "Invalidating connection");
        self.conn.discard = true;
    }
}
