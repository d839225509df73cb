//! Process-wide database state.
//!
//! [`Database`] bundles the sync engines, the async pool and the hook registry
//! resolved from one [`DbSettings`]. It can be owned directly, or installed as
//! the process singleton with [`init`] and reached through [`current`].
//!
//! The singleton remembers the process that installed it. In a forked child,
//! [`current`] fails with `ForkSafetyViolation` until [`after_fork`] has dropped
//! the inherited connections.

use crate::config::DbSettings;
use crate::db::engine::{PidProvider, default_pid_provider};
use crate::db::hooks::HookRegistry;
use crate::db::manager::SessionManager;
use crate::db::pool::{AsyncPool, ConnectionManager, PoolHandle};
use crate::db::registry::Engines;
use crate::error::{DbError, DbResult};
use crate::models::Role;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Engines, async pool and hooks for one process.
pub struct Database {
    settings: DbSettings,
    engines: Engines,
    async_pool: AsyncPool,
    hooks: HookRegistry,
    pid: PidProvider,
    owner_pid: AtomicU32,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("engines", &self.engines)
            .field("async_pool", &self.async_pool)
            .field("owner_pid", &self.owner_pid.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Build engines and the (not yet connected) async pool.
    pub fn new(settings: DbSettings) -> DbResult<Self> {
        let engines = Engines::configure(&settings)?;
        let async_pool = AsyncPool::new(
            settings.master.clone(),
            settings.application_name.as_deref(),
            settings.pool_timeout,
        );
        let pid = default_pid_provider();
        let owner_pid = AtomicU32::new(pid());
        Ok(Self {
            settings,
            engines,
            async_pool,
            hooks: HookRegistry::new(),
            pid,
            owner_pid,
        })
    }

    /// Use a custom process id source for the ownership checks.
    pub fn with_pid_provider(self, pid: PidProvider) -> Self {
        let owner_pid = AtomicU32::new(pid());
        Self {
            async_pool: self.async_pool.with_pid_provider(Arc::clone(&pid)),
            pid,
            owner_pid,
            ..self
        }
    }

    pub fn settings(&self) -> &DbSettings {
        &self.settings
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    /// Named post-commit hooks shared by every session manager.
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn async_pool(&self) -> &AsyncPool {
        &self.async_pool
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid.load(Ordering::SeqCst)
    }

    /// Fails when called from a process other than the one that owns the state.
    pub fn ensure_owned(&self) -> DbResult<()> {
        let owner = self.owner_pid();
        let current = (self.pid)();
        if owner == current {
            Ok(())
        } else {
            Err(DbError::fork_safety_violation(owner, current))
        }
    }

    /// New session manager for the calling thread.
    pub fn session_manager(&self) -> SessionManager {
        SessionManager::new(self.engines.clone(), self.hooks.clone())
    }

    /// The process-wide async pool, created on first call.
    pub async fn acquire_pool(&self) -> DbResult<PoolHandle> {
        self.async_pool.acquire().await
    }

    /// Close the async pool. A later [`Database::acquire_pool`] creates a new one.
    pub async fn close_pool(&self) -> bool {
        self.async_pool.close().await
    }

    /// Single-connection access to one role, bypassing every pool.
    pub fn scoped_connections(&self, role: Role) -> DbResult<ConnectionManager> {
        let config = match role {
            Role::Master => &self.settings.master,
            Role::Slave(idx) => self.settings.slaves.get(idx).ok_or_else(|| {
                DbError::invalid_input(format!(
                    "No slave {} (configured slaves: {})",
                    idx,
                    self.settings.slaves.len()
                ))
            })?,
        };
        let application_name = self
            .settings
            .application_name
            .as_ref()
            .map(|name| format!("{}:{}:scoped", name, role));
        Ok(ConnectionManager::new(config.clone())
            .with_application_name(application_name)
            .read_only(!role.is_master()))
    }

    /// Close every engine pool. Blocks; use `spawn_blocking` from async code.
    pub fn dispose_engines(&self) {
        self.engines.dispose_all();
    }

    /// Re-initialize every pool for the calling process and take ownership.
    ///
    /// Inherited connections are forgotten without a close handshake. Engines
    /// also rebuild their pool on the first checkout in a new process, so this
    /// mainly releases the slots the parent still held.
    pub fn after_fork(&self) {
        self.engines.reset_after_fork();
        self.async_pool.reset_after_fork();
        let current = (self.pid)();
        let previous = self.owner_pid.swap(current, Ordering::SeqCst);
        info!(previous_pid = previous, pid = current, "Reset database state after fork");
    }
}

static STATE: RwLock<Option<Arc<Database>>> = RwLock::new(None);

/// Install the process-wide state.
///
/// Fails if state is already installed; call [`shutdown`] first.
pub fn init(settings: DbSettings) -> DbResult<Arc<Database>> {
    install(Database::new(settings)?)
}

/// Install an already built [`Database`] as the process-wide state.
pub fn install(database: Database) -> DbResult<Arc<Database>> {
    let mut state = STATE.write().unwrap_or_else(PoisonError::into_inner);
    if state.is_some() {
        return Err(DbError::configuration(
            "Database state is already initialized in this process",
        ));
    }
    let database = Arc::new(database);
    *state = Some(Arc::clone(&database));
    info!(
        slaves = database.engines.slaves().len(),
        pid = database.owner_pid(),
        "Initialized database state"
    );
    Ok(database)
}

/// The process-wide state.
pub fn current() -> DbResult<Arc<Database>> {
    let database = STATE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(DbError::NotInitialized)?;
    database.ensure_owned()?;
    Ok(database)
}

/// Reset the inherited state in a forked child. Call before anything else.
pub fn after_fork() -> DbResult<Arc<Database>> {
    let database = STATE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(DbError::NotInitialized)?;
    database.after_fork();
    Ok(database)
}

/// Close the async pool, dispose every engine and uninstall the state.
///
/// Returns `false` when nothing was installed.
pub async fn shutdown() -> DbResult<bool> {
    let taken = STATE.write().unwrap_or_else(PoisonError::into_inner).take();
    let Some(database) = taken else {
        return Ok(false);
    };
    database.close_pool().await;
    let engines = database.engines.clone();
    tokio::task::spawn_blocking(move || engines.dispose_all())
        .await
        .map_err(|e| DbError::internal(format!("Engine disposal failed: {}", e)))?;
    info!("Shut down database state");
    Ok(true)
}
