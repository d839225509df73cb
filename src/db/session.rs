//! Master and slave sessions.
//!
//! A session is a unit of work bound to one engine. It checks a connection out
//! on first use and returns it when the work ends. Handles are cheap clones of
//! the same session and are confined to the thread that created them.
//!
//! Master sessions queue writes with `add` and run them on `flush` inside a
//! transaction opened with the engine's isolation level. `commit` flushes,
//! commits, returns the connection and then runs post-commit hooks. A flush
//! that fails part way leaves the session unusable until it is rolled back,
//! so a partly applied unit of work can never be committed.
//!
//! Slave sessions run in autocommit and never open a transaction. Statements
//! that could write are rejected, and so is any flush with queued writes.

use crate::db::engine::{Engine, PooledConnection};
use crate::db::hooks::{HookArgs, HookRegistry, PendingHooks, PostCommitHook, run_hooks};
use crate::db::readonly::ensure_read_only;
use crate::error::{DbError, DbResult, TransactionStage};
use crate::models::{Role, Row, Statement};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

fn connection<'a>(
    conn: &'a mut Option<PooledConnection>,
    engine: &Engine,
) -> DbResult<&'a mut PooledConnection> {
    if conn.is_none() {
        *conn = Some(engine.checkout()?);
    }
    conn.as_mut()
        .ok_or_else(|| DbError::internal("Session has no connection"))
}

struct MasterState {
    engine: Engine,
    registry: HookRegistry,
    conn: Option<PooledConnection>,
    in_transaction: bool,
    pending: Vec<Statement>,
    hooks: PendingHooks,
    /// Set when a flush failed after running some of its statements.
    failed_flush: Option<String>,
}

impl MasterState {
    fn ensure_usable(&self) -> DbResult<()> {
        match &self.failed_flush {
            Some(reason) => Err(DbError::pending_rollback(reason.clone())),
            None => Ok(()),
        }
    }

    fn begin_if_needed(&mut self) -> DbResult<&mut PooledConnection> {
        self.ensure_usable()?;
        let begin = if self.in_transaction {
            Vec::new()
        } else {
            self.engine
                .isolation_level()
                .begin_statements(self.engine.db_type())
        };
        let conn = connection(&mut self.conn, &self.engine)?;
        if !begin.is_empty() {
            for sql in &begin {
                conn.execute_raw(sql)
                    .map_err(|e| DbError::transaction(TransactionStage::Begin, e))?;
            }
            self.in_transaction = true;
            debug!(connection_id = conn.id(), "Began transaction");
        }
        Ok(conn)
    }

    fn flush(&mut self) -> DbResult<()> {
        self.ensure_usable()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        self.begin_if_needed()?;
        let pending = std::mem::take(&mut self.pending);
        let conn = connection(&mut self.conn, &self.engine)?;
        for (executed, stmt) in pending.iter().enumerate() {
            if let Err(e) = conn.execute(stmt) {
                error!(
                    executed,
                    discarded = pending.len() - executed - 1,
                    error = %e,
                    "Flush failed, session needs a rollback"
                );
                self.failed_flush = Some(e.to_string());
                return Err(e);
            }
        }
        debug!(statements = pending.len(), "Flushed session");
        Ok(())
    }

    /// Roll back and return the connection. Hooks and queued writes are dropped.
    fn rollback(&mut self) -> DbResult<()> {
        self.pending.clear();
        self.failed_flush = None;
        let dropped_hooks = self.hooks.clear();
        if dropped_hooks > 0 {
            debug!(hooks = dropped_hooks, "Dropped post-commit hooks on rollback");
        }

        if !std::mem::replace(&mut self.in_transaction, false) {
            self.conn = None;
            return Ok(());
        }

        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        match conn.execute_raw("ROLLBACK") {
            Ok(()) => {
                debug!(connection_id = conn.id(), "Rolled back transaction");
                Ok(())
            }
            Err(e) => {
                error!(connection_id = conn.id(), error = %e, "Rollback failed");
                conn.invalidate();
                Err(DbError::transaction(TransactionStage::Rollback, e))
            }
        }
    }
}

impl Drop for MasterState {
    fn drop(&mut self) {
        if self.in_transaction {
            warn!("Master session dropped with an open transaction, rolling back");
            let _ = self.rollback();
        }
    }
}

/// Read-write session on the master engine.
#[derive(Clone)]
pub struct MasterSession {
    state: Rc<RefCell<MasterState>>,
}

impl std::fmt::Debug for MasterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("MasterSession")
            .field("role", &state.engine.role())
            .field("in_transaction", &state.in_transaction)
            .field("pending", &state.pending.len())
            .field("hooks", &state.hooks.len())
            .finish()
    }
}

impl MasterSession {
    pub fn new(engine: Engine, registry: HookRegistry) -> Self {
        Self {
            state: Rc::new(RefCell::new(MasterState {
                engine,
                registry,
                conn: None,
                in_transaction: false,
                pending: Vec::new(),
                hooks: PendingHooks::default(),
                failed_flush: None,
            })),
        }
    }

    pub fn role(&self) -> Role {
        self.state.borrow().engine.role()
    }

    /// Queue a write for the next flush.
    pub fn add(&self, stmt: impl Into<Statement>) {
        self.state.borrow_mut().pending.push(stmt.into());
    }

    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn is_clean(&self) -> bool {
        self.pending_count() == 0
    }

    pub fn in_transaction(&self) -> bool {
        self.state.borrow().in_transaction
    }

    pub fn pending_hooks(&self) -> usize {
        self.state.borrow().hooks.len()
    }

    /// Whether a failed flush has to be rolled back before anything else runs.
    pub fn needs_rollback(&self) -> bool {
        self.state.borrow().failed_flush.is_some()
    }

    /// Id of the checked out connection, if any.
    pub fn connection_id(&self) -> Option<u64> {
        self.state.borrow().conn.as_ref().map(PooledConnection::id)
    }

    /// Run the statement now, inside the session's transaction.
    ///
    /// Queued writes are not flushed first.
    pub fn execute(&self, stmt: impl Into<Statement>) -> DbResult<u64> {
        let stmt = stmt.into();
        let mut state = self.state.borrow_mut();
        state.begin_if_needed()?.execute(&stmt)
    }

    pub fn fetch_all(&self, stmt: impl Into<Statement>) -> DbResult<Vec<Row>> {
        let stmt = stmt.into();
        let mut state = self.state.borrow_mut();
        state.begin_if_needed()?.fetch_all(&stmt)
    }

    pub fn fetch_optional(&self, stmt: impl Into<Statement>) -> DbResult<Option<Row>> {
        Ok(self.fetch_all(stmt)?.into_iter().next())
    }

    /// Run queued writes in order without committing.
    pub fn flush(&self) -> DbResult<()> {
        self.state.borrow_mut().flush()
    }

    /// Flush, commit, return the connection, then run post-commit hooks.
    pub fn commit(&self) -> DbResult<()> {
        // Hooks run without the session borrowed so they may register new hooks.
        run_hooks(self.commit_deferring_hooks()?);
        Ok(())
    }

    /// Flush, commit and return the connection; hand back the post-commit
    /// hooks for the caller to run.
    pub(crate) fn commit_deferring_hooks(&self) -> DbResult<Vec<PostCommitHook>> {
        let mut state = self.state.borrow_mut();
        state.flush()?;
        if state.in_transaction {
            if let Some(conn) = state.conn.as_mut() {
                conn.execute_raw("COMMIT")
                    .map_err(|e| DbError::transaction(TransactionStage::Commit, e))?;
                info!(connection_id = conn.id(), "Committed transaction");
            }
            state.in_transaction = false;
        }
        state.conn = None;
        Ok(state.hooks.take())
    }

    pub fn rollback(&self) -> DbResult<()> {
        self.state.borrow_mut().rollback()
    }

    /// Roll back anything unfinished and return the connection.
    pub fn close(&self) -> DbResult<()> {
        let mut state = self.state.borrow_mut();
        let result = state.rollback();
        state.conn = None;
        result
    }

    /// Run `hook` once after the next successful commit.
    ///
    /// Under [`SessionManager::master_session`](crate::db::SessionManager::master_session)
    /// hooks run after the outermost scope has closed, so a hook that opens a
    /// master scope gets a new transaction of its own.
    pub fn on_commit(&self, hook: impl FnOnce() + 'static) {
        self.state
            .borrow_mut()
            .hooks
            .push(PostCommitHook::new("closure", hook));
    }

    /// Run the hook registered as `name` after the next successful commit.
    ///
    /// Fails immediately with `InvalidHook` when no such hook is registered.
    pub fn on_commit_named(&self, name: &str, args: HookArgs) -> DbResult<()> {
        let mut state = self.state.borrow_mut();
        let hook = state.registry.resolve(name)?;
        state.hooks.push(PostCommitHook::named(name, hook, args));
        Ok(())
    }
}

struct SlaveState {
    engine: Engine,
    conn: Option<PooledConnection>,
    pending: Vec<Statement>,
}

/// Read-only session on a slave engine.
#[derive(Clone)]
pub struct SlaveSession {
    state: Rc<RefCell<SlaveState>>,
}

impl std::fmt::Debug for SlaveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SlaveSession")
            .field("role", &state.engine.role())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl SlaveSession {
    pub fn new(engine: Engine) -> Self {
        Self {
            state: Rc::new(RefCell::new(SlaveState {
                engine,
                conn: None,
                pending: Vec::new(),
            })),
        }
    }

    pub fn role(&self) -> Role {
        self.state.borrow().engine.role()
    }

    /// Queue a write. It can never be flushed; see [`SlaveSession::flush`].
    pub fn add(&self, stmt: impl Into<Statement>) {
        self.state.borrow_mut().pending.push(stmt.into());
    }

    pub fn is_clean(&self) -> bool {
        self.state.borrow().pending.is_empty()
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.state.borrow().conn.as_ref().map(PooledConnection::id)
    }

    /// No-op on a clean session; `ReadOnlyViolation` when writes are queued.
    pub fn flush(&self) -> DbResult<()> {
        let pending = self.state.borrow().pending.len();
        if pending > 0 {
            return Err(DbError::read_only_violation(format!(
                "flush of {} pending write(s)",
                pending
            )));
        }
        Ok(())
    }

    /// Run a read-only statement. Writes fail with `ReadOnlyViolation`.
    pub fn execute(&self, stmt: impl Into<Statement>) -> DbResult<u64> {
        let stmt = stmt.into();
        let mut state = self.state.borrow_mut();
        ensure_read_only(&stmt.sql, state.engine.db_type())?;
        let SlaveState { engine, conn, .. } = &mut *state;
        connection(conn, engine)?.execute(&stmt)
    }

    pub fn fetch_all(&self, stmt: impl Into<Statement>) -> DbResult<Vec<Row>> {
        let stmt = stmt.into();
        let mut state = self.state.borrow_mut();
        ensure_read_only(&stmt.sql, state.engine.db_type())?;
        let SlaveState { engine, conn, .. } = &mut *state;
        connection(conn, engine)?.fetch_all(&stmt)
    }

    pub fn fetch_optional(&self, stmt: impl Into<Statement>) -> DbResult<Option<Row>> {
        Ok(self.fetch_all(stmt)?.into_iter().next())
    }

    /// Drop queued writes and return the connection.
    pub fn close(&self) {
        let mut state = self.state.borrow_mut();
        if !state.pending.is_empty() {
            warn!(
                pending = state.pending.len(),
                "Discarding writes queued on a slave session"
            );
            state.pending.clear();
        }
        state.conn = None;
    }
}

/// Either kind of session, for code that takes the role as a flag.
#[derive(Debug, Clone)]
pub enum Session {
    Master(MasterSession),
    Slave(SlaveSession),
}

impl Session {
    pub fn role(&self) -> Role {
        match self {
            Self::Master(s) => s.role(),
            Self::Slave(s) => s.role(),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Master(_))
    }

    pub fn as_master(&self) -> Option<&MasterSession> {
        match self {
            Self::Master(s) => Some(s),
            Self::Slave(_) => None,
        }
    }

    pub fn add(&self, stmt: impl Into<Statement>) {
        match self {
            Self::Master(s) => s.add(stmt),
            Self::Slave(s) => s.add(stmt),
        }
    }

    pub fn execute(&self, stmt: impl Into<Statement>) -> DbResult<u64> {
        match self {
            Self::Master(s) => s.execute(stmt),
            Self::Slave(s) => s.execute(stmt),
        }
    }

    pub fn fetch_all(&self, stmt: impl Into<Statement>) -> DbResult<Vec<Row>> {
        match self {
            Self::Master(s) => s.fetch_all(stmt),
            Self::Slave(s) => s.fetch_all(stmt),
        }
    }

    pub fn fetch_optional(&self, stmt: impl Into<Statement>) -> DbResult<Option<Row>> {
        match self {
            Self::Master(s) => s.fetch_optional(stmt),
            Self::Slave(s) => s.fetch_optional(stmt),
        }
    }

    pub fn flush(&self) -> DbResult<()> {
        match self {
            Self::Master(s) => s.flush(),
            Self::Slave(s) => s.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::engine::testing::{Journal, mock_engine, options};
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn master() -> (MasterSession, Arc<Journal>, Engine) {
        let (engine, journal) = mock_engine(Role::Master, options(2, 0));
        (
            MasterSession::new(engine.clone(), HookRegistry::new()),
            journal,
            engine,
        )
    }

    #[test]
    fn test_commit_flushes_queued_writes_in_transaction() {
        let (session, journal, engine) = master();
        session.add("INSERT INTO t VALUES (1)");
        session.add("INSERT INTO t VALUES (2)");
        assert_eq!(session.pending_count(), 2);
        assert!(journal.statements().is_empty());

        session.commit().unwrap();
        assert_eq!(
            journal.statements(),
            vec![
                "BEGIN ISOLATION LEVEL READ COMMITTED",
                "INSERT INTO t VALUES (1)",
                "INSERT INTO t VALUES (2)",
                "COMMIT",
            ]
        );
        assert!(session.is_clean());
        assert!(session.connection_id().is_none());
        assert_eq!(engine.status().idle, 1);
    }

    #[test]
    fn test_hooks_run_after_commit_only() {
        let (session, journal, _engine) = master();
        let fired = Rc::new(Cell::new(0));

        let counter = Rc::clone(&fired);
        session.on_commit(move || counter.set(counter.get() + 1));
        session.execute("UPDATE t SET x = 1").unwrap();
        assert_eq!(fired.get(), 0);

        session.commit().unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(journal.count("COMMIT"), 1);

        // Cleared after firing.
        session.commit().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_hook_registered_during_hook_waits_for_next_commit() {
        let (session, _journal, _engine) = master();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let inner_session = session.clone();
        let log = Rc::clone(&fired);
        session.on_commit(move || {
            log.borrow_mut().push("first");
            let log = Rc::clone(&log);
            inner_session.on_commit(move || log.borrow_mut().push("second"));
        });

        session.commit().unwrap();
        assert_eq!(*fired.borrow(), vec!["first"]);
        assert_eq!(session.pending_hooks(), 1);

        session.commit().unwrap();
        assert_eq!(*fired.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_rollback_drops_hooks_and_pending() {
        let (session, journal, _engine) = master();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        session.on_commit(move || flag.set(true));
        session.execute("DELETE FROM t").unwrap();
        session.add("INSERT INTO t VALUES (3)");

        session.rollback().unwrap();
        assert_eq!(journal.count("ROLLBACK"), 1);
        assert!(session.is_clean());
        assert_eq!(session.pending_hooks(), 0);

        session.commit().unwrap();
        assert!(!fired.get());
        assert_eq!(journal.count("COMMIT"), 0);
    }

    #[test]
    fn test_failed_commit_keeps_hooks_unfired() {
        let (session, journal, _engine) = master();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        session.on_commit(move || flag.set(true));
        session.execute("UPDATE t SET x = 2").unwrap();

        journal.fail_commit.store(true, Ordering::SeqCst);
        let err = session.commit().unwrap_err();
        assert!(matches!(
            err,
            DbError::Transaction {
                stage: TransactionStage::Commit,
                ..
            }
        ));
        assert!(!fired.get());
        assert!(session.in_transaction());
    }

    #[test]
    fn test_failed_rollback_invalidates_connection() {
        let (session, journal, engine) = master();
        session.execute("UPDATE t SET x = 3").unwrap();
        journal.fail_rollback.store(true, Ordering::SeqCst);

        assert!(session.rollback().is_err());
        let status = engine.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.checked_out, 0);
    }

    #[test]
    fn test_named_hook_must_be_registered() {
        let (engine, _journal) = mock_engine(Role::Master, options(1, 0));
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        registry.register("audit", move |args: &HookArgs| {
            sink.fetch_add(args.positional.len(), Ordering::SeqCst);
        });
        let session = MasterSession::new(engine, registry);

        let err = session
            .on_commit_named("missing", HookArgs::new())
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidHook { .. }));

        session
            .on_commit_named("audit", HookArgs::new().arg(1).arg(2))
            .unwrap();
        session.commit().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_autocommit_master_never_begins() {
        let mut opts = options(1, 0);
        opts.isolation_level = crate::models::IsolationLevel::Autocommit;
        let (engine, journal) = mock_engine(Role::Master, opts);
        let session = MasterSession::new(engine, HookRegistry::new());

        session.execute("INSERT INTO t VALUES (1)").unwrap();
        session.commit().unwrap();
        assert_eq!(journal.statements(), vec!["INSERT INTO t VALUES (1)"]);
    }

    #[test]
    fn test_slave_rejects_flush_with_pending_writes() {
        let (engine, _journal) = mock_engine(Role::Slave(0), options(1, 0));
        let session = SlaveSession::new(engine);
        session.flush().unwrap();

        session.add("INSERT INTO t VALUES (1)");
        let err = session.flush().unwrap_err();
        assert!(matches!(err, DbError::ReadOnlyViolation { .. }));

        session.close();
        assert!(session.is_clean());
    }

    #[test]
    fn test_slave_rejects_write_statements() {
        let (engine, journal) = mock_engine(Role::Slave(0), options(1, 0));
        let session = SlaveSession::new(engine);

        let rows = session.fetch_all("SELECT * FROM t").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(matches!(
            session.execute("UPDATE t SET x = 1"),
            Err(DbError::ReadOnlyViolation { .. })
        ));
        assert_eq!(journal.statements(), vec!["SELECT * FROM t"]);
    }

    #[test]
    fn test_failed_flush_requires_rollback() {
        let (session, journal, engine) = master();
        *journal.fail_sql_containing.lock().unwrap() = Some("(2)".to_string());
        session.add("INSERT INTO t VALUES (1)");
        session.add("INSERT INTO t VALUES (2)");
        session.add("INSERT INTO t VALUES (3)");

        assert!(matches!(session.flush(), Err(DbError::Database { .. })));
        assert!(session.needs_rollback());
        *journal.fail_sql_containing.lock().unwrap() = None;

        // Neither more work nor a commit may follow the partial flush.
        assert!(matches!(
            session.execute("INSERT INTO t VALUES (4)"),
            Err(DbError::PendingRollback { .. })
        ));
        assert!(matches!(session.commit(), Err(DbError::PendingRollback { .. })));
        assert_eq!(journal.count("COMMIT"), 0);
        assert_eq!(journal.count("INSERT INTO t VALUES (3)"), 0);

        session.rollback().unwrap();
        assert!(!session.needs_rollback());
        assert_eq!(engine.status().idle, 1);

        session.execute("INSERT INTO t VALUES (4)").unwrap();
        session.commit().unwrap();
        assert_eq!(journal.count("COMMIT"), 1);
    }
}
