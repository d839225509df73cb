//! Scoped session acquisition with nesting.
//!
//! A [`SessionManager`] owns at most one master session and one slave session.
//! Entering a scope increments a per-kind counter and exiting decrements it.
//! Only the outermost master scope commits or rolls back; inner scopes flush
//! (unless `autoflush` is off) so their writes are visible to the enclosing
//! scope without being durable. When a counter returns to zero the session is
//! closed and the next scope starts a new one. Post-commit hooks run after
//! the outermost master scope has closed, so a hook may open a master scope of
//! its own.
//!
//! Managers are not `Send`: create one per thread.
//!
//! ```ignore
//! let manager = database.session_manager();
//! manager.master_session(true, |session| {
//!     session.add(Statement::new("INSERT INTO jobs (name) VALUES (?)").bind("sync"));
//!     session.on_commit(|| println!("job stored"));
//!     Ok(())
//! })?;
//! ```

use crate::db::hooks::{HookRegistry, PostCommitHook, run_hooks};
use crate::db::registry::Engines;
use crate::db::session::{MasterSession, Session, SlaveSession};
use crate::error::{DbError, DbResult};
use std::cell::{Cell, RefCell};
use tracing::{debug, error, warn};

pub struct SessionManager {
    engines: Engines,
    registry: HookRegistry,
    master: RefCell<Option<MasterSession>>,
    open_masters: Cell<usize>,
    slave: RefCell<Option<SlaveSession>>,
    open_slaves: Cell<usize>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("open_masters", &self.open_masters.get())
            .field("open_slaves", &self.open_slaves.get())
            .finish_non_exhaustive()
    }
}

/// Decrements a scope counter on every exit path, closing the session at zero.
struct ScopeGuard<'a> {
    manager: &'a SessionManager,
    writable: bool,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let manager = self.manager;
        let counter = if self.writable {
            &manager.open_masters
        } else {
            &manager.open_slaves
        };
        let open = counter.get().saturating_sub(1);
        counter.set(open);
        if open > 0 {
            return;
        }
        if self.writable {
            manager.close_master();
        } else {
            manager.close_slave();
        }
    }
}

impl SessionManager {
    pub fn new(engines: Engines, registry: HookRegistry) -> Self {
        Self {
            engines,
            registry,
            master: RefCell::new(None),
            open_masters: Cell::new(0),
            slave: RefCell::new(None),
            open_slaves: Cell::new(0),
        }
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    /// Whether a master scope is currently open.
    pub fn has_open_master(&self) -> bool {
        self.open_masters.get() > 0
    }

    /// Current master nesting depth.
    pub fn master_depth(&self) -> usize {
        self.open_masters.get()
    }

    fn master_handle(&self) -> MasterSession {
        self.master
            .borrow_mut()
            .get_or_insert_with(|| {
                debug!("Opening master session");
                MasterSession::new(self.engines.master().clone(), self.registry.clone())
            })
            .clone()
    }

    fn slave_handle(&self) -> SlaveSession {
        self.slave
            .borrow_mut()
            .get_or_insert_with(|| {
                let engine = self.engines.choose_slave().clone();
                debug!(role = %engine.role(), "Opening slave session");
                SlaveSession::new(engine)
            })
            .clone()
    }

    /// Run `f` in a master scope.
    ///
    /// The outermost scope commits when `f` succeeds and rolls back when it
    /// fails; nested scopes flush when `autoflush` is set. The error returned
    /// by `f` is propagated. If the rollback itself fails, both errors are
    /// returned chained in `DbError::RollbackFailed`.
    pub fn master_session<T, F>(&self, autoflush: bool, f: F) -> DbResult<T>
    where
        F: FnOnce(&MasterSession) -> DbResult<T>,
    {
        let (value, hooks) = self.master_scope(autoflush, f)?;
        run_hooks(hooks);
        Ok(value)
    }

    fn master_scope<T, F>(&self, autoflush: bool, f: F) -> DbResult<(T, Vec<PostCommitHook>)>
    where
        F: FnOnce(&MasterSession) -> DbResult<T>,
    {
        let session = self.master_handle();
        self.open_masters.set(self.open_masters.get() + 1);
        let _guard = ScopeGuard {
            manager: self,
            writable: true,
        };
        let outermost = self.open_masters.get() == 1;

        let finished = f(&session).and_then(|value| {
            if outermost {
                return Ok((value, session.commit_deferring_hooks()?));
            }
            if autoflush {
                session.flush()?;
            }
            Ok((value, Vec::new()))
        });

        finished.map_err(|e| {
            if outermost {
                Self::rollback_after(&session, e)
            } else {
                e
            }
        })
    }

    fn rollback_after(session: &MasterSession, original: DbError) -> DbError {
        match session.rollback() {
            Ok(()) => {
                debug!(error = %original, "Rolled back master scope");
                original
            }
            Err(rollback) => {
                error!(
                    error = %original,
                    rollback_error = %rollback,
                    "Rollback failed while aborting master scope"
                );
                DbError::rollback_failed(original, rollback)
            }
        }
    }

    /// Run `f` in a read-only scope on a slave engine.
    ///
    /// Nested slave scopes share the session; the slave is chosen when the
    /// outermost scope opens. Exiting the outermost scope with queued writes
    /// fails with `ReadOnlyViolation`.
    pub fn slave_session<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&SlaveSession) -> DbResult<T>,
    {
        let session = self.slave_handle();
        self.open_slaves.set(self.open_slaves.get() + 1);
        let _guard = ScopeGuard {
            manager: self,
            writable: false,
        };
        let outermost = self.open_slaves.get() == 1;

        let value = f(&session)?;
        if outermost {
            session.flush()?;
        }
        Ok(value)
    }

    /// Run `f` in a master scope when `writable`, a slave scope otherwise.
    pub fn session<T, F>(&self, writable: bool, f: F) -> DbResult<T>
    where
        F: FnOnce(&Session) -> DbResult<T>,
    {
        if writable {
            self.master_session(true, |s| f(&Session::Master(s.clone())))
        } else {
            self.slave_session(|s| f(&Session::Slave(s.clone())))
        }
    }

    fn close_master(&self) {
        let session = self.master.borrow_mut().take();
        if let Some(session) = session {
            if let Err(e) = session.close() {
                warn!(error = %e, "Error while closing master session");
            }
        }
    }

    fn close_slave(&self) {
        let session = self.slave.borrow_mut().take();
        if let Some(session) = session {
            session.close();
        }
    }

    /// Close both sessions regardless of nesting.
    pub fn close_all(&self) {
        self.close_master();
        self.close_slave();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
