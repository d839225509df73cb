//! Integration tests for the sync session manager on SQLite.
//!
//! Tests verify that:
//! - Master scopes commit once, at the outermost exit
//! - A failing master scope rolls back everything, nested writes included
//! - Post-commit hooks run after commit and never after rollback
//! - Slave scopes reject writes and see only committed data

use dbroute::config::DbSettings;
use dbroute::db::{Database, HookArgs, SessionManager};
use dbroute::error::DbError;
use dbroute::models::{RoleConfig, Statement};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Create a SQLite database with an `items` table and a manager over it.
fn setup() -> (TempDir, Database, SessionManager) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?pool_size=2", dir.path().join("items.db").display());
    let master = dbroute::config::parse_role(&url).unwrap();
    let database = Database::new(DbSettings::new(master, vec![])).unwrap();
    let manager = database.session_manager();

    manager
        .master_session(true, |session| {
            session.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")?;
            Ok(())
        })
        .unwrap();

    (dir, database, manager)
}

fn insert(name: &str) -> Statement {
    Statement::new("INSERT INTO items (name) VALUES (?)").bind(name)
}

fn names(manager: &SessionManager) -> Vec<String> {
    manager
        .slave_session(|session| session.fetch_all("SELECT name FROM items ORDER BY id"))
        .unwrap()
        .into_iter()
        .map(|row| row["name"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_commit_visible_only_after_outermost_scope() {
    let (_dir, database, manager) = setup();
    let reader = Database::new(database.settings().clone())
        .unwrap()
        .session_manager();

    manager
        .master_session(true, |outer| {
            outer.add(insert("a"));
            manager.master_session(true, |inner| {
                inner.add(insert("b"));
                Ok(())
            })?;
            // Inner scope flushed into the open transaction.
            assert!(outer.is_clean());
            assert!(outer.in_transaction());
            assert_eq!(manager.master_depth(), 1);
            assert!(names(&reader).is_empty());
            Ok(())
        })
        .unwrap();

    assert!(!manager.has_open_master());
    assert_eq!(names(&reader), vec!["a", "b"]);
}

#[test]
fn test_error_rolls_back_nested_writes() {
    let (_dir, _database, manager) = setup();

    let err = manager
        .master_session(true, |outer| {
            outer.add(insert("kept?"));
            manager.master_session(true, |inner| {
                inner.add(insert("nested"));
                Ok(())
            })?;
            Err::<(), _>(DbError::aborted("validation failed"))
        })
        .unwrap_err();

    assert!(matches!(err, DbError::Aborted { .. }));
    assert!(names(&manager).is_empty());

    // The next scope starts a fresh session and commits normally.
    manager
        .master_session(true, |session| {
            session.add(insert("after"));
            Ok(())
        })
        .unwrap();
    assert_eq!(names(&manager), vec!["after"]);
}

#[test]
fn test_sql_error_inside_scope_is_propagated() {
    let (_dir, _database, manager) = setup();

    let err = manager
        .master_session(true, |session| {
            session.add(insert("lost"));
            session.flush()?;
            session.execute("INSERT INTO missing (x) VALUES (1)")
        })
        .unwrap_err();

    assert!(matches!(err, DbError::Database { .. }));
    assert!(names(&manager).is_empty());
}

#[test]
fn test_hooks_run_after_commit_in_order() {
    let (_dir, database, manager) = setup();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let named = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&named);
    database.hooks().register("audit", move |args: &HookArgs| {
        sink.lock().unwrap().push(args.keyword["table"].clone());
    });

    manager
        .master_session(true, |session| {
            session.add(insert("x"));
            for i in 0..3 {
                let seen = Rc::clone(&seen);
                session.on_commit(move || seen.borrow_mut().push(i));
            }
            session.on_commit_named("audit", HookArgs::new().kwarg("table", "items"))?;
            assert!(seen.borrow().is_empty());
            Ok(())
        })
        .unwrap();

    assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    assert_eq!(named.lock().unwrap().len(), 1);
}

#[test]
fn test_hooks_dropped_on_rollback() {
    let (_dir, _database, manager) = setup();
    let fired = Rc::new(RefCell::new(false));

    let flag = Rc::clone(&fired);
    let _ = manager.master_session(true, |session| {
        session.add(insert("x"));
        session.on_commit(move || *flag.borrow_mut() = true);
        Err::<(), _>(DbError::aborted("nope"))
    });
    assert!(!*fired.borrow());

    // Nothing carried over into the next commit either.
    manager.master_session(true, |_| Ok(())).unwrap();
    assert!(!*fired.borrow());
}

#[test]
fn test_unknown_named_hook_fails_at_registration() {
    let (_dir, _database, manager) = setup();

    let err = manager
        .master_session(true, |session| {
            session.add(insert("x"));
            session.on_commit_named("missing", HookArgs::new())
        })
        .unwrap_err();

    assert!(matches!(err, DbError::InvalidHook { .. }));
    assert!(names(&manager).is_empty());
}

#[test]
fn test_slave_scope_rejects_writes() {
    let (_dir, _database, manager) = setup();

    let err = manager
        .slave_session(|session| session.execute(insert("x")))
        .unwrap_err();
    assert!(matches!(err, DbError::ReadOnlyViolation { .. }));

    let err = manager
        .slave_session(|session| {
            session.add(insert("queued"));
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, DbError::ReadOnlyViolation { .. }));

    // A clean slave scope flushes as a no-op.
    manager.slave_session(|session| session.flush()).unwrap();
    assert!(names(&manager).is_empty());
}

#[test]
fn test_session_by_flag() {
    let (_dir, _database, manager) = setup();

    manager
        .session(true, |session| {
            assert!(session.is_writable());
            session.add(insert("flagged"));
            Ok(())
        })
        .unwrap();

    let row = manager
        .session(false, |session| {
            assert!(!session.is_writable());
            session.fetch_optional("SELECT name FROM items")
        })
        .unwrap()
        .unwrap();
    assert_eq!(row["name"], "flagged");
}

#[test]
fn test_engines_return_connections() {
    let (_dir, database, manager) = setup();
    manager
        .master_session(true, |session| {
            session.add(insert("x"));
            Ok(())
        })
        .unwrap();

    let master = &database.engines().status()[0];
    assert_eq!(master.role, "master");
    assert_eq!(master.pool.checked_out, 0);
    assert!(master.pool.idle >= 1);

    database.dispose_engines();
    assert_eq!(database.engines().status()[0].pool.idle, 0);
}

#[test]
fn test_default_settings_route_reads_to_master_config() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("single.db").display());
    let settings = DbSettings::new(RoleConfig::new(url).unwrap(), vec![]);
    assert_eq!(settings.slaves.len(), 1);
    assert_eq!(
        settings.slaves[0].connection_string,
        settings.master.connection_string
    );
}
