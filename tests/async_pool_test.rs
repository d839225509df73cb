//! Integration tests for the async access paths on SQLite.
//!
//! Tests verify that:
//! - The process pool is a singleton until closed, and a new one afterwards
//! - Pool queries and transactions see each other's committed data
//! - Scoped connections are closed after every scope, failed or not

use dbroute::config::DbSettings;
use dbroute::db::{Database, DbPool};
use dbroute::error::DbError;
use dbroute::models::{Role, RoleConfig, Statement};
use tempfile::TempDir;

fn database() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("async.db").display());
    let settings = DbSettings::new(RoleConfig::new(url).unwrap(), vec![]);
    (dir, Database::new(settings).unwrap())
}

async fn create_table(pool: &DbPool) {
    pool.execute(&Statement::new(
        "CREATE TABLE IF NOT EXISTS events (id INTEGER PRIMARY KEY, kind TEXT)",
    ))
    .await
    .unwrap();
}

#[tokio::test]
async fn test_close_then_reacquire_gives_new_pool() {
    let (_dir, database) = database();

    let first = database.acquire_pool().await.unwrap();
    assert_eq!(first.owner_pid(), std::process::id());
    create_table(first.pool()).await;
    first
        .pool()
        .execute(&Statement::new("INSERT INTO events (kind) VALUES (?)").bind("before"))
        .await
        .unwrap();

    assert_eq!(
        database.acquire_pool().await.unwrap().id(),
        first.id(),
        "second acquire reuses the live pool"
    );

    assert!(database.close_pool().await);
    assert!(first.pool().is_closed());
    assert!(database.async_pool().current().await.is_none());

    let second = database.acquire_pool().await.unwrap();
    assert_ne!(second.id(), first.id());
    assert!(second.created_at() >= first.created_at());

    let rows = second
        .pool()
        .fetch_all(&Statement::new("SELECT kind FROM events"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["kind"], "before");

    // The closed instance refuses work.
    let err = first
        .pool()
        .fetch_all(&Statement::new("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));

    database.close_pool().await;
}

#[tokio::test]
async fn test_pool_transaction_rollback_on_drop() {
    let (_dir, database) = database();
    let handle = database.acquire_pool().await.unwrap();
    let pool = handle.pool();
    create_table(pool).await;

    {
        let mut tx = pool.begin().await.unwrap();
        tx.execute(&Statement::new("INSERT INTO events (kind) VALUES (?)").bind("dropped"))
            .await
            .unwrap();
    }

    let mut tx = pool.begin().await.unwrap();
    tx.execute(&Statement::new("INSERT INTO events (kind) VALUES (?)").bind("committed"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let rows = pool
        .fetch_all(&Statement::new("SELECT kind FROM events"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["kind"], "committed");

    database.close_pool().await;
}

#[tokio::test]
async fn test_scoped_connection_per_role() {
    let (_dir, database) = database();

    let master = database.scoped_connections(Role::Master).unwrap();
    master
        .with_connection(|conn| {
            Box::pin(async move {
                conn.execute_raw("CREATE TABLE notes (body TEXT)").await?;
                conn.execute(&Statement::new("INSERT INTO notes VALUES (?)").bind("hi"))
                    .await
            })
        })
        .await
        .unwrap();

    let slave = database.scoped_connections(Role::Slave(0)).unwrap();
    let rows = slave
        .with_connection(|conn| {
            Box::pin(async move { conn.fetch_all(&Statement::new("SELECT body FROM notes")).await })
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    // Slave scoped connections open the file read-only.
    let err = slave
        .with_connection(|conn| {
            Box::pin(async move {
                conn.execute(&Statement::new("INSERT INTO notes VALUES ('x')"))
                    .await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));

    let elapsed = master.ping().await.unwrap();
    assert!(elapsed.as_secs() < 5);
}

#[tokio::test]
async fn test_concurrent_acquire_creates_one_pool() {
    let (_dir, database) = database();

    let (a, b) = tokio::join!(database.acquire_pool(), database.acquire_pool());
    assert_eq!(a.unwrap().id(), b.unwrap().id());

    database.close_pool().await;
}
