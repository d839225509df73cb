//! Read-only statement classification for slave sessions.
//!
//! Slave sessions accept only statements whose syntax does not modify data.
//! Parsing goes through [sqlparser](https://docs.rs/sqlparser/) with the
//! backend's dialect. Every statement of a multi-statement string is checked,
//! queries are walked into CTEs and set operations, and row locks
//! (`FOR UPDATE`, `FOR SHARE`) count as writes.
//!
//! Classification is syntactic. A `SELECT` calling a function with side
//! effects (`SELECT nextval('seq')`, a user-defined function that writes) is
//! accepted; the server-side read-only transaction is the backstop for those.

use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

/// Whether a parsed statement only reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Reject any SQL that is not a pure read.
///
/// Returns `DbError::ReadOnlyViolation` naming the first offending operation,
/// or `DbError::InvalidInput` when the text cannot be parsed.
pub fn ensure_read_only(sql: &str, db_type: DatabaseType) -> DbResult<()> {
    let dialect = get_dialect(db_type);
    let statements = Parser::parse_sql(dialect.as_ref(), sql)
        .map_err(|e| DbError::invalid_input(format!("Failed to parse SQL statement: {}", e)))?;

    if statements.is_empty() {
        return Err(DbError::invalid_input("Empty SQL statement"));
    }

    for stmt in &statements {
        if let (StatementKind::Write, operation) = classify(stmt) {
            return Err(DbError::read_only_violation(operation));
        }
    }
    Ok(())
}

/// Classify a statement and name the operation for error messages.
pub fn classify(stmt: &Statement) -> (StatementKind, String) {
    let read = |name: &str| (StatementKind::Read, name.to_string());
    let write = |name: &str| (StatementKind::Write, name.to_string());

    match stmt {
        Statement::Query(query) => match query_write(query) {
            Some(operation) => write(&operation),
            None => read("SELECT"),
        },
        Statement::ShowTables { .. } => read("SHOW TABLES"),
        Statement::ShowColumns { .. } => read("SHOW COLUMNS"),
        Statement::ShowDatabases { .. } => read("SHOW DATABASES"),
        Statement::ShowCreate { .. } => read("SHOW CREATE"),
        Statement::ShowVariable { .. } => read("SHOW VARIABLE"),
        Statement::ShowVariables { .. } => read("SHOW VARIABLES"),
        Statement::ExplainTable { .. } => read("EXPLAIN TABLE"),
        // EXPLAIN ANALYZE executes the inner statement
        Statement::Explain { statement, .. } => match classify(statement) {
            (StatementKind::Read, _) => read("EXPLAIN"),
            write_op => write_op,
        },

        Statement::Insert(_) => write("INSERT"),
        Statement::Update { .. } => write("UPDATE"),
        Statement::Delete(_) => write("DELETE"),
        Statement::Merge { .. } => write("MERGE"),
        Statement::Truncate { .. } => write("TRUNCATE"),
        Statement::CreateTable { .. } => write("CREATE TABLE"),
        Statement::AlterTable { .. } => write("ALTER TABLE"),
        Statement::Drop { .. } => write("DROP"),
        Statement::StartTransaction { .. } => write("BEGIN"),
        Statement::Commit { .. } => write("COMMIT"),
        Statement::Rollback { .. } => write("ROLLBACK"),
        Statement::Set(_) => write("SET"),
        Statement::Pragma { .. } => write("PRAGMA"),
        other => {
            let text = other.to_string();
            let keyword = text.split_whitespace().next().unwrap_or("UNKNOWN");
            write(&keyword.to_uppercase())
        }
    }
}

/// Name the first data-modifying part of a query, if any.
fn query_write(query: &Query) -> Option<String> {
    if let Some(lock) = query.locks.first() {
        return Some(format!("SELECT {}", lock));
    }
    query
        .with
        .iter()
        .flat_map(|with| &with.cte_tables)
        .find_map(|cte| query_write(&cte.query))
        .or_else(|| set_expr_write(&query.body))
}

fn set_expr_write(body: &SetExpr) -> Option<String> {
    match body {
        SetExpr::Select(select) if select.into.is_some() => Some("SELECT INTO".to_string()),
        SetExpr::Query(query) => query_write(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_write(left).or_else(|| set_expr_write(right))
        }
        SetExpr::Insert(stmt)
        | SetExpr::Update(stmt)
        | SetExpr::Delete(stmt)
        | SetExpr::Merge(stmt) => Some(classify(stmt).1),
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => None,
    }
}
