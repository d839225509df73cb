//! dbroute Library
//!
//! Master/slave routed database sessions for blocking code, a process-wide
//! async pool for async code, and fork-safe lifecycle management around both
//! (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, DbSettings};
pub use db::{Database, SessionManager};
pub use error::{DbError, DbResult};
