//! Data models shared by engines, sessions and pools.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionConfigError, DatabaseType, IsolationLevel, Role, RoleConfig};
pub use query::{QueryParam, Row, Statement};
