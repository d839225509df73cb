//! Connection-related data models.
//!
//! This module defines database roles, isolation levels and the resolved
//! per-role configuration that engines and pools are built from.

use crate::config::{DEFAULT_MAX_OVERFLOW, DEFAULT_POOL_SIZE};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Role an engine plays in the master/slave topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The single read-write engine.
    Master,
    /// A read-only engine, indexed in configuration order.
    Slave(usize),
}

impl Role {
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Slave(idx) => write!(f, "slave-{}", idx),
        }
    }
}

/// Transaction isolation requested for connections of a role.
///
/// `Autocommit` never opens an explicit transaction; slaves use it because
/// they never write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Autocommit,
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn is_autocommit(&self) -> bool {
        matches!(self, Self::Autocommit)
    }

    fn sql_name(&self) -> Option<&'static str> {
        match self {
            Self::Autocommit => None,
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::Serializable => Some("SERIALIZABLE"),
        }
    }

    /// Statements that open a transaction at this level on the given backend.
    ///
    /// Empty for `Autocommit`. SQLite has no per-transaction isolation levels,
    /// so it always gets a plain `BEGIN`.
    pub fn begin_statements(&self, db_type: DatabaseType) -> Vec<String> {
        let Some(level) = self.sql_name() else {
            return Vec::new();
        };
        match db_type {
            DatabaseType::PostgreSQL => vec![format!("BEGIN ISOLATION LEVEL {}", level)],
            DatabaseType::MySQL => vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", level),
                "START TRANSACTION".to_string(),
            ],
            DatabaseType::SQLite => vec!["BEGIN".to_string()],
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "autocommit" => Ok(Self::Autocommit),
            "read_uncommitted" => Ok(Self::ReadUncommitted),
            "read_committed" => Ok(Self::ReadCommitted),
            "repeatable_read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            _ => Err(format!("Unknown isolation level: {}", s)),
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.sql_name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "AUTOCOMMIT"),
        }
    }
}

/// Resolved configuration for one database role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Optional name from the `name=url` form, used in logs only.
    pub name: Option<String>,
    pub db_type: DatabaseType,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub isolation_level: IsolationLevel,
    /// Ping idle connections before handing them out.
    pub pre_ping: bool,
}

impl RoleConfig {
    /// Create a role configuration with default sizing.
    pub fn new(connection_string: impl Into<String>) -> Result<Self, ConnectionConfigError> {
        let connection_string = connection_string.into();
        let db_type = DatabaseType::from_connection_string(&connection_string)
            .ok_or_else(|| ConnectionConfigError::UnknownDatabaseType(mask(&connection_string)))?;

        Ok(Self {
            name: None,
            db_type,
            connection_string,
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
            isolation_level: IsolationLevel::default(),
            pre_ping: true,
        })
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_overflow(mut self, max_overflow: u32) -> Self {
        self.max_overflow = max_overflow;
        self
    }

    pub fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    pub fn with_pre_ping(mut self, pre_ping: bool) -> Self {
        self.pre_ping = pre_ping;
        self
    }

    /// Maximum number of physical connections a sync engine may hold at once.
    pub fn capacity(&self) -> u32 {
        self.pool_size + self.max_overflow
    }

    /// `(min, max)` sizing for the async pool: `pool_size ∓ max_overflow`.
    pub fn async_pool_bounds(&self) -> (u32, u32) {
        (
            self.pool_size.saturating_sub(self.max_overflow),
            self.pool_size + self.max_overflow,
        )
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        mask(&self.connection_string)
    }
}

fn mask(connection_string: &str) -> String {
    // Simple masking: replace password in URL
    if let Some(at_pos) = connection_string.find('@') {
        if let Some(colon_pos) = connection_string[..at_pos].rfind(':') {
            if connection_string[colon_pos + 1..].starts_with("//") {
                // scheme separator, no password present
                return connection_string.to_string();
            }
            let prefix = &connection_string[..colon_pos + 1];
            let suffix = &connection_string[at_pos..];
            return format!("{}****{}", prefix, suffix);
        }
    }
    connection_string.to_string()
}

/// Errors that can occur when creating a role configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    /// Could not determine database type from connection string
    #[error("Unknown database type in connection string: {0}")]
    UnknownDatabaseType(String),
}
