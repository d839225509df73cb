//! Database access layer.
//!
//! This module provides:
//! - Sync engines (one per role) with fork-safe checkout
//! - Master/slave sessions and the nesting session manager
//! - Post-commit hooks
//! - The async pool singleton and scoped single connections
//! - Process-wide lifecycle (init, after fork, shutdown)
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod connection;
pub mod engine;
pub mod hooks;
pub mod lifecycle;
pub mod manager;
pub mod params;
pub mod pool;
pub mod readonly;
pub mod registry;
pub mod selector;
pub mod session;
pub mod types;

pub use connection::{ConnectOptions, DbConnection};
pub use engine::{Connector, Engine, EngineOptions, PoolStatus, PooledConnection, RawConnection};
pub use hooks::{HookArgs, HookRegistry};
pub use lifecycle::Database;
pub use manager::SessionManager;
pub use pool::{AsyncPool, ConnectionManager, DbPool, DbTransaction, PoolHandle, ScopedConnection};
pub use registry::{EngineStatus, Engines};
pub use selector::{RoundRobin, SlaveSelector, UniformRandom, Weighted};
pub use session::{MasterSession, Session, SlaveSession};
