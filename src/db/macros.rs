//! Database dispatch macros for reducing code duplication.
//!
//! This module provides declarative macros that generate backend-specific
//! match arms while maintaining linear readability. The macros expand at
//! compile time with zero runtime overhead.

/// Macro for generating database dispatch match arms.
///
/// Works for any enum in this crate whose variants are `MySql`, `Postgres`
/// and `SQLite` (`DbConnection`, `DbPool`, `DbTransaction`). Each arm body is
/// expanded with the concrete driver type bound, so identical source compiles
/// against three different sqlx backends.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(conn, DbConnection, {
///     MySql(c) => c.ping().await?,
///     Postgres(c) => c.ping().await?,
///     SQLite(c) => c.ping().await?,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($value:expr, $enum:ident, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $enum::$variant($p) => $body,
            )+
        }
    };
}
