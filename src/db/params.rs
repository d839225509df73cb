//! Statement binding for the sqlx backends.
//!
//! Every access path (engine connections, scoped connections, the async pool)
//! turns a [`Statement`] into a bound sqlx query through these functions.

use crate::models::{QueryParam, Statement};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

/// Define `$name(&Statement) -> Query` binding each parameter in order.
///
/// Only JSON differs between backends, so the JSON encoding is an argument.
macro_rules! bound_query {
    ($(#[$meta:meta])* $name:ident, $db:ty, $args:ty, |$json:ident| $encode_json:expr) => {
        $(#[$meta])*
        pub(crate) fn $name(stmt: &Statement) -> Query<'_, $db, $args> {
            stmt.params
                .iter()
                .fold(sqlx::query(&stmt.sql), |query, param| match param {
                    QueryParam::Null => query.bind(None::<String>),
                    QueryParam::Bool(v) => query.bind(*v),
                    QueryParam::Int(v) => query.bind(*v),
                    QueryParam::Float(v) => query.bind(*v),
                    QueryParam::String(v) => query.bind(v.as_str()),
                    QueryParam::Bytes(v) => query.bind(v.as_slice()),
                    QueryParam::Json($json) => query.bind($encode_json),
                })
        }
    };
}

bound_query!(
    /// Build a bound MySQL query for a statement.
    mysql_query, MySql, MySqlArguments, |v| Json(v)
);

bound_query!(
    /// Build a bound PostgreSQL query for a statement.
    postgres_query, Postgres, PgArguments, |v| Json(v)
);

bound_query!(
    /// Build a bound SQLite query for a statement. JSON is stored as text.
    sqlite_query, Sqlite, SqliteArguments<'_>, |v| v.to_string()
);

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;
    use sqlx::Row;
    use sqlx::sqlite::SqliteConnection;

    #[tokio::test]
    async fn test_sqlite_binds_in_order() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let stmt = Statement::new("SELECT ? AS a, ? AS b, ? AS c, ? AS d")
            .bind(7)
            .bind("seven")
            .bind(QueryParam::Null)
            .bind(QueryParam::Json(serde_json::json!({"k": 1})));

        let row = sqlite_query(&stmt).fetch_one(&mut conn).await.unwrap();
        assert_eq!(row.get::<i64, _>("a"), 7);
        assert_eq!(row.get::<String, _>("b"), "seven");
        assert_eq!(row.get::<Option<String>, _>("c"), None);
        assert_eq!(row.get::<String, _>("d"), r#"{"k":1}"#);
    }
}
