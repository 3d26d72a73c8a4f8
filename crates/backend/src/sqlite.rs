//! SQLite over sqlx. `:memory:` databases get a single pinned connection so
//! the data lives as long as the pool; files get a small WAL-mode pool.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, Connection, Row as _, TypeInfo, ValueRef};
use tracing::{debug, info};

use dbconn_core::{parse_bool, BackendKind, ConnectionDescriptor, Error, PoolSettings, Result};

use crate::adapter::{
    bytes_value, closed_error, float_value, push_column, BackendAdapter, BackendPool, PoolHandle,
    Row,
};
use crate::params::bind_params;

const KIND: BackendKind = BackendKind::Sqlite;

/// Upper bound on connections for file databases.
const FILE_POOL_MAX: u32 = 4;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn sqlite_err(e: sqlx::Error) -> Error {
    Error::connection(KIND, e)
}

fn journal_mode(value: &str) -> Option<SqliteJournalMode> {
    match value.to_lowercase().as_str() {
        "delete" => Some(SqliteJournalMode::Delete),
        "truncate" => Some(SqliteJournalMode::Truncate),
        "persist" => Some(SqliteJournalMode::Persist),
        "memory" => Some(SqliteJournalMode::Memory),
        "wal" => Some(SqliteJournalMode::Wal),
        "off" => Some(SqliteJournalMode::Off),
        _ => None,
    }
}

fn connect_options(descriptor: &ConnectionDescriptor) -> Result<SqliteConnectOptions> {
    let params = &descriptor.extra_params;
    let flag = |key: &str, default: bool| params.get(key).and_then(|v| parse_bool(v)).unwrap_or(default);

    let busy_timeout = params
        .get("timeout")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|t| t.is_finite() && *t >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_BUSY_TIMEOUT);

    if descriptor.is_in_memory() {
        // Each parse yields a distinct in-memory database.
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(sqlite_err)?;
        return Ok(options.busy_timeout(busy_timeout));
    }

    let journal = params
        .get("journal_mode")
        .and_then(|v| journal_mode(v))
        .unwrap_or(SqliteJournalMode::Wal);

    Ok(SqliteConnectOptions::new()
        .filename(&descriptor.database)
        .busy_timeout(busy_timeout)
        .create_if_missing(flag("create_if_missing", true))
        .read_only(flag("read_only", false))
        .journal_mode(journal))
}

pub struct SqliteAdapter;

#[async_trait]
impl BackendAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        settings: &PoolSettings,
    ) -> Result<PoolHandle> {
        let options = connect_options(descriptor)?;
        let pool_options = if descriptor.is_in_memory() {
            // One connection that is never reaped or recycled.
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(settings.max_connections.clamp(1, FILE_POOL_MAX))
                .idle_timeout(settings.idle_timeout())
        };

        let pool = pool_options
            .acquire_timeout(settings.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(sqlite_err)?;

        info!(name = %descriptor.name, database = %descriptor.database, "SQLite pool opened");
        Ok(Arc::new(SqliteBackendPool { pool }))
    }

    async fn test(&self, descriptor: &ConnectionDescriptor, _settings: &PoolSettings) -> Result<()> {
        let mut conn = SqliteConnection::connect_with(&connect_options(descriptor)?)
            .await
            .map_err(sqlite_err)?;
        sqlx::query(KIND.ping_statement())
            .execute(&mut conn)
            .await
            .map_err(sqlite_err)?;
        conn.close().await.map_err(sqlite_err)?;
        debug!(database = %descriptor.database, "SQLite round-trip ok");
        Ok(())
    }
}

#[derive(Debug)]
pub struct SqliteBackendPool {
    pool: SqlitePool,
}

#[async_trait]
impl BackendPool for SqliteBackendPool {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn execute_query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        if self.pool.is_closed() {
            return Err(closed_error(KIND));
        }
        let query = bind_params!(sqlx::query(statement).persistent(false), params);
        let rows = query.fetch_all(&self.pool).await.map_err(sqlite_err)?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn execute_command(&self, statement: &str, params: &[Value]) -> Result<u64> {
        if self.pool.is_closed() {
            return Err(closed_error(KIND));
        }
        let query = bind_params!(sqlx::query(statement).persistent(false), params);
        let done = query.execute(&self.pool).await.map_err(sqlite_err)?;
        Ok(done.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

// ── Row decoding ──────────────────────────────────────────────

fn decode_row(row: &SqliteRow) -> Row {
    let mut out = Row::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name());
        push_column(&mut out, column.name(), value);
    }
    out
}

fn get<'r, T: sqlx::Decode<'r, sqlx::Sqlite>>(row: &'r SqliteRow, idx: usize) -> Option<T> {
    row.try_get_unchecked::<T, _>(idx).ok()
}

/// SQLite is dynamically typed: the declared type only decides booleans,
/// everything else follows the storage class of the value itself.
fn decode_column(row: &SqliteRow, idx: usize, declared: &str) -> Value {
    let storage = match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => raw.type_info().name().to_string(),
        _ => return Value::Null,
    };

    let value = match (declared, storage.as_str()) {
        ("BOOLEAN", "INTEGER") => get::<bool>(row, idx).map(Value::Bool),
        (_, "INTEGER") => get::<i64>(row, idx).map(Value::from),
        (_, "REAL") => get::<f64>(row, idx).map(float_value),
        (_, "BLOB") => get::<Vec<u8>>(row, idx).map(|b| bytes_value(&b)),
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory(name: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::sqlite(name, dbconn_core::SQLITE_MEMORY)
    }

    #[tokio::test]
    async fn test_memory_database_survives_between_statements() {
        let pool = SqliteAdapter
            .open(&memory("cache"), &PoolSettings::default())
            .await
            .unwrap();

        assert_eq!(
            pool.execute_command("CREATE TABLE t (id INTEGER)", &[]).await.unwrap(),
            0
        );
        assert_eq!(
            pool.execute_command("INSERT INTO t VALUES (1)", &[]).await.unwrap(),
            1
        );
        let rows = pool.execute_query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_params_bound_positionally_and_types_decoded() {
        let pool = SqliteAdapter
            .open(&memory("types"), &PoolSettings::default())
            .await
            .unwrap();
        pool.execute_command(
            "CREATE TABLE items (id INTEGER, name TEXT, price REAL, active BOOLEAN, blob BLOB, note TEXT)",
            &[],
        )
        .await
        .unwrap();
        pool.execute_command(
            "INSERT INTO items VALUES (?, ?, ?, ?, x'beef', ?)",
            &[json!(7), json!("it's; fine"), json!(2.5), json!(true), json!(null)],
        )
        .await
        .unwrap();

        let rows = pool
            .execute_query("SELECT * FROM items WHERE name = ?", &[json!("it's; fine")])
            .await
            .unwrap();
        let row = &rows[0];
        let columns: Vec<_> = row.keys().cloned().collect();
        assert_eq!(columns, vec!["id", "name", "price", "active", "blob", "note"]);
        assert_eq!(row["id"], json!(7));
        assert_eq!(row["name"], json!("it's; fine"));
        assert_eq!(row["price"], json!(2.5));
        assert_eq!(row["active"], json!(true));
        assert_eq!(row["blob"], json!("0xbeef"));
        assert_eq!(row["note"], json!(null));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_execution() {
        let pool = SqliteAdapter
            .open(&memory("closing"), &PoolSettings::default())
            .await
            .unwrap();
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());

        let err = pool.execute_query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), dbconn_core::ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_file_database_and_roundtrip_test() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app.db");
        let d = ConnectionDescriptor::sqlite("file", path.to_string_lossy())
            .with_param("journal_mode", "delete");

        SqliteAdapter.test(&d, &PoolSettings::default()).await.unwrap();
        assert!(path.exists());

        let pool = SqliteAdapter.open(&d, &PoolSettings::default()).await.unwrap();
        pool.execute_command("CREATE TABLE t (v TEXT)", &[]).await.unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_missing_file_without_create_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let d = ConnectionDescriptor::sqlite("ro", tmp.path().join("nope.db").to_string_lossy())
            .with_param("create_if_missing", "false");
        let err = SqliteAdapter.test(&d, &PoolSettings::default()).await.unwrap_err();
        assert_eq!(err.kind(), dbconn_core::ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_bad_sql_is_connection_error() {
        let pool = SqliteAdapter
            .open(&memory("bad"), &PoolSettings::default())
            .await
            .unwrap();
        let err = pool.execute_query("SELEC nonsense", &[]).await.unwrap_err();
        assert_eq!(err.kind(), dbconn_core::ErrorKind::Connection);
    }
}
