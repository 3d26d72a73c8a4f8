use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Connection, Row as _, TypeInfo, ValueRef};
use tracing::{debug, info};

use dbconn_core::{BackendKind, ConnectionDescriptor, Error, PoolSettings, Result};

use crate::adapter::{
    bytes_value, closed_error, float_value, push_column, BackendAdapter, BackendPool, PoolHandle,
    Row,
};
use crate::connect::{connect_url, redacted};
use crate::params::bind_params;

const KIND: BackendKind = BackendKind::Postgresql;

fn pg_err(e: sqlx::Error) -> Error {
    Error::connection(KIND, e)
}

fn connect_options(descriptor: &ConnectionDescriptor) -> Result<(PgConnectOptions, String)> {
    let url = connect_url(descriptor)?;
    let options = PgConnectOptions::from_str(url.as_str()).map_err(pg_err)?;
    Ok((options, redacted(&url)))
}

/// `connect_timeout` from extra params, else the pool acquire timeout.
fn connect_timeout(descriptor: &ConnectionDescriptor, settings: &PoolSettings) -> Duration {
    descriptor
        .extra_params
        .get("connect_timeout")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.acquire_timeout())
}

pub struct PostgresAdapter;

#[async_trait]
impl BackendAdapter for PostgresAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        settings: &PoolSettings,
    ) -> Result<PoolHandle> {
        let (options, shown) = connect_options(descriptor)?;
        let pool = PgPoolOptions::new()
            .min_connections(settings.min_connections)
            .max_connections(settings.max_connections)
            .idle_timeout(settings.idle_timeout())
            .acquire_timeout(connect_timeout(descriptor, settings))
            .connect_with(options)
            .await
            .map_err(pg_err)?;

        info!(
            name = %descriptor.name,
            url = %shown,
            max_connections = settings.max_connections,
            "PostgreSQL pool opened"
        );
        Ok(std::sync::Arc::new(PostgresPool { pool }))
    }

    async fn test(&self, descriptor: &ConnectionDescriptor, settings: &PoolSettings) -> Result<()> {
        let (options, shown) = connect_options(descriptor)?;
        let timeout = connect_timeout(descriptor, settings);
        let mut conn = tokio::time::timeout(timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| Error::connection(KIND, format!("connect timed out after {:?}", timeout)))?
            .map_err(pg_err)?;

        sqlx::query(KIND.ping_statement())
            .execute(&mut conn)
            .await
            .map_err(pg_err)?;
        conn.close().await.map_err(pg_err)?;
        debug!(url = %shown, "PostgreSQL round-trip ok");
        Ok(())
    }
}

#[derive(Debug)]
pub struct PostgresPool {
    pool: PgPool,
}

#[async_trait]
impl BackendPool for PostgresPool {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn execute_query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        if self.pool.is_closed() {
            return Err(closed_error(KIND));
        }
        let query = bind_params!(sqlx::query(statement).persistent(false), params);
        let rows = query.fetch_all(&self.pool).await.map_err(pg_err)?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn execute_command(&self, statement: &str, params: &[Value]) -> Result<u64> {
        if self.pool.is_closed() {
            return Err(closed_error(KIND));
        }
        let query = bind_params!(sqlx::query(statement).persistent(false), params);
        let done = query.execute(&self.pool).await.map_err(pg_err)?;
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

fn decode_row(row: &PgRow) -> Row {
    let mut out = Row::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name());
        push_column(&mut out, column.name(), value);
    }
    out
}

fn get<'r, T: sqlx::Decode<'r, sqlx::Postgres>>(row: &'r PgRow, idx: usize) -> Option<T> {
    row.try_get_unchecked::<T, _>(idx).ok()
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Value {
    let Ok(raw) = row.try_get_raw(idx) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }

    let value = match type_name {
        "BOOL" => get::<bool>(row, idx).map(Value::Bool),
        "INT2" => get::<i16>(row, idx).map(Value::from),
        "INT4" => get::<i32>(row, idx).map(Value::from),
        "INT8" => get::<i64>(row, idx).map(Value::from),
        "FLOAT4" => get::<f32>(row, idx).map(|f| float_value(f as f64)),
        "FLOAT8" => get::<f64>(row, idx).map(float_value),
        "NUMERIC" => raw
            .as_bytes()
            .ok()
            .and_then(numeric_to_string)
            .map(Value::String),
        "UUID" => get::<uuid::Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        "JSON" | "JSONB" => get::<Value>(row, idx),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, idx).map(|t| Value::String(t.to_rfc3339())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, idx)
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "DATE" => get::<NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        "TIME" => get::<NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        "BYTEA" => get::<Vec<u8>>(row, idx).map(|b| bytes_value(&b)),
        "TEXT[]" | "VARCHAR[]" | "NAME[]" => get::<Vec<String>>(row, idx).map(Value::from),
        "INT4[]" => get::<Vec<i32>>(row, idx).map(Value::from),
        "INT8[]" => get::<Vec<i64>>(row, idx).map(Value::from),
        "BOOL[]" => get::<Vec<bool>>(row, idx).map(Value::from),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT" | "UNKNOWN" => {
            get::<String>(row, idx).map(Value::String)
        }
        _ => None,
    };

    value.unwrap_or_else(|| Value::String(format!("<unsupported {}>", type_name)))
}

/// Render a binary-format NUMERIC as its exact decimal text.
///
/// Layout: ndigits, weight, sign, dscale (i16/u16 big-endian), then
/// `ndigits` base-10000 digits.
fn numeric_to_string(buf: &[u8]) -> Option<String> {
    if buf.len() < 8 {
        return None;
    }
    let word = |i: usize| i16::from_be_bytes([buf[i], buf[i + 1]]);
    let ndigits = usize::try_from(word(0)).ok()?;
    let weight = word(2) as i32;
    let sign = u16::from_be_bytes([buf[4], buf[5]]);
    let dscale = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    if buf.len() < 8 + ndigits * 2 {
        return None;
    }

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digit = |i: i32| -> i16 {
        usize::try_from(i)
            .ok()
            .filter(|i| *i < ndigits)
            .map_or(0, |i| word(8 + i * 2))
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                out.push_str(&digit(i).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(i)));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}
