//! SQL Server over tiberius, pooled with bb8.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use dbconn_core::{
    parse_bool, BackendKind, ConnectionDescriptor, Error, PoolSettings, Result, MSSQL_TDS_VERSION,
};

use crate::adapter::{
    bytes_value, closed_error, float_value, push_column, BackendAdapter, BackendPool, PoolHandle,
    Row,
};
use crate::connect::{connect_url, redacted};

const KIND: BackendKind = BackendKind::Mssql;

type MssqlClient = Client<Compat<TcpStream>>;

fn mssql_err(e: impl std::fmt::Display) -> Error {
    Error::connection(KIND, e)
}

/// Build the tiberius config from the descriptor and its extra params.
fn client_config(descriptor: &ConnectionDescriptor) -> Result<Config> {
    let params = &descriptor.extra_params;
    let flag = |key: &str| params.get(key).and_then(|v| parse_bool(v));

    let mut config = Config::new();
    config.host(descriptor.host.as_deref().unwrap_or("localhost"));
    config.port(descriptor.port.or(KIND.default_port()).unwrap_or(1433));
    config.database(&descriptor.database);
    config.authentication(AuthMethod::sql_server(
        descriptor.username.as_deref().unwrap_or_default(),
        descriptor.password.as_deref().unwrap_or_default(),
    ));

    if flag("trust_server_certificate") == Some(true) {
        config.trust_cert();
    }
    match flag("encrypt") {
        Some(true) => config.encryption(EncryptionLevel::Required),
        Some(false) => config.encryption(EncryptionLevel::NotSupported),
        None => {}
    }
    if let Some(app) = params.get("application_name") {
        config.application_name(app);
    }
    if let Some(instance) = params.get("instance_name") {
        // No SQL Browser lookup: the port must point at the instance.
        config.instance_name(instance);
    }
    if let Some(tds) = params.get("tds_version") {
        if tds != MSSQL_TDS_VERSION {
            return Err(Error::Validation(format!(
                "'{}': tds_version {} is not supported, the driver speaks TDS {}",
                descriptor.name, tds, MSSQL_TDS_VERSION
            )));
        }
    }
    Ok(config)
}

async fn connect(config: &Config) -> std::result::Result<MssqlClient, tiberius::error::Error> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;

    match Client::connect(config.clone(), tcp.compat_write()).await {
        Ok(client) => Ok(client),
        // Azure SQL gateway redirect.
        Err(tiberius::error::Error::Routing { host, port }) => {
            let mut redirected = config.clone();
            redirected.host(&host);
            redirected.port(port);
            let tcp = TcpStream::connect(redirected.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Client::connect(redirected, tcp.compat_write()).await
        }
        Err(e) => Err(e),
    }
}

/// bb8 connection manager for tiberius clients.
#[derive(Clone)]
pub struct TiberiusManager {
    config: Config,
}

#[async_trait]
impl bb8::ManageConnection for TiberiusManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        connect(&self.config).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query(KIND.ping_statement()).await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub struct MssqlAdapter;

#[async_trait]
impl BackendAdapter for MssqlAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        settings: &PoolSettings,
    ) -> Result<PoolHandle> {
        let shown = redacted(&connect_url(descriptor)?);
        let manager = TiberiusManager {
            config: client_config(descriptor)?,
        };

        let min_idle = (settings.min_connections > 0).then_some(settings.min_connections);
        let pool = bb8::Pool::builder()
            .max_size(settings.max_connections)
            .min_idle(min_idle)
            .idle_timeout(settings.idle_timeout())
            .connection_timeout(settings.acquire_timeout())
            .build(manager)
            .await
            .map_err(mssql_err)?;

        // bb8 connects lazily when min_idle is zero; check reachability up front.
        drop(pool.get().await.map_err(mssql_err)?);

        info!(
            name = %descriptor.name,
            url = %shown,
            max_connections = settings.max_connections,
            "SQL Server pool opened"
        );
        Ok(Arc::new(MssqlPool {
            pool: RwLock::new(Some(pool)),
        }))
    }

    async fn test(&self, descriptor: &ConnectionDescriptor, settings: &PoolSettings) -> Result<()> {
        let shown = redacted(&connect_url(descriptor)?);
        let config = client_config(descriptor)?;
        let timeout = settings.acquire_timeout();

        let mut client = tokio::time::timeout(timeout, connect(&config))
            .await
            .map_err(|_| mssql_err(format!("connect timed out after {:?}", timeout)))?
            .map_err(mssql_err)?;
        client
            .simple_query(KIND.ping_statement())
            .await
            .map_err(mssql_err)?
            .into_row()
            .await
            .map_err(mssql_err)?;
        client.close().await.map_err(mssql_err)?;
        debug!(url = %shown, "SQL Server round-trip ok");
        Ok(())
    }
}

pub struct MssqlPool {
    pool: RwLock<Option<bb8::Pool<TiberiusManager>>>,
}

impl std::fmt::Debug for MssqlPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlPool")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MssqlPool {
    fn current(&self) -> Result<bb8::Pool<TiberiusManager>> {
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| closed_error(KIND))
    }
}

/// Owned tiberius parameters for one statement.
fn to_params(params: &[Value]) -> Vec<Box<dyn ToSql>> {
    params
        .iter()
        .map(|value| -> Box<dyn ToSql> {
            match value {
                Value::Null => Box::new(Option::<String>::None),
                Value::Bool(b) => Box::new(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => Box::new(i),
                    None => Box::new(n.as_f64().unwrap_or_default()),
                },
                Value::String(s) => Box::new(s.clone()),
                other => Box::new(other.to_string()),
            }
        })
        .collect()
}

#[async_trait]
impl BackendPool for MssqlPool {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn execute_query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        let pool = self.current()?;
        let mut conn = pool.get().await.map_err(mssql_err)?;

        let owned = to_params(params);
        let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();
        let rows = conn
            .query(statement, &refs)
            .await
            .map_err(mssql_err)?
            .into_first_result()
            .await
            .map_err(mssql_err)?;
        Ok(rows.into_iter().map(decode_row).collect())
    }

    async fn execute_command(&self, statement: &str, params: &[Value]) -> Result<u64> {
        let pool = self.current()?;
        let mut conn = pool.get().await.map_err(mssql_err)?;

        let owned = to_params(params);
        let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();
        let done = conn.execute(statement, &refs).await.map_err(mssql_err)?;
        Ok(done.total())
    }

    async fn close(&self) {
        let taken = self
            .pool
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pool) = taken {
            let state = pool.state();
            if state.connections > state.idle_connections {
                warn!(
                    in_use = state.connections - state.idle_connections,
                    "Closing SQL Server pool with checked-out connections"
                );
            }
            // Idle connections are dropped with the last pool handle.
            drop(pool);
        }
    }

    fn is_closed(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

// ── Row decoding ──────────────────────────────────────────────

fn decode_row(row: tiberius::Row) -> Row {
    let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut out = Row::with_capacity(names.len());
    for (name, data) in names.iter().zip(row) {
        push_column(&mut out, name, decode_value(&data));
    }
    out
}

fn decode_value(data: &ColumnData<'static>) -> Value {
    let text = |s: String| Value::String(s);
    let value = match data {
        ColumnData::U8(v) => v.map(Value::from),
        ColumnData::I16(v) => v.map(Value::from),
        ColumnData::I32(v) => v.map(Value::from),
        ColumnData::I64(v) => v.map(Value::from),
        ColumnData::F32(v) => v.map(|f| float_value(f as f64)),
        ColumnData::F64(v) => v.map(float_value),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| text(s.to_string())),
        ColumnData::Guid(v) => v.as_ref().map(|g| text(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| bytes_value(b)),
        ColumnData::Numeric(v) => v.as_ref().map(|n| text(n.to_string())),
        ColumnData::Xml(v) => v.as_ref().map(|x| text((**x).clone().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)
                .ok()
                .flatten()
                .map(|t| text(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)
            .ok()
            .flatten()
            .map(|d| text(d.to_string())),
        ColumnData::Time(_) => NaiveTime::from_sql(data)
            .ok()
            .flatten()
            .map(|t| text(t.to_string())),
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(data)
            .ok()
            .flatten()
            .map(|t| text(t.to_rfc3339())),
    };
    value.unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::borrow::Cow;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::network("ms", KIND, "sql.internal", "erp").with_credentials("sa", "pw")
    }

    #[test]
    fn test_config_address_follows_descriptor() {
        let config = client_config(&descriptor().with_port(14330)).unwrap();
        assert_eq!(config.get_addr(), "sql.internal:14330");

        let config = client_config(&descriptor()).unwrap();
        assert_eq!(config.get_addr(), "sql.internal:1433");
    }

    #[test]
    fn test_unsupported_tds_version_is_rejected() {
        client_config(&descriptor().with_param("tds_version", "7.3")).unwrap();
        let err = client_config(&descriptor().with_param("tds_version", "7.1")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_params_are_owned_and_ordered() {
        let params = to_params(&[json!(1), json!("a"), json!(null), json!(true), json!(1.5)]);
        assert_eq!(params.len(), 5);
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode_value(&ColumnData::I32(Some(5))), json!(5));
        assert_eq!(decode_value(&ColumnData::I32(None)), json!(null));
        assert_eq!(decode_value(&ColumnData::Bit(Some(true))), json!(true));
        assert_eq!(
            decode_value(&ColumnData::String(Some(Cow::Borrowed("x")))),
            json!("x")
        );
        assert_eq!(
            decode_value(&ColumnData::Binary(Some(Cow::Borrowed(&[0xde, 0xad])))),
            json!("0xdead")
        );
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_statements() {
        let pool = MssqlPool {
            pool: RwLock::new(None),
        };
        assert!(pool.is_closed());
        pool.close().await;
        let err = pool.execute_command("DELETE FROM t", &[]).await.unwrap_err();
        assert_eq!(err.kind(), dbconn_core::ErrorKind::Connection);
    }
}
