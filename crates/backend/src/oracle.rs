//! Oracle over the `oracle` crate (ODPI-C), enabled by the `oracle` cargo
//! feature. The driver is blocking, so every call runs on the blocking pool.

use async_trait::async_trait;

use dbconn_core::{BackendKind, ConnectionDescriptor, PoolSettings, Result};

use crate::adapter::{BackendAdapter, PoolHandle};

const KIND: BackendKind = BackendKind::Oracle;

/// Easy Connect string (`//host:port/service`) or a full descriptor when a SID is given.
pub fn connect_string(descriptor: &ConnectionDescriptor) -> String {
    let host = descriptor.host.as_deref().unwrap_or("localhost");
    let port = descriptor.port.or(KIND.default_port()).unwrap_or(1521);
    let params = &descriptor.extra_params;

    match params.get("sid") {
        Some(sid) => format!(
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST={})(PORT={}))(CONNECT_DATA=(SID={})))",
            host, port, sid
        ),
        None => {
            let service = params
                .get("service_name")
                .map(String::as_str)
                .unwrap_or(descriptor.database.as_str());
            format!("//{}:{}/{}", host, port, service)
        }
    }
}

pub struct OracleAdapter;

#[cfg(not(feature = "oracle"))]
fn unavailable() -> dbconn_core::Error {
    dbconn_core::Error::connection(
        KIND,
        "oracle support is not compiled in; rebuild with `--features oracle` (needs Oracle Instant Client)",
    )
}

#[cfg(not(feature = "oracle"))]
#[async_trait]
impl BackendAdapter for OracleAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn open(&self, _: &ConnectionDescriptor, _: &PoolSettings) -> Result<PoolHandle> {
        Err(unavailable())
    }

    async fn test(&self, _: &ConnectionDescriptor, _: &PoolSettings) -> Result<()> {
        Err(unavailable())
    }
}

#[cfg(feature = "oracle")]
#[async_trait]
impl BackendAdapter for OracleAdapter {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        settings: &PoolSettings,
    ) -> Result<PoolHandle> {
        driver::open(descriptor, settings).await
    }

    async fn test(&self, descriptor: &ConnectionDescriptor, _settings: &PoolSettings) -> Result<()> {
        driver::test(descriptor).await
    }
}

#[cfg(feature = "oracle")]
mod driver {
    use std::sync::{Arc, RwLock};

    use async_trait::async_trait;
    use oracle::pool::{CloseMode, Pool, PoolBuilder};
    use oracle::sql_type::{OracleType, ToSql};
    use oracle::Connection;
    use serde_json::Value;
    use tracing::{debug, info};

    use dbconn_core::{ConnectionDescriptor, Error, PoolSettings, Result};

    use super::{connect_string, KIND};
    use crate::adapter::{closed_error, float_value, push_column, BackendPool, PoolHandle, Row};
    use crate::connect::{connect_url, redacted};

    fn ora_err(e: impl std::fmt::Display) -> Error {
        Error::connection(KIND, e)
    }

    async fn blocking<T, F>(f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.map_err(ora_err)?
    }

    fn credentials(descriptor: &ConnectionDescriptor) -> (String, String, String) {
        (
            descriptor.username.clone().unwrap_or_default(),
            descriptor.password.clone().unwrap_or_default(),
            connect_string(descriptor),
        )
    }

    pub(super) async fn open(
        descriptor: &ConnectionDescriptor,
        settings: &PoolSettings,
    ) -> Result<PoolHandle> {
        let shown = redacted(&connect_url(descriptor)?);
        let (user, password, connect) = credentials(descriptor);
        let (min, max) = (settings.min_connections, settings.max_connections);

        let pool = blocking(move || {
            let mut builder = PoolBuilder::new(user, password, connect);
            builder.min_connections(min).max_connections(max);
            let pool = builder.build().map_err(ora_err)?;
            // Surface bad credentials now rather than on first use.
            pool.get().map_err(ora_err)?;
            Ok(pool)
        })
        .await?;

        info!(name = %descriptor.name, url = %shown, max_connections = max, "Oracle pool opened");
        Ok(Arc::new(OraclePool {
            pool: RwLock::new(Some(pool)),
        }))
    }

    pub(super) async fn test(descriptor: &ConnectionDescriptor) -> Result<()> {
        let shown = redacted(&connect_url(descriptor)?);
        let (user, password, connect) = credentials(descriptor);
        blocking(move || {
            let conn = Connection::connect(user, password, connect).map_err(ora_err)?;
            conn.query_row(KIND.ping_statement(), &[]).map_err(ora_err)?;
            conn.close().map_err(ora_err)?;
            Ok(())
        })
        .await?;
        debug!(url = %shown, "Oracle round-trip ok");
        Ok(())
    }

    pub struct OraclePool {
        pool: RwLock<Option<Pool>>,
    }

    impl std::fmt::Debug for OraclePool {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("OraclePool")
                .field("closed", &self.is_closed())
                .finish()
        }
    }

    impl OraclePool {
        fn current(&self) -> Result<Pool> {
            self.pool
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
                .ok_or_else(|| closed_error(KIND))
        }
    }

    fn to_params(params: &[Value]) -> Vec<Box<dyn ToSql + Send>> {
        params
            .iter()
            .map(|value| -> Box<dyn ToSql + Send> {
                match value {
                    Value::Null => Box::new(Option::<String>::None),
                    // No boolean SQL type before 23c.
                    Value::Bool(b) => Box::new(i64::from(*b)),
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

    fn decode(row: &oracle::Row, idx: usize, oracle_type: &OracleType) -> Value {
        let value = match oracle_type {
            OracleType::Number(_, scale) if *scale == 0 => row
                .get::<usize, Option<i64>>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            OracleType::Number(..)
            | OracleType::BinaryFloat
            | OracleType::BinaryDouble
            | OracleType::Float(_) => row
                .get::<usize, Option<f64>>(idx)
                .ok()
                .flatten()
                .map(float_value),
            _ => None,
        };
        value
            .or_else(|| {
                row.get::<usize, Option<String>>(idx)
                    .ok()
                    .flatten()
                    .map(Value::String)
            })
            .unwrap_or(Value::Null)
    }

    #[async_trait]
    impl BackendPool for OraclePool {
        fn kind(&self) -> dbconn_core::BackendKind {
            KIND
        }

        async fn execute_query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
            let pool = self.current()?;
            let sql = statement.to_string();
            let owned = to_params(params);
            blocking(move || {
                let conn = pool.get().map_err(ora_err)?;
                let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref() as &dyn ToSql).collect();
                let rows = conn.query(&sql, &refs).map_err(ora_err)?;
                let columns: Vec<(String, OracleType)> = rows
                    .column_info()
                    .iter()
                    .map(|c| (c.name().to_string(), c.oracle_type().clone()))
                    .collect();

                let mut out = Vec::new();
                for row in rows {
                    let row = row.map_err(ora_err)?;
                    let mut decoded = Row::with_capacity(columns.len());
                    for (idx, (name, oracle_type)) in columns.iter().enumerate() {
                        push_column(&mut decoded, name, decode(&row, idx, oracle_type));
                    }
                    out.push(decoded);
                }
                Ok(out)
            })
            .await
        }

        async fn execute_command(&self, statement: &str, params: &[Value]) -> Result<u64> {
            let pool = self.current()?;
            let sql = statement.to_string();
            let owned = to_params(params);
            blocking(move || {
                let conn = pool.get().map_err(ora_err)?;
                let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref() as &dyn ToSql).collect();
                let stmt = conn.execute(&sql, &refs).map_err(ora_err)?;
                let affected = stmt.row_count().map_err(ora_err)?;
                conn.commit().map_err(ora_err)?;
                Ok(affected)
            })
            .await
        }

        async fn close(&self) {
            let taken = self
                .pool
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(pool) = taken {
                let _ = blocking(move || pool.close(&CloseMode::Default).map_err(ora_err)).await;
            }
        }

        fn is_closed(&self) -> bool {
            self.pool
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .is_none()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_string_prefers_service_then_sid() {
        let d = ConnectionDescriptor::network("o", KIND, "ora.internal", "ORCL")
            .with_credentials("scott", "tiger");
        assert_eq!(connect_string(&d), "//ora.internal:1521/ORCL");

        let d = d.with_param("service_name", "ORCLPDB1");
        assert_eq!(connect_string(&d), "//ora.internal:1521/ORCLPDB1");

        let d = d.with_param("sid", "XE");
        assert!(connect_string(&d).contains("(SID=XE)"));
    }

    #[cfg(not(feature = "oracle"))]
    #[tokio::test]
    async fn test_without_feature_reports_connection_error() {
        let d = ConnectionDescriptor::network("o", KIND, "h", "d").with_credentials("u", "p");
        let err = OracleAdapter
            .test(&d, &PoolSettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), dbconn_core::ErrorKind::Connection);
        assert!(err.to_string().contains("--features oracle"));
    }
}
