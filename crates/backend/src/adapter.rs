use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use dbconn_core::{BackendKind, ConnectionDescriptor, Error, PoolSettings, Result};

/// One result row: column name → value, in select-list order.
pub type Row = IndexMap<String, Value>;

/// Shared, thread-safe pool handle returned by [`BackendAdapter::open`].
pub type PoolHandle = Arc<dyn BackendPool>;

/// Per-family logic: turn a descriptor into a live pool, or probe it once.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Establish a pool sized by `settings`.
    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        settings: &PoolSettings,
    ) -> Result<PoolHandle>;

    /// Connect once (no pool), run the trivial round-trip, disconnect.
    async fn test(&self, descriptor: &ConnectionDescriptor, settings: &PoolSettings) -> Result<()>;
}

/// A live pool. Statements run one at a time in auto-commit mode with
/// parameters bound positionally through the driver's native placeholders.
#[async_trait]
pub trait BackendPool: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    async fn execute_query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Returns the affected row count.
    async fn execute_command(&self, statement: &str, params: &[Value]) -> Result<u64>;

    /// Drain and release. Closing twice is a no-op.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Registry of adapters keyed by backend kind.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().collect();
        kinds.sort();
        f.debug_struct("AdapterSet").field("kinds", &kinds).finish()
    }
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in adapters.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(crate::postgres::PostgresAdapter));
        set.register(Arc::new(crate::mysql::MySqlAdapter));
        set.register(Arc::new(crate::mssql::MssqlAdapter));
        set.register(Arc::new(crate::oracle::OracleAdapter));
        set.register(Arc::new(crate::sqlite::SqliteAdapter));
        set
    }

    /// Add or replace the adapter for its kind.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) -> &mut Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::connection(kind, "no adapter registered for this backend"))
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Insert a column, suffixing `_2`, `_3`… when the select list repeats a name.
pub(crate) fn push_column(row: &mut Row, name: &str, value: Value) {
    if !row.contains_key(name) {
        row.insert(name.to_string(), value);
        return;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", name, n);
        if !row.contains_key(&candidate) {
            row.insert(candidate, value);
            return;
        }
        n += 1;
    }
}

/// Map NaN and infinities to null; JSON has no encoding for them.
pub(crate) fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub(crate) fn bytes_value(bytes: &[u8]) -> Value {
    Value::String(format!("0x{}", hex::encode(bytes)))
}

/// Error for calls on a pool that was already closed.
pub(crate) fn closed_error(kind: BackendKind) -> Error {
    Error::connection(kind, "pool is closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_columns_are_suffixed() {
        let mut row = Row::new();
        push_column(&mut row, "a", Value::from(1));
        push_column(&mut row, "a", Value::from(2));
        push_column(&mut row, "a", Value::from(3));
        let keys: Vec<_> = row.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "a_2", "a_3"]);
    }

    #[test]
    fn test_defaults_cover_every_kind() {
        let set = AdapterSet::with_defaults();
        assert_eq!(set.kinds(), BackendKind::ALL.to_vec());
        for kind in BackendKind::ALL {
            assert_eq!(set.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_missing_adapter_is_connection_error() {
        let set = AdapterSet::new();
        let err = set.get(BackendKind::Mysql).err().unwrap();
        assert_eq!(err.kind(), dbconn_core::ErrorKind::Connection);
    }

    #[test]
    fn test_float_value_rejects_nan() {
        assert_eq!(float_value(f64::NAN), Value::Null);
        assert_eq!(float_value(1.5), serde_json::json!(1.5));
    }
}
