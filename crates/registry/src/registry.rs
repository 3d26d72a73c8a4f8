use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, info, warn};

use dbconn_backend::{AdapterSet, PoolHandle, Row};
use dbconn_core::sql::truncate_statement;
use dbconn_core::{ConnectionDescriptor, ConnectionInfo, ConnectionSummary, Error, Result, Settings};
use dbconn_vault::{ConfigStore, SecretCipher};

use crate::gate::GateTable;

/// Longest statement prefix written to the audit log.
const LOGGED_STATEMENT_CHARS: usize = 120;

/// Lifecycle of one connection name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconfigured,
    Configured,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unconfigured => "unconfigured",
            ConnectionState::Configured => "configured",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Slot {
    Open(PoolHandle),
    Closed,
}

/// Named connections: persisted descriptors plus at most one live pool per name.
pub struct ConnectionRegistry {
    store: ConfigStore,
    adapters: AdapterSet,
    settings: Settings,
    gates: GateTable,
    slots: RwLock<HashMap<String, Slot>>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("store", &self.store)
            .field("adapters", &self.adapters)
            .field("open", &self.open_connections())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    pub fn new(store: ConfigStore, adapters: AdapterSet, settings: Settings) -> Self {
        Self {
            store,
            adapters,
            settings,
            gates: GateTable::default(),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Load (or create) the key under the configured root and wire up every
    /// built-in adapter.
    pub fn open(settings: Settings) -> Result<Self> {
        let cipher = SecretCipher::load_or_create(&settings.key_path())?;
        info!(source = %cipher.source(), "Encryption key ready");
        let store = ConfigStore::from_settings(&settings, cipher);
        Ok(Self::new(store, AdapterSet::with_defaults(), settings))
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ── Slots ─────────────────────────────────────────────────

    fn slots_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slots_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.slots.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_handle(&self, name: &str) -> Option<PoolHandle> {
        match self.slots_read().get(name) {
            Some(Slot::Open(handle)) if !handle.is_closed() => Some(handle.clone()),
            _ => None,
        }
    }

    /// Remove the open handle for `name`, leaving a `Closed` marker when asked.
    fn detach(&self, name: &str, mark_closed: bool) -> Option<PoolHandle> {
        let mut slots = self.slots_write();
        let previous = slots.remove(name);
        if mark_closed && previous.is_some() {
            slots.insert(name.to_string(), Slot::Closed);
        }
        match previous {
            Some(Slot::Open(handle)) => Some(handle),
            _ => None,
        }
    }

    async fn shutdown(&self, name: &str, handle: PoolHandle) {
        let after = self.settings.operation_timeout();
        match tokio::time::timeout(after, handle.close()).await {
            Ok(()) => info!(name, backend = %handle.kind(), "Connection closed"),
            Err(_) => warn!(name, backend = %handle.kind(), ?after, "Pool close timed out, handle dropped"),
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let after = self.settings.operation_timeout();
        tokio::time::timeout(after, fut)
            .await
            .map_err(|_| Error::Timeout { operation, after })?
    }

    // ── Definitions ───────────────────────────────────────────

    fn prepare(name: &str, descriptor: ConnectionDescriptor) -> Result<ConnectionDescriptor> {
        let descriptor = ConnectionDescriptor {
            name: name.to_string(),
            ..descriptor
        }
        .normalized();
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Validate and persist. No pool is opened. Redefining a name whose pool
    /// is open is a conflict.
    pub async fn add_connection(&self, name: &str, descriptor: ConnectionDescriptor) -> Result<()> {
        let ctx = |e: Error| e.with_context("add_connection", name);
        let descriptor = Self::prepare(name, descriptor).map_err(ctx)?;

        let gate = self.gates.gate(name);
        let _guard = gate.lock().await;
        if self.live_handle(name).is_some() {
            return Err(ctx(Error::Conflict {
                name: name.to_string(),
                detail: "connection is open; close it before redefining".into(),
            }));
        }

        self.store.upsert(name, &descriptor).map_err(ctx)?;
        self.slots_write().remove(name);
        info!(name, backend = %descriptor.backend_kind, "Connection saved");
        Ok(())
    }

    /// Replace an existing definition, closing its pool first.
    pub async fn update_connection(
        &self,
        name: &str,
        descriptor: ConnectionDescriptor,
    ) -> Result<()> {
        let ctx = |e: Error| e.with_context("update_connection", name);
        let descriptor = Self::prepare(name, descriptor).map_err(ctx)?;

        let gate = self.gates.gate(name);
        let _guard = gate.lock().await;
        if !self.store.contains(name).map_err(ctx)? {
            return Err(ctx(Error::NotFound(name.to_string())));
        }
        self.replace(name, &descriptor).await.map_err(ctx)
    }

    /// Read-modify-write of a stored definition under the name's gate, so
    /// concurrent amendments never drop each other's changes. Returns the
    /// descriptor that was saved.
    pub async fn amend_connection<F>(&self, name: &str, amend: F) -> Result<ConnectionDescriptor>
    where
        F: FnOnce(ConnectionDescriptor) -> ConnectionDescriptor + Send,
    {
        let ctx = |e: Error| e.with_context("update_connection", name);

        let gate = self.gates.gate(name);
        let _guard = gate.lock().await;
        let stored = self.store.get(name).map_err(ctx)?;
        let descriptor = Self::prepare(name, amend(stored)).map_err(ctx)?;
        self.replace(name, &descriptor).await.map_err(ctx)?;
        Ok(descriptor)
    }

    /// Caller holds the gate.
    async fn replace(&self, name: &str, descriptor: &ConnectionDescriptor) -> Result<()> {
        if let Some(handle) = self.detach(name, false) {
            self.shutdown(name, handle).await;
        }
        self.store.upsert(name, descriptor)?;
        info!(name, backend = %descriptor.backend_kind, "Connection updated");
        Ok(())
    }

    /// Close any open pool (best-effort), then delete the definition.
    pub async fn remove_connection(&self, name: &str) -> Result<()> {
        let ctx = |e: Error| e.with_context("remove_connection", name);

        let gate = self.gates.gate(name);
        let _guard = gate.lock().await;
        if !self.store.contains(name).map_err(ctx)? {
            return Err(ctx(Error::NotFound(name.to_string())));
        }
        if let Some(handle) = self.detach(name, false) {
            self.shutdown(name, handle).await;
        }

        self.store.delete(name).map_err(ctx)?;
        info!(name, "Connection removed");
        Ok(())
    }

    // ── Pools ─────────────────────────────────────────────────

    /// The open handle for `name`, opening it on first use.
    pub async fn get_connection(&self, name: &str) -> Result<PoolHandle> {
        self.resolve(name)
            .await
            .map_err(|e| e.with_context("get_connection", name))
    }

    async fn resolve(&self, name: &str) -> Result<PoolHandle> {
        if let Some(handle) = self.live_handle(name) {
            return Ok(handle);
        }

        let gate = self.gates.gate(name);
        let seen = gate.failures();
        let mut state = gate.lock().await;

        if let Some(handle) = self.live_handle(name) {
            return Ok(handle);
        }
        if gate.failures() != seen {
            let detail = state.last_failure.clone().unwrap_or_default();
            return Err(Error::Conflict {
                name: name.to_string(),
                detail: format!("concurrent open failed: {}", detail),
            });
        }

        let descriptor = self.store.get(name)?;
        let adapter = self.adapters.get(descriptor.backend_kind)?;
        debug!(name, backend = %descriptor.backend_kind, "Opening pool");

        match self
            .bounded("open", adapter.open(&descriptor, &self.settings.pool))
            .await
        {
            Ok(handle) => {
                self.slots_write()
                    .insert(name.to_string(), Slot::Open(handle.clone()));
                info!(name, backend = %descriptor.backend_kind, "Connection opened");
                Ok(handle)
            }
            Err(e) => {
                warn!(name, backend = %descriptor.backend_kind, error = %e, "Open failed");
                gate.record_failure(&mut state, e.to_string());
                Err(e)
            }
        }
    }

    pub async fn execute_query(
        &self,
        name: &str,
        statement: &str,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        let ctx = |e: Error| e.with_context("execute_query", name);
        let handle = self.resolve(name).await.map_err(ctx)?;
        debug!(
            name,
            statement = %truncate_statement(statement, LOGGED_STATEMENT_CHARS),
            params = params.len(),
            "execute_query"
        );

        let rows = self
            .bounded("execute_query", handle.execute_query(statement, params))
            .await
            .map_err(ctx)?;
        info!(name, rows = rows.len(), "Query executed");
        Ok(rows)
    }

    pub async fn execute_command(&self, name: &str, statement: &str, params: &[Value]) -> Result<u64> {
        let ctx = |e: Error| e.with_context("execute_command", name);
        let handle = self.resolve(name).await.map_err(ctx)?;
        debug!(
            name,
            statement = %truncate_statement(statement, LOGGED_STATEMENT_CHARS),
            params = params.len(),
            "execute_command"
        );

        let affected = self
            .bounded("execute_command", handle.execute_command(statement, params))
            .await
            .map_err(ctx)?;
        info!(name, affected, "Command executed");
        Ok(affected)
    }

    /// One-off round-trip on a fresh connection; any open pool is left alone.
    pub async fn test_connection(&self, name: &str) -> Result<()> {
        let ctx = |e: Error| e.with_context("test_connection", name);
        let descriptor = self.store.get(name).map_err(ctx)?;
        let adapter = self.adapters.get(descriptor.backend_kind).map_err(ctx)?;
        self.bounded("test", adapter.test(&descriptor, &self.settings.pool))
            .await
            .map_err(ctx)?;
        info!(name, backend = %descriptor.backend_kind, "Connection test passed");
        Ok(())
    }

    /// Idempotent; the stored definition is untouched.
    pub async fn close_connection(&self, name: &str) {
        if let Some(handle) = self.detach(name, true) {
            self.shutdown(name, handle).await;
        }
    }

    /// Close every open pool. Returns how many were open.
    pub async fn close_all_connections(&self) -> usize {
        let handles: Vec<(String, PoolHandle)> = {
            let mut slots = self.slots_write();
            let names: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| match slots.insert(name.clone(), Slot::Closed) {
                    Some(Slot::Open(handle)) => Some((name, handle)),
                    _ => None,
                })
                .collect()
        };

        let count = handles.len();
        futures::future::join_all(
            handles
                .into_iter()
                .map(|(name, handle)| async move { self.shutdown(&name, handle).await }),
        )
        .await;
        if count > 0 {
            info!(count, "All connections closed");
        }
        count
    }

    // ── Views ─────────────────────────────────────────────────

    pub fn list_connections(&self) -> Result<Vec<ConnectionSummary>> {
        self.store.list()
    }

    pub fn connection_info(&self, name: &str) -> Result<ConnectionInfo> {
        let descriptor = self
            .store
            .get(name)
            .map_err(|e| e.with_context("connection_info", name))?;
        Ok(descriptor.info(self.is_open(name)))
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.live_handle(name).is_some()
    }

    /// Sorted names with a live pool.
    pub fn open_connections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots_read()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(h) if !h.is_closed()))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn state(&self, name: &str) -> Result<ConnectionState> {
        if !self.store.contains(name)? {
            return Ok(ConnectionState::Unconfigured);
        }
        Ok(match self.slots_read().get(name) {
            None => ConnectionState::Configured,
            Some(Slot::Open(handle)) if !handle.is_closed() => ConnectionState::Open,
            Some(_) => ConnectionState::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use dbconn_backend::{BackendAdapter, BackendPool};
    use dbconn_core::{BackendKind, ErrorKind, PoolSettings};
    use serde_json::json;

    use super::*;

    const KIND: BackendKind = BackendKind::Postgresql;

    #[derive(Default)]
    struct MockAdapter {
        opens: AtomicUsize,
        tests: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl MockAdapter {
        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendAdapter for MockAdapter {
        fn kind(&self) -> BackendKind {
            KIND
        }

        async fn open(&self, _: &ConnectionDescriptor, _: &PoolSettings) -> Result<PoolHandle> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::connection(KIND, "connection refused"));
            }
            Ok(Arc::new(MockPool::default()))
        }

        async fn test(&self, _: &ConnectionDescriptor, _: &PoolSettings) -> Result<()> {
            self.tests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct MockPool {
        closed: AtomicBool,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl BackendPool for MockPool {
        fn kind(&self) -> BackendKind {
            KIND
        }

        async fn execute_query(&self, _: &str, params: &[Value]) -> Result<Vec<Row>> {
            if self.is_closed() {
                return Err(Error::connection(KIND, "pool is closed"));
            }
            let mut row = Row::new();
            row.insert("params".to_string(), json!(params.len()));
            Ok(vec![row])
        }

        async fn execute_command(&self, _: &str, _: &[Value]) -> Result<u64> {
            if self.is_closed() {
                return Err(Error::connection(KIND, "pool is closed"));
            }
            Ok(3)
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn registry(dir: &std::path::Path, adapter: Arc<MockAdapter>, timeout_secs: u64) -> ConnectionRegistry {
        let settings = Settings {
            config_dir: dir.to_path_buf(),
            operation_timeout_secs: timeout_secs,
            ..Settings::default()
        };
        let store = ConfigStore::from_settings(&settings, SecretCipher::generate());
        let mut adapters = AdapterSet::new();
        adapters.register(adapter);
        ConnectionRegistry::new(store, adapters, settings)
    }

    fn pg(name: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::network(name, KIND, "db.internal", "app").with_credentials("app", "s3cret")
    }

    #[tokio::test]
    async fn test_concurrent_gets_open_once() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = MockAdapter::slow(Duration::from_millis(50));
        let registry = Arc::new(registry(tmp.path(), adapter.clone(), 30));
        registry.add_connection("x", pg("x")).await.unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_connection("x").await })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }
        assert_eq!(adapter.opens(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(registry.state("x").unwrap(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_failed_open_shared_with_waiters_and_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = MockAdapter::slow(Duration::from_millis(50));
        adapter.fail.store(true, Ordering::SeqCst);
        let registry = Arc::new(registry(tmp.path(), adapter.clone(), 30));
        registry.add_connection("x", pg("x")).await.unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_connection("x").await })
            })
            .collect();

        let mut kinds = Vec::new();
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            if err.kind() == ErrorKind::Conflict {
                assert!(err.to_string().contains("connection refused"));
            }
            kinds.push(err.kind());
        }
        assert_eq!(adapter.opens(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == ErrorKind::Connection).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == ErrorKind::Conflict).count(), 9);

        adapter.fail.store(false, Ordering::SeqCst);
        registry.get_connection("x").await.unwrap();
        assert_eq!(adapter.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_open_times_out_and_nothing_is_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = MockAdapter::slow(Duration::from_secs(5));
        let registry = registry(tmp.path(), adapter.clone(), 1);
        registry.add_connection("x", pg("x")).await.unwrap();

        let err = registry.get_connection("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!registry.is_open("x"));
        assert!(registry.open_connections().is_empty());
        assert_eq!(registry.state("x").unwrap(), ConnectionState::Configured);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_reopens() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::default());
        let registry = registry(tmp.path(), adapter.clone(), 30);
        registry.add_connection("x", pg("x")).await.unwrap();

        let handle = registry.get_connection("x").await.unwrap();
        registry.close_connection("x").await;
        registry.close_connection("x").await;
        registry.close_connection("never-added").await;
        assert!(handle.is_closed());
        assert_eq!(registry.state("x").unwrap(), ConnectionState::Closed);

        let rows = registry.execute_query("x", "SELECT 1", &[json!(1)]).await.unwrap();
        assert_eq!(rows[0]["params"], json!(1));
        assert_eq!(adapter.opens(), 2);
        assert_eq!(registry.state("x").unwrap(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_remove_closes_then_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path(), Arc::new(MockAdapter::default()), 30);
        registry.add_connection("x", pg("x")).await.unwrap();
        let handle = registry.get_connection("x").await.unwrap();

        registry.remove_connection("x").await.unwrap();
        assert!(handle.is_closed());
        assert_eq!(registry.state("x").unwrap(), ConnectionState::Unconfigured);

        let err = registry.get_connection("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = registry.remove_connection("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_add_while_open_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path(), Arc::new(MockAdapter::default()), 30);
        registry.add_connection("x", pg("x")).await.unwrap();
        registry.add_connection("x", pg("x")).await.unwrap();
        registry.get_connection("x").await.unwrap();

        let err = registry.add_connection("x", pg("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(err, Error::Context { operation: "add_connection", .. }));
        assert!(err.to_string().starts_with("add_connection 'x'"));

        registry.close_connection("x").await;
        registry.add_connection("x", pg("x").with_port(6543)).await.unwrap();
        assert_eq!(registry.connection_info("x").unwrap().port, Some(6543));
        assert_eq!(registry.state("x").unwrap(), ConnectionState::Configured);
    }

    #[tokio::test]
    async fn test_update_closes_pool_and_requires_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::default());
        let registry = registry(tmp.path(), adapter.clone(), 30);

        let err = registry.update_connection("x", pg("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        registry.add_connection("x", pg("x")).await.unwrap();
        let handle = registry.get_connection("x").await.unwrap();
        registry
            .update_connection("x", pg("x").with_param("sslmode", "require"))
            .await
            .unwrap();
        assert!(handle.is_closed());
        assert!(!registry.is_open("x"));

        let info = registry.connection_info("x").unwrap();
        assert_eq!(info.extra_params.get("sslmode").map(String::as_str), Some("require"));
    }

    #[tokio::test]
    async fn test_concurrent_amendments_all_land() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path(), Arc::new(MockAdapter::default()), 30);
        registry.add_connection("x", pg("x")).await.unwrap();
        let handle = registry.get_connection("x").await.unwrap();

        let (a, b) = tokio::join!(
            registry.amend_connection("x", |d| d.with_param("sslmode", "require")),
            registry.amend_connection("x", |d| d.with_param("application_name", "reports")),
        );
        a.unwrap();
        b.unwrap();

        let params = registry.connection_info("x").unwrap().extra_params;
        assert_eq!(params.get("sslmode").map(String::as_str), Some("require"));
        assert_eq!(params.get("application_name").map(String::as_str), Some("reports"));
        assert!(handle.is_closed());

        let err = registry.amend_connection("missing", |d| d).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = registry
            .amend_connection("x", |mut d| {
                d.host = None;
                d
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_validation_rejected_before_persisting() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path(), Arc::new(MockAdapter::default()), 30);
        let mut d = pg("x");
        d.host = None;

        let err = registry.add_connection("x", d).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(registry.list_connections().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_errors_keep_kind_with_context() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path(), Arc::new(MockAdapter::default()), 30);

        let err = registry.execute_command("missing", "DELETE FROM t", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().starts_with("execute_command 'missing'"));

        registry.add_connection("x", pg("x")).await.unwrap();
        assert_eq!(registry.execute_command("x", "DELETE FROM t", &[]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_test_connection_leaves_pools_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::default());
        let registry = registry(tmp.path(), adapter.clone(), 30);
        registry.add_connection("x", pg("x")).await.unwrap();

        registry.test_connection("x").await.unwrap();
        assert_eq!(adapter.tests.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.opens(), 0);
        assert!(registry.open_connections().is_empty());
    }

    #[tokio::test]
    async fn test_close_all_and_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path(), Arc::new(MockAdapter::default()), 30);
        for name in ["b", "a", "c"] {
            registry.add_connection(name, pg(name)).await.unwrap();
        }
        registry.get_connection("a").await.unwrap();
        registry.get_connection("b").await.unwrap();
        assert_eq!(registry.open_connections(), vec!["a", "b"]);

        let names: Vec<_> = registry
            .list_connections()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        assert_eq!(registry.close_all_connections().await, 2);
        assert_eq!(registry.close_all_connections().await, 0);
        assert!(registry.open_connections().is_empty());
        assert!(registry.list_connections().unwrap().len() == 3);
    }
}
