//! Per-name lock table.
//!
//! A gate serializes opens and mutations for one connection name. Entries are
//! created on first reference and kept for the life of the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::MutexGuard;

#[derive(Debug, Default)]
pub(crate) struct GateState {
    /// Detail of the most recent failed open, handed to callers that waited on it.
    pub last_failure: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Gate {
    state: tokio::sync::Mutex<GateState>,
    failures: AtomicU64,
}

impl Gate {
    /// Failed-open counter. Read it before [`Gate::lock`] to detect a failure
    /// that happened while waiting.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    pub async fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().await
    }

    /// Must be called with the guard held.
    pub fn record_failure(&self, state: &mut GateState, detail: String) {
        state.last_failure = Some(detail);
        self.failures.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
pub(crate) struct GateTable {
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl GateTable {
    pub fn gate(&self, name: &str) -> Arc<Gate> {
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.entry(name.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_name_same_gate() {
        let table = GateTable::default();
        let a = table.gate("x");
        let b = table.gate("x");
        let c = table.gate("y");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_failure_counter_advances() {
        let gate = Gate::default();
        let seen = gate.failures();
        {
            let mut state = gate.lock().await;
            gate.record_failure(&mut state, "refused".into());
        }
        assert_eq!(gate.failures(), seen + 1);
        assert_eq!(gate.lock().await.last_failure.as_deref(), Some("refused"));
    }
}
