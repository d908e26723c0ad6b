//! Per-turn side channel for tool results.
//!
//! The registry records every tool outcome here, keyed by call id, and the
//! reconciler consults it when a result event arrives without a result. A
//! ledger is created for one turn and dropped with it, so nothing leaks
//! between sessions or turns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Cloneable handle to one turn's result map.
#[derive(Debug, Clone, Default)]
pub struct ToolResultLedger {
    results: Arc<Mutex<HashMap<String, String>>>,
}

impl ToolResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or overwrite) the result for `call_id`.
    pub fn record(&self, call_id: &str, result: impl Into<String>) {
        if let Ok(mut map) = self.results.lock() {
            map.insert(call_id.to_owned(), result.into());
        }
    }

    /// Remove and return the result for `call_id`.
    pub fn take(&self, call_id: &str) -> Option<String> {
        self.results.lock().ok()?.remove(call_id)
    }

    pub fn len(&self) -> usize {
        self.results.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_entry() {
        let ledger = ToolResultLedger::new();
        ledger.record("call_1", "first");
        ledger.record("call_1", "second");
        assert_eq!(ledger.len(), 1);

        let clone = ledger.clone();
        assert_eq!(clone.take("call_1").as_deref(), Some("second"));
        assert!(ledger.take("call_1").is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn ledgers_are_independent() {
        let a = ToolResultLedger::new();
        let b = ToolResultLedger::new();
        a.record("x", "only in a");
        assert!(b.take("x").is_none());
    }
}
