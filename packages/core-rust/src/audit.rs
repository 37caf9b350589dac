//! Audit collaborator: receives the audit value of every successful invocation.

use parking_lot::Mutex;
use serde_json::Value;

/// Destination for audit records. Audit values are never returned to callers.
pub trait AuditSink: Send + Sync {
    fn record(&self, operation: &str, audit: &Value);
}

/// Writes audit records to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, operation: &str, audit: &Value) {
        tracing::info!(target: "audit", operation, audit = %audit, "audit");
    }
}

/// Keeps audit records in memory. Used by tests and local tooling.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<(String, Value)>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records collected so far, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<(String, Value)> {
        self.records.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, operation: &str, audit: &Value) {
        self.records.lock().push((operation.to_string(), audit.clone()));
    }
}
