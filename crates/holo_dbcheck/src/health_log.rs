//! Audit records written by dbCheck.
//!
//! The health log is informational: a lost record never affects the
//! replicated stream, so sinks are infallible from the caller's side.

use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::DbCheckError;
use crate::oplog::OplogEntryKind;
use crate::types::{BatchResult, CollectionMetadataRecord, DocKey, Namespace, OpTime};

const SCOPE_CLUSTER: &str = "cluster";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthLogEntry {
    pub namespace: Namespace,
    pub timestamp_ms: u64,
    pub severity: Severity,
    pub msg: String,
    pub scope: String,
    pub operation: String,
    pub data: Value,
}

impl HealthLogEntry {
    fn new(
        namespace: &Namespace,
        severity: Severity,
        msg: impl Into<String>,
        kind: OplogEntryKind,
        data: Value,
    ) -> Self {
        Self {
            namespace: namespace.clone(),
            timestamp_ms: timestamp_ms(),
            severity,
            msg: msg.into(),
            scope: SCOPE_CLUSTER.to_string(),
            operation: kind.operation().to_string(),
            data,
        }
    }

    /// Whether the record reports a consistent result.
    pub fn is_success(&self) -> bool {
        self.data.get("success").and_then(Value::as_bool) == Some(true)
    }
}

/// Record for a successful batch. On the primary the expected and found
/// digests are the same value, so the batch is always consistent.
pub fn batch_entry(nss: &Namespace, min_key: &DocKey, batch: &BatchResult) -> HealthLogEntry {
    let data = json!({
        "success": true,
        "count": batch.docs,
        "bytes": batch.bytes,
        "digest": batch.digest,
        "minKey": min_key,
        "maxKey": batch.last_key,
        "optime": batch.op_time,
    });
    HealthLogEntry::new(
        nss,
        Severity::Info,
        "dbCheck batch consistent",
        OplogEntryKind::Batch,
        data,
    )
}

/// Record comparing expected and found collection metadata. `op_time` is
/// `None` when the metadata entry could not be replicated.
pub fn collection_entry(
    nss: &Namespace,
    expected: &CollectionMetadataRecord,
    found: &CollectionMetadataRecord,
    op_time: Option<OpTime>,
) -> HealthLogEntry {
    let consistent = expected == found;
    let (severity, msg) = if consistent {
        (Severity::Info, "dbCheck collection consistent")
    } else {
        (Severity::Error, "dbCheck collection inconsistent")
    };
    let data = json!({
        "success": consistent,
        "expected": expected,
        "found": found,
        "optime": op_time,
    });
    HealthLogEntry::new(nss, severity, msg, OplogEntryKind::CollectionMetadata, data)
}

pub fn error_entry(
    nss: &Namespace,
    msg: &str,
    kind: OplogEntryKind,
    err: &DbCheckError,
) -> HealthLogEntry {
    let data = json!({
        "success": false,
        "error": err.to_string(),
        "code": err.code() as i32,
    });
    HealthLogEntry::new(nss, Severity::Error, msg, kind, data)
}

/// Write-only audit sink.
pub trait HealthLog: Send + Sync + 'static {
    fn log(&self, entry: HealthLogEntry);
}

/// Keeps every record in memory, in write order.
#[derive(Default)]
pub struct MemoryHealthLog {
    entries: Mutex<Vec<HealthLogEntry>>,
}

impl MemoryHealthLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<HealthLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HealthLog for MemoryHealthLog {
    fn log(&self, entry: HealthLogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

/// Emits each record as a tracing event under the `health_log` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingHealthLog;

impl HealthLog for TracingHealthLog {
    fn log(&self, entry: HealthLogEntry) {
        let data = entry.data.to_string();
        match entry.severity {
            Severity::Info => tracing::info!(
                target: "health_log",
                namespace = %entry.namespace,
                operation = %entry.operation,
                data = %data,
                "{}",
                entry.msg
            ),
            Severity::Warning => tracing::warn!(
                target: "health_log",
                namespace = %entry.namespace,
                operation = %entry.operation,
                data = %data,
                "{}",
                entry.msg
            ),
            Severity::Error => tracing::error!(
                target: "health_log",
                namespace = %entry.namespace,
                operation = %entry.operation,
                data = %data,
                "{}",
                entry.msg
            ),
        }
    }
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
