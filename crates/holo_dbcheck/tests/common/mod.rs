//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use holo_dbcheck::catalog::Collection;
use holo_dbcheck::context::OperationContext;
use holo_dbcheck::digest::{DigestOutcome, DigestRequest};
use holo_dbcheck::oplog::BatchOplogEntry;
use holo_dbcheck::{
    Blake3Digest, DbCheckError, DbCheckOplogEntry, DigestService, DocKey, JobHandle, JobReport,
    LockManager, MemoryCatalog, MemoryHealthLog, MemoryOpLog, Namespace, OpLog, OplogEntry,
    ReplicaSetMember, ServiceContext,
};

/// Upper bound for a job to finish in tests.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// One in-process primary with typed handles on every collaborator.
pub struct Node {
    pub catalog: Arc<MemoryCatalog>,
    pub oplog: Arc<dyn OpLog>,
    pub member: Arc<ReplicaSetMember>,
    pub health: Arc<MemoryHealthLog>,
    pub service: ServiceContext,
}

pub fn node() -> Node {
    node_with_oplog(Arc::new(MemoryOpLog::new()))
}

pub fn node_with_oplog(oplog: Arc<dyn OpLog>) -> Node {
    let catalog = Arc::new(MemoryCatalog::new());
    let locks = LockManager::new();
    let member = Arc::new(ReplicaSetMember::primary(locks.clone()));
    let health = Arc::new(MemoryHealthLog::new());
    let service = ServiceContext::new(
        catalog.clone(),
        locks,
        oplog.clone(),
        member.clone(),
        health.clone(),
    );
    Node {
        catalog,
        oplog,
        member,
        health,
        service,
    }
}

/// Create `db.coll` with documents keyed `1..=n`, each `body_len` bytes.
pub fn fill(catalog: &MemoryCatalog, db: &str, coll: &str, n: i64, body_len: usize) -> Arc<Collection> {
    let handle = catalog
        .create_collection(&Namespace::new(db, coll), json!({}), Vec::new())
        .expect("create collection");
    for i in 1..=n {
        handle
            .insert(DocKey::Int(i), vec![b'd'; body_len])
            .expect("insert document");
    }
    handle
}

pub fn batch_entries(oplog: &dyn OpLog) -> Vec<BatchOplogEntry> {
    oplog
        .entries()
        .expect("read oplog")
        .into_iter()
        .filter_map(|entry| match entry.object {
            DbCheckOplogEntry::Batch(batch) => Some(batch),
            DbCheckOplogEntry::Collection(_) => None,
        })
        .collect()
}

/// `(operation, collection)` per entry, in log order.
pub fn entry_summary(entries: &[OplogEntry]) -> Vec<(&'static str, String)> {
    entries
        .iter()
        .map(|entry| (entry.object.kind().operation(), entry.ns.coll.clone()))
        .collect()
}

pub async fn wait(handle: JobHandle) -> JobReport {
    tokio::time::timeout(JOB_TIMEOUT, handle.wait())
        .await
        .expect("job finished in time")
        .expect("job task did not panic")
}

/// Side effect triggered right before a given digest call runs.
pub enum Step {
    StepDown(Arc<ReplicaSetMember>),
    DropCollection(Arc<MemoryCatalog>, Namespace),
    Fail(DbCheckError),
    /// Make the next `n` log appends fail; the scan itself succeeds.
    FailAppends(Arc<MemoryOpLog>, u32, DbCheckError),
}

/// Blake3 digest with scripted side effects keyed by call number (from 1).
#[derive(Default)]
pub struct ScriptedDigest {
    calls: AtomicUsize,
    script: Mutex<BTreeMap<usize, Step>>,
}

impl ScriptedDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_call(self, call: usize, step: Step) -> Self {
        self.script.lock().unwrap().insert(call, step);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DigestService for ScriptedDigest {
    async fn hash_range(
        &self,
        op: &OperationContext,
        collection: &Arc<Collection>,
        request: &DigestRequest,
    ) -> Result<DigestOutcome, DbCheckError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.script.lock().unwrap().remove(&call);
        match step {
            Some(Step::StepDown(member)) => member.step_down().await,
            Some(Step::DropCollection(catalog, nss)) => {
                catalog.drop_collection(&nss);
            }
            Some(Step::Fail(err)) => return Err(err),
            Some(Step::FailAppends(oplog, n, err)) => oplog.fail_next_appends(n, err),
            None => {}
        }
        Blake3Digest.hash_range(op, collection, request).await
    }
}
