//! The background dbCheck job.
//!
//! Collections are checked one after another in plan order and batches of a
//! collection strictly in key order, so the replicated entries of one run
//! have a single deterministic order. The abort flag is checked before each
//! collection and after each batch; once set, the job stops without writing
//! further audit records.

use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};

use crate::batch::{batch_caps, BatchExecutor};
use crate::context::{AbortFlag, Client, ServiceContext};
use crate::health_log;
use crate::log_writer::ReplicatedLogWriter;
use crate::metadata::{MetadataExchanger, MetadataOutcome};
use crate::oplog::OplogEntryKind;
use crate::types::{Namespace, RangeSpec, RunPlan, RunTotals};

/// Name of the client every job runs under.
pub const JOB_CLIENT_NAME: &str = "dbCheck";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionOutcome {
    /// Every batch up to the end of the range or a cap was checked.
    Completed,
    /// The collection was gone before its metadata could be read.
    Vanished,
    /// A batch failed; the remaining batches of this collection were skipped.
    Failed(String),
    /// The job stopped while this collection was in progress.
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub namespace: Namespace,
    pub outcome: CollectionOutcome,
    pub batches: u64,
    pub docs: u64,
    pub bytes: u64,
}

impl CollectionReport {
    fn new(namespace: &Namespace, outcome: CollectionOutcome, totals: &RunTotals) -> Self {
        Self {
            namespace: namespace.clone(),
            outcome,
            batches: totals.batches,
            docs: totals.docs,
            bytes: totals.bytes,
        }
    }
}

/// What a finished job did. Never returned to the command caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub db: String,
    pub collections: Vec<CollectionReport>,
    pub stopped_by_abort: bool,
}

impl JobReport {
    pub fn batches(&self) -> u64 {
        self.collections.iter().map(|c| c.batches).sum()
    }

    pub fn docs(&self) -> u64 {
        self.collections.iter().map(|c| c.docs).sum()
    }

    pub fn outcome_of(&self, nss: &Namespace) -> Option<&CollectionOutcome> {
        self.collections
            .iter()
            .find(|c| &c.namespace == nss)
            .map(|c| &c.outcome)
    }
}

pub struct DbCheckJob {
    service: ServiceContext,
    db: String,
    plan: RunPlan,
    client: Client,
    abort: AbortFlag,
    writer: ReplicatedLogWriter,
}

impl DbCheckJob {
    pub fn new(service: ServiceContext, db: &str, plan: RunPlan) -> Self {
        let client = service.make_client(JOB_CLIENT_NAME);
        let abort = AbortFlag::new();
        let writer = ReplicatedLogWriter::new(service.clone(), abort.clone());
        Self {
            service,
            db: db.to_string(),
            plan,
            client,
            abort,
            writer,
        }
    }

    /// Start the job on the runtime without waiting for it.
    pub fn spawn(self) -> JobHandle {
        let client = self.client.clone();
        let abort = self.abort.clone();
        let task = tokio::spawn(self.run());
        JobHandle {
            client,
            abort,
            task,
        }
    }

    pub async fn run(self) -> JobReport {
        tracing::info!(db = %self.db, collections = self.plan.len(), "dbCheck started");
        let mut report = JobReport {
            db: self.db.clone(),
            ..JobReport::default()
        };

        for spec in &self.plan {
            if self.abort.is_set() {
                break;
            }
            report.collections.push(self.check_collection(spec).await);
        }

        if self.abort.is_set() {
            report.stopped_by_abort = true;
            tracing::info!(db = %self.db, "dbCheck terminated due to stepdown");
        }
        tracing::info!(
            db = %self.db,
            collections = report.collections.len(),
            batches = report.batches(),
            docs = report.docs(),
            stopped_by_abort = report.stopped_by_abort,
            "dbCheck finished"
        );
        report
    }

    async fn check_collection(&self, spec: &RangeSpec) -> CollectionReport {
        let mut totals = RunTotals::default();

        let op = self.client.make_operation_context();
        let exchanged = MetadataExchanger::new(&self.service, &self.writer)
            .exchange(&op, &spec.nss)
            .await;
        drop(op);
        if exchanged == MetadataOutcome::Vanished {
            return CollectionReport::new(&spec.nss, CollectionOutcome::Vanished, &totals);
        }
        if self.abort.is_set() {
            return CollectionReport::new(&spec.nss, CollectionOutcome::Aborted, &totals);
        }
        if spec.is_empty() {
            tracing::debug!(namespace = %spec.nss, "empty key range, no batches to run");
            return CollectionReport::new(&spec.nss, CollectionOutcome::Completed, &totals);
        }

        let executor = BatchExecutor::new(&self.service, &self.writer);
        loop {
            let start = totals.resume_key(spec);
            let (max_docs, max_bytes) = batch_caps(&self.service.config, spec, &totals);
            let result = executor
                .run(&self.client, spec, start.clone(), max_docs, max_bytes)
                .await;

            // The writer sets the flag itself before failing; anything it set
            // stops the job without a record.
            if self.abort.is_set() {
                return CollectionReport::new(&spec.nss, CollectionOutcome::Aborted, &totals);
            }

            match result {
                Ok(batch) => {
                    self.service
                        .health_log
                        .log(health_log::batch_entry(&spec.nss, &start, &batch));
                    totals.record(&batch);
                    if totals.reached_end(spec) {
                        return CollectionReport::new(
                            &spec.nss,
                            CollectionOutcome::Completed,
                            &totals,
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(namespace = %spec.nss, error = ?err, "dbCheck batch failed");
                    self.service.health_log.log(health_log::error_entry(
                        &spec.nss,
                        "dbCheck batch failed",
                        OplogEntryKind::Batch,
                        &err,
                    ));
                    // An interrupted scan still gets its record, then ends the run.
                    if err.is_run_fatal() {
                        self.abort.set();
                        return CollectionReport::new(
                            &spec.nss,
                            CollectionOutcome::Aborted,
                            &totals,
                        );
                    }
                    return CollectionReport::new(
                        &spec.nss,
                        CollectionOutcome::Failed(err.to_string()),
                        &totals,
                    );
                }
            }
        }
    }
}

/// Handle on a spawned job, for embedders and tests.
pub struct JobHandle {
    client: Client,
    abort: AbortFlag,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    /// Interrupt the job; it stops at its next interruption check.
    pub fn kill(&self) {
        self.client.kill();
    }

    pub fn abort_flag(&self) -> &AbortFlag {
        &self.abort
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<JobReport, JoinError> {
        self.task.await
    }
}
