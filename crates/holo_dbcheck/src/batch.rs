//! One bounded batch: digest a key range and replicate the result.

use crate::config::DbCheckConfig;
use crate::context::{Client, ServiceContext};
use crate::digest::DigestRequest;
use crate::error::DbCheckError;
use crate::lock::LockMode;
use crate::log_writer::ReplicatedLogWriter;
use crate::oplog::{BatchOplogEntry, DbCheckOplogEntry};
use crate::types::{BatchResult, DocKey, RangeSpec, RunTotals};

/// Document and byte caps for the next batch of `spec`: the configured
/// ceiling or whatever is left of the collection's allowance, whichever is
/// smaller.
pub fn batch_caps(config: &DbCheckConfig, spec: &RangeSpec, totals: &RunTotals) -> (u64, u64) {
    let docs_left = spec.max_count.saturating_sub(totals.docs).max(1);
    let bytes_left = spec.max_size.saturating_sub(totals.bytes).max(1);
    (config.batch_docs.min(docs_left), config.batch_bytes.min(bytes_left))
}

pub struct BatchExecutor<'a> {
    service: &'a ServiceContext,
    writer: &'a ReplicatedLogWriter,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(service: &'a ServiceContext, writer: &'a ReplicatedLogWriter) -> Self {
        Self { service, writer }
    }

    /// Digest the documents after `start` in `spec` and append the batch entry.
    ///
    /// Runs under its own operation context and collection lock, both
    /// released before returning.
    pub async fn run(
        &self,
        client: &Client,
        spec: &RangeSpec,
        start: DocKey,
        max_docs: u64,
        max_bytes: u64,
    ) -> Result<BatchResult, DbCheckError> {
        let op = client.make_operation_context();
        let _coll = self
            .service
            .locks
            .lock_collection(&spec.nss, LockMode::Shared)
            .await;

        let collection = self.service.catalog.lookup(&spec.nss).ok_or_else(|| {
            DbCheckError::NamespaceNotFound("dbCheck collection no longer exists".to_string())
        })?;

        let request = DigestRequest {
            start: start.clone(),
            end: spec.end.clone(),
            max_docs,
            max_bytes,
        };
        let outcome = self
            .service
            .digest
            .hash_range(&op, &collection, &request)
            .await?;

        let entry = DbCheckOplogEntry::Batch(BatchOplogEntry {
            nss: spec.nss.clone(),
            digest: outcome.digest.clone(),
            min_key: start,
            max_key: outcome.last_key.clone(),
        });
        let op_time = self
            .writer
            .write(&op, &spec.nss, Some(collection.uuid()), entry)
            .await?;

        tracing::debug!(
            namespace = %spec.nss,
            docs = outcome.docs,
            bytes = outcome.bytes,
            last_key = %outcome.last_key,
            "dbCheck batch done"
        );
        Ok(BatchResult {
            docs: outcome.docs,
            bytes: outcome.bytes,
            last_key: outcome.last_key,
            digest: outcome.digest,
            op_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::harness;
    use crate::context::AbortFlag;
    use crate::oplog::OpLog;
    use crate::types::{Namespace, OpTime};
    use serde_json::json;

    fn spec(nss: &Namespace) -> RangeSpec {
        RangeSpec::full(nss.clone())
    }

    #[test]
    fn caps_use_the_smaller_of_ceiling_and_allowance() {
        let config = DbCheckConfig::default();
        let mut spec = spec(&Namespace::new("db", "c"));
        let mut totals = RunTotals::default();
        assert_eq!(batch_caps(&config, &spec, &totals), (5_000, 20_000_000));

        spec.max_count = 120;
        spec.max_size = 1_000;
        totals.docs = 100;
        totals.bytes = 900;
        assert_eq!(batch_caps(&config, &spec, &totals), (20, 100));
    }

    #[tokio::test]
    async fn batch_resumes_after_start_and_replicates_range() {
        let h = harness();
        let nss = Namespace::new("db", "c");
        let coll = h.catalog.create_collection(&nss, json!({}), Vec::new()).unwrap();
        for i in 1..=10 {
            coll.insert(DocKey::Int(i), vec![b'x'; 10]).unwrap();
        }
        let writer = ReplicatedLogWriter::new(h.service.clone(), AbortFlag::new());
        let client = h.service.make_client("dbCheck");
        let exec = BatchExecutor::new(&h.service, &writer);

        let first = exec
            .run(&client, &spec(&nss), DocKey::Min, 4, u64::MAX)
            .await
            .unwrap();
        assert_eq!(first.docs, 4);
        assert_eq!(first.last_key, DocKey::Int(4));
        assert_eq!(first.op_time, OpTime { ts: 1, term: 1 });

        let second = exec
            .run(&client, &spec(&nss), first.last_key.clone(), 100, u64::MAX)
            .await
            .unwrap();
        assert_eq!(second.docs, 6);
        assert_eq!(second.bytes, 60);
        assert_eq!(second.last_key, DocKey::Max);

        let entries = h.oplog.entries().unwrap();
        let DbCheckOplogEntry::Batch(batch) = &entries[1].object else {
            panic!("expected a batch entry");
        };
        assert_eq!(batch.min_key, DocKey::Int(4));
        assert_eq!(batch.max_key, DocKey::Max);
        assert_eq!(batch.digest, second.digest);
        assert_eq!(entries[1].uuid, Some(coll.uuid()));
    }

    #[tokio::test]
    async fn dropped_collection_fails_the_batch() {
        let h = harness();
        let nss = Namespace::new("db", "c");
        h.catalog.create_collection(&nss, json!({}), Vec::new()).unwrap();
        h.catalog.drop_collection(&nss);
        let writer = ReplicatedLogWriter::new(h.service.clone(), AbortFlag::new());
        let client = h.service.make_client("dbCheck");

        let err = BatchExecutor::new(&h.service, &writer)
            .run(&client, &spec(&nss), DocKey::Min, 10, 10)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DbCheckError::NamespaceNotFound("dbCheck collection no longer exists".into())
        );
        assert!(h.oplog.entries().unwrap().is_empty());
    }
}
