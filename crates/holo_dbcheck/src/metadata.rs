//! Collection metadata exchange, run once per collection before its batches.

use crate::catalog::Collection;
use crate::context::{OperationContext, ServiceContext};
use crate::health_log;
use crate::lock::LockMode;
use crate::log_writer::ReplicatedLogWriter;
use crate::oplog::DbCheckOplogEntry;
use crate::types::{CollectionMetadataRecord, Namespace, OpTime};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataOutcome {
    /// Metadata was built and audited. `op_time` is `None` when the entry
    /// could not be replicated.
    Exchanged { op_time: Option<OpTime> },
    /// The collection no longer exists; skip it.
    Vanished,
}

pub struct MetadataExchanger<'a> {
    service: &'a ServiceContext,
    writer: &'a ReplicatedLogWriter,
}

impl<'a> MetadataExchanger<'a> {
    pub fn new(service: &'a ServiceContext, writer: &'a ReplicatedLogWriter) -> Self {
        Self { service, writer }
    }

    /// Replicate the identity of `nss` and write the matching audit record.
    ///
    /// A failed replication does not fail the exchange; the caller checks
    /// the abort flag to tell a stepdown from a storage error.
    pub async fn exchange(&self, op: &OperationContext, nss: &Namespace) -> MetadataOutcome {
        // Neighbour lookups must see a stable catalog.
        let _db = self.service.locks.lock_database(&nss.db, LockMode::Shared).await;

        let Some(collection) = self.service.catalog.lookup(nss) else {
            tracing::info!(namespace = %nss, "collection vanished before metadata exchange");
            return MetadataOutcome::Vanished;
        };
        let record = self.build_record(&collection);

        let op_time = match self
            .writer
            .write(
                op,
                nss,
                Some(record.uuid),
                DbCheckOplogEntry::Collection(record.clone()),
            )
            .await
        {
            Ok(op_time) => Some(op_time),
            Err(err) => {
                tracing::warn!(namespace = %nss, error = ?err, "failed to replicate collection metadata");
                None
            }
        };

        // The primary has nothing to compare against yet, so the record is
        // checked against itself.
        self.service
            .health_log
            .log(health_log::collection_entry(nss, &record, &record, op_time));

        MetadataOutcome::Exchanged { op_time }
    }

    fn build_record(&self, collection: &Collection) -> CollectionMetadataRecord {
        let nss = collection.nss();
        let uuid = collection.uuid();
        CollectionMetadataRecord {
            nss: nss.clone(),
            uuid,
            prev: self.service.catalog.prev(&nss.db, uuid),
            next: self.service.catalog.next(&nss.db, uuid),
            indexes: collection.indexes().to_vec(),
            options: collection.options().clone(),
        }
    }
}
