//! Guarded appends to the replicated log.
//!
//! Every entry dbCheck emits goes through [`ReplicatedLogWriter::write`]. The
//! interruption and write-authority checks run under `Global IX`, and the
//! append happens before that lock is released. Stepdown needs `Global S`, so
//! it cannot complete between the checks and the append.

use std::time::Duration;

use crate::config::DbCheckConfig;
use crate::context::{AbortFlag, OperationContext, ServiceContext};
use crate::error::DbCheckError;
use crate::lock::LockMode;
use crate::oplog::{DbCheckOplogEntry, PendingEntry};
use crate::types::{CollectionUuid, Namespace, OpTime};

/// Conflicts retried back to back before sleeping.
const RETRIES_WITHOUT_BACKOFF: u64 = 4;
/// Every this many conflicts the retry is logged at warn.
const WARN_EVERY_ATTEMPTS: u64 = 100;

pub struct ReplicatedLogWriter {
    service: ServiceContext,
    abort: AbortFlag,
}

impl ReplicatedLogWriter {
    pub fn new(service: ServiceContext, abort: AbortFlag) -> Self {
        Self { service, abort }
    }

    /// Append `object` for `nss` and return its position.
    ///
    /// Interruption and lost write authority set the abort flag and are
    /// never retried. Write conflicts are retried with the same payload.
    pub async fn write(
        &self,
        op: &OperationContext,
        nss: &Namespace,
        uuid: Option<CollectionUuid>,
        object: DbCheckOplogEntry,
    ) -> Result<OpTime, DbCheckError> {
        let _global = self
            .service
            .locks
            .lock_global(LockMode::IntentExclusive)
            .await;

        if let Err(err) = op.check_for_interrupt() {
            self.abort.set();
            return Err(err);
        }
        if !self.service.replication.can_accept_writes_for(nss) {
            self.abort.set();
            return Err(DbCheckError::RoleLost);
        }

        let pending = PendingEntry {
            term: self.service.replication.term(),
            ns: nss.clone(),
            uuid,
            object,
        };
        let operation = pending.object.kind().operation();
        let oplog = &self.service.oplog;
        write_conflict_retry(&self.service.config, operation, nss, || oplog.append(&pending)).await
    }
}

/// Run `f` until it returns anything other than a transient write conflict.
pub async fn write_conflict_retry<T, F>(
    config: &DbCheckConfig,
    operation: &str,
    nss: &Namespace,
    mut f: F,
) -> Result<T, DbCheckError>
where
    F: FnMut() -> Result<T, DbCheckError>,
{
    let mut attempt: u64 = 0;
    loop {
        match f() {
            Err(err) if err.is_transient() => {
                attempt += 1;
                if attempt % WARN_EVERY_ATTEMPTS == 0 {
                    tracing::warn!(
                        namespace = %nss,
                        operation,
                        attempt,
                        "write conflict retry still failing"
                    );
                } else {
                    tracing::debug!(namespace = %nss, operation, attempt, "write conflict, retrying");
                }
                if let Some(delay) = backoff(config, attempt) {
                    tokio::time::sleep(delay).await;
                }
            }
            other => return other,
        }
    }
}

fn backoff(config: &DbCheckConfig, attempt: u64) -> Option<Duration> {
    if attempt < RETRIES_WITHOUT_BACKOFF {
        return None;
    }
    Some(Duration::from_millis(attempt).min(config.conflict_backoff_max))
}
