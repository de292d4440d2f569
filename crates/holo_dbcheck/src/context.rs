//! Process, client and per-operation contexts.
//!
//! `ServiceContext` bundles the storage, replication and logging collaborators.
//! Interruption is a token tree: shutting the service down interrupts every
//! client, killing a client interrupts its current operation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::{AllowAll, Authorizer};
use crate::catalog::Catalog;
use crate::config::DbCheckConfig;
use crate::digest::{Blake3Digest, DigestService};
use crate::error::DbCheckError;
use crate::health_log::HealthLog;
use crate::lock::LockManager;
use crate::oplog::OpLog;
use crate::replication::ReplicationCoordinator;

/// Feature compatibility version of the deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureCompatibilityVersion {
    V34,
    V36,
}

impl fmt::Display for FeatureCompatibilityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureCompatibilityVersion::V34 => f.write_str("3.4"),
            FeatureCompatibilityVersion::V36 => f.write_str("3.6"),
        }
    }
}

#[derive(Clone)]
pub struct ServiceContext {
    pub catalog: Arc<dyn Catalog>,
    pub locks: Arc<LockManager>,
    pub oplog: Arc<dyn OpLog>,
    pub replication: Arc<dyn ReplicationCoordinator>,
    pub health_log: Arc<dyn HealthLog>,
    pub digest: Arc<dyn DigestService>,
    pub authorizer: Arc<dyn Authorizer>,
    pub fcv: FeatureCompatibilityVersion,
    pub config: DbCheckConfig,
    shutdown: CancellationToken,
}

impl ServiceContext {
    /// Context with the blake3 digest, no authorization and the latest FCV.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        locks: Arc<LockManager>,
        oplog: Arc<dyn OpLog>,
        replication: Arc<dyn ReplicationCoordinator>,
        health_log: Arc<dyn HealthLog>,
    ) -> Self {
        Self {
            catalog,
            locks,
            oplog,
            replication,
            health_log,
            digest: Arc::new(Blake3Digest),
            authorizer: Arc::new(AllowAll),
            fcv: FeatureCompatibilityVersion::V36,
            config: DbCheckConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_digest(mut self, digest: Arc<dyn DigestService>) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_fcv(mut self, fcv: FeatureCompatibilityVersion) -> Self {
        self.fcv = fcv;
        self
    }

    pub fn with_config(mut self, config: DbCheckConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// New client whose operations are interrupted by service shutdown.
    pub fn make_client(&self, name: &str) -> Client {
        Client {
            name: name.to_string(),
            token: self.shutdown.child_token(),
        }
    }

    /// Interrupt every client.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("fcv", &self.fcv)
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Client {
    name: String,
    token: CancellationToken,
}

impl Client {
    /// Client not attached to any service; only `kill` interrupts it.
    pub fn standalone(name: &str) -> Self {
        Self {
            name: name.to_string(),
            token: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interrupt the current and all future operations of this client.
    pub fn kill(&self) {
        self.token.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fresh operation scope; never reused across batches.
    pub fn make_operation_context(&self) -> OperationContext {
        OperationContext {
            token: self.token.child_token(),
        }
    }
}

#[derive(Debug)]
pub struct OperationContext {
    token: CancellationToken,
}

impl OperationContext {
    pub fn check_for_interrupt(&self) -> Result<(), DbCheckError> {
        if self.token.is_cancelled() {
            return Err(DbCheckError::Interrupted);
        }
        Ok(())
    }

    pub fn kill(&self) {
        self.token.cancel();
    }
}

/// Job-wide stop flag. Set once, never cleared.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
