//! Primary-side replica consistency check.
//!
//! `dbCheck` walks collections in key order, hashes bounded batches of
//! documents and appends each digest, together with collection metadata, to
//! the replicated log so every secondary can recompute the same ranges and
//! detect divergence.
//!
//! The entry point is [`DbCheckCommand`]: it validates an invocation, builds
//! a [`RunPlan`] and spawns a [`DbCheckJob`] without waiting for it.

pub mod auth;
pub mod batch;
pub mod catalog;
pub mod command;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod health_log;
pub mod job;
pub mod lock;
pub mod log_writer;
pub mod metadata;
pub mod oplog;
pub mod plan;
pub mod replication;
pub mod types;

pub use auth::{AllowAll, Authorizer, DatabaseAuthorizer, UserContext};
pub use catalog::{Catalog, CatalogFixture, Collection, MemoryCatalog};
pub use command::{CommandReply, DbCheckCommand};
pub use config::DbCheckConfig;
pub use context::{AbortFlag, FeatureCompatibilityVersion, ServiceContext};
pub use digest::{Blake3Digest, DigestService};
pub use error::{DbCheckError, ErrorCode};
pub use health_log::{HealthLog, HealthLogEntry, MemoryHealthLog, TracingHealthLog};
pub use job::{CollectionOutcome, DbCheckJob, JobHandle, JobReport};
pub use lock::{LockManager, LockMode};
pub use oplog::{DbCheckOplogEntry, FileOpLog, MemoryOpLog, OpLog, OplogEntry};
pub use replication::{ReplicaSetMember, ReplicationCoordinator};
pub use types::{DocKey, Namespace, RangeSpec, RunPlan};
