//! Invocation parsing and run planning.
//!
//! A `{dbCheck: "<name or uuid>", ...}` command checks one collection; any
//! other `dbCheck` value checks every eligible collection of the database.

use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::ServiceContext;
use crate::error::DbCheckError;
use crate::lock::LockMode;
use crate::types::{CollectionUuid, DocKey, Namespace, RangeSpec, RunPlan, LOCAL_DB};

/// Field holding the command target.
pub const COMMAND_NAME: &str = "dbCheck";

/// System collections that are replicated and may be checked.
const REPLICATED_SYSTEM_COLLECTIONS: [&str; 7] = [
    "system.backup_users",
    "system.js",
    "system.new_users",
    "system.roles",
    "system.users",
    "system.version",
    "system.views",
];

/// Arguments every command accepts; never part of the invocation itself.
const GENERIC_ARGUMENTS: [&str; 9] = [
    "$db",
    "lsid",
    "txnNumber",
    "maxTimeMS",
    "comment",
    "$readPreference",
    "$clusterTime",
    "writeConcern",
    "readConcern",
];

/// Whether `nss` is replicated and therefore checkable.
pub fn can_run_on(nss: &Namespace) -> bool {
    if nss.is_local() {
        return false;
    }
    if nss.is_system() {
        return REPLICATED_SYSTEM_COLLECTIONS.contains(&nss.coll.as_str());
    }
    true
}

pub fn strip_generic_arguments(cmd: &Map<String, Value>) -> Map<String, Value> {
    cmd.iter()
        .filter(|(name, _)| !GENERIC_ARGUMENTS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectionTarget {
    Name(String),
    Uuid(CollectionUuid),
}

impl CollectionTarget {
    fn parse(raw: &str) -> Self {
        match Uuid::parse_str(raw) {
            Ok(uuid) => CollectionTarget::Uuid(CollectionUuid(uuid)),
            Err(_) => CollectionTarget::Name(raw.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SingleInvocation {
    pub target: CollectionTarget,
    pub min_key: DocKey,
    pub max_key: DocKey,
    pub max_count: u64,
    pub max_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Invocation {
    Collection(SingleInvocation),
    Database,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleFields {
    db_check: String,
    #[serde(default = "min_key")]
    min_key: DocKey,
    #[serde(default = "max_key")]
    max_key: DocKey,
    #[serde(default)]
    max_count: Option<u64>,
    #[serde(default)]
    max_size: Option<u64>,
}

fn min_key() -> DocKey {
    DocKey::Min
}

fn max_key() -> DocKey {
    DocKey::Max
}

impl Invocation {
    pub fn parse(cmd: &Value) -> Result<Self, DbCheckError> {
        let Some(obj) = cmd.as_object() else {
            return Err(DbCheckError::BadValue("command must be an object".to_string()));
        };
        let obj = strip_generic_arguments(obj);
        match obj.get(COMMAND_NAME) {
            None => Err(DbCheckError::BadValue(format!(
                "missing required field '{COMMAND_NAME}'"
            ))),
            Some(Value::String(_)) => {
                let fields: SingleFields = serde_json::from_value(Value::Object(obj))?;
                Ok(Invocation::Collection(SingleInvocation {
                    target: CollectionTarget::parse(&fields.db_check),
                    min_key: fields.min_key,
                    max_key: fields.max_key,
                    max_count: fields.max_count.unwrap_or(u64::MAX),
                    max_size: fields.max_size.unwrap_or(u64::MAX),
                }))
            }
            Some(_) => Ok(Invocation::Database),
        }
    }

    /// Namespace the caller must be allowed to read.
    pub fn auth_namespace(&self, service: &ServiceContext, db: &str) -> Namespace {
        match self {
            Invocation::Database => Namespace::new(db, "$cmd"),
            Invocation::Collection(single) => match &single.target {
                CollectionTarget::Name(name) => Namespace::new(db, name.clone()),
                CollectionTarget::Uuid(uuid) => service
                    .catalog
                    .lookup_by_uuid(db, *uuid)
                    .map(|coll| coll.nss().clone())
                    .unwrap_or_else(|| Namespace::new(db, uuid.to_string())),
            },
        }
    }
}

pub async fn build_run_plan(
    service: &ServiceContext,
    db: &str,
    invocation: &Invocation,
) -> Result<RunPlan, DbCheckError> {
    match invocation {
        Invocation::Collection(single) => single_collection_run(service, db, single).await,
        Invocation::Database => full_database_run(service, db).await,
    }
}

pub async fn single_collection_run(
    service: &ServiceContext,
    db: &str,
    invocation: &SingleInvocation,
) -> Result<RunPlan, DbCheckError> {
    let _db = service.locks.lock_database(db, LockMode::IntentShared).await;
    let collection = match &invocation.target {
        CollectionTarget::Name(name) => service.catalog.lookup(&Namespace::new(db, name.clone())),
        CollectionTarget::Uuid(uuid) => service.catalog.lookup_by_uuid(db, *uuid),
    };
    let Some(collection) = collection else {
        let shown = match &invocation.target {
            CollectionTarget::Name(name) => name.clone(),
            CollectionTarget::Uuid(uuid) => uuid.to_string(),
        };
        return Err(DbCheckError::NamespaceNotFound(format!(
            "Collection {shown} not found"
        )));
    };

    let nss = collection.nss().clone();
    if !can_run_on(&nss) {
        return Err(DbCheckError::NotReplicated(nss.to_string()));
    }
    Ok(RunPlan::single(RangeSpec {
        nss,
        start: invocation.min_key.clone(),
        end: invocation.max_key.clone(),
        max_count: invocation.max_count,
        max_size: invocation.max_size,
    }))
}

pub async fn full_database_run(service: &ServiceContext, db: &str) -> Result<RunPlan, DbCheckError> {
    if db == LOCAL_DB {
        return Err(DbCheckError::InvalidNamespace(
            "Cannot run dbCheck on local database".to_string(),
        ));
    }

    let _db = service.locks.lock_database(db, LockMode::Shared).await;
    let Some(collections) = service.catalog.list_collections(db) else {
        return Err(DbCheckError::NamespaceNotFound(format!("Database {db} not found")));
    };

    let mut specs = Vec::with_capacity(collections.len());
    for collection in collections {
        let nss = collection.nss();
        if !can_run_on(nss) {
            tracing::debug!(namespace = %nss, "skipping collection that is not replicated");
            continue;
        }
        specs.push(RangeSpec::full(nss.clone()));
    }
    Ok(RunPlan::from_specs(specs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::harness;
    use serde_json::json;

    #[test]
    fn eligibility() {
        assert!(can_run_on(&Namespace::new("db", "orders")));
        assert!(can_run_on(&Namespace::new("db", "system.views")));
        assert!(can_run_on(&Namespace::new("admin", "system.users")));
        assert!(!can_run_on(&Namespace::new("db", "system.profile")));
        assert!(!can_run_on(&Namespace::new("local", "oplog.rs")));
        assert!(!can_run_on(&Namespace::new("local", "users")));
    }

    #[test]
    fn parse_single_collection_form() {
        let cmd = json!({
            "dbCheck": "orders",
            "minKey": 10,
            "maxKey": {"$maxKey": 1},
            "maxCount": 100,
            "lsid": {"id": "x"},
            "$db": "shop",
            "maxCountPerSecond": 50
        });
        let Invocation::Collection(single) = Invocation::parse(&cmd).unwrap() else {
            panic!("expected the single-collection form");
        };
        assert_eq!(single.target, CollectionTarget::Name("orders".into()));
        assert_eq!(single.min_key, DocKey::Int(10));
        assert_eq!(single.max_key, DocKey::Max);
        assert_eq!(single.max_count, 100);
        assert_eq!(single.max_size, u64::MAX);
    }

    #[test]
    fn parse_uuid_target_and_database_form() {
        let uuid = CollectionUuid::random();
        let cmd = json!({"dbCheck": uuid.to_string()});
        let Invocation::Collection(single) = Invocation::parse(&cmd).unwrap() else {
            panic!("expected the single-collection form");
        };
        assert_eq!(single.target, CollectionTarget::Uuid(uuid));
        assert_eq!(single.min_key, DocKey::Min);

        assert_eq!(Invocation::parse(&json!({"dbCheck": 1})).unwrap(), Invocation::Database);
    }

    #[test]
    fn malformed_commands_are_bad_values() {
        for cmd in [
            json!([1, 2]),
            json!({"comment": "no target"}),
            json!({"dbCheck": "c", "maxCount": -1}),
            json!({"dbCheck": "c", "minKey": 1.5}),
        ] {
            let err = Invocation::parse(&cmd).unwrap_err();
            assert!(matches!(err, DbCheckError::BadValue(_)), "{cmd}: {err:?}");
        }
    }

    #[tokio::test]
    async fn single_collection_checks() {
        let h = harness();
        h.catalog
            .create_collection(&Namespace::new("db", "system.profile"), json!({}), Vec::new())
            .unwrap();
        let orders = h
            .catalog
            .create_collection(&Namespace::new("db", "orders"), json!({}), Vec::new())
            .unwrap();

        let missing = SingleInvocation {
            target: CollectionTarget::Name("nope".into()),
            min_key: DocKey::Min,
            max_key: DocKey::Max,
            max_count: u64::MAX,
            max_size: u64::MAX,
        };
        let err = single_collection_run(&h.service, "db", &missing).await.unwrap_err();
        assert_eq!(err, DbCheckError::NamespaceNotFound("Collection nope not found".into()));

        let profile = SingleInvocation {
            target: CollectionTarget::Name("system.profile".into()),
            ..missing.clone()
        };
        let err = single_collection_run(&h.service, "db", &profile).await.unwrap_err();
        assert_eq!(err.code() as i32, 40616);

        let by_uuid = SingleInvocation {
            target: CollectionTarget::Uuid(orders.uuid()),
            min_key: DocKey::Int(5),
            max_key: DocKey::Int(1),
            max_count: 3,
            max_size: 4,
        };
        let plan = single_collection_run(&h.service, "db", &by_uuid).await.unwrap();
        assert_eq!(plan.len(), 1);
        let spec = &plan.specs()[0];
        assert_eq!(spec.nss, Namespace::new("db", "orders"));
        assert!(spec.is_empty());
        assert_eq!((spec.max_count, spec.max_size), (3, 4));
    }

    #[tokio::test]
    async fn database_run_keeps_creation_order_and_skips_ineligible() {
        let h = harness();
        for name in ["b", "system.profile", "a", "system.views"] {
            h.catalog
                .create_collection(&Namespace::new("db", name), json!({}), Vec::new())
                .unwrap();
        }
        let plan = full_database_run(&h.service, "db").await.unwrap();
        let names: Vec<_> = plan.specs().iter().map(|s| s.nss.coll.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "system.views"]);
        assert!(plan
            .specs()
            .iter()
            .all(|s| s.start == DocKey::Min && s.end == DocKey::Max && s.max_count == u64::MAX));

        let err = full_database_run(&h.service, "local").await.unwrap_err();
        assert_eq!(err.code() as i32, 73);
        let err = full_database_run(&h.service, "missing").await.unwrap_err();
        assert_eq!(err, DbCheckError::NamespaceNotFound("Database missing not found".into()));
    }
}
