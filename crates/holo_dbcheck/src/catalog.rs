//! Collection catalog and key-ordered document storage.
//!
//! `Catalog` is the read-only view dbCheck needs from the storage layer.
//! `MemoryCatalog` is the in-process implementation used by the CLI and the
//! tests; collections keep their documents in a `BTreeMap` so range scans come
//! out in key order.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::DbCheckError;
use crate::types::{CollectionUuid, DocKey, IndexDescriptor, Namespace};

/// One stored document: its key and raw body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub key: DocKey,
    pub body: Vec<u8>,
}

impl Document {
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

pub struct Collection {
    nss: Namespace,
    uuid: CollectionUuid,
    options: serde_json::Value,
    indexes: Vec<IndexDescriptor>,
    docs: RwLock<BTreeMap<DocKey, Vec<u8>>>,
}

impl Collection {
    pub fn new(
        nss: Namespace,
        uuid: CollectionUuid,
        options: serde_json::Value,
        mut indexes: Vec<IndexDescriptor>,
    ) -> Self {
        if !indexes.iter().any(|idx| idx.name == "_id_") {
            indexes.insert(
                0,
                IndexDescriptor {
                    name: "_id_".to_string(),
                    key: vec![("_id".to_string(), 1)],
                    unique: true,
                },
            );
        }
        Self {
            nss,
            uuid,
            options,
            indexes,
            docs: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn nss(&self) -> &Namespace {
        &self.nss
    }

    pub fn uuid(&self) -> CollectionUuid {
        self.uuid
    }

    pub fn options(&self) -> &serde_json::Value {
        &self.options
    }

    pub fn indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    /// Insert or replace a document. `Min`/`Max` are reserved bounds.
    pub fn insert(&self, key: DocKey, body: Vec<u8>) -> Result<(), DbCheckError> {
        if matches!(key, DocKey::Min | DocKey::Max) {
            return Err(DbCheckError::BadValue(format!(
                "{key} is not a valid document key in {}",
                self.nss
            )));
        }
        let mut docs = self
            .docs
            .write()
            .map_err(|_| DbCheckError::Storage(format!("document store poisoned for {}", self.nss)))?;
        docs.insert(key, body);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursor over keys in `(after, end]`, ascending.
    pub fn cursor(self: &Arc<Self>, after: DocKey, end: DocKey) -> RangeCursor {
        RangeCursor {
            collection: Arc::clone(self),
            position: after,
            end,
        }
    }

    /// First document strictly after `after` and at or before `end`.
    fn seek_after(&self, after: &DocKey, end: &DocKey) -> Result<Option<Document>, DbCheckError> {
        if after >= end {
            return Ok(None);
        }
        let docs = self
            .docs
            .read()
            .map_err(|_| DbCheckError::Storage(format!("document store poisoned for {}", self.nss)))?;
        let next = docs
            .range((Bound::Excluded(after), Bound::Included(end)))
            .next()
            .map(|(key, body)| Document {
                key: key.clone(),
                body: body.clone(),
            });
        Ok(next)
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("nss", &self.nss)
            .field("uuid", &self.uuid)
            .finish()
    }
}

/// Forward cursor that re-seeks on every step, so no storage lock is held
/// between documents.
pub struct RangeCursor {
    collection: Arc<Collection>,
    position: DocKey,
    end: DocKey,
}

impl RangeCursor {
    pub fn next_doc(&mut self) -> Result<Option<Document>, DbCheckError> {
        let next = self.collection.seek_after(&self.position, &self.end)?;
        if let Some(doc) = &next {
            self.position = doc.key.clone();
        }
        Ok(next)
    }
}

/// Read-only catalog view used by dbCheck.
pub trait Catalog: Send + Sync + 'static {
    fn database_exists(&self, db: &str) -> bool;
    /// Collections of `db` in creation order, or `None` if the database is absent.
    fn list_collections(&self, db: &str) -> Option<Vec<Arc<Collection>>>;
    fn lookup(&self, nss: &Namespace) -> Option<Arc<Collection>>;
    fn lookup_by_uuid(&self, db: &str, uuid: CollectionUuid) -> Option<Arc<Collection>>;

    /// Collection created immediately before `uuid` in `db`.
    fn prev(&self, db: &str, uuid: CollectionUuid) -> Option<CollectionUuid> {
        let colls = self.list_collections(db)?;
        let pos = colls.iter().position(|c| c.uuid() == uuid)?;
        pos.checked_sub(1).map(|idx| colls[idx].uuid())
    }

    /// Collection created immediately after `uuid` in `db`.
    fn next(&self, db: &str, uuid: CollectionUuid) -> Option<CollectionUuid> {
        let colls = self.list_collections(db)?;
        let pos = colls.iter().position(|c| c.uuid() == uuid)?;
        colls.get(pos + 1).map(|c| c.uuid())
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    databases: RwLock<BTreeMap<String, Vec<Arc<Collection>>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_database(&self, db: &str) {
        let mut dbs = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        dbs.entry(db.to_string()).or_default();
    }

    /// Create a collection (and its database) with a fresh UUID.
    pub fn create_collection(
        &self,
        nss: &Namespace,
        options: serde_json::Value,
        indexes: Vec<IndexDescriptor>,
    ) -> Result<Arc<Collection>, DbCheckError> {
        let mut dbs = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        let colls = dbs.entry(nss.db.clone()).or_default();
        if colls.iter().any(|c| c.nss() == nss) {
            return Err(DbCheckError::BadValue(format!("collection {nss} already exists")));
        }
        let coll = Arc::new(Collection::new(
            nss.clone(),
            CollectionUuid::random(),
            options,
            indexes,
        ));
        colls.push(Arc::clone(&coll));
        Ok(coll)
    }

    pub fn drop_collection(&self, nss: &Namespace) -> bool {
        let mut dbs = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        let Some(colls) = dbs.get_mut(&nss.db) else {
            return false;
        };
        let before = colls.len();
        colls.retain(|c| c.nss() != nss);
        colls.len() != before
    }

    pub fn drop_database(&self, db: &str) -> bool {
        let mut dbs = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        dbs.remove(db).is_some()
    }

    /// Build a catalog from a fixture description.
    pub fn from_fixture(fixture: &CatalogFixture) -> Result<Self, DbCheckError> {
        let catalog = Self::new();
        for (db, colls) in &fixture.databases {
            catalog.create_database(db);
            for coll in colls {
                let nss = Namespace::new(db.clone(), coll.name.clone());
                let handle =
                    catalog.create_collection(&nss, coll.options.clone(), coll.indexes.clone())?;
                for doc in &coll.documents {
                    let body = serde_json::to_vec(&doc.body)?;
                    handle.insert(doc.id.clone(), body)?;
                }
            }
        }
        Ok(catalog)
    }
}

impl Catalog for MemoryCatalog {
    fn database_exists(&self, db: &str) -> bool {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(db)
    }

    fn list_collections(&self, db: &str) -> Option<Vec<Arc<Collection>>> {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(db)
            .cloned()
    }

    fn lookup(&self, nss: &Namespace) -> Option<Arc<Collection>> {
        let dbs = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        dbs.get(&nss.db)?.iter().find(|c| c.nss() == nss).cloned()
    }

    fn lookup_by_uuid(&self, db: &str, uuid: CollectionUuid) -> Option<Arc<Collection>> {
        let dbs = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        dbs.get(db)?.iter().find(|c| c.uuid() == uuid).cloned()
    }
}

/// JSON fixture: databases mapped to collections in creation order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogFixture {
    pub databases: BTreeMap<String, Vec<CollectionFixture>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionFixture {
    pub name: String,
    #[serde(default = "empty_options")]
    pub options: serde_json::Value,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
    #[serde(default)]
    pub documents: Vec<DocumentFixture>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentFixture {
    #[serde(rename = "_id")]
    pub id: DocKey,
    #[serde(default)]
    pub body: serde_json::Value,
}

fn empty_options() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
