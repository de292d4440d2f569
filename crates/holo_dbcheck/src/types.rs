//! Shared types for the dbCheck engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the planner, the batch executor, the oplog writer and the health log.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DbCheckError;

/// Name of the non-replicated database.
pub const LOCAL_DB: &str = "local";
/// Prefix shared by all system collections.
const SYSTEM_PREFIX: &str = "system.";

/// Fully qualified collection name (`db.collection`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.db == LOCAL_DB
    }

    pub fn is_system(&self) -> bool {
        self.coll.starts_with(SYSTEM_PREFIX)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = DbCheckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(DbCheckError::InvalidNamespace(format!(
                "invalid namespace '{s}', expected <db>.<collection>"
            ))),
        }
    }
}

/// Stable collection identifier, independent of the collection name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionUuid(pub Uuid);

impl CollectionUuid {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CollectionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Document key. Ordering is total across variants: `Min < Int < Str < Max`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocKey {
    Min,
    Int(i64),
    Str(String),
    Max,
}

impl DocKey {
    /// Stable byte encoding fed to the digest. Type tag first so that `Int(1)`
    /// and `Str("1")` never hash alike.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DocKey::Min => vec![0x00],
            DocKey::Int(v) => {
                let mut out = Vec::with_capacity(9);
                out.push(0x10);
                out.extend_from_slice(&v.to_be_bytes());
                out
            }
            DocKey::Str(s) => {
                let mut out = Vec::with_capacity(5 + s.len());
                out.push(0x20);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
                out
            }
            DocKey::Max => vec![0xff],
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocKey::Min => f.write_str("MinKey"),
            DocKey::Int(v) => write!(f, "{v}"),
            DocKey::Str(s) => write!(f, "{s:?}"),
            DocKey::Max => f.write_str("MaxKey"),
        }
    }
}

impl Serialize for DocKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DocKey::Int(v) => serializer.serialize_i64(*v),
            DocKey::Str(s) => serializer.serialize_str(s),
            DocKey::Min => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$minKey", &1)?;
                map.end()
            }
            DocKey::Max => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$maxKey", &1)?;
                map.end()
            }
        }
    }
}

/// Wire shapes accepted for a key.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawKey {
    Int(i64),
    Str(String),
    Min {
        #[serde(rename = "$minKey")]
        _min: i64,
    },
    Max {
        #[serde(rename = "$maxKey")]
        _max: i64,
    },
}

impl<'de> Deserialize<'de> for DocKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawKey::deserialize(deserializer).map_err(|_| {
            de::Error::custom("key must be an integer, a string, {\"$minKey\": 1} or {\"$maxKey\": 1}")
        })?;
        Ok(match raw {
            RawKey::Int(v) => DocKey::Int(v),
            RawKey::Str(s) => DocKey::Str(s),
            RawKey::Min { .. } => DocKey::Min,
            RawKey::Max { .. } => DocKey::Max,
        })
    }
}

/// Position assigned to an entry appended to the replicated log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpTime {
    pub ts: u64,
    pub term: u64,
}

impl Ord for OpTime {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ts, self.term).cmp(&(other.ts, other.term))
    }
}

impl PartialOrd for OpTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One collection to check.
///
/// `start` is exclusive (the previous run's last key is never reprocessed);
/// `end` is inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeSpec {
    pub nss: Namespace,
    pub start: DocKey,
    pub end: DocKey,
    pub max_count: u64,
    pub max_size: u64,
}

impl RangeSpec {
    /// Full key space with unbounded caps.
    pub fn full(nss: Namespace) -> Self {
        Self {
            nss,
            start: DocKey::Min,
            end: DocKey::Max,
            max_count: u64::MAX,
            max_size: u64::MAX,
        }
    }

    /// A range whose start lies beyond its end covers no keys.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// A run of dbCheck consists of a series of collections, checked in order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunPlan {
    specs: Vec<RangeSpec>,
}

impl RunPlan {
    pub fn single(spec: RangeSpec) -> Self {
        Self { specs: vec![spec] }
    }

    pub fn from_specs(specs: Vec<RangeSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[RangeSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl<'a> IntoIterator for &'a RunPlan {
    type Item = &'a RangeSpec;
    type IntoIter = std::slice::Iter<'a, RangeSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.specs.iter()
    }
}

/// Outcome of one batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchResult {
    pub docs: u64,
    pub bytes: u64,
    pub last_key: DocKey,
    pub digest: String,
    pub op_time: OpTime,
}

/// Index descriptor reported with collection metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    /// Key pattern as `(field, direction)` pairs.
    pub key: Vec<(String, i32)>,
    #[serde(default)]
    pub unique: bool,
}

/// Identity snapshot of a collection at check time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadataRecord {
    pub nss: Namespace,
    pub uuid: CollectionUuid,
    /// Collection created immediately before this one, if any.
    pub prev: Option<CollectionUuid>,
    /// Collection created immediately after this one, if any.
    pub next: Option<CollectionUuid>,
    pub indexes: Vec<IndexDescriptor>,
    pub options: serde_json::Value,
}

/// Running sums across the batches of one collection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub docs: u64,
    pub bytes: u64,
    pub batches: u64,
    pub last_key: Option<DocKey>,
}

impl RunTotals {
    pub fn record(&mut self, batch: &BatchResult) {
        self.docs = self.docs.saturating_add(batch.docs);
        self.bytes = self.bytes.saturating_add(batch.bytes);
        self.batches += 1;
        self.last_key = Some(batch.last_key.clone());
    }

    /// Start key for the next batch: the last key reached so far, else the range start.
    pub fn resume_key(&self, spec: &RangeSpec) -> DocKey {
        self.last_key.clone().unwrap_or_else(|| spec.start.clone())
    }

    /// Whether this collection is done: end of range reached or a cap hit.
    pub fn reached_end(&self, spec: &RangeSpec) -> bool {
        let reached_last = self.last_key.as_ref().is_some_and(|key| *key >= spec.end);
        let too_many_docs = self.docs >= spec.max_count;
        let too_many_bytes = self.bytes >= spec.max_size;
        reached_last || too_many_docs || too_many_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_spans_variants() {
        let mut keys = vec![
            DocKey::Max,
            DocKey::Str("a".into()),
            DocKey::Int(7),
            DocKey::Min,
            DocKey::Int(-3),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                DocKey::Min,
                DocKey::Int(-3),
                DocKey::Int(7),
                DocKey::Str("a".into()),
                DocKey::Max
            ]
        );
    }

    #[test]
    fn key_wire_forms() {
        let min: DocKey = serde_json::from_str(r#"{"$minKey": 1}"#).unwrap();
        let max: DocKey = serde_json::from_str(r#"{"$maxKey": 1}"#).unwrap();
        let int: DocKey = serde_json::from_str("42").unwrap();
        let s: DocKey = serde_json::from_str(r#""k1""#).unwrap();
        assert_eq!(min, DocKey::Min);
        assert_eq!(max, DocKey::Max);
        assert_eq!(int, DocKey::Int(42));
        assert_eq!(s, DocKey::Str("k1".into()));
        assert_eq!(serde_json::to_string(&DocKey::Max).unwrap(), r#"{"$maxKey":1}"#);
        assert!(serde_json::from_str::<DocKey>("1.5").is_err());
    }

    #[test]
    fn namespace_classification() {
        let ns: Namespace = "test.system.views".parse().unwrap();
        assert_eq!(ns.db, "test");
        assert_eq!(ns.coll, "system.views");
        assert!(ns.is_system());
        assert!(!ns.is_local());
        assert!(Namespace::new("local", "oplog.rs").is_local());
        assert!("nodot".parse::<Namespace>().is_err());
    }

    #[test]
    fn totals_stop_on_any_limit() {
        let spec = RangeSpec {
            nss: Namespace::new("db", "c"),
            start: DocKey::Min,
            end: DocKey::Int(100),
            max_count: 10,
            max_size: 1_000,
        };
        let mut totals = RunTotals::default();
        assert_eq!(totals.resume_key(&spec), DocKey::Min);
        assert!(!totals.reached_end(&spec));

        totals.record(&BatchResult {
            docs: 5,
            bytes: 50,
            last_key: DocKey::Int(5),
            digest: String::new(),
            op_time: OpTime::default(),
        });
        assert_eq!(totals.resume_key(&spec), DocKey::Int(5));
        assert!(!totals.reached_end(&spec));

        totals.record(&BatchResult {
            docs: 5,
            bytes: 50,
            last_key: DocKey::Int(10),
            digest: String::new(),
            op_time: OpTime::default(),
        });
        assert!(totals.reached_end(&spec));
        assert_eq!(totals.batches, 2);
    }

    #[test]
    fn inverted_range_is_empty() {
        let mut spec = RangeSpec::full(Namespace::new("db", "c"));
        assert!(!spec.is_empty());
        spec.start = DocKey::Int(10);
        spec.end = DocKey::Int(1);
        assert!(spec.is_empty());
    }
}
