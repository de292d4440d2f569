//! Range digesting.
//!
//! `DigestService` is the capability the batch executor depends on: scan a
//! bounded key range in order and return a cumulative digest plus progress.
//! `Blake3Digest` is the default implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::{Collection, Document};
use crate::context::OperationContext;
use crate::error::DbCheckError;
use crate::types::DocKey;

/// Documents hashed between cooperative yields to the runtime.
const YIELD_EVERY_DOCS: u64 = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestRequest {
    /// Exclusive lower bound.
    pub start: DocKey,
    /// Inclusive upper bound.
    pub end: DocKey,
    pub max_docs: u64,
    pub max_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestOutcome {
    /// Hex-encoded digest over every hashed document.
    pub digest: String,
    pub docs: u64,
    pub bytes: u64,
    /// Last key hashed, or `end` when the range was exhausted.
    pub last_key: DocKey,
}

#[async_trait]
pub trait DigestService: Send + Sync + 'static {
    async fn hash_range(
        &self,
        op: &OperationContext,
        collection: &Arc<Collection>,
        request: &DigestRequest,
    ) -> Result<DigestOutcome, DbCheckError>;
}

/// Incremental hasher for one batch.
///
/// At least one document is always hashed; after that a document is hashed
/// only if it keeps both counters within their caps.
pub struct RangeHasher {
    hasher: blake3::Hasher,
    request: DigestRequest,
    docs: u64,
    bytes: u64,
    last: DocKey,
}

impl RangeHasher {
    pub fn new(request: DigestRequest) -> Self {
        let last = request.start.clone();
        Self {
            hasher: blake3::Hasher::new(),
            request,
            docs: 0,
            bytes: 0,
            last,
        }
    }

    pub fn can_hash(&self, doc: &Document) -> bool {
        if self.docs == 0 {
            return true;
        }
        if self.bytes.saturating_add(doc.size()) > self.request.max_bytes {
            return false;
        }
        self.docs < self.request.max_docs
    }

    pub fn hash(&mut self, doc: &Document) {
        let key = doc.key.encode();
        self.hasher.update(&(key.len() as u32).to_be_bytes());
        self.hasher.update(&key);
        self.hasher.update(&(doc.body.len() as u32).to_be_bytes());
        self.hasher.update(&doc.body);
        self.docs += 1;
        self.bytes = self.bytes.saturating_add(doc.size());
        self.last = doc.key.clone();
    }

    /// Mark the range as exhausted.
    pub fn reached_end(&mut self) {
        self.last = self.request.end.clone();
    }

    pub fn finish(self) -> DigestOutcome {
        DigestOutcome {
            digest: self.hasher.finalize().to_hex().to_string(),
            docs: self.docs,
            bytes: self.bytes,
            last_key: self.last,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Blake3Digest;

#[async_trait]
impl DigestService for Blake3Digest {
    async fn hash_range(
        &self,
        op: &OperationContext,
        collection: &Arc<Collection>,
        request: &DigestRequest,
    ) -> Result<DigestOutcome, DbCheckError> {
        let mut hasher = RangeHasher::new(request.clone());
        let mut cursor = collection.cursor(request.start.clone(), request.end.clone());
        loop {
            op.check_for_interrupt()?;
            let Some(doc) = cursor.next_doc()? else {
                hasher.reached_end();
                break;
            };
            if !hasher.can_hash(&doc) {
                break;
            }
            hasher.hash(&doc);
            if hasher.docs % YIELD_EVERY_DOCS == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::types::Namespace;
    use serde_json::json;

    fn collection(n: i64, body_len: usize) -> Arc<Collection> {
        let catalog = MemoryCatalog::new();
        let coll = catalog
            .create_collection(&Namespace::new("db", "c"), json!({}), Vec::new())
            .unwrap();
        for i in 1..=n {
            coll.insert(DocKey::Int(i), vec![b'x'; body_len]).unwrap();
        }
        coll
    }

    fn op() -> OperationContext {
        crate::context::Client::standalone("digest-test").make_operation_context()
    }

    fn request(max_docs: u64, max_bytes: u64) -> DigestRequest {
        DigestRequest {
            start: DocKey::Min,
            end: DocKey::Max,
            max_docs,
            max_bytes,
        }
    }

    #[tokio::test]
    async fn exhausted_range_reports_end_key() {
        let coll = collection(10, 8);
        let out = Blake3Digest
            .hash_range(&op(), &coll, &request(5_000, u64::MAX))
            .await
            .unwrap();
        assert_eq!(out.docs, 10);
        assert_eq!(out.bytes, 80);
        assert_eq!(out.last_key, DocKey::Max);
    }

    #[tokio::test]
    async fn doc_cap_stops_before_the_extra_document() {
        let coll = collection(10, 8);
        let out = Blake3Digest
            .hash_range(&op(), &coll, &request(4, u64::MAX))
            .await
            .unwrap();
        assert_eq!(out.docs, 4);
        assert_eq!(out.last_key, DocKey::Int(4));
    }

    #[tokio::test]
    async fn byte_cap_still_hashes_one_document() {
        let coll = collection(3, 100);
        let out = Blake3Digest
            .hash_range(&op(), &coll, &request(5_000, 10))
            .await
            .unwrap();
        assert_eq!(out.docs, 1);
        assert_eq!(out.bytes, 100);
        assert_eq!(out.last_key, DocKey::Int(1));
    }

    #[tokio::test]
    async fn resumed_ranges_cover_the_same_documents() {
        let coll = collection(9, 8);
        let whole = Blake3Digest
            .hash_range(&op(), &coll, &request(5_000, u64::MAX))
            .await
            .unwrap();
        let first = Blake3Digest
            .hash_range(&op(), &coll, &request(5, u64::MAX))
            .await
            .unwrap();
        let second = Blake3Digest
            .hash_range(
                &op(),
                &coll,
                &DigestRequest {
                    start: first.last_key.clone(),
                    end: DocKey::Max,
                    max_docs: 5_000,
                    max_bytes: u64::MAX,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.docs + second.docs, whole.docs);
        assert_eq!(second.last_key, DocKey::Max);
        assert_ne!(first.digest, second.digest);
    }

    #[tokio::test]
    async fn digest_changes_with_content() {
        let a = collection(3, 8);
        let b = collection(3, 8);
        b.insert(DocKey::Int(2), b"changed!".to_vec()).unwrap();
        let req = request(5_000, u64::MAX);
        let da = Blake3Digest.hash_range(&op(), &a, &req).await.unwrap();
        let db = Blake3Digest.hash_range(&op(), &b, &req).await.unwrap();
        assert_eq!(da.docs, db.docs);
        assert_ne!(da.digest, db.digest);
    }

    #[tokio::test]
    async fn interrupted_scan_fails() {
        let coll = collection(3, 8);
        let op = op();
        op.kill();
        let err = Blake3Digest
            .hash_range(&op, &coll, &request(5_000, u64::MAX))
            .await
            .unwrap_err();
        assert_eq!(err, DbCheckError::Interrupted);
    }
}
