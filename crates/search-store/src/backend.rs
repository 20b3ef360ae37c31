use crate::error::Result;
use async_trait::async_trait;
use river_doc_builder::DeletionQuery;
use serde_json::{Map, Value};

/// Fully qualified document address in the search backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    pub index: String,
    pub doc_type: String,
    pub id: String,
}

impl DocumentRef {
    pub fn new(
        index: impl Into<String>,
        doc_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            id: id.into(),
        }
    }
}

/// One operation of a bulk write.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Index {
        target: DocumentRef,
        parent: Option<String>,
        source: Map<String, Value>,
    },
    Delete {
        target: DocumentRef,
    },
}

impl BulkOp {
    #[must_use]
    pub fn target(&self) -> &DocumentRef {
        match self {
            Self::Index { target, .. } | Self::Delete { target } => target,
        }
    }
}

/// One hit of a scrolled search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub target: DocumentRef,
    pub source: Map<String, Value>,
}

/// Cursor over a scrolled search; `next_page` returns an empty page once
/// the scroll is exhausted.
#[async_trait]
pub trait ScrollCursor: Send {
    async fn next_page(&mut self) -> Result<Vec<SearchHit>>;
}

/// Contract of the search backend: a bulk-capable document store with a
/// scrollable search and an automatic per-document ingest-timestamp.
///
/// The river never manages backend schema; it only writes, deletes,
/// refreshes and scrolls.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Execute a bulk write. Any failed operation fails the whole call.
    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<()>;

    /// Make previous writes to `index` visible to searches and reads.
    async fn refresh(&self, index: &str) -> Result<()>;

    async fn get(&self, target: &DocumentRef) -> Result<Option<Map<String, Value>>>;

    async fn put(&self, target: &DocumentRef, source: Map<String, Value>) -> Result<()>;

    /// Delete a single document; returns whether it existed.
    async fn delete(&self, target: &DocumentRef) -> Result<bool>;

    /// Open a scrolled search over `index` for the documents matched by
    /// `query`.
    async fn scroll(
        &self,
        index: &str,
        query: &DeletionQuery,
        page_size: usize,
    ) -> Result<Box<dyn ScrollCursor>>;
}
