use crate::backend::{BulkOp, DocumentRef, ScrollCursor, SearchBackend, SearchHit};
use crate::error::{Result, SearchStoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use river_doc_builder::DeletionQuery;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// A stored document together with its backend-side metadata.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub source: Map<String, Value>,
    pub parent: Option<String>,
    /// Automatic ingest-timestamp, assigned on every write. The full-run
    /// delete pass keys off this field.
    pub ingested_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    // index name -> (doc_type, id) -> document
    indices: HashMap<String, HashMap<(String, String), StoredDocument>>,
}

/// In-memory reference implementation of [`SearchBackend`].
///
/// Keeps the contract honest for tests: bulk writes are all-or-nothing,
/// every write stamps an ingest time, and scrolls snapshot their matches
/// when opened.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    refreshes: AtomicUsize,
    fail_next_bulk: AtomicBool,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refresh calls observed, across all indices.
    #[must_use]
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Make the next bulk call fail, for error-path tests.
    pub fn fail_next_bulk(&self) {
        self.fail_next_bulk.store(true, Ordering::Relaxed);
    }

    /// Read one document with its metadata.
    pub fn document(&self, target: &DocumentRef) -> Option<StoredDocument> {
        let state = self.state.lock().ok()?;
        state
            .indices
            .get(&target.index)?
            .get(&(target.doc_type.clone(), target.id.clone()))
            .cloned()
    }

    /// Sorted ids of all documents of one type in one index.
    pub fn document_ids(&self, index: &str, doc_type: &str) -> Vec<String> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = state
            .indices
            .get(index)
            .map(|docs| {
                docs.keys()
                    .filter(|(stored_type, _)| stored_type == doc_type)
                    .map(|(_, id)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Seed a document with an explicit ingest time, bypassing the clock.
    pub fn put_with_ingest(
        &self,
        target: &DocumentRef,
        source: Map<String, Value>,
        parent: Option<String>,
        ingested_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock_state()?;
        state.indices.entry(target.index.clone()).or_default().insert(
            (target.doc_type.clone(), target.id.clone()),
            StoredDocument {
                source,
                parent,
                ingested_at,
            },
        );
        Ok(())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| SearchStoreError::Backend("memory state lock poisoned".to_string()))
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<()> {
        if self.fail_next_bulk.swap(false, Ordering::Relaxed) {
            return Err(SearchStoreError::Bulk("injected bulk failure".to_string()));
        }
        let now = Utc::now();
        let mut state = self.lock_state()?;
        for op in ops {
            match op {
                BulkOp::Index {
                    target,
                    parent,
                    source,
                } => {
                    state.indices.entry(target.index).or_default().insert(
                        (target.doc_type, target.id),
                        StoredDocument {
                            source,
                            parent,
                            ingested_at: now,
                        },
                    );
                }
                BulkOp::Delete { target } => {
                    if let Some(docs) = state.indices.get_mut(&target.index) {
                        docs.remove(&(target.doc_type, target.id));
                    }
                }
            }
        }
        Ok(())
    }

    async fn refresh(&self, _index: &str) -> Result<()> {
        // Writes are immediately visible in memory; only the call is
        // recorded so tests can assert the refresh-before-read contract.
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, target: &DocumentRef) -> Result<Option<Map<String, Value>>> {
        let state = self.lock_state()?;
        Ok(state
            .indices
            .get(&target.index)
            .and_then(|docs| docs.get(&(target.doc_type.clone(), target.id.clone())))
            .map(|doc| doc.source.clone()))
    }

    async fn put(&self, target: &DocumentRef, source: Map<String, Value>) -> Result<()> {
        let mut state = self.lock_state()?;
        state.indices.entry(target.index.clone()).or_default().insert(
            (target.doc_type.clone(), target.id.clone()),
            StoredDocument {
                source,
                parent: None,
                ingested_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, target: &DocumentRef) -> Result<bool> {
        let mut state = self.lock_state()?;
        Ok(state
            .indices
            .get_mut(&target.index)
            .and_then(|docs| docs.remove(&(target.doc_type.clone(), target.id.clone())))
            .is_some())
    }

    async fn scroll(
        &self,
        index: &str,
        query: &DeletionQuery,
        page_size: usize,
    ) -> Result<Box<dyn ScrollCursor>> {
        let state = self.lock_state()?;
        let mut hits: Vec<SearchHit> = state
            .indices
            .get(index)
            .map(|docs| {
                docs.iter()
                    .filter(|((doc_type, _), doc)| {
                        query.doc_types.iter().any(|t| t == doc_type)
                            && doc
                                .source
                                .get(&query.project_key_field)
                                .and_then(Value::as_str)
                                == Some(query.project_key.as_str())
                            && doc.ingested_at < query.ingested_before
                    })
                    .map(|((doc_type, id), doc)| SearchHit {
                        target: DocumentRef::new(index, doc_type.clone(), id.clone()),
                        source: doc.source.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| a.target.id.cmp(&b.target.id));

        let page_size = page_size.max(1);
        let mut pages = VecDeque::new();
        while !hits.is_empty() {
            let rest = hits.split_off(page_size.min(hits.len()));
            pages.push_back(std::mem::replace(&mut hits, rest));
        }
        Ok(Box::new(MemoryScroll { pages }))
    }
}

struct MemoryScroll {
    pages: VecDeque<Vec<SearchHit>>,
}

#[async_trait]
impl ScrollCursor for MemoryScroll {
    async fn next_page(&mut self) -> Result<Vec<SearchHit>> {
        Ok(self.pages.pop_front().unwrap_or_default())
    }
}
