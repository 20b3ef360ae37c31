#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use river_doc_builder::{BuilderConfig, DocumentBuilder};
use river_indexer::{ActivityLog, IndexingContext};
use river_search_store::{MemoryBackend, WatermarkStore};
use river_upstream::{ChangedIssuesPage, IssueSource, Result as UpstreamResult, UpstreamError};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const RIVER_NAME: &str = "river_test";
pub const RIVER_INDEX: &str = "river_test";
pub const STATE_INDEX: &str = "_river_test_state";
pub const DATETIME_TYPE: &str = "datetime_value";
pub const AUDIT_INDEX: &str = "river_audit";
pub const AUDIT_TYPE: &str = "jira_river_indexupdate";

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub project: String,
    pub start_at: u64,
    pub updated_after: Option<DateTime<Utc>>,
    pub at: Instant,
}

/// Scripted stand-in for the upstream tracker: per-project page queues,
/// per-project artificial latency, and enough bookkeeping to assert call
/// windows and concurrency from tests.
#[derive(Default)]
pub struct ScriptedSource {
    projects: Mutex<Vec<String>>,
    fail_listing: AtomicBool,
    listing_calls: AtomicUsize,
    pages: Mutex<HashMap<String, VecDeque<ChangedIssuesPage>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
    active_per_project: Mutex<HashMap<String, usize>>,
    project_overlap: AtomicBool,
    active_global: AtomicUsize,
    max_active_global: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(projects: &[&str]) -> Arc<Self> {
        let source = Self::default();
        *source.projects.lock().unwrap() = projects.iter().map(ToString::to_string).collect();
        Arc::new(source)
    }

    pub fn set_projects(&self, projects: &[&str]) {
        *self.projects.lock().unwrap() = projects.iter().map(ToString::to_string).collect();
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn push_page(&self, project: &str, page: ChangedIssuesPage) {
        self.pages
            .lock()
            .unwrap()
            .entry(project.to_string())
            .or_default()
            .push_back(page);
    }

    pub fn set_delay(&self, project: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(project.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, project: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.project == project)
            .collect()
    }

    /// Whether two runs of the same project ever pulled concurrently.
    pub fn project_overlap_detected(&self) -> bool {
        self.project_overlap.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent pulls observed across all projects.
    pub fn max_concurrent_pulls(&self) -> usize {
        self.max_active_global.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IssueSource for ScriptedSource {
    async fn list_project_keys(&self) -> UpstreamResult<Vec<String>> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transient("scripted listing failure".to_string()));
        }
        Ok(self.projects.lock().unwrap().clone())
    }

    async fn changed_issues(
        &self,
        project_key: &str,
        start_at: u64,
        updated_after: Option<DateTime<Utc>>,
        _max_results: Option<u64>,
    ) -> UpstreamResult<ChangedIssuesPage> {
        {
            let mut active = self.active_per_project.lock().unwrap();
            let slot = active.entry(project_key.to_string()).or_insert(0);
            *slot += 1;
            if *slot > 1 {
                self.project_overlap.store(true, Ordering::SeqCst);
            }
        }
        let global = self.active_global.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_global.fetch_max(global, Ordering::SeqCst);
        self.calls.lock().unwrap().push(RecordedCall {
            project: project_key.to_string(),
            start_at,
            updated_after,
            at: Instant::now(),
        });

        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(project_key)
            .copied()
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let page = self
            .pages
            .lock()
            .unwrap()
            .get_mut(project_key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        self.active_global.fetch_sub(1, Ordering::SeqCst);
        if let Some(slot) = self
            .active_per_project
            .lock()
            .unwrap()
            .get_mut(project_key)
        {
            *slot -= 1;
        }
        Ok(page)
    }
}

pub fn issue(key: &str, updated: &str) -> Value {
    json!({
        "key": key,
        "self": format!("https://issues.example.org/rest/api/2/issue/{key}"),
        "fields": {
            "updated": updated,
            "project": {"key": key.split('-').next().unwrap_or(key)},
            "summary": format!("Issue {key}"),
            "status": {"name": "Open"}
        }
    })
}

pub fn page(total: u64, start_at: u64, issues: Vec<Value>) -> ChangedIssuesPage {
    ChangedIssuesPage {
        total,
        start_at,
        issues,
    }
}

pub fn utc(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, second)
        .single()
        .expect("valid timestamp")
}

pub fn watermark_store(backend: Arc<MemoryBackend>) -> WatermarkStore {
    WatermarkStore::new(backend, STATE_INDEX, DATETIME_TYPE)
}

pub fn indexing_context(
    source: Arc<ScriptedSource>,
    backend: Arc<MemoryBackend>,
    document_settings: Value,
    with_activity: bool,
) -> Arc<IndexingContext> {
    let config = BuilderConfig::from_settings(&document_settings).expect("document settings");
    let builder = DocumentBuilder::new(
        RIVER_NAME,
        "https://issues.example.org",
        "jira_issue",
        config,
        Vec::new(),
    )
    .expect("builder");
    let activity = with_activity
        .then(|| ActivityLog::new(backend.clone(), AUDIT_INDEX, AUDIT_TYPE));
    Arc::new(IndexingContext {
        source,
        backend: backend.clone(),
        builder: Arc::new(builder),
        watermarks: watermark_store(backend),
        activity,
        index_name: RIVER_INDEX.to_string(),
        max_issues_per_request: 50,
    })
}

pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
