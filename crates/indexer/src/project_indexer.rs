use crate::activity::ActivityLog;
use crate::error::{Result, RiverError};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use river_doc_builder::{issue_updated, DocumentBuilder};
use river_search_store::{BulkOp, DocumentRef, SearchBackend, WatermarkStore};
use river_upstream::IssueSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Property name of the per-project incremental watermark.
pub const LAST_INDEXED_ISSUE_UPDATE_DATE: &str = "lastIndexedIssueUpdateDate";

/// Forced watermark advance when a run makes progress but cannot move the
/// watermark past its own minute; just over a minute so the stuck minute is
/// never re-fetched.
const WATERMARK_BUMP_SECONDS: i64 = 64;

const DELETE_SCROLL_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Incremental,
    Full,
}

impl UpdateMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "INCREMENTAL",
            Self::Full => "FULL",
        }
    }
}

/// Shutdown flag shared between the coordinator and its workers. Workers
/// check it at every suspension point and exit cleanly when it is set.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared collaborators of every indexing run of one river.
pub struct IndexingContext {
    pub source: Arc<dyn IssueSource>,
    pub backend: Arc<dyn SearchBackend>,
    pub builder: Arc<DocumentBuilder>,
    pub watermarks: WatermarkStore,
    pub activity: Option<ActivityLog>,
    pub index_name: String,
    pub max_issues_per_request: u64,
}

/// Terminal outcome of one indexing run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub project_key: String,
    /// Effective mode: a requested incremental run is promoted to full when
    /// no watermark exists yet.
    pub full_update: bool,
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub issues_updated: u64,
    pub issues_deleted: u64,
    pub error_message: Option<String>,
}

impl RunReport {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.error_message.is_none()
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Finished(RunReport),
    /// Shutdown observed mid-run; nothing is reported and the watermark
    /// reflects only fully written pages.
    Interrupted,
}

#[derive(Default)]
struct RunCounts {
    full_update: bool,
    issues_updated: u64,
    issues_deleted: u64,
}

/// Drives one full or incremental sync pass for a single project, then is
/// discarded.
pub struct ProjectIndexer {
    ctx: Arc<IndexingContext>,
    project_key: String,
    requested_mode: UpdateMode,
    cancel: CancelFlag,
}

impl ProjectIndexer {
    pub fn new(
        ctx: Arc<IndexingContext>,
        project_key: impl Into<String>,
        requested_mode: UpdateMode,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            ctx,
            project_key: project_key.into(),
            requested_mode,
            cancel,
        }
    }

    /// Run the sync pass to completion, error or cancellation.
    pub async fn run(&self) -> RunOutcome {
        let start_time = Utc::now();
        let started = Instant::now();
        let mut counts = RunCounts {
            full_update: self.requested_mode == UpdateMode::Full,
            ..RunCounts::default()
        };

        match self.sync(start_time, &mut counts).await {
            Ok(()) => {
                log::info!(
                    "{} update of project {} done: {} updated, {} deleted in {:?}",
                    if counts.full_update { "full" } else { "incremental" },
                    self.project_key,
                    counts.issues_updated,
                    counts.issues_deleted,
                    started.elapsed()
                );
                RunOutcome::Finished(self.report(start_time, started, &counts, None))
            }
            Err(RiverError::Interrupted) => {
                log::info!(
                    "indexing of project {} interrupted by shutdown",
                    self.project_key
                );
                RunOutcome::Interrupted
            }
            Err(err) => {
                log::error!("indexing of project {} failed: {err}", self.project_key);
                RunOutcome::Finished(self.report(
                    start_time,
                    started,
                    &counts,
                    Some(err.to_string()),
                ))
            }
        }
    }

    fn report(
        &self,
        start_time: DateTime<Utc>,
        started: Instant,
        counts: &RunCounts,
        error_message: Option<String>,
    ) -> RunReport {
        RunReport {
            project_key: self.project_key.clone(),
            full_update: counts.full_update,
            start_time,
            elapsed: started.elapsed(),
            issues_updated: counts.issues_updated,
            issues_deleted: counts.issues_deleted,
            error_message,
        }
    }

    async fn sync(&self, start_time: DateTime<Utc>, counts: &mut RunCounts) -> Result<()> {
        let initial_watermark = self
            .ctx
            .watermarks
            .read_datetime(&self.project_key, LAST_INDEXED_ISSUE_UPDATE_DATE)
            .await?;

        // Without a watermark there is nothing to anchor an incremental
        // pull on, so the run is promoted to full.
        let full = self.requested_mode == UpdateMode::Full || initial_watermark.is_none();
        counts.full_update = full;

        let final_last_updated = self
            .pull_changed_issues(
                if full { None } else { initial_watermark },
                initial_watermark,
                counts,
            )
            .await?;

        // Livelock guard: progress was made but the watermark is still the
        // one we started from, which would re-fetch the same minute forever.
        if counts.issues_updated > 0 {
            if let (Some(initial), Some(last)) = (initial_watermark, final_last_updated) {
                if truncate_to_minute(last) == initial {
                    let bumped = initial + ChronoDuration::seconds(WATERMARK_BUMP_SECONDS);
                    log::info!(
                        "watermark of project {} stuck at {initial}; bumping to {bumped}",
                        self.project_key
                    );
                    self.ctx
                        .watermarks
                        .store_datetime(
                            &self.project_key,
                            LAST_INDEXED_ISSUE_UPDATE_DATE,
                            bumped,
                            None,
                        )
                        .await?;
                }
            }
        }

        if full {
            self.delete_stale_documents(start_time, counts).await?;
        }
        Ok(())
    }

    /// Paginated, watermark-anchored pull. Returns the greatest
    /// `fields.updated` observed, if any.
    async fn pull_changed_issues(
        &self,
        mut updated_after: Option<DateTime<Utc>>,
        watermark_floor: Option<DateTime<Utc>>,
        counts: &mut RunCounts,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut start_at = 0u64;
        let mut final_last_updated = None;

        loop {
            self.check_cancelled()?;
            let page = self
                .ctx
                .source
                .changed_issues(
                    &self.project_key,
                    start_at,
                    updated_after,
                    Some(self.ctx.max_issues_per_request),
                )
                .await?;
            if page.issues.is_empty() {
                break;
            }
            let page_len = page.issues.len() as u64;

            let mut ops = Vec::new();
            let mut first_updated = None;
            let mut last_updated: Option<DateTime<Utc>> = None;
            for issue in &page.issues {
                self.check_cancelled()?;
                let issue = self
                    .ctx
                    .builder
                    .apply_preprocessors(&self.project_key, issue.clone())?;
                let updated = issue_updated(&issue)?;
                if let Some(previous) = last_updated {
                    if updated < previous {
                        // The pagination advancement below is only sound on
                        // an ascending stream; a mis-sorted page would
                        // corrupt the watermark.
                        return Err(RiverError::OutOfOrder {
                            project: self.project_key.clone(),
                            details: format!("{updated} after {previous}"),
                        });
                    }
                }
                first_updated.get_or_insert(updated);
                last_updated = Some(updated);

                let documents = self.ctx.builder.build_issue(&self.project_key, &issue)?;
                ops.push(BulkOp::Index {
                    target: DocumentRef::new(
                        self.ctx.index_name.clone(),
                        self.ctx.builder.issue_type(),
                        documents.issue.id,
                    ),
                    parent: None,
                    source: documents.issue.source,
                });
                for comment in documents.comments {
                    ops.push(BulkOp::Index {
                        target: DocumentRef::new(
                            self.ctx.index_name.clone(),
                            self.ctx.builder.comment_type(),
                            comment.id,
                        ),
                        parent: comment.parent,
                        source: comment.source,
                    });
                }
                counts.issues_updated += 1;
            }
            let (Some(first), Some(last)) = (first_updated, last_updated) else {
                break;
            };

            // The watermark never regresses, even when a full pull revisits
            // history older than a previously bumped value.
            let page_watermark = match watermark_floor {
                Some(floor) => truncate_to_minute(last).max(floor),
                None => truncate_to_minute(last),
            };
            self.ctx
                .watermarks
                .store_datetime(
                    &self.project_key,
                    LAST_INDEXED_ISSUE_UPDATE_DATE,
                    page_watermark,
                    Some(&mut ops),
                )
                .await?;
            self.check_cancelled()?;
            self.ctx.backend.bulk(ops).await?;
            final_last_updated = Some(last);

            if truncate_to_minute(first) != truncate_to_minute(last) {
                // The page spans minutes, so re-anchoring by time is safe.
                let consumed = start_at + page_len;
                updated_after = Some(last);
                start_at = 0;
                if page.total <= consumed {
                    break;
                }
            } else {
                // Everything shares the watermark minute; only the offset
                // can advance without losing items.
                start_at += page_len;
                if page.total <= start_at {
                    break;
                }
            }
        }
        Ok(final_last_updated)
    }

    /// Sweep documents of this project that were not re-ingested by this
    /// run, i.e. deleted upstream.
    async fn delete_stale_documents(
        &self,
        bound: DateTime<Utc>,
        counts: &mut RunCounts,
    ) -> Result<()> {
        self.check_cancelled()?;
        // Ingest-timestamps of just-written documents have to be visible to
        // the deletion search.
        self.ctx.backend.refresh(&self.ctx.index_name).await?;

        let query = self.ctx.builder.deletion_query(&self.project_key, bound);
        let mut cursor = self
            .ctx
            .backend
            .scroll(&self.ctx.index_name, &query, DELETE_SCROLL_PAGE_SIZE)
            .await?;
        loop {
            let hits = cursor.next_page().await?;
            if hits.is_empty() {
                break;
            }
            self.check_cancelled()?;
            counts.issues_deleted += hits.len() as u64;
            let ops = hits
                .into_iter()
                .map(|hit| BulkOp::Delete { target: hit.target })
                .collect();
            self.ctx.backend.bulk(ops).await?;
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RiverError::Interrupted);
        }
        Ok(())
    }
}

pub(crate) fn truncate_to_minute(value: DateTime<Utc>) -> DateTime<Utc> {
    value
        .with_second(0)
        .and_then(|truncated| truncated.with_nanosecond(0))
        .unwrap_or(value)
}
