use crate::project_indexer::RunReport;
use river_search_store::{DocumentRef, SearchBackend};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Best-effort audit trail of indexing runs. A failure to record never
/// affects the run it describes.
pub struct ActivityLog {
    backend: Arc<dyn SearchBackend>,
    index: String,
    doc_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivityRecord<'a> {
    project_key: &'a str,
    update_type: &'a str,
    result: &'a str,
    start_date: String,
    /// Milliseconds.
    time_elapsed: u64,
    issues_updated: u64,
    issues_deleted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

impl ActivityLog {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        index: impl Into<String>,
        doc_type: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            index: index.into(),
            doc_type: doc_type.into(),
        }
    }

    pub async fn record(&self, report: &RunReport) {
        let record = ActivityRecord {
            project_key: &report.project_key,
            update_type: if report.full_update {
                "FULL"
            } else {
                "INCREMENTAL"
            },
            result: if report.ok() { "OK" } else { "ERROR" },
            start_date: report.start_time.to_rfc3339(),
            time_elapsed: u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            issues_updated: report.issues_updated,
            issues_deleted: report.issues_deleted,
            error_message: report.error_message.as_deref(),
        };

        let source = match serde_json::to_value(&record) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                log::warn!("activity record for {} did not serialize", report.project_key);
                return;
            }
        };
        let target = DocumentRef::new(
            self.index.clone(),
            self.doc_type.clone(),
            format!(
                "{}_{}",
                report.project_key,
                report.start_time.timestamp_millis()
            ),
        );
        if let Err(err) = self.backend.put(&target, source).await {
            log::warn!(
                "failed to write activity record for {}: {err}",
                report.project_key
            );
        }
    }
}
