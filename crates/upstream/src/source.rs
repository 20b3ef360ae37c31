use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// One page of the upstream changed-issues search, ordered by
/// `fields.updated` ascending.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChangedIssuesPage {
    #[serde(default)]
    pub total: u64,
    #[serde(default, rename = "startAt")]
    pub start_at: u64,
    #[serde(default)]
    pub issues: Vec<Value>,
}

/// Read-only contract of the issue tracker being mirrored.
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Keys of all projects visible to the river's credentials.
    async fn list_project_keys(&self) -> Result<Vec<String>>;

    /// Issues of `project_key` updated at or after `updated_after`
    /// (unbounded when `None`), starting at offset `start_at`.
    async fn changed_issues(
        &self,
        project_key: &str,
        start_at: u64,
        updated_after: Option<DateTime<Utc>>,
        max_results: Option<u64>,
    ) -> Result<ChangedIssuesPage>;
}
