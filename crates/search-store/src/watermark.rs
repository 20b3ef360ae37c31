use crate::backend::{BulkOp, DocumentRef, SearchBackend};
use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Persisted per-project datetime properties, most importantly the
/// `lastIndexedIssueUpdateDate` watermark that bounds the next incremental
/// pull. Stored in a private index so a restart resumes where the previous
/// process stopped.
#[derive(Clone)]
pub struct WatermarkStore {
    backend: Arc<dyn SearchBackend>,
    index: String,
    doc_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatetimeValueBody {
    project_key: String,
    property_name: String,
    value: String,
}

impl WatermarkStore {
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

    /// Document id of one (project, property) pair.
    #[must_use]
    pub fn document_id(project_key: &str, property: &str) -> String {
        format!("_{property}_{project_key}")
    }

    fn target(&self, project_key: &str, property: &str) -> DocumentRef {
        DocumentRef::new(
            self.index.clone(),
            self.doc_type.clone(),
            Self::document_id(project_key, property),
        )
    }

    /// Store a datetime property. When `bulk` is given the write is
    /// appended to it and executed with the caller's batch; otherwise it is
    /// executed synchronously.
    pub async fn store_datetime(
        &self,
        project_key: &str,
        property: &str,
        value: DateTime<Utc>,
        bulk: Option<&mut Vec<BulkOp>>,
    ) -> Result<()> {
        let body = DatetimeValueBody {
            project_key: project_key.to_string(),
            property_name: property.to_string(),
            value: value.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let source = body_to_map(&body)?;
        let target = self.target(project_key, property);
        match bulk {
            Some(ops) => {
                ops.push(BulkOp::Index {
                    target,
                    parent: None,
                    source,
                });
                Ok(())
            }
            None => self.backend.put(&target, source).await,
        }
    }

    /// Read a datetime property. The private index is refreshed first so a
    /// write from a previous run is always visible.
    pub async fn read_datetime(
        &self,
        project_key: &str,
        property: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        self.backend.refresh(&self.index).await?;
        let Some(source) = self.backend.get(&self.target(project_key, property)).await? else {
            return Ok(None);
        };
        let body: DatetimeValueBody = serde_json::from_value(Value::Object(source))?;
        match DateTime::parse_from_rfc3339(&body.value) {
            Ok(parsed) => Ok(Some(parsed.with_timezone(&Utc))),
            Err(err) => {
                log::warn!(
                    "ignoring unparsable datetime value for {project_key}/{property}: `{}` ({err})",
                    body.value
                );
                Ok(None)
            }
        }
    }

    /// Remove a datetime property; returns whether it existed.
    pub async fn delete_datetime(&self, project_key: &str, property: &str) -> Result<bool> {
        self.backend
            .delete(&self.target(project_key, property))
            .await
    }
}

fn body_to_map(body: &DatetimeValueBody) -> Result<Map<String, Value>> {
    match serde_json::to_value(body)? {
        Value::Object(map) => Ok(map),
        other => Err(crate::error::SearchStoreError::Backend(format!(
            "datetime value serialized to non-object: {other}"
        ))),
    }
}
