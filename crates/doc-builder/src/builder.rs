use crate::config::{BuilderConfig, CommentMode, FieldSpec};
use crate::error::{DocBuilderError, Result};
use crate::extract::{extract, root_segment};
use crate::preprocessor::IssuePreprocessor;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::collections::HashSet;

const COMMENTS_PATH: &str = "fields.comment.comments";
const COMMENT_TYPE_SUFFIX: &str = "_comment";

/// A single document ready to be written to the search backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    /// Parent document id, set only for `child` comment documents.
    pub parent: Option<String>,
    pub source: Map<String, Value>,
}

/// Output of one issue transformation: the issue document plus the comment
/// documents produced in `child`/`standalone` comment modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueDocuments {
    pub issue: Document,
    pub comments: Vec<Document>,
}

/// Selects every document of this river for one project whose backend
/// ingest-timestamp is strictly older than the bound. Full runs use it to
/// sweep documents that were not re-ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionQuery {
    pub doc_types: Vec<String>,
    pub project_key_field: String,
    pub project_key: String,
    pub ingested_before: DateTime<Utc>,
}

/// Transforms upstream issue records into flat index documents according to
/// the field/filter configuration.
pub struct DocumentBuilder {
    river_name: String,
    url_base: String,
    issue_type: String,
    comment_type: String,
    config: BuilderConfig,
    preprocessors: Vec<Box<dyn IssuePreprocessor>>,
}

impl std::fmt::Debug for DocumentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBuilder")
            .field("river_name", &self.river_name)
            .field("url_base", &self.url_base)
            .field("issue_type", &self.issue_type)
            .field("comment_type", &self.comment_type)
            .field("config", &self.config)
            .field("preprocessors", &self.preprocessors.len())
            .finish()
    }
}

impl DocumentBuilder {
    /// Build a new document builder.
    ///
    /// `preprocessors` is the host-registered stage set; the configured
    /// `preprocessors` names select and order stages from it, and a name
    /// without a registered stage is a configuration error.
    pub fn new(
        river_name: impl Into<String>,
        url_base: impl Into<String>,
        issue_type: impl Into<String>,
        config: BuilderConfig,
        registered: Vec<Box<dyn IssuePreprocessor>>,
    ) -> Result<Self> {
        let river_name = river_name.into();
        let issue_type = issue_type.into();
        let url_base: String = url_base.into();
        let url_base = url_base.trim_end_matches('/').to_string();
        if url_base.is_empty() {
            return Err(DocBuilderError::Config(
                "issue tracker url base must not be blank".to_string(),
            ));
        }

        let mut by_name: BTreeMap<String, Box<dyn IssuePreprocessor>> = registered
            .into_iter()
            .map(|stage| (stage.name().to_string(), stage))
            .collect();
        let mut preprocessors = Vec::with_capacity(config.preprocessor_names.len());
        for name in &config.preprocessor_names {
            match by_name.remove(name) {
                Some(stage) => preprocessors.push(stage),
                None => {
                    return Err(DocBuilderError::Config(format!(
                        "preprocessor `{name}` is not registered"
                    )))
                }
            }
        }

        let comment_type = format!("{issue_type}{COMMENT_TYPE_SUFFIX}");
        Ok(Self {
            river_name,
            url_base,
            issue_type,
            comment_type,
            config,
            preprocessors,
        })
    }

    #[must_use]
    pub fn issue_type(&self) -> &str {
        &self.issue_type
    }

    #[must_use]
    pub fn comment_type(&self) -> &str {
        &self.comment_type
    }

    #[must_use]
    pub fn comment_mode(&self) -> CommentMode {
        self.config.comment_mode
    }

    /// Canonical browse URL of an issue.
    #[must_use]
    pub fn issue_url(&self, issue_key: &str) -> String {
        format!("{}/browse/{issue_key}", self.url_base)
    }

    /// GUI anchor of one comment inside the issue view.
    #[must_use]
    pub fn comment_url(&self, issue_key: &str, comment_id: &str) -> String {
        format!(
            "{}/browse/{issue_key}?focusedCommentId={comment_id}\
             &page=com.atlassian.jira.plugin.system.issuetabpanels:comment-tabpanel\
             #comment-{comment_id}",
            self.url_base
        )
    }

    /// Comma-separated field list the upstream search call must request,
    /// derived from the configured field paths.
    #[must_use]
    pub fn required_fields(&self) -> String {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for segment in ["updated", "project"] {
            if seen.insert(segment.to_string()) {
                out.push(segment.to_string());
            }
        }
        for spec in self.config.fields.values() {
            let segment = root_segment(&spec.source_path);
            if !segment.is_empty() && seen.insert(segment.to_string()) {
                out.push(segment.to_string());
            }
        }
        if self.config.comment_mode.needs_comments() && seen.insert("comment".to_string()) {
            out.push("comment".to_string());
        }
        out.join(",")
    }

    /// Run the configured preprocessor chain over a raw upstream issue.
    pub fn apply_preprocessors(&self, project_key: &str, issue: Value) -> Result<Value> {
        let mut issue = issue;
        for stage in &self.preprocessors {
            issue = stage.process(project_key, issue)?;
        }
        Ok(issue)
    }

    /// Transform one upstream issue into its index document(s).
    pub fn build_issue(&self, project_key: &str, issue: &Value) -> Result<IssueDocuments> {
        let key = issue_key(issue)?;

        let mut source = Map::new();
        self.put_provenance(&mut source, project_key, key, self.issue_url(key));
        self.render_fields(&self.config.fields, issue, &mut source);

        let comments = self.comment_records(issue);
        let mut comment_documents = Vec::new();
        match self.config.comment_mode {
            CommentMode::None => {}
            CommentMode::Embedded => {
                let rendered: Vec<Value> = comments
                    .iter()
                    .filter_map(|comment| self.embedded_comment(key, comment))
                    .collect();
                if !rendered.is_empty() {
                    source.insert(
                        self.config.field_comments.clone(),
                        Value::Array(rendered),
                    );
                }
            }
            CommentMode::Child | CommentMode::Standalone => {
                for comment in &comments {
                    if let Some(document) = self.comment_document(project_key, key, comment) {
                        comment_documents.push(document);
                    }
                }
            }
        }

        Ok(IssueDocuments {
            issue: Document {
                id: key.to_string(),
                parent: None,
                source,
            },
            comments: comment_documents,
        })
    }

    /// Query matching this river's documents for `project_key` that were not
    /// re-ingested after `ingested_before`.
    #[must_use]
    pub fn deletion_query(
        &self,
        project_key: &str,
        ingested_before: DateTime<Utc>,
    ) -> DeletionQuery {
        let mut doc_types = vec![self.issue_type.clone()];
        if self.config.comment_mode.separate_documents() {
            doc_types.push(self.comment_type.clone());
        }
        DeletionQuery {
            doc_types,
            project_key_field: self.config.field_project_key.clone(),
            project_key: project_key.to_string(),
            ingested_before,
        }
    }

    fn put_provenance(
        &self,
        source: &mut Map<String, Value>,
        project_key: &str,
        issue_key: &str,
        url: String,
    ) {
        source.insert(
            self.config.field_river_name.clone(),
            Value::String(self.river_name.clone()),
        );
        source.insert(
            self.config.field_project_key.clone(),
            Value::String(project_key.to_string()),
        );
        source.insert(
            self.config.field_issue_key.clone(),
            Value::String(issue_key.to_string()),
        );
        source.insert(self.config.field_issue_url.clone(), Value::String(url));
    }

    fn render_fields(
        &self,
        specs: &BTreeMap<String, FieldSpec>,
        record: &Value,
        out: &mut Map<String, Value>,
    ) {
        for (name, spec) in specs {
            let Some(value) = extract(&spec.source_path, record) else {
                continue;
            };
            let rendered = match &spec.filter {
                Some(filter_name) => match self.config.value_filters.get(filter_name) {
                    Some(filter) => filter.apply(value),
                    None => value.clone(),
                },
                None => value.clone(),
            };
            out.insert(name.clone(), rendered);
        }
    }

    fn comment_records<'a>(&self, issue: &'a Value) -> Vec<&'a Value> {
        if !self.config.comment_mode.needs_comments() {
            return Vec::new();
        }
        extract(COMMENTS_PATH, issue)
            .and_then(Value::as_array)
            .map(|comments| comments.iter().collect())
            .unwrap_or_default()
    }

    fn embedded_comment(&self, issue_key: &str, comment: &Value) -> Option<Value> {
        let id = comment_id(comment)?;
        let mut source = Map::new();
        self.render_fields(&self.config.comment_fields, comment, &mut source);
        source.insert(
            self.config.field_issue_url.clone(),
            Value::String(self.comment_url(issue_key, &id)),
        );
        Some(Value::Object(source))
    }

    fn comment_document(
        &self,
        project_key: &str,
        issue_key: &str,
        comment: &Value,
    ) -> Option<Document> {
        let id = comment_id(comment)?;
        let mut source = Map::new();
        self.put_provenance(
            &mut source,
            project_key,
            issue_key,
            self.comment_url(issue_key, &id),
        );
        self.render_fields(&self.config.comment_fields, comment, &mut source);
        let parent = matches!(self.config.comment_mode, CommentMode::Child)
            .then(|| issue_key.to_string());
        Some(Document { id, parent, source })
    }
}

/// Stable issue identifier; its absence is fatal for the run.
pub fn issue_key(issue: &Value) -> Result<&str> {
    issue
        .get("key")
        .and_then(Value::as_str)
        .filter(|key| !key.is_empty())
        .ok_or(DocBuilderError::MissingField("key"))
}

/// Last-update timestamp of an issue; its absence is fatal for the run.
pub fn issue_updated(issue: &Value) -> Result<DateTime<Utc>> {
    let raw = extract("fields.updated", issue)
        .and_then(Value::as_str)
        .ok_or(DocBuilderError::MissingField("fields.updated"))?;
    parse_timestamp("fields.updated", raw)
}

/// Parse an upstream ISO-8601 timestamp. Jira renders zone offsets both
/// with and without a colon, so RFC 3339 alone is not enough.
pub fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| DocBuilderError::InvalidTimestamp {
            field,
            value: raw.to_string(),
            reason: err.to_string(),
        })
}

fn comment_id(comment: &Value) -> Option<String> {
    match comment.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => {
            log::warn!("skipping comment without id: {comment}");
            None
        }
    }
}
