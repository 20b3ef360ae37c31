use crate::error::{DocBuilderError, Result};
use crate::filter::ValueFilter;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

const DEFAULT_SETTINGS: &str = include_str!("../templates/default_settings.json");

/// How upstream comments are materialised in the search backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentMode {
    /// Comments are not indexed at all; the upstream call omits them.
    None,
    /// Comments are an ordered sub-array inside the issue document.
    Embedded,
    /// Each comment is its own document, parent-linked to the issue.
    Child,
    /// Each comment is its own document without a parent relation.
    Standalone,
}

impl CommentMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Embedded => "embedded",
            Self::Child => "child",
            Self::Standalone => "standalone",
        }
    }

    /// Whether comments must be requested from the upstream.
    #[must_use]
    pub const fn needs_comments(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether comments become documents of their own.
    #[must_use]
    pub const fn separate_documents(self) -> bool {
        matches!(self, Self::Child | Self::Standalone)
    }
}

impl FromStr for CommentMode {
    type Err = DocBuilderError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "embedded" => Ok(Self::Embedded),
            "child" => Ok(Self::Child),
            "standalone" => Ok(Self::Standalone),
            other => Err(DocBuilderError::Config(format!(
                "unknown comment_mode `{other}`"
            ))),
        }
    }
}

/// One output field: where it comes from upstream and an optional filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub source_path: String,
    pub filter: Option<String>,
}

/// Validated document-structure configuration.
///
/// Options absent from the settings fall back to the embedded default
/// template; validation is fail-fast so a misconfigured river never starts.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub field_river_name: String,
    pub field_project_key: String,
    pub field_issue_key: String,
    pub field_issue_url: String,
    pub fields: BTreeMap<String, FieldSpec>,
    pub value_filters: HashMap<String, ValueFilter>,
    pub comment_mode: CommentMode,
    pub field_comments: String,
    pub comment_fields: BTreeMap<String, FieldSpec>,
    pub preprocessor_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    field_river_name: Option<String>,
    field_project_key: Option<String>,
    field_issue_key: Option<String>,
    field_issue_url: Option<String>,
    fields: Option<BTreeMap<String, RawFieldSpec>>,
    value_filters: Option<BTreeMap<String, HashMap<String, String>>>,
    comment_mode: Option<String>,
    field_comments: Option<String>,
    comment_fields: Option<BTreeMap<String, RawFieldSpec>>,
    preprocessors: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawFieldSpec {
    jira_field: Option<String>,
    value_filter: Option<String>,
}

impl BuilderConfig {
    /// Parse the `index.*` document-structure subtree of the river settings.
    pub fn from_settings(settings: &Value) -> Result<Self> {
        let defaults: RawSettings = serde_json::from_str(DEFAULT_SETTINGS)
            .map_err(|err| DocBuilderError::Config(format!("embedded defaults: {err}")))?;
        let raw: RawSettings = serde_json::from_value(settings.clone())
            .map_err(|err| DocBuilderError::Config(format!("document settings: {err}")))?;

        let comment_mode = match raw.comment_mode.or(defaults.comment_mode) {
            Some(mode) => mode.parse()?,
            None => CommentMode::Embedded,
        };

        let config = Self {
            field_river_name: required_name(
                "field_river_name",
                raw.field_river_name.or(defaults.field_river_name),
            )?,
            field_project_key: required_name(
                "field_project_key",
                raw.field_project_key.or(defaults.field_project_key),
            )?,
            field_issue_key: required_name(
                "field_issue_key",
                raw.field_issue_key.or(defaults.field_issue_key),
            )?,
            field_issue_url: required_name(
                "field_issue_url",
                raw.field_issue_url.or(defaults.field_issue_url),
            )?,
            fields: field_specs("fields", raw.fields.or(defaults.fields))?,
            value_filters: value_filters(raw.value_filters.or(defaults.value_filters)),
            comment_mode,
            field_comments: raw
                .field_comments
                .or(defaults.field_comments)
                .unwrap_or_default(),
            comment_fields: field_specs(
                "comment_fields",
                raw.comment_fields.or(defaults.comment_fields),
            )?,
            preprocessor_names: raw
                .preprocessors
                .or(defaults.preprocessors)
                .unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.comment_mode == CommentMode::Embedded && self.field_comments.trim().is_empty() {
            return Err(DocBuilderError::Config(
                "field_comments must be set when comment_mode is embedded".to_string(),
            ));
        }
        self.check_filter_references("fields", &self.fields)?;
        if self.comment_mode.needs_comments() {
            self.check_filter_references("comment_fields", &self.comment_fields)?;
        }
        Ok(())
    }

    fn check_filter_references(
        &self,
        section: &str,
        specs: &BTreeMap<String, FieldSpec>,
    ) -> Result<()> {
        for (name, spec) in specs {
            if let Some(filter) = &spec.filter {
                if !self.value_filters.contains_key(filter) {
                    return Err(DocBuilderError::Config(format!(
                        "{section}.{name} references undefined value_filter `{filter}`"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn required_name(option: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(name) if !name.trim().is_empty() => Ok(name),
        _ => Err(DocBuilderError::Config(format!(
            "{option} must not be blank"
        ))),
    }
}

fn field_specs(
    section: &str,
    raw: Option<BTreeMap<String, RawFieldSpec>>,
) -> Result<BTreeMap<String, FieldSpec>> {
    let mut out = BTreeMap::new();
    for (name, spec) in raw.unwrap_or_default() {
        if name.trim().is_empty() {
            return Err(DocBuilderError::Config(format!(
                "{section} contains a blank output field name"
            )));
        }
        let source_path = match spec.jira_field {
            Some(path) if !path.trim().is_empty() => path,
            _ => {
                return Err(DocBuilderError::Config(format!(
                    "{section}.{name} is missing jira_field"
                )))
            }
        };
        out.insert(
            name,
            FieldSpec {
                source_path,
                filter: spec.value_filter.filter(|f| !f.trim().is_empty()),
            },
        );
    }
    Ok(out)
}

fn value_filters(
    raw: Option<BTreeMap<String, HashMap<String, String>>>,
) -> HashMap<String, ValueFilter> {
    raw.unwrap_or_default()
        .into_iter()
        .map(|(name, mappings)| (name.clone(), ValueFilter::new(name, mappings)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn defaults_load_from_embedded_template() {
        let config = BuilderConfig::from_settings(&json!({})).unwrap();
        assert_eq!(config.field_river_name, "river");
        assert_eq!(config.field_issue_url, "document_url");
        assert_eq!(config.comment_mode, CommentMode::Embedded);
        assert_eq!(config.field_comments, "comments");
        assert!(config.fields.contains_key("summary"));
        assert!(config.fields.contains_key("components"));
        assert!(config.value_filters.contains_key("user"));
        assert!(config.comment_fields.contains_key("comment_body"));
    }

    #[test]
    fn explicit_settings_override_defaults() {
        let config = BuilderConfig::from_settings(&json!({
            "comment_mode": "standalone",
            "fields": {"title": {"jira_field": "fields.summary"}}
        }))
        .unwrap();
        assert_eq!(config.comment_mode, CommentMode::Standalone);
        assert_eq!(config.fields.len(), 1);
        assert_eq!(config.fields["title"].source_path, "fields.summary");
    }

    #[test]
    fn missing_jira_field_fails_fast() {
        let err = BuilderConfig::from_settings(&json!({
            "fields": {"broken": {"value_filter": "user"}}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("missing jira_field"), "{err}");
    }

    #[test]
    fn undefined_value_filter_fails_fast() {
        let err = BuilderConfig::from_settings(&json!({
            "fields": {"summary": {"jira_field": "fields.summary", "value_filter": "nope"}},
            "value_filters": {}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("undefined value_filter"), "{err}");
    }

    #[test]
    fn blank_required_name_fails_fast() {
        let err = BuilderConfig::from_settings(&json!({"field_issue_key": "  "})).unwrap_err();
        assert!(err.to_string().contains("field_issue_key"), "{err}");
    }

    #[test]
    fn embedded_mode_requires_comments_field_name() {
        let err = BuilderConfig::from_settings(&json!({
            "comment_mode": "embedded",
            "field_comments": ""
        }))
        .unwrap_err();
        assert!(err.to_string().contains("field_comments"), "{err}");
    }

    #[test]
    fn unknown_comment_mode_is_rejected() {
        let err = BuilderConfig::from_settings(&json!({"comment_mode": "inline"})).unwrap_err();
        assert!(err.to_string().contains("comment_mode"), "{err}");
    }
}
