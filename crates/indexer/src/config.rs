use crate::error::{Result, RiverError};
use chrono_tz::Tz;
use river_upstream::{JiraConfig, DEFAULT_MAX_ISSUES_PER_REQUEST, DEFAULT_TIMEOUT};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_ISSUE_TYPE: &str = "jira_issue";
pub const DEFAULT_ACTIVITY_TYPE: &str = "jira_river_indexupdate";
/// Document type of the persisted datetime properties (watermarks).
pub const DATETIME_VALUE_TYPE: &str = "datetime_value";

const DEFAULT_INDEX_UPDATE_PERIOD_MINUTES: u64 = 5;
const DEFAULT_INDEX_FULL_UPDATE_PERIOD_HOURS: u64 = 12;
const DEFAULT_PROJECTS_REFRESH_INTERVAL_MINUTES: u64 = 30;
const DEFAULT_COORDINATOR_TICK_INTERVAL_SECONDS: u64 = 30;

/// Validated river settings, parsed from the host-supplied settings value.
#[derive(Debug, Clone)]
pub struct RiverConfig {
    pub river_name: String,
    pub jira: JiraSettings,
    pub index: IndexSettings,
    pub activity_log: Option<ActivityLogSettings>,
}

#[derive(Debug, Clone)]
pub struct JiraSettings {
    pub url_base: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub jql_time_zone: Tz,
    pub timeout: Duration,
    pub max_issues_per_request: u64,
    /// Static project list; when non-empty, discovery never runs.
    pub project_keys_indexed: Vec<String>,
    pub project_keys_excluded: Vec<String>,
    pub index_update_period: Duration,
    /// `None` disables full updates entirely.
    pub index_full_update_period: Option<Duration>,
    pub max_indexing_threads: usize,
    pub projects_refresh_interval: Duration,
    pub coordinator_tick_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub index_name: String,
    pub issue_type: String,
    /// The whole `index` subtree; the document builder reads its
    /// field/filter/comment options from it.
    pub document_settings: Value,
}

#[derive(Debug, Clone)]
pub struct ActivityLogSettings {
    pub index: String,
    pub doc_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    jira: Option<RawJira>,
    index: Option<Value>,
    activity_log: Option<RawActivityLog>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJira {
    url_base: Option<String>,
    username: Option<String>,
    pwd: Option<String>,
    jql_time_zone: Option<String>,
    /// Seconds.
    timeout: Option<u64>,
    max_issues_per_request: Option<u64>,
    project_keys_indexed: Option<String>,
    project_keys_excluded: Option<String>,
    /// Minutes.
    index_update_period: Option<u64>,
    /// Hours; `0` disables full updates.
    index_full_update_period: Option<u64>,
    max_indexing_threads: Option<usize>,
    /// Minutes.
    projects_refresh_interval: Option<u64>,
    /// Seconds.
    coordinator_tick_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIndexNames {
    index: Option<String>,
    #[serde(rename = "type")]
    doc_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawActivityLog {
    index: Option<String>,
    #[serde(rename = "type")]
    doc_type: Option<String>,
}

impl RiverConfig {
    /// Parse and validate the river settings. Fails fast so a misconfigured
    /// river never starts.
    pub fn from_settings(river_name: impl Into<String>, settings: &Value) -> Result<Self> {
        let river_name = river_name.into();
        if river_name.trim().is_empty() {
            return Err(RiverError::Config("river name must not be blank".to_string()));
        }
        let raw: RawSettings = serde_json::from_value(settings.clone())
            .map_err(|err| RiverError::Config(format!("river settings: {err}")))?;
        let jira = raw.jira.unwrap_or_default();

        let url_base = match jira.url_base {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => {
                return Err(RiverError::Config(
                    "jira.urlBase is required".to_string(),
                ))
            }
        };
        let jql_time_zone = match jira.jql_time_zone {
            Some(raw_tz) => raw_tz.parse::<Tz>().map_err(|err| {
                RiverError::Config(format!("jira.jqlTimeZone `{raw_tz}`: {err}"))
            })?,
            None => Tz::UTC,
        };

        let index_full_update_period = match jira
            .index_full_update_period
            .unwrap_or(DEFAULT_INDEX_FULL_UPDATE_PERIOD_HOURS)
        {
            0 => None,
            hours => Some(Duration::from_secs(hours * 3600)),
        };

        let jira = JiraSettings {
            url_base,
            username: jira.username.filter(|name| !name.trim().is_empty()),
            password: jira.pwd,
            jql_time_zone,
            timeout: jira.timeout.map_or(DEFAULT_TIMEOUT, Duration::from_secs),
            max_issues_per_request: jira
                .max_issues_per_request
                .unwrap_or(DEFAULT_MAX_ISSUES_PER_REQUEST)
                .max(1),
            project_keys_indexed: split_csv(jira.project_keys_indexed.as_deref()),
            project_keys_excluded: split_csv(jira.project_keys_excluded.as_deref()),
            index_update_period: Duration::from_secs(
                jira.index_update_period
                    .unwrap_or(DEFAULT_INDEX_UPDATE_PERIOD_MINUTES)
                    * 60,
            ),
            index_full_update_period,
            max_indexing_threads: jira.max_indexing_threads.unwrap_or(1).max(1),
            projects_refresh_interval: Duration::from_secs(
                jira.projects_refresh_interval
                    .unwrap_or(DEFAULT_PROJECTS_REFRESH_INTERVAL_MINUTES)
                    * 60,
            ),
            coordinator_tick_interval: Duration::from_secs(
                jira.coordinator_tick_interval
                    .unwrap_or(DEFAULT_COORDINATOR_TICK_INTERVAL_SECONDS),
            ),
        };

        let document_settings = raw.index.unwrap_or(Value::Null);
        let names: RawIndexNames = match &document_settings {
            Value::Null => RawIndexNames::default(),
            value => serde_json::from_value(value.clone())
                .map_err(|err| RiverError::Config(format!("index settings: {err}")))?,
        };
        let index = IndexSettings {
            index_name: names.index.unwrap_or_else(|| river_name.clone()),
            issue_type: names
                .doc_type
                .unwrap_or_else(|| DEFAULT_ISSUE_TYPE.to_string()),
            document_settings: match document_settings {
                Value::Null => Value::Object(serde_json::Map::new()),
                value => value,
            },
        };

        let activity_log = raw.activity_log.and_then(|activity| {
            activity.index.map(|index| ActivityLogSettings {
                index,
                doc_type: activity
                    .doc_type
                    .unwrap_or_else(|| DEFAULT_ACTIVITY_TYPE.to_string()),
            })
        });

        Ok(Self {
            river_name,
            jira,
            index,
            activity_log,
        })
    }

    /// Upstream client settings derived from the `jira.*` keys.
    #[must_use]
    pub fn jira_client_config(&self) -> JiraConfig {
        JiraConfig {
            url_base: self.jira.url_base.clone(),
            username: self.jira.username.clone(),
            password: self.jira.password.clone(),
            timeout: self.jira.timeout,
            max_issues_per_request: self.jira.max_issues_per_request,
            jql_time_zone: self.jira.jql_time_zone,
        }
    }
}

fn split_csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|csv| {
        csv.split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(ToString::to_string)
            .collect()
    })
    .unwrap_or_default()
}
