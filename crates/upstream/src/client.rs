use crate::error::{Result, UpstreamError};
use crate::source::{ChangedIssuesPage, IssueSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::time::Duration;

const SEARCH_PATH: &str = "/rest/api/2/search";
const PROJECT_PATH: &str = "/rest/api/2/project";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ISSUES_PER_REQUEST: u64 = 50;

/// Connection settings of the upstream tracker.
#[derive(Debug, Clone)]
pub struct JiraConfig {
    pub url_base: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    /// Upper bound on one search page; requests asking for more are capped.
    pub max_issues_per_request: u64,
    /// Timezone JQL timestamps are rendered in. Has to match the timezone
    /// of the upstream user the river authenticates as, otherwise updates
    /// can be silently skipped.
    pub jql_time_zone: Tz,
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            url_base: String::new(),
            username: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
            max_issues_per_request: DEFAULT_MAX_ISSUES_PER_REQUEST,
            jql_time_zone: Tz::UTC,
        }
    }
}

/// Authenticated, paginated access to the upstream JQL search endpoint.
#[derive(Debug)]
pub struct JiraClient {
    http: reqwest::Client,
    config: JiraConfig,
    required_fields: String,
}

impl JiraClient {
    /// Build a client. `required_fields` is the comma-separated field list
    /// computed by the document builder from its configuration.
    pub fn new(config: JiraConfig, required_fields: impl Into<String>) -> Result<Self> {
        let config = JiraConfig {
            url_base: config.url_base.trim_end_matches('/').to_string(),
            ..config
        };
        if config.url_base.is_empty() {
            return Err(UpstreamError::Config(
                "jira url base must not be blank".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| UpstreamError::Config(format!("http client: {err}")))?;

        // A wrong JQL timezone loses updates without any error, so make the
        // effective one easy to find in the logs.
        log::info!(
            "jira client for {} renders JQL timestamps in timezone {}",
            config.url_base,
            config.jql_time_zone
        );

        Ok(Self {
            http,
            config,
            required_fields: required_fields.into(),
        })
    }

    #[must_use]
    pub fn url_base(&self) -> &str {
        &self.config.url_base
    }

    /// JQL fragment selecting a project's issues updated at or after the
    /// bound, oldest first. The bound is minute-truncated and rendered in
    /// the configured timezone.
    pub(crate) fn jql_for(&self, project_key: &str, updated_after: Option<DateTime<Utc>>) -> String {
        match updated_after {
            Some(bound) => {
                let local = bound.with_timezone(&self.config.jql_time_zone);
                format!(
                    "project = \"{project_key}\" AND updated >= \"{}\" ORDER BY updated ASC",
                    local.format("%Y-%m-%d %H:%M")
                )
            }
            None => format!("project = \"{project_key}\" ORDER BY updated ASC"),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.get(format!("{}{path}", self.config.url_base));
        match &self.config.username {
            Some(username) => builder.basic_auth(username, self.config.password.as_deref()),
            None => builder,
        }
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(status_error(status))
    }
}

#[async_trait]
impl IssueSource for JiraClient {
    async fn list_project_keys(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct ProjectEntry {
            key: String,
        }

        let response = self.execute(self.request(PROJECT_PATH)).await?;
        let entries: Vec<ProjectEntry> = response.json().await.map_err(decode_error)?;
        Ok(entries.into_iter().map(|entry| entry.key).collect())
    }

    async fn changed_issues(
        &self,
        project_key: &str,
        start_at: u64,
        updated_after: Option<DateTime<Utc>>,
        max_results: Option<u64>,
    ) -> Result<ChangedIssuesPage> {
        let max_results = max_results
            .unwrap_or(self.config.max_issues_per_request)
            .min(self.config.max_issues_per_request);
        let jql = self.jql_for(project_key, updated_after);
        log::debug!(
            "changed issues for {project_key}: startAt={start_at} maxResults={max_results} jql=`{jql}`"
        );

        let builder = self.request(SEARCH_PATH).query(&[
            ("jql", jql.as_str()),
            ("fields", self.required_fields.as_str()),
            ("startAt", start_at.to_string().as_str()),
            ("maxResults", max_results.to_string().as_str()),
        ]);
        let response = self.execute(builder).await?;
        response.json().await.map_err(decode_error)
    }
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() || err.is_connect() {
        UpstreamError::Transient(err.to_string())
    } else {
        UpstreamError::Fatal(err.to_string())
    }
}

fn decode_error(err: reqwest::Error) -> UpstreamError {
    UpstreamError::Fatal(format!("malformed upstream response: {err}"))
}

fn status_error(status: reqwest::StatusCode) -> UpstreamError {
    if status.is_server_error() {
        UpstreamError::Transient(format!("upstream returned HTTP {status}"))
    } else if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
    {
        UpstreamError::Auth {
            status: status.as_u16(),
        }
    } else {
        UpstreamError::Fatal(format!("upstream returned HTTP {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn client(config: JiraConfig) -> JiraClient {
        JiraClient::new(config, "updated,project,summary").expect("client")
    }

    #[test]
    fn blank_url_base_is_rejected() {
        let err = JiraClient::new(JiraConfig::default(), "updated,project").unwrap_err();
        assert!(matches!(err, UpstreamError::Config(_)));
    }

    #[test]
    fn jql_without_bound_has_no_date_clause() {
        let client = client(JiraConfig {
            url_base: "https://issues.example.org".to_string(),
            ..JiraConfig::default()
        });
        assert_eq!(
            client.jql_for("ORG", None),
            "project = \"ORG\" ORDER BY updated ASC"
        );
    }

    #[test]
    fn jql_bound_is_minute_truncated_in_utc() {
        let client = client(JiraConfig {
            url_base: "https://issues.example.org".to_string(),
            ..JiraConfig::default()
        });
        let bound = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 42).unwrap();
        assert_eq!(
            client.jql_for("ORG", Some(bound)),
            "project = \"ORG\" AND updated >= \"2024-05-01 10:00\" ORDER BY updated ASC"
        );
    }

    #[test]
    fn jql_bound_is_rendered_in_the_configured_timezone() {
        let client = client(JiraConfig {
            url_base: "https://issues.example.org".to_string(),
            jql_time_zone: chrono_tz::Europe::Prague,
            ..JiraConfig::default()
        });
        // CEST in May: UTC+2.
        let bound = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(
            client.jql_for("ORG", Some(bound)),
            "project = \"ORG\" AND updated >= \"2024-05-01 12:00\" ORDER BY updated ASC"
        );
    }

    #[test]
    fn url_base_trailing_slash_is_trimmed() {
        let client = client(JiraConfig {
            url_base: "https://issues.example.org/".to_string(),
            ..JiraConfig::default()
        });
        assert_eq!(client.url_base(), "https://issues.example.org");
    }
}
