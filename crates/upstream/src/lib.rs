//! # River Upstream
//!
//! Client side of the issue tracker being mirrored: an authenticated,
//! paginated JQL search translated into a uniform page shape, plus the
//! [`IssueSource`] trait the indexer consumes so tests can script the
//! upstream.

mod client;
mod error;
mod source;

pub use client::{JiraClient, JiraConfig, DEFAULT_MAX_ISSUES_PER_REQUEST, DEFAULT_TIMEOUT};
pub use error::{Result, UpstreamError};
pub use source::{ChangedIssuesPage, IssueSource};
