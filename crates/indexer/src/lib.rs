//! # River Indexer
//!
//! Core of the river: mirrors issues of a remote tracker into a search
//! backend and keeps the mirror fresh.
//!
//! ## Pipeline
//!
//! ```text
//! Coordinator (tick loop)
//!     │
//!     ├──> project discovery (static list or periodic refresh)
//!     │
//!     └──> ProjectIndexer per (project, mode), bounded worker budget
//!            │
//!            ├──> watermark read (promotes to full when absent)
//!            ├──> paginated pull, ordered by `updated`
//!            │      └─> document builder -> bulk writes + watermark
//!            └──> full runs: sweep-delete of not-re-ingested documents
//! ```
//!
//! The host owns the [`Coordinator`] value; there is no process-wide
//! registry. Shutdown via [`Coordinator::close`] cancels in-flight runs at
//! their next suspension point.

mod activity;
mod config;
mod coordinator;
mod error;
mod project_indexer;

pub use activity::ActivityLog;
pub use config::{
    ActivityLogSettings, IndexSettings, JiraSettings, RiverConfig, DATETIME_VALUE_TYPE,
    DEFAULT_ACTIVITY_TYPE, DEFAULT_ISSUE_TYPE,
};
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use error::{Result, RiverError};
pub use project_indexer::{
    CancelFlag, IndexingContext, ProjectIndexer, RunOutcome, RunReport, UpdateMode,
    LAST_INDEXED_ISSUE_UPDATE_DATE,
};
