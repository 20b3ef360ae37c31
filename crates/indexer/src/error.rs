use thiserror::Error;

pub type Result<T> = std::result::Result<T, RiverError>;

#[derive(Error, Debug)]
pub enum RiverError {
    #[error(transparent)]
    Upstream(#[from] river_upstream::UpstreamError),

    #[error(transparent)]
    Store(#[from] river_search_store::SearchStoreError),

    #[error(transparent)]
    Builder(#[from] river_doc_builder::DocBuilderError),

    #[error("Invalid river configuration: {0}")]
    Config(String),

    #[error("Upstream returned issues out of updated-ascending order for {project}: {details}")]
    OutOfOrder { project: String, details: String },

    /// Internal marker for a shutdown observed mid-run; never reported as a
    /// failure.
    #[error("indexing interrupted by shutdown")]
    Interrupted,
}
