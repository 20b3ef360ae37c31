use thiserror::Error;

pub type Result<T> = std::result::Result<T, SearchStoreError>;

#[derive(Error, Debug)]
pub enum SearchStoreError {
    #[error("Bulk write failed: {0}")]
    Bulk(String),

    #[error("Scroll failed: {0}")]
    Scroll(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
