use thiserror::Error;

pub type Result<T> = std::result::Result<T, DocBuilderError>;

#[derive(Error, Debug)]
pub enum DocBuilderError {
    #[error("Invalid document configuration: {0}")]
    Config(String),

    #[error("Issue is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid timestamp `{value}` in field `{field}`: {reason}")]
    InvalidTimestamp {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Preprocessor `{name}` failed: {reason}")]
    Preprocessor { name: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
