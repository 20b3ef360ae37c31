use thiserror::Error;

pub type Result<T> = std::result::Result<T, UpstreamError>;

#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Network-level trouble worth retrying on a later tick.
    #[error("Upstream request failed (transient): {0}")]
    Transient(String),

    /// Credentials rejected; an operator has to intervene.
    #[error("Upstream rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    /// Anything else the upstream will keep answering the same way.
    #[error("Upstream request failed: {0}")]
    Fatal(String),

    #[error("Invalid upstream configuration: {0}")]
    Config(String),
}

impl UpstreamError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
