//! Error types for Toolvault operations

/// Result type for Toolvault operations
pub type Result<T> = std::result::Result<T, ToolvaultError>;

/// Error types returned by host collaborators and configuration loading.
///
/// Errors raised *inside* a sandbox session are reported through
/// [`crate::sandbox::SandboxError`] instead.
#[derive(Debug, thiserror::Error)]
pub enum ToolvaultError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A host collaborator (LLM, index, uploads, ...) failed
    #[error("Host error: {0}")]
    Host(String),

    /// A requested host record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for ToolvaultError {
    fn from(s: String) -> Self {
        ToolvaultError::Other(s)
    }
}

impl From<&str> for ToolvaultError {
    fn from(s: &str) -> Self {
        ToolvaultError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ToolvaultError {
    fn from(err: anyhow::Error) -> Self {
        ToolvaultError::Other(err.to_string())
    }
}
