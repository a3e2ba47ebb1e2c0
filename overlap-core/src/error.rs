//! Error types for overlap-core

use thiserror::Error;

/// Main error type for the overlap-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parse error for agent journals
    #[error("parse error in {agent} journal: {message}")]
    Parse { agent: String, message: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Token rejected (HTTP 401) by a team instance
    #[error("authentication rejected by {0}")]
    Auth(String),

    /// Remote API or transport error
    #[error("remote error: {0}")]
    Http(String),

    /// Version-control interop error
    #[error("git error: {0}")]
    Git(String),

    /// Filesystem watch error
    #[error("watch error: {0}")]
    Watch(String),
}

impl Error {
    /// Transient errors are worth retrying with backoff; auth rejections,
    /// malformed input, and local IO are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Http(_))
    }
}

/// Result type alias for overlap-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Http("API error (500): boom".into()).is_transient());
        assert!(!Error::Auth("https://team.example.com".into()).is_transient());
        assert!(!Error::Config("missing token".into()).is_transient());
    }
}
