//! Error types for the reference filesystem

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RefError>;

#[derive(Error, Debug)]
pub enum RefError {
    #[error("No such reference: {0}")]
    NotFound(String),

    #[error("Reference \"{path}\" failed to fetch target {target}")]
    NotReachable {
        path: String,
        target: String,
        #[source]
        source: Box<RefError>,
    },

    #[error("Invalid reference spec: {0}")]
    BadSpec(String),

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("No backend registered for protocol '{0}'")]
    UnknownProtocol(String),

    #[error("Invalid record file: {0}")]
    InvalidFormat(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RefError {
    /// True for any "the key or its backing file does not exist" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            RefError::NotFound(_) => true,
            RefError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Wrap a backend failure as a reference-level error, preserving the
    /// failed path and target URL.
    pub fn not_reachable(
        path: impl Into<String>,
        target: impl Into<String>,
        source: RefError,
    ) -> Self {
        RefError::NotReachable {
            path: path.into(),
            target: target.into(),
            source: Box::new(source),
        }
    }
}
