//! Error types and handlers for proxy operations

pub mod handlers;

use crate::digest::Digest;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Registry construction failed; fatal for the process bootstrapper
    #[error("Failed to construct proxy registry: {0}")]
    Construction(String),
    /// Namespace could not be derived from the request
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),
    #[error("Invalid repository name {name:?}: {reason}")]
    NameParse { name: String, reason: String },
    #[error("Invalid digest {0:?}")]
    InvalidDigest(String),
    #[error("Unexpected reference type: {0}")]
    UnexpectedReferenceType(String),
    /// Challenge ping or token exchange failure
    #[error("Upstream authentication error: {0}")]
    UpstreamAuth(String),
    /// Origin unreachable or answered with an error
    #[error("Remote fetch error: {0}")]
    RemoteFetch(String),
    #[error("Blob unknown to registry: {0}")]
    BlobUnknown(Digest),
    #[error("Manifest unknown: {0}")]
    ManifestUnknown(String),
    #[error("Tag unknown: {0}")]
    TagUnknown(String),
    #[error("Path not found: {0}")]
    PathNotFound(String),
    #[error("Local storage error: {0}")]
    LocalStore(String),
    #[error("Digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: Digest, computed: Digest },
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("Scheduler error: {0}")]
    Scheduler(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("No http request in context")]
    NoRequestInContext,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ProxyError {
    /// True for every "content does not exist" flavour of error.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProxyError::BlobUnknown(_)
                | ProxyError::ManifestUnknown(_)
                | ProxyError::TagUnknown(_)
                | ProxyError::PathNotFound(_)
        )
    }

    pub fn name_parse(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::NameParse {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::RemoteFetch(err.to_string())
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for ProxyError {
    fn from(err: base64::DecodeError) -> Self {
        ProxyError::Config(format!("Invalid base64 credential: {}", err))
    }
}
