//! Standardized error handling for upstream responses and configuration input

use crate::error::{ProxyError, Result};
use reqwest::StatusCode;

/// Standard error handler for upstream HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Map a non-success upstream status to an error.
    ///
    /// `not_found` builds the kind-specific "unknown" error for 404s so that
    /// callers can tell a missing blob from a broken origin.
    pub fn handle_registry_error<F>(
        status: StatusCode,
        error_text: &str,
        operation: &str,
        not_found: F,
    ) -> ProxyError
    where
        F: FnOnce() -> ProxyError,
    {
        match status.as_u16() {
            401 => ProxyError::UpstreamAuth(format!(
                "Unauthorized to perform {}: {}",
                operation, error_text
            )),
            403 => ProxyError::UpstreamAuth(format!(
                "Forbidden: insufficient permissions for {}: {}",
                operation, error_text
            )),
            404 => not_found(),
            429 => ProxyError::RemoteFetch(format!(
                "Rate limited during {}: {}",
                operation, error_text
            )),
            500 => ProxyError::RemoteFetch(format!(
                "Registry server error during {}: {}",
                operation, error_text
            )),
            502 | 503 => ProxyError::RemoteFetch(format!(
                "Registry unavailable for {}: {}",
                operation, error_text
            )),
            _ => ProxyError::RemoteFetch(format!(
                "{} failed (status {}): {}",
                operation, status, error_text
            )),
        }
    }

    /// Handle token endpoint errors
    pub fn handle_auth_error(status: StatusCode, error_text: &str) -> ProxyError {
        let error_msg = match status.as_u16() {
            400 => "Invalid token request parameters".to_string(),
            401 => "Invalid credentials provided".to_string(),
            403 => "Access denied - insufficient permissions".to_string(),
            404 => "Authentication endpoint not found".to_string(),
            _ => format!("Authentication failed (status {}): {}", status, error_text),
        };

        ProxyError::UpstreamAuth(error_msg)
    }
}

/// Network error categorization
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize transport errors with the operation that triggered them
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> ProxyError {
        if error.is_timeout() {
            ProxyError::RemoteFetch(format!("{} timeout: {}", context, error))
        } else if error.is_connect() {
            ProxyError::RemoteFetch(format!("Connection error during {}: {}", context, error))
        } else if error.is_body() || error.is_decode() {
            ProxyError::RemoteFetch(format!("Body transfer error during {}: {}", context, error))
        } else {
            ProxyError::RemoteFetch(format!("{} network error: {}", context, error))
        }
    }
}

/// Validation error utilities
pub struct ValidationErrorHandler;

impl ValidationErrorHandler {
    /// Remote URLs must carry an http(s) scheme and a host
    pub fn validate_remote_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(ProxyError::Config("Remote URL cannot be empty".to_string()));
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ProxyError::Config(format!(
                "Remote URL must include protocol (http:// or https://): {}",
                url
            )));
        }

        Ok(())
    }

    pub fn validate_credentials(
        username: &Option<String>,
        password: &Option<String>,
    ) -> Result<()> {
        match (username, password) {
            (Some(_), None) => Err(ProxyError::Config(
                "Password is required when username is provided".to_string(),
            )),
            (None, Some(_)) => Err(ProxyError::Config(
                "Username is required when password is provided".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
