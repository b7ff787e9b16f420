//! Proxy configuration
//!
//! Mirrors the `proxy` section of a registry configuration: a single remote
//! origin with optional flat credentials, or namespace mode with credentials
//! keyed by upstream host.

use crate::error::handlers::ValidationErrorHandler;
use crate::error::{ProxyError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Default lifetime of a cached blob or manifest: one week
pub const DEFAULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Upper bound on a configured TTL: one hundred years
pub const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredential {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// docker config style `base64(user:pass)`
    #[serde(default)]
    pub auth: Option<String>,
}

impl ProxyCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            auth: None,
        }
    }

    /// Resolve to a username/password pair, decoding `auth` when present.
    /// Empty credentials resolve to `None`.
    pub fn resolve(&self) -> Result<Option<(String, String)>> {
        if let Some(auth) = &self.auth {
            let decoded = String::from_utf8(STANDARD.decode(auth.trim())?)
                .map_err(|e| ProxyError::Config(format!("Credential is not UTF-8: {}", e)))?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| {
                ProxyError::Config("Credential auth field must encode user:password".to_string())
            })?;
            return Ok(Some((username.to_string(), password.to_string())));
        }

        ValidationErrorHandler::validate_credentials(&self.username, &self.password)?;
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() => {
                Ok(Some((username.clone(), password.clone())))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub remote_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub enable_namespaces: bool,
    pub namespace_credentials: HashMap<String, ProxyCredential>,
    pub ttl_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            username: None,
            password: None,
            enable_namespaces: false,
            namespace_credentials: HashMap::new(),
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

impl ProxyConfig {
    /// Single-origin configuration
    pub fn single(remote_url: impl Into<String>) -> Self {
        Self {
            remote_url: remote_url.into(),
            ..Self::default()
        }
    }

    /// Namespace-mode configuration; the origin is derived per request
    pub fn namespaced(namespace_credentials: HashMap<String, ProxyCredential>) -> Self {
        Self {
            enable_namespaces: true,
            namespace_credentials,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs();
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: ProxyConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let enable_namespaces = env::var("PROXY_ENABLE_NAMESPACES").is_ok_and(|v| v == "true");
        let ttl_secs = match env::var("PROXY_TTL_SECS") {
            Ok(v) => v
                .parse::<u64>()
                .map_err(|e| ProxyError::Config(format!("PROXY_TTL_SECS: {}", e)))?,
            Err(_) => DEFAULT_TTL_SECS,
        };

        let config = ProxyConfig {
            remote_url: env::var("PROXY_REMOTE_URL").unwrap_or_default(),
            username: env::var("PROXY_USERNAME").ok(),
            password: env::var("PROXY_PASSWORD").ok(),
            enable_namespaces,
            namespace_credentials: HashMap::new(),
            ttl_secs,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enable_namespaces || !self.remote_url.is_empty() {
            ValidationErrorHandler::validate_remote_url(&self.remote_url)?;
        }
        ValidationErrorHandler::validate_credentials(&self.username, &self.password)?;
        if self.ttl_secs == 0 {
            return Err(ProxyError::Config("TTL must be greater than 0".to_string()));
        }
        if self.ttl_secs > MAX_TTL_SECS {
            return Err(ProxyError::Config(format!(
                "TTL of {}s exceeds the maximum of {}s",
                self.ttl_secs, MAX_TTL_SECS
            )));
        }
        Ok(())
    }

    /// Credentials keyed by origin. Outside namespace mode this is the single
    /// remote URL mapped to the top-level username/password.
    pub fn effective_credentials(&self) -> HashMap<String, ProxyCredential> {
        if self.enable_namespaces {
            return self.namespace_credentials.clone();
        }

        let mut credentials = HashMap::new();
        credentials.insert(
            self.remote_url.clone(),
            ProxyCredential {
                username: self.username.clone(),
                password: self.password.clone(),
                auth: None,
            },
        );
        credentials
    }
}
