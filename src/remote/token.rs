//! Bearer token acquisition for repository-scoped pulls

use super::challenge::Challenge;
use super::credentials::CredentialStore;
use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{ProxyError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

/// Tokens that do not state a lifetime, or state a shorter one, are kept this long
pub const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

const CLIENT_ID: &str = "registry-proxy";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct TokenHandler {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialStore>,
    scope: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl TokenHandler {
    /// Handler requesting `repository:<repository>:pull`
    pub fn new(client: reqwest::Client, credentials: Arc<dyn CredentialStore>, repository: &str) -> Self {
        Self {
            client,
            credentials,
            scope: format!("repository:{}:pull", repository),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Token satisfying a bearer `challenge` from `registry`, cached until expiry
    pub async fn token(&self, challenge: &Challenge, registry: &Url) -> Result<String> {
        let realm = challenge
            .parameter("realm")
            .ok_or_else(|| ProxyError::UpstreamAuth("Bearer challenge without realm".to_string()))?;
        let realm = Url::parse(realm)
            .map_err(|e| ProxyError::UpstreamAuth(format!("Invalid token realm {}: {}", realm, e)))?;
        let service = challenge.parameter("service").unwrap_or_default();

        let key = format!("{}|{}|{}", realm, service, self.scope);
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&key) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let response = self.fetch(&realm, service, registry).await?;
        let token = response
            .token
            .or(response.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProxyError::UpstreamAuth(format!("No token in response from {}", realm)))?;
        if let Some(refresh) = &response.refresh_token {
            self.credentials.set_refresh_token(&realm, service, refresh);
        }

        let lifetime = response
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(MIN_TOKEN_LIFETIME)
            .max(MIN_TOKEN_LIFETIME);
        tracing::debug!(realm = %realm, scope = %self.scope, expires_in = lifetime.as_secs(), "obtained upstream token");

        cache.insert(
            key,
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + lifetime,
            },
        );
        Ok(token)
    }

    async fn fetch(&self, realm: &Url, service: &str, registry: &Url) -> Result<TokenResponse> {
        let request = match self.credentials.refresh_token(realm, service) {
            Some(refresh) => self.client.post(realm.clone()).form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.as_str()),
                ("service", service),
                ("scope", self.scope.as_str()),
                ("client_id", CLIENT_ID),
            ]),
            None => {
                let mut url = realm.clone();
                {
                    let mut query = url.query_pairs_mut();
                    if !service.is_empty() {
                        query.append_pair("service", service);
                    }
                    query.append_pair("scope", &self.scope);
                }

                let mut request = self.client.get(url);
                let credentials = self
                    .credentials
                    .basic(realm)
                    .or_else(|| self.credentials.basic(registry));
                if let Some((username, password)) = credentials {
                    request = request.basic_auth(username, Some(password));
                }
                request
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "token request"))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(HttpErrorHandler::handle_auth_error(status, &error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ProxyError::UpstreamAuth(format!("Failed to parse token response: {}", e)))
    }
}
