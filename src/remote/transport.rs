//! HTTP transport that authorizes requests against cached upstream challenges

use super::challenge::ChallengeManager;
use super::credentials::CredentialStore;
use super::token::TokenHandler;
use crate::error::Result;
use reqwest::{Method, RequestBuilder};
use std::sync::Arc;
use url::Url;

pub struct AuthorizingTransport {
    client: reqwest::Client,
    challenges: Arc<dyn ChallengeManager>,
    credentials: Arc<dyn CredentialStore>,
    tokens: TokenHandler,
}

impl AuthorizingTransport {
    /// Transport authorizing pulls of `repository`
    pub fn new(
        client: reqwest::Client,
        challenges: Arc<dyn ChallengeManager>,
        credentials: Arc<dyn CredentialStore>,
        repository: &str,
    ) -> Self {
        let tokens = TokenHandler::new(client.clone(), credentials.clone(), repository);
        Self {
            client,
            challenges,
            credentials,
            tokens,
        }
    }

    pub fn scope(&self) -> &str {
        self.tokens.scope()
    }

    /// Start a request to `url` carrying whatever `Authorization` the
    /// origin's cached challenges call for. Origins with no cached
    /// challenges get an anonymous request.
    pub async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        let mut ping = url.clone();
        ping.set_path("/v2/");
        ping.set_query(None);

        let request = self.client.request(method, url.clone());
        for challenge in self.challenges.get_challenges(&ping)? {
            match challenge.scheme.as_str() {
                "bearer" => {
                    let token = self.tokens.token(&challenge, &url).await?;
                    return Ok(request.bearer_auth(token));
                }
                "basic" => {
                    if let Some((username, password)) = self.credentials.basic(&url) {
                        return Ok(request.basic_auth(username, Some(password)));
                    }
                }
                other => tracing::debug!(scheme = other, "ignoring unsupported challenge scheme"),
            }
        }
        Ok(request)
    }
}
