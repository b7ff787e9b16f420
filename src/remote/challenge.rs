//! Authentication challenges advertised by upstream registries

use crate::error::{ProxyError, Result};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};
use std::collections::HashMap;
use std::sync::RwLock;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Lowercased scheme, e.g. `bearer` or `basic`
    pub scheme: String,
    pub parameters: HashMap<String, String>,
}

impl Challenge {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// Parse every challenge in a `WWW-Authenticate` header value, e.g.
/// `Bearer realm="https://auth.example.com/token",service="registry.example.com"`
pub fn parse_www_authenticate(header: &str) -> Vec<Challenge> {
    let mut challenges = Vec::new();
    let mut rest = header.trim_start();

    while !rest.is_empty() {
        let (scheme, after_scheme) = take_token(rest);
        if scheme.is_empty() {
            break;
        }
        let mut challenge = Challenge {
            scheme: scheme.to_ascii_lowercase(),
            parameters: HashMap::new(),
        };
        rest = after_scheme.trim_start();

        loop {
            let (key, after_key) = take_token(rest);
            let after_key = after_key.trim_start();
            // A token not followed by '=' starts the next challenge
            if key.is_empty() || !after_key.starts_with('=') {
                break;
            }
            let raw_value = after_key[1..].trim_start();
            let (value, after_value) = match raw_value.strip_prefix('"') {
                Some(quoted) => take_quoted(quoted),
                None => {
                    let (token, after) = take_token(raw_value);
                    (token.to_string(), after)
                }
            };
            challenge.parameters.insert(key.to_ascii_lowercase(), value);

            rest = after_value.trim_start();
            match rest.strip_prefix(',') {
                Some(next) => rest = next.trim_start(),
                None => break,
            }
        }

        challenges.push(challenge);
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    challenges
}

fn take_token(input: &str) -> (&str, &str) {
    let end = input
        .find(|c: char| c.is_whitespace() || matches!(c, ',' | '=' | '"'))
        .unwrap_or(input.len());
    input.split_at(end)
}

fn take_quoted(input: &str) -> (String, &str) {
    let mut value = String::new();
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        match c {
            _ if escaped => {
                value.push(c);
                escaped = false;
            }
            '\\' => escaped = true,
            '"' => return (value, &input[i + 1..]),
            _ => value.push(c),
        }
    }
    (value, "")
}

/// Cache of the challenges each upstream endpoint answered with
pub trait ChallengeManager: Send + Sync {
    fn get_challenges(&self, endpoint: &Url) -> Result<Vec<Challenge>>;

    /// Record the challenges of a response; only 401 responses carry any
    fn add_response(&self, endpoint: &Url, status: StatusCode, headers: &HeaderMap) -> Result<()>;
}

#[derive(Default)]
pub struct SimpleChallengeManager {
    challenges: RwLock<HashMap<String, Vec<Challenge>>>,
}

impl SimpleChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `scheme://host:port/path`, with the default port filled in
fn normalize_endpoint(endpoint: &Url) -> Result<String> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| ProxyError::UpstreamAuth(format!("Endpoint has no host: {}", endpoint)))?;
    let port = endpoint.port_or_known_default().unwrap_or(443);
    Ok(format!(
        "{}://{}:{}{}",
        endpoint.scheme(),
        host.to_ascii_lowercase(),
        port,
        endpoint.path()
    ))
}

fn lock_poisoned() -> ProxyError {
    ProxyError::UpstreamAuth("Challenge cache lock poisoned".to_string())
}

impl ChallengeManager for SimpleChallengeManager {
    fn get_challenges(&self, endpoint: &Url) -> Result<Vec<Challenge>> {
        let key = normalize_endpoint(endpoint)?;
        let guard = self.challenges.read().map_err(|_| lock_poisoned())?;
        Ok(guard.get(&key).cloned().unwrap_or_default())
    }

    fn add_response(&self, endpoint: &Url, status: StatusCode, headers: &HeaderMap) -> Result<()> {
        if status != StatusCode::UNAUTHORIZED {
            return Ok(());
        }

        let challenges: Vec<Challenge> = headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(parse_www_authenticate)
            .collect();

        let key = normalize_endpoint(endpoint)?;
        let mut guard = self.challenges.write().map_err(|_| lock_poisoned())?;
        guard.insert(key, challenges);
        Ok(())
    }
}

/// Probe `endpoint` without credentials and record the challenges it answers with
pub async fn ping(
    client: &reqwest::Client,
    manager: &dyn ChallengeManager,
    endpoint: &Url,
) -> Result<()> {
    let response = client.get(endpoint.clone()).send().await.map_err(|e| {
        ProxyError::UpstreamAuth(format!("Challenge ping to {} failed: {}", endpoint, e))
    })?;

    tracing::debug!(endpoint = %endpoint, status = %response.status(), "challenge ping answered");
    manager.add_response(endpoint, response.status(), response.headers())
}
