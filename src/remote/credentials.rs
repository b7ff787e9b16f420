//! Upstream credentials

use crate::config::ProxyCredential;
use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use url::Url;

pub trait CredentialStore: Send + Sync {
    /// Username and password to present to `url`, if any are configured
    fn basic(&self, url: &Url) -> Option<(String, String)>;

    fn refresh_token(&self, url: &Url, service: &str) -> Option<String>;

    fn set_refresh_token(&self, url: &Url, service: &str, token: &str);
}

/// `host[:port]` of a URL, the key credentials are looked up by
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Credentials keyed by upstream host
#[derive(Default)]
pub struct NamespaceCredentials {
    credentials: HashMap<String, (String, String)>,
    refresh_tokens: RwLock<HashMap<String, String>>,
}

impl NamespaceCredentials {
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl CredentialStore for NamespaceCredentials {
    fn basic(&self, url: &Url) -> Option<(String, String)> {
        host_key(url).and_then(|key| self.credentials.get(&key).cloned())
    }

    fn refresh_token(&self, url: &Url, service: &str) -> Option<String> {
        let key = format!("{}|{}", host_key(url)?, service);
        self.refresh_tokens.read().ok()?.get(&key).cloned()
    }

    fn set_refresh_token(&self, url: &Url, service: &str, token: &str) {
        let Some(host) = host_key(url) else {
            return;
        };
        if let Ok(mut guard) = self.refresh_tokens.write() {
            guard.insert(format!("{}|{}", host, service), token.to_string());
        }
    }
}

/// Build a credential store from configured credentials. Keys may be full
/// URLs (`https://registry-1.docker.io`) or bare hosts (`ghcr.io`);
/// anonymous entries are skipped.
pub fn configure_auth(configured: &HashMap<String, ProxyCredential>) -> Result<NamespaceCredentials> {
    let mut credentials = HashMap::new();
    for (origin, credential) in configured {
        let Some(pair) = credential.resolve()? else {
            continue;
        };

        let url = if origin.contains("://") {
            Url::parse(origin)?
        } else {
            Url::parse(&format!("https://{}", origin))?
        };
        let key = host_key(&url).ok_or_else(|| {
            ProxyError::Config(format!("Credential origin has no host: {}", origin))
        })?;
        tracing::debug!(host = %key, user = %pair.0, "configured upstream credentials");
        credentials.insert(key, pair);
    }

    Ok(NamespaceCredentials {
        credentials,
        refresh_tokens: RwLock::new(HashMap::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_credentials_by_host() {
        let mut configured = HashMap::new();
        configured.insert(
            "https://registry-1.docker.io".to_string(),
            ProxyCredential::new("alice", "secret"),
        );
        configured.insert("ghcr.io".to_string(), ProxyCredential::new("bob", "token"));
        configured.insert("quay.io".to_string(), ProxyCredential::default());

        let store = configure_auth(&configured).unwrap();
        assert_eq!(store.len(), 2);

        let docker = Url::parse("https://registry-1.docker.io/v2/library/redis/blobs/x").unwrap();
        assert_eq!(
            store.basic(&docker),
            Some(("alice".to_string(), "secret".to_string()))
        );
        let ghcr = Url::parse("https://GHCR.io/v2/").unwrap();
        assert_eq!(store.basic(&ghcr).map(|(u, _)| u), Some("bob".to_string()));
        assert_eq!(store.basic(&Url::parse("https://quay.io/v2/").unwrap()), None);
    }

    #[test]
    fn remembers_refresh_tokens_per_service() {
        let store = NamespaceCredentials::default();
        let realm = Url::parse("https://auth.example.com/token").unwrap();
        assert_eq!(store.refresh_token(&realm, "registry"), None);

        store.set_refresh_token(&realm, "registry", "r1");
        assert_eq!(store.refresh_token(&realm, "registry").as_deref(), Some("r1"));
        assert_eq!(store.refresh_token(&realm, "other"), None);
    }
}
