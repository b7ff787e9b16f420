//! Per-request context
//!
//! Carries the inbound request URL, the path variables extracted by the
//! router (the repository name lives under [`NAME_VAR`]) and the tracing span
//! that per-request log lines are emitted in.

use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Span;
use url::Url;

/// Path variable holding the repository name of the request
pub const NAME_VAR: &str = "vars.name";

#[derive(Debug, Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    request_url: Option<Url>,
    vars: HashMap<String, String>,
    span: Span,
}

impl RequestContext {
    /// Context with no inbound request, used by background work such as TTL expiry
    pub fn background() -> Self {
        Self::build(None, HashMap::new())
    }

    pub fn for_request(request_url: Url) -> Self {
        Self::build(Some(request_url), HashMap::new())
    }

    /// Return a copy of this context with an extra path variable
    pub fn with_var(&self, key: &str, value: &str) -> Self {
        let mut vars = self.inner.vars.clone();
        vars.insert(key.to_string(), value.to_string());
        Self::build(self.inner.request_url.clone(), vars)
    }

    fn build(request_url: Option<Url>, vars: HashMap<String, String>) -> Self {
        let span = tracing::info_span!(
            "request",
            url = request_url.as_ref().map(|u| u.path().to_string()),
            name = vars.get(NAME_VAR).map(String::as_str),
        );
        Self {
            inner: Arc::new(ContextInner {
                request_url,
                vars,
                span,
            }),
        }
    }

    pub fn request_url(&self) -> Result<&Url> {
        self.inner
            .request_url
            .as_ref()
            .ok_or(ProxyError::NoRequestInContext)
    }

    /// First value of a query parameter of the inbound request, empty values ignored
    pub fn query_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .request_url()?
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty()))
    }

    /// Named string variable, empty when absent
    pub fn string_value(&self, key: &str) -> &str {
        self.inner.vars.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_query_and_vars() {
        let url = Url::parse("http://localhost/v2/library/redis/manifests/7?ns=h.example.com").unwrap();
        let ctx = RequestContext::for_request(url).with_var(NAME_VAR, "library/redis");

        assert_eq!(ctx.query_value("ns").unwrap().as_deref(), Some("h.example.com"));
        assert_eq!(ctx.query_value("missing").unwrap(), None);
        assert_eq!(ctx.string_value(NAME_VAR), "library/redis");
        assert_eq!(ctx.string_value("vars.reference"), "");
    }

    #[test]
    fn background_context_has_no_request() {
        let ctx = RequestContext::background();
        assert!(matches!(ctx.query_value("ns"), Err(ProxyError::NoRequestInContext)));
    }
}
