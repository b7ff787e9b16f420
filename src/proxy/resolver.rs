//! Mapping of requested repository names onto upstream origins

use crate::context::{NAME_VAR, RequestContext};
use crate::error::{ProxyError, Result};
use crate::reference::RepositoryName;
use std::fmt;
use url::Url;

/// Query parameter naming the upstream host in namespace mode
pub const NAMESPACE_PARAM: &str = "ns";

/// One upstream registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteOrigin {
    scheme: String,
    host: String,
}

impl RemoteOrigin {
    /// Origin for a bare `host[:port]`; anything beyond the authority is rejected
    pub fn https(host: &str) -> Result<Self> {
        let url = Url::parse(&format!("https://{}", host))
            .map_err(|e| ProxyError::InvalidNamespace(format!("{}: {}", host, e)))?;
        let bare = matches!(url.path(), "" | "/")
            && url.username().is_empty()
            && url.password().is_none()
            && url.query().is_none()
            && url.fragment().is_none();
        if !bare {
            return Err(ProxyError::InvalidNamespace(format!(
                "{} is not a bare registry host",
                host
            )));
        }
        Self::from_url(&url).map_err(|_| ProxyError::InvalidNamespace(host.to_string()))
    }

    /// Scheme and authority of `url`; any path is dropped
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Construction(format!("Remote URL has no host: {}", url)))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host, with the port when it is not the scheme default
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    /// Endpoint whose challenges represent the whole origin
    pub fn ping_url(&self) -> Result<Url> {
        Ok(Url::parse(&format!("{}/v2/", self.base_url()))?)
    }
}

impl fmt::Display for RemoteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

/// Upstream origin and remote repository name for a namespace-mode request.
///
/// The origin comes from the `ns` query parameter. Without one, the first
/// path segment of the requested name must look like a domain (contain a `.`
/// after its first character) and is split off as the origin host.
pub fn extract_remote_url(ctx: &RequestContext) -> Result<(RemoteOrigin, RepositoryName)> {
    let name = ctx.string_value(NAME_VAR);
    let (namespace, remote_name) = match ctx.query_value(NAMESPACE_PARAM)? {
        Some(namespace) => (namespace, name),
        None => match name.split_once('/') {
            Some((host, rest)) if host.find('.').is_some_and(|i| i >= 1) => (host.to_string(), rest),
            _ => {
                return Err(ProxyError::InvalidNamespace(
                    "ns parameter is missing and image is not prefixed with domain".to_string(),
                ));
            }
        },
    };

    let remote_name = RepositoryName::parse(remote_name)?;
    Ok((RemoteOrigin::https(&namespace)?, remote_name))
}

/// Names and origin a repository request resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub origin: RemoteOrigin,
    /// Name of the repository on the origin
    pub remote_name: RepositoryName,
    /// Name the content is cached under locally
    pub local_name: RepositoryName,
}

#[derive(Debug, Clone)]
pub struct OriginResolver {
    static_origin: Option<RemoteOrigin>,
    enable_namespaces: bool,
}

impl OriginResolver {
    pub fn new(static_origin: Option<RemoteOrigin>, enable_namespaces: bool) -> Self {
        Self {
            static_origin,
            enable_namespaces,
        }
    }

    pub fn enable_namespaces(&self) -> bool {
        self.enable_namespaces
    }

    fn static_origin(&self) -> Result<RemoteOrigin> {
        self.static_origin
            .clone()
            .ok_or_else(|| ProxyError::Construction("No remote URL configured".to_string()))
    }

    /// Origin serving the request in `ctx`
    pub fn origin(&self, ctx: &RequestContext) -> Result<RemoteOrigin> {
        if self.enable_namespaces {
            Ok(extract_remote_url(ctx)?.0)
        } else {
            self.static_origin()
        }
    }

    pub fn resolve(&self, ctx: &RequestContext, name: &RepositoryName) -> Result<Resolution> {
        if !self.enable_namespaces {
            return Ok(Resolution {
                origin: self.static_origin()?,
                remote_name: name.clone(),
                local_name: name.clone(),
            });
        }

        let (origin, remote_name) = extract_remote_url(ctx)?;
        let local_name = RepositoryName::parse(&format!("{}/{}", origin.host(), remote_name))?;
        Ok(Resolution {
            origin,
            remote_name,
            local_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(query: &str, name: &str) -> (RequestContext, RepositoryName) {
        let url = Url::parse(&format!("http://localhost:5000/v2/{}/manifests/latest{}", name, query)).unwrap();
        let ctx = RequestContext::for_request(url).with_var(NAME_VAR, name);
        (ctx, RepositoryName::parse(name).unwrap())
    }

    fn namespaced() -> OriginResolver {
        OriginResolver::new(None, true)
    }

    #[test]
    fn single_origin_ignores_query() {
        let origin = RemoteOrigin::from_url(&Url::parse("https://mirror.example.com").unwrap()).unwrap();
        let resolver = OriginResolver::new(Some(origin.clone()), false);
        let (ctx, name) = request("?ns=h.example.com", "library/redis");

        let resolution = resolver.resolve(&ctx, &name).unwrap();
        assert_eq!(resolution.origin, origin);
        assert_eq!(resolution.remote_name, name);
        assert_eq!(resolution.local_name, name);
        assert_eq!(resolver.origin(&ctx).unwrap(), origin);
    }

    #[test]
    fn namespace_from_query_parameter() {
        let (ctx, name) = request("?ns=h.example.com", "library/redis");
        let resolution = namespaced().resolve(&ctx, &name).unwrap();

        assert_eq!(resolution.origin.base_url(), "https://h.example.com");
        assert_eq!(resolution.remote_name.as_str(), "library/redis");
        assert_eq!(resolution.local_name.as_str(), "h.example.com/library/redis");
    }

    #[test]
    fn namespace_from_domain_prefix() {
        let (ctx, name) = request("", "registry-1.docker.io/library/redis");
        let resolution = namespaced().resolve(&ctx, &name).unwrap();

        assert_eq!(resolution.origin.scheme(), "https");
        assert_eq!(resolution.origin.host(), "registry-1.docker.io");
        assert_eq!(resolution.remote_name.as_str(), "library/redis");
        assert_eq!(
            resolution.local_name.as_str(),
            "registry-1.docker.io/library/redis"
        );
    }

    #[test]
    fn rejects_names_without_domain() {
        for name in ["library/redis", ".hidden/redis"] {
            let url = Url::parse("http://localhost/v2/").unwrap();
            let ctx = RequestContext::for_request(url).with_var(NAME_VAR, name);
            assert!(matches!(
                extract_remote_url(&ctx),
                Err(ProxyError::InvalidNamespace(_))
            ));
        }
    }

    #[test]
    fn namespace_must_be_bare_host() {
        for ns in ["evil.com/x", "user@h.example.com", "user:pw@h.example.com", "h.example.com?x=1", "h.example.com#frag"] {
            assert!(
                matches!(RemoteOrigin::https(ns), Err(ProxyError::InvalidNamespace(_))),
                "{} accepted",
                ns
            );
        }
        assert_eq!(
            RemoteOrigin::https("h.example.com:5443").unwrap().host(),
            "h.example.com:5443"
        );

        let mut url = Url::parse("http://localhost/v2/library/redis/manifests/latest").unwrap();
        url.query_pairs_mut().append_pair(NAMESPACE_PARAM, "evil.com/x");
        let ctx = RequestContext::for_request(url).with_var(NAME_VAR, "library/redis");
        assert!(matches!(
            namespaced().resolve(&ctx, &RepositoryName::parse("library/redis").unwrap()),
            Err(ProxyError::InvalidNamespace(_))
        ));
    }

    #[test]
    fn surfaces_malformed_remote_names() {
        let url = Url::parse("http://localhost/v2/?ns=h.example.com").unwrap();
        let ctx = RequestContext::for_request(url).with_var(NAME_VAR, "Library/Redis");
        assert!(matches!(
            extract_remote_url(&ctx),
            Err(ProxyError::NameParse { .. })
        ));
    }

    #[test]
    fn namespace_mode_requires_request() {
        let ctx = RequestContext::background().with_var(NAME_VAR, "docker.io/library/redis");
        assert!(matches!(
            namespaced().origin(&ctx),
            Err(ProxyError::NoRequestInContext)
        ));
    }
}
