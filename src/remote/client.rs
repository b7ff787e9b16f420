//! Read-only repository client for an upstream registry

use super::transport::AuthorizingTransport;
use crate::digest::Digest;
use crate::distribution::{
    BlobStore, BlobStream, BlobWriter, ManifestOption, ManifestService, Repository, TagService,
};
use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{ProxyError, Result};
use crate::reference::{
    Descriptor, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_OCTET_STREAM, Manifest, RepositoryName, validate_tag,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Standard Accept header for manifest requests
pub fn manifest_accept_header() -> String {
    [
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_DOCKER_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    ]
    .join(", ")
}

struct Endpoint {
    name: RepositoryName,
    base: String,
    transport: Arc<AuthorizingTransport>,
}

impl Endpoint {
    fn url(&self, suffix: &str) -> Result<Url> {
        let url = format!("{}/v2/{}/{}", self.base, self.name, suffix);
        Url::parse(&url).map_err(|e| ProxyError::RemoteFetch(format!("Invalid upstream URL {}: {}", url, e)))
    }

    async fn send(
        &self,
        method: Method,
        suffix: &str,
        accept: Option<&str>,
        operation: &str,
    ) -> Result<Response> {
        let url = self.url(suffix)?;
        let mut request = self.transport.request(method, url).await?;
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, operation))
    }
}

/// Pass successful responses through, map the rest to errors
async fn check<F>(response: Response, operation: &str, not_found: F) -> Result<Response>
where
    F: FnOnce() -> ProxyError,
{
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());
    Err(HttpErrorHandler::handle_registry_error(
        status,
        &error_text,
        operation,
        not_found,
    ))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok())
}

fn content_type(headers: &HeaderMap) -> String {
    header_str(headers, CONTENT_TYPE.as_str())
        .unwrap_or(MEDIA_TYPE_OCTET_STREAM)
        .to_string()
}

/// Repository on a remote origin, read through an [`AuthorizingTransport`]
pub struct RemoteRepository {
    endpoint: Arc<Endpoint>,
}

impl RemoteRepository {
    pub fn new(name: RepositoryName, base_url: &str, transport: Arc<AuthorizingTransport>) -> Result<Self> {
        let base = Url::parse(base_url)?;
        if base.host_str().is_none() {
            return Err(ProxyError::Config(format!("Remote URL has no host: {}", base_url)));
        }
        Ok(Self {
            endpoint: Arc::new(Endpoint {
                name,
                base: base.as_str().trim_end_matches('/').to_string(),
                transport,
            }),
        })
    }

    /// Origin base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.endpoint.base
    }

    pub fn transport(&self) -> &Arc<AuthorizingTransport> {
        &self.endpoint.transport
    }
}

impl Repository for RemoteRepository {
    fn named(&self) -> &RepositoryName {
        &self.endpoint.name
    }

    fn blobs(&self) -> Arc<dyn BlobStore> {
        Arc::new(RemoteBlobStore {
            endpoint: self.endpoint.clone(),
        })
    }

    fn manifests(&self, _options: &[ManifestOption]) -> Result<Arc<dyn ManifestService>> {
        Ok(Arc::new(RemoteManifestService {
            endpoint: self.endpoint.clone(),
        }))
    }

    fn tags(&self) -> Arc<dyn TagService> {
        Arc::new(RemoteTagService {
            endpoint: self.endpoint.clone(),
        })
    }
}

pub struct RemoteBlobStore {
    endpoint: Arc<Endpoint>,
}

#[async_trait]
impl BlobStore for RemoteBlobStore {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        let response = self
            .endpoint
            .send(Method::HEAD, &format!("blobs/{}", digest), None, "blob stat")
            .await?;
        let response = check(response, "blob stat", || ProxyError::BlobUnknown(digest.clone())).await?;
        let headers = response.headers();
        Ok(Descriptor {
            media_type: content_type(headers),
            digest: digest.clone(),
            size: content_length(headers).unwrap_or(0),
        })
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        let response = self
            .endpoint
            .send(Method::GET, &format!("blobs/{}", digest), None, "blob fetch")
            .await?;
        let response = check(response, "blob fetch", || ProxyError::BlobUnknown(digest.clone())).await?;
        let content = response
            .bytes()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "blob fetch"))?;
        digest.verify(&content)?;
        Ok(content)
    }

    async fn open(&self, digest: &Digest) -> Result<BlobStream> {
        let response = self
            .endpoint
            .send(Method::GET, &format!("blobs/{}", digest), None, "blob fetch")
            .await?;
        let response = check(response, "blob fetch", || ProxyError::BlobUnknown(digest.clone())).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| NetworkErrorHandler::handle_network_error(&e, "blob fetch")))
            .boxed())
    }

    async fn put(&self, _media_type: &str, _content: Bytes) -> Result<Descriptor> {
        Err(ProxyError::Unsupported("blob put on remote repository"))
    }

    async fn create(&self) -> Result<Box<dyn BlobWriter>> {
        Err(ProxyError::Unsupported("blob upload on remote repository"))
    }

    async fn delete(&self, _digest: &Digest) -> Result<()> {
        Err(ProxyError::Unsupported("blob delete on remote repository"))
    }
}

pub struct RemoteManifestService {
    endpoint: Arc<Endpoint>,
}

#[async_trait]
impl ManifestService for RemoteManifestService {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        let accept = manifest_accept_header();
        let response = self
            .endpoint
            .send(
                Method::HEAD,
                &format!("manifests/{}", digest),
                Some(&accept),
                "manifest stat",
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response, "manifest stat", || ProxyError::ManifestUnknown(digest.to_string())).await?;
        Ok(true)
    }

    async fn get(&self, digest: &Digest) -> Result<Manifest> {
        let accept = manifest_accept_header();
        let response = self
            .endpoint
            .send(
                Method::GET,
                &format!("manifests/{}", digest),
                Some(&accept),
                "manifest fetch",
            )
            .await?;
        let response = check(response, "manifest fetch", || {
            ProxyError::ManifestUnknown(digest.to_string())
        })
        .await?;

        let media_type = content_type(response.headers());
        let payload = response
            .bytes()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "manifest fetch"))?;
        digest.verify(&payload)?;

        if media_type == MEDIA_TYPE_OCTET_STREAM || media_type.is_empty() {
            Manifest::from_payload(payload)
        } else {
            Ok(Manifest::new(media_type, payload))
        }
    }

    async fn put(&self, _manifest: &Manifest) -> Result<Digest> {
        Err(ProxyError::Unsupported("manifest put on remote repository"))
    }

    async fn delete(&self, _digest: &Digest) -> Result<()> {
        Err(ProxyError::Unsupported("manifest delete on remote repository"))
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub struct RemoteTagService {
    endpoint: Arc<Endpoint>,
}

impl RemoteTagService {
    /// Fallback for origins that omit `Docker-Content-Digest` on HEAD
    async fn get_by_content(&self, tag: &str, accept: &str) -> Result<Descriptor> {
        let response = self
            .endpoint
            .send(Method::GET, &format!("manifests/{}", tag), Some(accept), "tag fetch")
            .await?;
        let response = check(response, "tag fetch", || ProxyError::TagUnknown(tag.to_string())).await?;
        let media_type = content_type(response.headers());
        let payload = response
            .bytes()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "tag fetch"))?;
        Ok(Descriptor {
            media_type,
            digest: Digest::from_bytes(&payload),
            size: payload.len() as u64,
        })
    }
}

#[async_trait]
impl TagService for RemoteTagService {
    async fn get(&self, tag: &str) -> Result<Descriptor> {
        validate_tag(tag)?;
        let accept = manifest_accept_header();
        let response = self
            .endpoint
            .send(Method::HEAD, &format!("manifests/{}", tag), Some(&accept), "tag stat")
            .await?;
        let response = check(response, "tag stat", || ProxyError::TagUnknown(tag.to_string())).await?;

        let headers = response.headers();
        match header_str(headers, DOCKER_CONTENT_DIGEST) {
            Some(digest) => Ok(Descriptor {
                media_type: content_type(headers),
                digest: Digest::parse(digest)?,
                size: content_length(headers).unwrap_or(0),
            }),
            None => self.get_by_content(tag, &accept).await,
        }
    }

    async fn tag(&self, _tag: &str, _descriptor: &Descriptor) -> Result<()> {
        Err(ProxyError::Unsupported("tag on remote repository"))
    }

    async fn untag(&self, _tag: &str) -> Result<()> {
        Err(ProxyError::Unsupported("untag on remote repository"))
    }

    async fn all(&self) -> Result<Vec<String>> {
        let response = self
            .endpoint
            .send(Method::GET, "tags/list", None, "tag list")
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check(response, "tag list", || {
            ProxyError::TagUnknown(self.endpoint.name.to_string())
        })
        .await?;
        let list: TagList = response.json().await?;
        Ok(list.tags.unwrap_or_default())
    }
}
