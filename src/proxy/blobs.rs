//! Pull-through blob store

use super::challenger::AuthChallenger;
use super::inflight::InflightFetches;
use crate::context::RequestContext;
use crate::digest::Digest;
use crate::distribution::{BlobStore, BlobStream, BlobWriter};
use crate::error::{ProxyError, Result};
use crate::reference::{CanonicalReference, Descriptor, MEDIA_TYPE_OCTET_STREAM, RepositoryName};
use crate::scheduler::TtlScheduler;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

pub struct ProxyBlobStore {
    pub(crate) ctx: RequestContext,
    pub(crate) local: Arc<dyn BlobStore>,
    pub(crate) remote: Arc<dyn BlobStore>,
    pub(crate) scheduler: TtlScheduler,
    pub(crate) ttl: Duration,
    pub(crate) repository_name: RepositoryName,
    pub(crate) challenger: Arc<dyn AuthChallenger>,
    pub(crate) inflight: Arc<InflightFetches>,
}

/// `Ok(None)` when the local store does not have the content
fn local_hit<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

impl ProxyBlobStore {
    /// Make `digest` locally readable, fetching it at most once at a time
    async fn ensure_local(&self, digest: &Digest) -> Result<()> {
        if local_hit(self.local.stat(digest).await)?.is_some() {
            return Ok(());
        }

        let _fetch = self.inflight.acquire(digest.as_str()).await;
        if local_hit(self.local.stat(digest).await)?.is_some() {
            tracing::debug!(parent: self.ctx.span(), digest = %digest, "blob fetched by concurrent request");
            return Ok(());
        }

        self.fetch_from_remote(digest)
            .instrument(self.ctx.span().clone())
            .await
    }

    async fn fetch_from_remote(&self, digest: &Digest) -> Result<()> {
        self.challenger.try_establish_challenges(&self.ctx).await?;

        let mut stream = self.remote.open(digest).await?;
        let mut writer = self.local.create().await?;
        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(chunk) => writer.write(chunk).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!(digest = %digest, error = %e, "remote blob transfer failed");
                if let Err(cancel) = writer.cancel().await {
                    tracing::warn!(digest = %digest, error = %cancel, "failed to cancel blob writer");
                }
                return Err(e);
            }
        }

        let size = writer.size();
        let descriptor = writer
            .commit(Descriptor {
                media_type: MEDIA_TYPE_OCTET_STREAM.to_string(),
                digest: digest.clone(),
                size,
            })
            .await?;
        tracing::info!(
            repository = %self.repository_name,
            digest = %descriptor.digest,
            size = descriptor.size,
            "cached blob from upstream"
        );

        let reference = CanonicalReference::new(self.repository_name.clone(), digest.clone());
        if let Err(e) = self.scheduler.add_blob(&reference, self.ttl).await {
            tracing::error!(digest = %digest, error = %e, "failed to schedule blob expiry");
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for ProxyBlobStore {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        if let Some(descriptor) = local_hit(self.local.stat(digest).await)? {
            return Ok(descriptor);
        }
        self.challenger.try_establish_challenges(&self.ctx).await?;
        self.remote.stat(digest).await
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        if let Some(content) = local_hit(self.local.get(digest).await)? {
            return Ok(content);
        }
        self.ensure_local(digest).await?;
        self.local.get(digest).await
    }

    async fn open(&self, digest: &Digest) -> Result<BlobStream> {
        if let Some(stream) = local_hit(self.local.open(digest).await)? {
            return Ok(stream);
        }
        self.ensure_local(digest).await?;
        self.local.open(digest).await
    }

    async fn put(&self, _media_type: &str, _content: Bytes) -> Result<Descriptor> {
        Err(ProxyError::Unsupported("blob put on pull-through cache"))
    }

    async fn create(&self) -> Result<Box<dyn BlobWriter>> {
        Err(ProxyError::Unsupported("blob upload on pull-through cache"))
    }

    async fn delete(&self, _digest: &Digest) -> Result<()> {
        Err(ProxyError::Unsupported("blob delete on pull-through cache"))
    }
}
