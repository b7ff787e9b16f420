//! Pull-through manifest store

use super::challenger::AuthChallenger;
use crate::context::RequestContext;
use crate::digest::Digest;
use crate::distribution::ManifestService;
use crate::error::{ProxyError, Result};
use crate::reference::{CanonicalReference, Manifest, RepositoryName};
use crate::scheduler::TtlScheduler;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub struct ProxyManifestStore {
    pub(crate) ctx: RequestContext,
    pub(crate) repository_name: RepositoryName,
    pub(crate) local: Arc<dyn ManifestService>,
    pub(crate) remote: Arc<dyn ManifestService>,
    pub(crate) scheduler: TtlScheduler,
    pub(crate) ttl: Duration,
    pub(crate) challenger: Arc<dyn AuthChallenger>,
}

#[async_trait]
impl ManifestService for ProxyManifestStore {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        if self.local.exists(digest).await? {
            return Ok(true);
        }
        self.challenger.try_establish_challenges(&self.ctx).await?;
        self.remote.exists(digest).await
    }

    async fn get(&self, digest: &Digest) -> Result<Manifest> {
        match self.local.get(digest).await {
            Ok(manifest) => return Ok(manifest),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.challenger.try_establish_challenges(&self.ctx).await?;
        let manifest = self.remote.get(digest).await?;
        self.local.put(&manifest).await?;
        tracing::info!(
            parent: self.ctx.span(),
            repository = %self.repository_name,
            digest = %digest,
            media_type = manifest.media_type(),
            "cached manifest from upstream"
        );

        let reference = CanonicalReference::new(self.repository_name.clone(), digest.clone());
        if let Err(e) = self.scheduler.add_manifest(&reference, self.ttl).await {
            tracing::error!(parent: self.ctx.span(), digest = %digest, error = %e, "failed to schedule manifest expiry");
        }
        Ok(manifest)
    }

    async fn put(&self, _manifest: &Manifest) -> Result<Digest> {
        Err(ProxyError::Unsupported("manifest put on pull-through cache"))
    }

    async fn delete(&self, _digest: &Digest) -> Result<()> {
        Err(ProxyError::Unsupported("manifest delete on pull-through cache"))
    }
}
