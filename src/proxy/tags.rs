//! Pull-through tag service

use super::challenger::AuthChallenger;
use crate::context::RequestContext;
use crate::distribution::TagService;
use crate::error::{ProxyError, Result};
use crate::reference::Descriptor;
use async_trait::async_trait;
use std::sync::Arc;

/// Tags are resolved local-first and remembered locally; they carry no TTL
pub struct ProxyTagService {
    pub(crate) ctx: RequestContext,
    pub(crate) local: Arc<dyn TagService>,
    pub(crate) remote: Arc<dyn TagService>,
    pub(crate) challenger: Arc<dyn AuthChallenger>,
}

#[async_trait]
impl TagService for ProxyTagService {
    async fn get(&self, tag: &str) -> Result<Descriptor> {
        match self.local.get(tag).await {
            Ok(descriptor) => return Ok(descriptor),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.challenger.try_establish_challenges(&self.ctx).await?;
        let descriptor = self.remote.get(tag).await?;
        if let Err(e) = self.local.tag(tag, &descriptor).await {
            tracing::warn!(parent: self.ctx.span(), tag, error = %e, "failed to cache tag locally");
        }
        Ok(descriptor)
    }

    async fn tag(&self, _tag: &str, _descriptor: &Descriptor) -> Result<()> {
        Err(ProxyError::Unsupported("tag on pull-through cache"))
    }

    async fn untag(&self, _tag: &str) -> Result<()> {
        Err(ProxyError::Unsupported("untag on pull-through cache"))
    }

    /// Remote listing when the origin is reachable, local listing otherwise
    async fn all(&self) -> Result<Vec<String>> {
        if self.challenger.try_establish_challenges(&self.ctx).await.is_ok() {
            match self.remote.all().await {
                Ok(tags) => return Ok(tags),
                Err(e) => {
                    tracing::debug!(parent: self.ctx.span(), error = %e, "remote tag list failed, using local tags");
                }
            }
        }
        self.local.all().await
    }
}
