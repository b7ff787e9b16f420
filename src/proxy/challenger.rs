//! Lazy negotiation of upstream authentication challenges

use super::resolver::OriginResolver;
use crate::context::RequestContext;
use crate::error::Result;
use crate::remote::{ChallengeManager, CredentialStore, ping};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Instrument;

/// Establishes which challenges an upstream requires before it is fetched from
#[async_trait]
pub trait AuthChallenger: Send + Sync {
    /// Probe the request's origin unless its challenges are already cached
    async fn try_establish_challenges(&self, ctx: &RequestContext) -> Result<()>;

    fn challenge_manager(&self) -> Arc<dyn ChallengeManager>;

    fn credential_store(&self) -> Arc<dyn CredentialStore>;
}

/// One negotiation at a time, across every origin it serves
pub struct RemoteAuthChallenger {
    resolver: OriginResolver,
    client: reqwest::Client,
    lock: Mutex<()>,
    manager: Arc<dyn ChallengeManager>,
    credentials: Arc<dyn CredentialStore>,
}

impl RemoteAuthChallenger {
    pub fn new(
        resolver: OriginResolver,
        client: reqwest::Client,
        manager: Arc<dyn ChallengeManager>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            resolver,
            client,
            lock: Mutex::new(()),
            manager,
            credentials,
        }
    }
}

#[async_trait]
impl AuthChallenger for RemoteAuthChallenger {
    async fn try_establish_challenges(&self, ctx: &RequestContext) -> Result<()> {
        let _guard = self.lock.lock().await;

        let endpoint = self.resolver.origin(ctx)?.ping_url()?;
        if !self.manager.get_challenges(&endpoint)?.is_empty() {
            return Ok(());
        }

        ping(&self.client, self.manager.as_ref(), &endpoint)
            .instrument(ctx.span().clone())
            .await?;
        tracing::info!(parent: ctx.span(), endpoint = %endpoint, "challenge established with upstream");
        Ok(())
    }

    fn challenge_manager(&self) -> Arc<dyn ChallengeManager> {
        self.manager.clone()
    }

    fn credential_store(&self) -> Arc<dyn CredentialStore> {
        self.credentials.clone()
    }
}
