//! Pull-through cache registry

use super::blobs::ProxyBlobStore;
use super::challenger::{AuthChallenger, RemoteAuthChallenger};
use super::eviction::EvictionBridge;
use super::inflight::InflightFetches;
use super::manifests::ProxyManifestStore;
use super::repository::ProxiedRepository;
use super::resolver::{OriginResolver, RemoteOrigin};
use super::tags::ProxyTagService;
use crate::config::ProxyConfig;
use crate::context::{NAME_VAR, RequestContext};
use crate::distribution::{BlobEnumerator, BlobStatter, ManifestOption, Namespace, Repository};
use crate::error::{ProxyError, Result};
use crate::reference::RepositoryName;
use crate::remote::{AuthorizingTransport, RemoteRepository, SimpleChallengeManager, configure_auth};
use crate::scheduler::TtlScheduler;
use crate::storage::{StorageDriver, Vacuum};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Where the TTL scheduler keeps its state in the storage driver
pub const SCHEDULER_STATE_PATH: &str = "/scheduler-state.json";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry that serves content from `embedded` and pulls missing content
/// through from a remote origin
pub struct ProxyingRegistry {
    embedded: Arc<dyn Namespace>,
    scheduler: TtlScheduler,
    resolver: OriginResolver,
    challenger: Arc<RemoteAuthChallenger>,
    client: reqwest::Client,
    ttl: Duration,
    inflight: Arc<InflightFetches>,
}

fn construction(err: ProxyError) -> ProxyError {
    match err {
        ProxyError::Construction(_) => err,
        other => ProxyError::Construction(other.to_string()),
    }
}

impl ProxyingRegistry {
    pub async fn new(
        embedded: Arc<dyn Namespace>,
        driver: Arc<dyn StorageDriver>,
        config: &ProxyConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("registry-proxy/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Construction(format!("Failed to create HTTP client: {}", e)))?;
        Self::with_client(embedded, driver, config, client).await
    }

    /// Build the registry and start its scheduler. Persisted expiry state is
    /// replayed before this returns.
    pub async fn with_client(
        embedded: Arc<dyn Namespace>,
        driver: Arc<dyn StorageDriver>,
        config: &ProxyConfig,
        client: reqwest::Client,
    ) -> Result<Self> {
        config.validate().map_err(construction)?;

        // The remote URL is only a placeholder in namespace mode
        let static_origin = if config.remote_url.is_empty() {
            None
        } else {
            let url = Url::parse(&config.remote_url).map_err(|e| {
                ProxyError::Construction(format!("Invalid remote URL {}: {}", config.remote_url, e))
            })?;
            Some(RemoteOrigin::from_url(&url)?)
        };

        let vacuum = Vacuum::new(driver.clone());
        let scheduler = TtlScheduler::new(driver, SCHEDULER_STATE_PATH);
        scheduler.register_listener(Arc::new(EvictionBridge::new(embedded.clone(), vacuum)));
        scheduler.start().await.map_err(construction)?;

        let credentials = configure_auth(&config.effective_credentials()).map_err(construction)?;
        let resolver = OriginResolver::new(static_origin, config.enable_namespaces);
        let challenger = Arc::new(RemoteAuthChallenger::new(
            resolver.clone(),
            client.clone(),
            Arc::new(SimpleChallengeManager::new()),
            Arc::new(credentials),
        ));

        tracing::info!(
            remote = %config.remote_url,
            namespaces = config.enable_namespaces,
            ttl_secs = config.ttl_secs,
            "pull-through cache ready"
        );

        Ok(Self {
            embedded,
            scheduler,
            resolver,
            challenger,
            client,
            ttl: config.ttl(),
            inflight: Arc::new(InflightFetches::new()),
        })
    }

    pub fn scheduler(&self) -> &TtlScheduler {
        &self.scheduler
    }

    pub fn challenger(&self) -> Arc<dyn AuthChallenger> {
        self.challenger.clone()
    }

    /// Stop expiry timers and persist scheduler state
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await
    }

    /// Resolve `name` and wire its local and remote stores together
    pub async fn proxied_repository(
        &self,
        ctx: &RequestContext,
        name: &RepositoryName,
    ) -> Result<ProxiedRepository> {
        let ctx = if ctx.string_value(NAME_VAR).is_empty() {
            ctx.with_var(NAME_VAR, name.as_str())
        } else {
            ctx.clone()
        };

        let resolution = self.resolver.resolve(&ctx, name)?;
        let challenger: Arc<dyn AuthChallenger> = self.challenger.clone();
        let transport = Arc::new(AuthorizingTransport::new(
            self.client.clone(),
            challenger.challenge_manager(),
            challenger.credential_store(),
            resolution.remote_name.as_str(),
        ));

        let local = self.embedded.repository(&ctx, &resolution.local_name).await?;
        let local_manifests = local.manifests(&[ManifestOption::SkipLayerVerification])?;

        let remote = Arc::new(RemoteRepository::new(
            resolution.remote_name.clone(),
            &resolution.origin.base_url(),
            transport,
        )?);
        let remote_manifests = remote.manifests(&[])?;

        tracing::debug!(
            parent: ctx.span(),
            local = %resolution.local_name,
            remote = %resolution.remote_name,
            origin = %resolution.origin,
            "opened proxied repository"
        );

        Ok(ProxiedRepository {
            name: resolution.local_name.clone(),
            blobs: Arc::new(ProxyBlobStore {
                ctx: ctx.clone(),
                local: local.blobs(),
                remote: remote.blobs(),
                scheduler: self.scheduler.clone(),
                ttl: self.ttl,
                repository_name: resolution.local_name.clone(),
                challenger: challenger.clone(),
                inflight: self.inflight.clone(),
            }),
            manifests: Arc::new(ProxyManifestStore {
                ctx: ctx.clone(),
                repository_name: resolution.local_name.clone(),
                local: local_manifests,
                remote: remote_manifests,
                scheduler: self.scheduler.clone(),
                ttl: self.ttl,
                challenger: challenger.clone(),
            }),
            tags: Arc::new(ProxyTagService {
                ctx,
                local: local.tags(),
                remote: remote.tags(),
                challenger,
            }),
            remote,
        })
    }
}

#[async_trait]
impl Namespace for ProxyingRegistry {
    async fn repository(
        &self,
        ctx: &RequestContext,
        name: &RepositoryName,
    ) -> Result<Box<dyn Repository>> {
        Ok(Box::new(self.proxied_repository(ctx, name).await?))
    }

    async fn repositories(&self, last: Option<&str>, n: usize) -> Result<Vec<String>> {
        self.embedded.repositories(last, n).await
    }

    fn blobs(&self) -> Arc<dyn BlobEnumerator> {
        self.embedded.blobs()
    }

    fn blob_statter(&self) -> Arc<dyn BlobStatter> {
        self.embedded.blob_statter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryDriver, LocalRegistry};

    async fn registry(config: &ProxyConfig) -> ProxyingRegistry {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let local = Arc::new(LocalRegistry::new(driver.clone()));
        ProxyingRegistry::new(local, driver, config).await.unwrap()
    }

    fn request(name: &str, query: &str) -> RequestContext {
        let url = Url::parse(&format!("http://localhost:5000/v2/{}/manifests/latest{}", name, query)).unwrap();
        RequestContext::for_request(url).with_var(NAME_VAR, name)
    }

    #[tokio::test]
    async fn namespace_mode_fetches_under_remote_name() {
        let registry = registry(&ProxyConfig::namespaced(Default::default())).await;
        let name = RepositoryName::parse("library/redis").unwrap();

        let repository = registry
            .proxied_repository(&request("library/redis", "?ns=h.example.com"), &name)
            .await
            .unwrap();
        assert_eq!(repository.named().as_str(), "h.example.com/library/redis");
        assert_eq!(repository.remote().named().as_str(), "library/redis");
        assert_eq!(repository.remote().base_url(), "https://h.example.com");
        assert_eq!(
            repository.remote().transport().scope(),
            "repository:library/redis:pull"
        );
    }

    #[tokio::test]
    async fn domain_prefixed_name_strips_host_for_upstream() {
        let registry = registry(&ProxyConfig::namespaced(Default::default())).await;
        let name = RepositoryName::parse("registry-1.docker.io/library/redis").unwrap();

        let repository = registry
            .proxied_repository(&request(name.as_str(), ""), &name)
            .await
            .unwrap();
        assert_eq!(repository.named(), &name);
        assert_eq!(repository.remote().named().as_str(), "library/redis");
        assert_eq!(repository.remote().base_url(), "https://registry-1.docker.io");
        assert_eq!(
            repository.remote().transport().scope(),
            "repository:library/redis:pull"
        );
    }

    #[tokio::test]
    async fn single_origin_uses_requested_name() {
        let registry = registry(&ProxyConfig::single("https://mirror.example.com")).await;
        let name = RepositoryName::parse("library/redis").unwrap();

        let repository = registry
            .proxied_repository(&request("library/redis", "?ns=h.example.com"), &name)
            .await
            .unwrap();
        assert_eq!(repository.named(), &name);
        assert_eq!(repository.remote().base_url(), "https://mirror.example.com");
        assert_eq!(
            repository.remote().transport().scope(),
            "repository:library/redis:pull"
        );
    }
}
