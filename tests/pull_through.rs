mod common;

use common::{MockRegistry, REPOSITORY, TAG, request_context};
use registry_proxy::distribution::{BlobStore, ManifestService, Namespace, Repository, TagService};
use registry_proxy::storage::{InMemoryDriver, LocalRegistry, StorageDriver};
use registry_proxy::{Digest, ProxyConfig, ProxyError, ProxyingRegistry, RepositoryName};
use std::sync::Arc;

async fn proxy_for(config: ProxyConfig) -> (ProxyingRegistry, Arc<dyn StorageDriver>) {
    let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
    let local = Arc::new(LocalRegistry::new(driver.clone()));
    let registry = ProxyingRegistry::new(local, driver.clone(), &config)
        .await
        .unwrap();
    (registry, driver)
}

#[tokio::test]
async fn pulls_image_through_cache_once() {
    let mock = MockRegistry::start().await;
    let (registry, _) = proxy_for(ProxyConfig::single(mock.url())).await;
    let name = RepositoryName::parse(REPOSITORY).unwrap();

    let repository = registry
        .repository(&request_context(REPOSITORY, ""), &name)
        .await
        .unwrap();
    assert_eq!(repository.named(), &name);

    let descriptor = repository.tags().get(TAG).await.unwrap();
    assert_eq!(descriptor.digest, mock.state.manifest_digest);

    let manifest = repository
        .manifests(&[])
        .unwrap()
        .get(&descriptor.digest)
        .await
        .unwrap();
    assert_eq!(manifest.payload(), &mock.state.manifest);

    let blobs = repository.blobs();
    for reference in manifest.references().unwrap() {
        let content = blobs.get(&reference.digest).await.unwrap();
        assert_eq!(content.len() as u64, reference.size);
    }

    let counters = mock.counters();
    assert_eq!(counters.pings(), 1);
    assert_eq!(counters.manifest_gets(), 1);
    assert_eq!(counters.blob_gets(), 2);
    assert!(counters.tokens() >= 1);
    assert_eq!(
        mock.state.token_scope.lock().unwrap().as_deref(),
        Some("repository:library/redis:pull")
    );

    // A later request is served entirely from local storage
    let repository = registry
        .repository(&request_context(REPOSITORY, ""), &name)
        .await
        .unwrap();
    let descriptor = repository.tags().get(TAG).await.unwrap();
    let manifest = repository
        .manifests(&[])
        .unwrap()
        .get(&descriptor.digest)
        .await
        .unwrap();
    for reference in manifest.references().unwrap() {
        repository.blobs().get(&reference.digest).await.unwrap();
    }
    assert_eq!(counters.pings(), 1);
    assert_eq!(counters.manifest_gets(), 1);
    assert_eq!(counters.blob_gets(), 2);

    let layer = Digest::from_bytes(&mock.layer);
    assert!(registry.scheduler().contains(&layer).await);
    assert!(registry.scheduler().contains(&mock.state.manifest_digest).await);
    assert_eq!(
        registry.repositories(None, 10).await.unwrap(),
        vec![REPOSITORY.to_string()]
    );
}

#[tokio::test]
async fn missing_content_is_not_cached_as_missing() {
    let mock = MockRegistry::start().await;
    let (registry, _) = proxy_for(ProxyConfig::single(mock.url())).await;
    let name = RepositoryName::parse(REPOSITORY).unwrap();
    let repository = registry
        .repository(&request_context(REPOSITORY, ""), &name)
        .await
        .unwrap();

    let unknown = Digest::from_bytes(b"not on the origin");
    for attempt in 1..=2 {
        assert!(matches!(
            repository.blobs().get(&unknown).await,
            Err(ProxyError::BlobUnknown(_))
        ));
        assert_eq!(mock.counters().blob_gets(), attempt);
    }
    assert!(registry.scheduler().is_empty().await);

    assert!(matches!(
        repository.tags().get("missing").await,
        Err(ProxyError::TagUnknown(_))
    ));
}

#[tokio::test]
async fn presents_configured_credentials_to_token_endpoint() {
    let mock = MockRegistry::start().await;
    let config = ProxyConfig::single(mock.url()).with_credentials("alice", "secret");
    let (registry, _) = proxy_for(config).await;
    let name = RepositoryName::parse(REPOSITORY).unwrap();

    let repository = registry
        .repository(&request_context(REPOSITORY, ""), &name)
        .await
        .unwrap();
    let tags = repository.tags().all().await.unwrap();
    assert_eq!(tags, vec![TAG.to_string(), "latest".to_string()]);

    // base64("alice:secret")
    assert_eq!(
        mock.state.token_authorization.lock().unwrap().as_deref(),
        Some("Basic YWxpY2U6c2VjcmV0")
    );
}

#[tokio::test]
async fn namespace_mode_rejects_unprefixed_names() {
    let mock = MockRegistry::start().await;
    let (registry, _) = proxy_for(ProxyConfig::namespaced(Default::default())).await;
    let name = RepositoryName::parse(REPOSITORY).unwrap();

    let result = registry
        .repository(&request_context(REPOSITORY, ""), &name)
        .await;
    assert!(matches!(result, Err(ProxyError::InvalidNamespace(_))));
    assert_eq!(mock.counters().pings(), 0);
}

#[tokio::test]
async fn namespace_mode_caches_under_origin_host() {
    let (registry, _) = proxy_for(ProxyConfig::namespaced(Default::default())).await;
    let name = RepositoryName::parse(REPOSITORY).unwrap();

    let repository = registry
        .proxied_repository(&request_context(REPOSITORY, "?ns=h.example.com"), &name)
        .await
        .unwrap();
    assert_eq!(repository.named().as_str(), "h.example.com/library/redis");
    assert_eq!(repository.remote().named(), &name);
    assert_eq!(
        repository.remote().transport().scope(),
        "repository:library/redis:pull"
    );
}

#[tokio::test]
async fn rejects_bad_configuration_at_construction() {
    let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
    let local = Arc::new(LocalRegistry::new(driver.clone()));

    let result = ProxyingRegistry::new(local.clone(), driver.clone(), &ProxyConfig::single("")).await;
    assert!(matches!(result, Err(ProxyError::Construction(_))));

    let endless = ProxyConfig::single("https://mirror.example.com")
        .with_ttl(std::time::Duration::from_secs(10_000_000_000_000));
    let result = ProxyingRegistry::new(local.clone(), driver.clone(), &endless).await;
    assert!(matches!(result, Err(ProxyError::Construction(_))));

    driver
        .put_content("/scheduler-state.json", bytes::Bytes::from_static(b"garbage"))
        .await
        .unwrap();
    let result = ProxyingRegistry::new(local, driver, &ProxyConfig::single("https://mirror.example.com")).await;
    assert!(matches!(result, Err(ProxyError::Construction(_))));
}
