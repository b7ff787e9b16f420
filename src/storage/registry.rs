//! Driver-backed local registry
//!
//! Blob content is stored once, globally, under `/blobs`; repositories hold
//! links to it. Deleting a blob through a repository only drops that
//! repository's link, reclaiming the data is the [`Vacuum`](super::Vacuum)'s job.

use super::driver::{FileWriter, StorageDriver};
use super::paths;
use crate::context::RequestContext;
use crate::digest::{Digest, DigestVerifier};
use crate::distribution::{
    BlobEnumerator, BlobStatter, BlobStore, BlobStream, BlobWriter, ManifestOption,
    ManifestService, Namespace, Repository, TagService,
};
use crate::error::{ProxyError, Result};
use crate::reference::{
    Descriptor, MEDIA_TYPE_OCTET_STREAM, Manifest, RepositoryName, validate_tag,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Local, authoritative registry over a storage driver
#[derive(Clone)]
pub struct LocalRegistry {
    driver: Arc<dyn StorageDriver>,
}

impl LocalRegistry {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// Collect every repository name below the repositories root
    async fn walk_repositories(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pending = vec![paths::REPOSITORIES_ROOT.to_string()];

        while let Some(path) = pending.pop() {
            let children = match self.driver.list(&path).await {
                Ok(children) => children,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            let is_repository = children.iter().any(|child| {
                let base = paths::base_name(child);
                base == paths::LAYERS_DIR || base == paths::MANIFESTS_DIR
            });
            if is_repository && path.len() > paths::REPOSITORIES_ROOT.len() {
                names.push(path[paths::REPOSITORIES_ROOT.len() + 1..].to_string());
            }

            // underscore-prefixed entries are repository metadata, not name components
            pending.extend(
                children
                    .into_iter()
                    .filter(|child| !paths::base_name(child).starts_with('_')),
            );
        }
        Ok(names)
    }
}

#[async_trait]
impl Namespace for LocalRegistry {
    async fn repository(
        &self,
        _ctx: &RequestContext,
        name: &RepositoryName,
    ) -> Result<Box<dyn Repository>> {
        Ok(Box::new(LocalRepository {
            name: name.clone(),
            driver: self.driver.clone(),
        }))
    }

    async fn repositories(&self, last: Option<&str>, n: usize) -> Result<Vec<String>> {
        let mut names = self.walk_repositories().await?;
        names.sort();
        Ok(names
            .into_iter()
            .filter(|name| last.is_none_or(|last| name.as_str() > last))
            .take(n)
            .collect())
    }

    fn blobs(&self) -> Arc<dyn BlobEnumerator> {
        Arc::new(GlobalBlobs {
            driver: self.driver.clone(),
        })
    }

    fn blob_statter(&self) -> Arc<dyn BlobStatter> {
        Arc::new(GlobalBlobs {
            driver: self.driver.clone(),
        })
    }
}

/// Enumerates and stats blob data regardless of repository links
struct GlobalBlobs {
    driver: Arc<dyn StorageDriver>,
}

#[async_trait]
impl BlobEnumerator for GlobalBlobs {
    async fn enumerate(&self) -> Result<Vec<Digest>> {
        let algorithm_dir = format!("{}/sha256", paths::BLOBS_ROOT);
        let prefixes = match self.driver.list(&algorithm_dir).await {
            Ok(prefixes) => prefixes,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut digests = Vec::new();
        for prefix in prefixes {
            for blob_dir in self.driver.list(&prefix).await? {
                match Digest::from_hex(paths::base_name(&blob_dir)) {
                    Ok(digest) => digests.push(digest),
                    Err(_) => tracing::warn!(path = %blob_dir, "skipping malformed blob directory"),
                }
            }
        }
        Ok(digests)
    }
}

#[async_trait]
impl BlobStatter for GlobalBlobs {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        let info = self
            .driver
            .stat(&paths::blob_data(digest))
            .await
            .map_err(|e| not_found_as(e, || ProxyError::BlobUnknown(digest.clone())))?;
        Ok(Descriptor {
            media_type: MEDIA_TYPE_OCTET_STREAM.to_string(),
            digest: digest.clone(),
            size: info.size,
        })
    }
}

fn not_found_as<F>(err: ProxyError, not_found: F) -> ProxyError
where
    F: FnOnce() -> ProxyError,
{
    if err.is_not_found() { not_found() } else { err }
}

pub struct LocalRepository {
    name: RepositoryName,
    driver: Arc<dyn StorageDriver>,
}

impl LocalRepository {
    fn blob_store(&self) -> LocalBlobStore {
        LocalBlobStore {
            name: self.name.clone(),
            driver: self.driver.clone(),
        }
    }
}

impl Repository for LocalRepository {
    fn named(&self) -> &RepositoryName {
        &self.name
    }

    fn blobs(&self) -> Arc<dyn BlobStore> {
        Arc::new(self.blob_store())
    }

    fn manifests(&self, options: &[ManifestOption]) -> Result<Arc<dyn ManifestService>> {
        Ok(Arc::new(LocalManifestStore {
            blobs: self.blob_store(),
            skip_layer_verification: options.contains(&ManifestOption::SkipLayerVerification),
        }))
    }

    fn tags(&self) -> Arc<dyn TagService> {
        Arc::new(LocalTagStore {
            name: self.name.clone(),
            driver: self.driver.clone(),
        })
    }
}

/// Repository-scoped view over the global blob data
#[derive(Clone)]
pub struct LocalBlobStore {
    name: RepositoryName,
    driver: Arc<dyn StorageDriver>,
}

impl LocalBlobStore {
    /// True when intact data for `digest` of `size` bytes is already stored
    async fn has_data(&self, digest: &Digest, size: u64) -> Result<bool> {
        match self.driver.stat(&paths::blob_data(digest)).await {
            Ok(info) => Ok(info.size == size),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn link(&self, digest: &Digest) -> Result<()> {
        self.driver
            .put_content(
                &paths::layer_link(&self.name, digest),
                Bytes::from(digest.to_string()),
            )
            .await
    }

    /// Store content globally and link it into this repository
    async fn link_content(&self, digest: &Digest, content: Bytes) -> Result<()> {
        if !self.has_data(digest, content.len() as u64).await? {
            self.driver
                .put_content(&paths::blob_data(digest), content)
                .await?;
        }
        self.link(digest).await
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        let unknown = || ProxyError::BlobUnknown(digest.clone());
        let link = self
            .driver
            .get_content(&paths::layer_link(&self.name, digest))
            .await
            .map_err(|e| not_found_as(e, unknown))?;
        if link.as_ref() != digest.as_str().as_bytes() {
            return Err(ProxyError::LocalStore(format!(
                "Corrupt blob link for {} in {}",
                digest, self.name
            )));
        }

        let info = self
            .driver
            .stat(&paths::blob_data(digest))
            .await
            .map_err(|e| not_found_as(e, unknown))?;
        Ok(Descriptor {
            media_type: MEDIA_TYPE_OCTET_STREAM.to_string(),
            digest: digest.clone(),
            size: info.size,
        })
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        self.stat(digest).await?;
        self.driver
            .get_content(&paths::blob_data(digest))
            .await
            .map_err(|e| not_found_as(e, || ProxyError::BlobUnknown(digest.clone())))
    }

    async fn open(&self, digest: &Digest) -> Result<BlobStream> {
        self.stat(digest).await?;
        self.driver
            .reader(&paths::blob_data(digest))
            .await
            .map_err(|e| not_found_as(e, || ProxyError::BlobUnknown(digest.clone())))
    }

    async fn put(&self, media_type: &str, content: Bytes) -> Result<Descriptor> {
        let digest = Digest::from_bytes(&content);
        let size = content.len() as u64;
        self.link_content(&digest, content).await?;
        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest,
            size,
        })
    }

    async fn create(&self) -> Result<Box<dyn BlobWriter>> {
        Ok(Box::new(LocalBlobWriter {
            id: uuid::Uuid::new_v4().to_string(),
            store: self.clone(),
            file: self.driver.writer().await?,
            verifier: DigestVerifier::new(),
        }))
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        self.driver
            .delete(&paths::layer_link(&self.name, digest))
            .await
            .map_err(|e| not_found_as(e, || ProxyError::BlobUnknown(digest.clone())))
    }
}

/// Staged upload streamed into a driver file; dropping it discards the content
pub struct LocalBlobWriter {
    id: String,
    store: LocalBlobStore,
    file: Box<dyn FileWriter>,
    verifier: DigestVerifier,
}

#[async_trait]
impl BlobWriter for LocalBlobWriter {
    fn id(&self) -> &str {
        &self.id
    }

    fn size(&self) -> u64 {
        self.verifier.size()
    }

    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.file.write(&chunk).await?;
        self.verifier.update(&chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>, expected: Descriptor) -> Result<Descriptor> {
        let LocalBlobWriter {
            id,
            store,
            file,
            verifier,
        } = *self;
        let size = verifier.size();
        let computed = verifier.finalize();

        let mismatch = if computed != expected.digest {
            Some(ProxyError::DigestMismatch {
                expected: expected.digest,
                computed: computed.clone(),
            })
        } else if expected.size > 0 && expected.size != size {
            Some(ProxyError::LocalStore(format!(
                "Size mismatch for {}: expected {} bytes, received {}",
                computed, expected.size, size
            )))
        } else {
            None
        };
        if let Some(err) = mismatch {
            if let Err(e) = file.cancel().await {
                tracing::warn!(upload = %id, error = %e, "failed to discard rejected upload");
            }
            return Err(err);
        }

        if store.has_data(&computed, size).await? {
            file.cancel().await?;
        } else {
            file.commit(&paths::blob_data(&computed)).await?;
        }
        store.link(&computed).await?;
        Ok(Descriptor {
            media_type: expected.media_type,
            digest: computed,
            size,
        })
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        tracing::debug!(upload = %self.id, bytes = self.size(), "blob upload cancelled");
        self.file.cancel().await
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestLink {
    digest: Digest,
    media_type: String,
}

pub struct LocalManifestStore {
    blobs: LocalBlobStore,
    skip_layer_verification: bool,
}

impl LocalManifestStore {
    async fn verify_references(&self, manifest: &Manifest) -> Result<()> {
        for reference in manifest.references()? {
            if manifest.is_index() {
                if !self.exists(&reference.digest).await? {
                    return Err(ProxyError::ManifestUnknown(reference.digest.to_string()));
                }
            } else {
                self.blobs.stat(&reference.digest).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ManifestService for LocalManifestStore {
    async fn exists(&self, digest: &Digest) -> Result<bool> {
        let link = paths::manifest_revision_link(&self.blobs.name, digest);
        match self.blobs.driver.stat(&link).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, digest: &Digest) -> Result<Manifest> {
        let unknown = || ProxyError::ManifestUnknown(digest.to_string());
        let link = self
            .blobs
            .driver
            .get_content(&paths::manifest_revision_link(&self.blobs.name, digest))
            .await
            .map_err(|e| not_found_as(e, unknown))?;
        let link: ManifestLink = serde_json::from_slice(&link)?;

        let payload = self
            .blobs
            .driver
            .get_content(&paths::blob_data(digest))
            .await
            .map_err(|e| not_found_as(e, unknown))?;
        digest.verify(&payload)?;
        Ok(Manifest::new(link.media_type, payload))
    }

    async fn put(&self, manifest: &Manifest) -> Result<Digest> {
        if !self.skip_layer_verification {
            self.verify_references(manifest).await?;
        }

        let digest = manifest.digest();
        let driver = &self.blobs.driver;
        driver
            .put_content(&paths::blob_data(&digest), manifest.payload().clone())
            .await?;
        let link = ManifestLink {
            digest: digest.clone(),
            media_type: manifest.media_type().to_string(),
        };
        driver
            .put_content(
                &paths::manifest_revision_link(&self.blobs.name, &digest),
                Bytes::from(serde_json::to_vec(&link)?),
            )
            .await?;
        Ok(digest)
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        self.blobs
            .driver
            .delete(&paths::manifest_revision_link(&self.blobs.name, digest))
            .await
            .map_err(|e| not_found_as(e, || ProxyError::ManifestUnknown(digest.to_string())))
    }
}

pub struct LocalTagStore {
    name: RepositoryName,
    driver: Arc<dyn StorageDriver>,
}

#[async_trait]
impl TagService for LocalTagStore {
    async fn get(&self, tag: &str) -> Result<Descriptor> {
        validate_tag(tag)?;
        let content = self
            .driver
            .get_content(&paths::tag_current_link(&self.name, tag))
            .await
            .map_err(|e| not_found_as(e, || ProxyError::TagUnknown(tag.to_string())))?;
        Ok(serde_json::from_slice(&content)?)
    }

    async fn tag(&self, tag: &str, descriptor: &Descriptor) -> Result<()> {
        validate_tag(tag)?;
        self.driver
            .put_content(
                &paths::tag_current_link(&self.name, tag),
                Bytes::from(serde_json::to_vec(descriptor)?),
            )
            .await
    }

    async fn untag(&self, tag: &str) -> Result<()> {
        validate_tag(tag)?;
        self.driver
            .delete(&paths::tag_dir(&self.name, tag))
            .await
            .map_err(|e| not_found_as(e, || ProxyError::TagUnknown(tag.to_string())))
    }

    async fn all(&self) -> Result<Vec<String>> {
        match self.driver.list(&paths::tags_dir(&self.name)).await {
            Ok(children) => Ok(children
                .iter()
                .map(|child| paths::base_name(child).to_string())
                .collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
