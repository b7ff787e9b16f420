use crate::distribution::{BlobStore, ManifestOption, ManifestService, Repository, TagService};
use crate::error::Result;
use crate::reference::RepositoryName;
use crate::remote::RemoteRepository;
use std::sync::Arc;

/// Request-scoped repository serving from the local cache and filling it
/// from the origin on a miss
pub struct ProxiedRepository {
    pub(crate) name: RepositoryName,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) manifests: Arc<dyn ManifestService>,
    pub(crate) tags: Arc<dyn TagService>,
    pub(crate) remote: Arc<RemoteRepository>,
}

impl ProxiedRepository {
    /// Upstream repository misses are fetched from
    pub fn remote(&self) -> &RemoteRepository {
        &self.remote
    }
}

impl Repository for ProxiedRepository {
    /// The local name content is cached under
    fn named(&self) -> &RepositoryName {
        &self.name
    }

    fn blobs(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    /// Options are fixed when the repository is built; those passed here are ignored
    fn manifests(&self, _options: &[ManifestOption]) -> Result<Arc<dyn ManifestService>> {
        Ok(self.manifests.clone())
    }

    fn tags(&self) -> Arc<dyn TagService> {
        self.tags.clone()
    }
}
