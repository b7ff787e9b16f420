//! Deletion of expired cache entries

use crate::context::RequestContext;
use crate::distribution::Namespace;
use crate::error::{ProxyError, Result};
use crate::reference::{CanonicalReference, Reference};
use crate::scheduler::EvictionListener;
use crate::storage::Vacuum;
use async_trait::async_trait;
use std::sync::Arc;

/// Removes expired blobs and manifests from the local registry
pub struct EvictionBridge {
    registry: Arc<dyn Namespace>,
    vacuum: Vacuum,
}

impl EvictionBridge {
    /// `registry` must be the local backend, never the proxy itself
    pub fn new(registry: Arc<dyn Namespace>, vacuum: Vacuum) -> Self {
        Self { registry, vacuum }
    }
}

fn canonical(reference: &Reference) -> Result<&CanonicalReference> {
    match reference {
        Reference::Canonical(canonical) => Ok(canonical),
        other => Err(ProxyError::UnexpectedReferenceType(format!(
            "{} reference {}",
            other.kind(),
            other
        ))),
    }
}

/// Content that is already gone counts as evicted
fn tolerate_not_found(result: Result<()>, reference: &CanonicalReference) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => {
            tracing::debug!(reference = %Reference::Canonical(reference.clone()), "already evicted");
            Ok(())
        }
        other => other,
    }
}

#[async_trait]
impl EvictionListener for EvictionBridge {
    async fn on_blob_expire(&self, reference: &Reference) -> Result<()> {
        let reference = canonical(reference)?;
        let repository = self
            .registry
            .repository(&RequestContext::background(), reference.name())
            .await?;

        tolerate_not_found(repository.blobs().delete(reference.digest()).await, reference)?;
        tolerate_not_found(
            self.vacuum.remove_blob(reference.digest().as_str()).await,
            reference,
        )
    }

    async fn on_manifest_expire(&self, reference: &Reference) -> Result<()> {
        let reference = canonical(reference)?;
        let repository = self
            .registry
            .repository(&RequestContext::background(), reference.name())
            .await?;

        let manifests = repository.manifests(&[])?;
        tolerate_not_found(manifests.delete(reference.digest()).await, reference)
    }
}
