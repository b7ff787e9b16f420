//! Storage-agnostic registry interfaces
//!
//! The local backend, the remote client and the pull-through stores all
//! implement these traits, so a proxied repository is indistinguishable from
//! a local one to its callers.

use crate::context::RequestContext;
use crate::digest::Digest;
use crate::error::Result;
use crate::reference::{Descriptor, Manifest, RepositoryName};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Blob content as a stream of chunks
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

/// Options applied when a manifest service is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOption {
    /// Accept manifests whose referenced blobs are not linked in the repository
    SkipLayerVerification,
}

/// Registry-wide view: a set of repositories plus global blob access
#[async_trait]
pub trait Namespace: Send + Sync {
    async fn repository(
        &self,
        ctx: &RequestContext,
        name: &RepositoryName,
    ) -> Result<Box<dyn Repository>>;

    /// Lexically ordered repository names after `last`, at most `n` of them
    async fn repositories(&self, last: Option<&str>, n: usize) -> Result<Vec<String>>;

    fn blobs(&self) -> Arc<dyn BlobEnumerator>;

    fn blob_statter(&self) -> Arc<dyn BlobStatter>;
}

pub trait Repository: Send + Sync {
    fn named(&self) -> &RepositoryName;

    fn blobs(&self) -> Arc<dyn BlobStore>;

    fn manifests(&self, options: &[ManifestOption]) -> Result<Arc<dyn ManifestService>>;

    fn tags(&self) -> Arc<dyn TagService>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor>;

    async fn get(&self, digest: &Digest) -> Result<Bytes>;

    async fn open(&self, digest: &Digest) -> Result<BlobStream>;

    async fn put(&self, media_type: &str, content: Bytes) -> Result<Descriptor>;

    /// Start a staged write; nothing is readable until the writer commits
    async fn create(&self) -> Result<Box<dyn BlobWriter>>;

    async fn delete(&self, digest: &Digest) -> Result<()>;
}

#[async_trait]
pub trait BlobWriter: Send {
    fn id(&self) -> &str;

    fn size(&self) -> u64;

    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Verify the written content against `expected` and make it readable
    async fn commit(self: Box<Self>, expected: Descriptor) -> Result<Descriptor>;

    async fn cancel(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait ManifestService: Send + Sync {
    async fn exists(&self, digest: &Digest) -> Result<bool>;

    async fn get(&self, digest: &Digest) -> Result<Manifest>;

    async fn put(&self, manifest: &Manifest) -> Result<Digest>;

    async fn delete(&self, digest: &Digest) -> Result<()>;
}

#[async_trait]
pub trait TagService: Send + Sync {
    async fn get(&self, tag: &str) -> Result<Descriptor>;

    async fn tag(&self, tag: &str, descriptor: &Descriptor) -> Result<()>;

    async fn untag(&self, tag: &str) -> Result<()>;

    async fn all(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait BlobEnumerator: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<Digest>>;
}

#[async_trait]
pub trait BlobStatter: Send + Sync {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor>;
}

/// Drain a blob stream into memory
pub async fn collect_blob(mut stream: BlobStream) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
