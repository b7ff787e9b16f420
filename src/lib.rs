//! Registry Proxy Library
//!
//! Pull-through caching for container image registries. A
//! [`ProxyingRegistry`] sits in front of a local registry backend and serves
//! blobs, manifests and tags from it, fetching anything missing from the
//! configured upstream origin (or, in namespace mode, from the origin named
//! by each request) and expiring cached content after a TTL.

pub mod cli;
pub mod config;
pub mod context;
pub mod digest;
pub mod distribution;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod reference;
pub mod remote;
pub mod scheduler;
pub mod storage;

pub use config::{ProxyConfig, ProxyCredential};
pub use context::RequestContext;
pub use digest::Digest;
pub use error::{ProxyError, Result};
pub use proxy::ProxyingRegistry;
pub use reference::{CanonicalReference, Reference, RepositoryName};
pub use scheduler::{EvictionListener, TtlScheduler};
