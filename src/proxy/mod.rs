//! Pull-through caching in front of a local registry
//!
//! [`ProxyingRegistry`] wraps a local [`Namespace`](crate::distribution::Namespace).
//! Each repository it opens serves reads from local storage and, on a miss,
//! negotiates auth with the origin, fetches the content, stores it locally
//! and schedules it for expiry.

pub mod blobs;
pub mod challenger;
pub mod eviction;
pub mod inflight;
pub mod manifests;
pub mod registry;
pub mod repository;
pub mod resolver;
pub mod tags;

pub use challenger::{AuthChallenger, RemoteAuthChallenger};
pub use eviction::EvictionBridge;
pub use inflight::InflightFetches;
pub use registry::{ProxyingRegistry, SCHEDULER_STATE_PATH};
pub use repository::ProxiedRepository;
pub use resolver::{NAMESPACE_PARAM, OriginResolver, RemoteOrigin, Resolution, extract_remote_url};
