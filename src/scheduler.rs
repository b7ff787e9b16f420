//! TTL expiration scheduler
//!
//! Tracks an expiry time per cached blob or manifest and notifies an
//! [`EvictionListener`] when it lapses. State is persisted as JSON through the
//! storage driver after every change and replayed by [`TtlScheduler::start`],
//! so entries survive restarts; entries that expired while the process was
//! down fire immediately on start.

use crate::digest::Digest;
use crate::error::{ProxyError, Result};
use crate::reference::{CanonicalReference, Reference};
use crate::storage::StorageDriver;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Receives expiry notifications from the scheduler
#[async_trait]
pub trait EvictionListener: Send + Sync {
    async fn on_blob_expire(&self, reference: &Reference) -> Result<()>;

    async fn on_manifest_expire(&self, reference: &Reference) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Blob,
    Manifest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEntry {
    pub key: String,
    pub expiry: DateTime<Utc>,
    pub entry_type: EntryType,
}

struct ScheduledEntry {
    entry: SchedulerEntry,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    started: bool,
    stopped: bool,
    entries: HashMap<String, ScheduledEntry>,
}

struct Inner {
    driver: Arc<dyn StorageDriver>,
    path: String,
    listener: RwLock<Option<Arc<dyn EvictionListener>>>,
    state: Mutex<State>,
}

/// Handle to the process-wide TTL scheduler; clones share state
#[derive(Clone)]
pub struct TtlScheduler {
    inner: Arc<Inner>,
}

impl TtlScheduler {
    pub fn new(driver: Arc<dyn StorageDriver>, path: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                path: path.into(),
                listener: RwLock::new(None),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn EvictionListener>) {
        match self.inner.listener.write() {
            Ok(mut guard) => *guard = Some(listener),
            Err(poisoned) => *poisoned.into_inner() = Some(listener),
        }
    }

    /// Replay persisted state and begin firing timers
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.started {
            return Err(ProxyError::Scheduler("scheduler already started".to_string()));
        }

        let persisted = self.load().await?;
        tracing::info!(
            entries = persisted.len(),
            path = %self.inner.path,
            "starting TTL scheduler"
        );
        for (key, entry) in persisted {
            let timer = self.spawn_timer(key.clone(), entry.expiry);
            state.entries.insert(key, ScheduledEntry { entry, timer });
        }
        state.started = true;
        Ok(())
    }

    pub async fn add_blob(&self, reference: &CanonicalReference, ttl: Duration) -> Result<()> {
        self.add(Reference::Canonical(reference.clone()), ttl, EntryType::Blob)
            .await
    }

    pub async fn add_manifest(&self, reference: &CanonicalReference, ttl: Duration) -> Result<()> {
        self.add(Reference::Canonical(reference.clone()), ttl, EntryType::Manifest)
            .await
    }

    /// Schedule `reference`, replacing any earlier expiry for the same key
    async fn add(&self, reference: Reference, ttl: Duration, entry_type: EntryType) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ProxyError::Scheduler(format!("TTL out of range: {}", e)))?;

        let mut state = self.inner.state.lock().await;
        if !state.started || state.stopped {
            return Err(ProxyError::Scheduler("scheduler not running".to_string()));
        }

        let key = reference.to_string();
        if let Some(previous) = state.entries.remove(&key) {
            previous.timer.abort();
        }

        let expiry = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| ProxyError::Scheduler(format!("TTL of {} overflows expiry time", ttl)))?;
        tracing::debug!(key = %key, ?entry_type, %expiry, "scheduling expiry");
        let timer = self.spawn_timer(key.clone(), expiry);
        state.entries.insert(
            key.clone(),
            ScheduledEntry {
                entry: SchedulerEntry {
                    key,
                    expiry,
                    entry_type,
                },
                timer,
            },
        );
        self.save(&state).await
    }

    /// Cancel every pending timer and persist the remaining state
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        for scheduled in state.entries.values() {
            scheduled.timer.abort();
        }
        state.stopped = true;
        self.save(&state).await
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, digest: &Digest) -> bool {
        let state = self.inner.state.lock().await;
        state
            .entries
            .keys()
            .any(|key| key.ends_with(&format!("@{}", digest)))
    }

    pub async fn expiry(&self, reference: &CanonicalReference) -> Option<DateTime<Utc>> {
        let key = Reference::Canonical(reference.clone()).to_string();
        let state = self.inner.state.lock().await;
        state.entries.get(&key).map(|scheduled| scheduled.entry.expiry)
    }

    fn spawn_timer(&self, key: String, expiry: DateTime<Utc>) -> JoinHandle<()> {
        let delay = (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                TtlScheduler { inner }.expire(&key).await;
            }
        })
    }

    async fn expire(&self, key: &str) {
        let entry = {
            let mut state = self.inner.state.lock().await;
            match state.entries.remove(key) {
                Some(scheduled) => scheduled.entry,
                None => return,
            }
        };

        let listener = match self.inner.listener.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match listener {
            Some(listener) => {
                let outcome = match Reference::parse(&entry.key) {
                    Ok(reference) => match entry.entry_type {
                        EntryType::Blob => listener.on_blob_expire(&reference).await,
                        EntryType::Manifest => listener.on_manifest_expire(&reference).await,
                    },
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(()) => tracing::info!(key = %entry.key, ?entry.entry_type, "expired cached entry"),
                    Err(e) => tracing::error!(key = %entry.key, error = %e, "failed to expire cached entry"),
                }
            }
            None => tracing::warn!(key = %entry.key, "entry expired with no eviction listener registered"),
        }

        let state = self.inner.state.lock().await;
        if let Err(e) = self.save(&state).await {
            tracing::error!(error = %e, "failed to persist scheduler state");
        }
    }

    async fn load(&self) -> Result<HashMap<String, SchedulerEntry>> {
        match self.inner.driver.get_content(&self.inner.path).await {
            Ok(content) => serde_json::from_slice(&content).map_err(|e| {
                ProxyError::Scheduler(format!(
                    "unreadable scheduler state {}: {}",
                    self.inner.path, e
                ))
            }),
            Err(e) if e.is_not_found() => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    async fn save(&self, state: &State) -> Result<()> {
        let entries: HashMap<&String, &SchedulerEntry> = state
            .entries
            .iter()
            .map(|(key, scheduled)| (key, &scheduled.entry))
            .collect();
        let content = serde_json::to_vec(&entries)?;
        self.inner
            .driver
            .put_content(&self.inner.path, Bytes::from(content))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::RepositoryName;
    use crate::storage::InMemoryDriver;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        blobs: StdMutex<Vec<String>>,
        manifests: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl EvictionListener for Recorder {
        async fn on_blob_expire(&self, reference: &Reference) -> Result<()> {
            self.blobs.lock().unwrap().push(reference.to_string());
            Ok(())
        }

        async fn on_manifest_expire(&self, reference: &Reference) -> Result<()> {
            self.manifests.lock().unwrap().push(reference.to_string());
            Ok(())
        }
    }

    fn canonical(content: &[u8]) -> CanonicalReference {
        CanonicalReference::new(
            RepositoryName::parse("library/redis").unwrap(),
            Digest::from_bytes(content),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fires_listener_after_ttl() {
        let driver = Arc::new(InMemoryDriver::new());
        let scheduler = TtlScheduler::new(driver, "/scheduler-state.json");
        let recorder = Arc::new(Recorder::default());
        scheduler.register_listener(recorder.clone());
        scheduler.start().await.unwrap();

        let blob = canonical(b"blob");
        let manifest = canonical(b"manifest");
        scheduler.add_blob(&blob, Duration::from_secs(60)).await.unwrap();
        scheduler
            .add_manifest(&manifest, Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(scheduler.len().await, 2);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(recorder.blobs.lock().unwrap().len(), 1);
        assert!(recorder.manifests.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            recorder.manifests.lock().unwrap().as_slice(),
            [Reference::Canonical(manifest).to_string()]
        );
        assert!(scheduler.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn adding_again_refreshes_expiry() {
        let scheduler = TtlScheduler::new(Arc::new(InMemoryDriver::new()), "/state.json");
        let recorder = Arc::new(Recorder::default());
        scheduler.register_listener(recorder.clone());
        scheduler.start().await.unwrap();

        let blob = canonical(b"blob");
        scheduler.add_blob(&blob, Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;
        scheduler.add_blob(&blob, Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;

        assert!(recorder.blobs.lock().unwrap().is_empty());
        assert_eq!(scheduler.len().await, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.blobs.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_state_is_replayed_on_start() {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let blob = canonical(b"blob");

        let first = TtlScheduler::new(driver.clone(), "/scheduler-state.json");
        first.start().await.unwrap();
        first.add_blob(&blob, Duration::from_secs(30)).await.unwrap();
        first.stop().await.unwrap();

        let second = TtlScheduler::new(driver, "/scheduler-state.json");
        let recorder = Arc::new(Recorder::default());
        second.register_listener(recorder.clone());
        second.start().await.unwrap();
        assert!(second.contains(blob.digest()).await);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(recorder.blobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_adds_before_start_and_corrupt_state() {
        let driver: Arc<dyn StorageDriver> = Arc::new(InMemoryDriver::new());
        let scheduler = TtlScheduler::new(driver.clone(), "/scheduler-state.json");
        assert!(matches!(
            scheduler.add_blob(&canonical(b"x"), Duration::from_secs(1)).await,
            Err(ProxyError::Scheduler(_))
        ));

        driver
            .put_content("/scheduler-state.json", Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        assert!(matches!(scheduler.start().await, Err(ProxyError::Scheduler(_))));
    }

    #[tokio::test]
    async fn rejects_ttl_past_representable_time() {
        let scheduler = TtlScheduler::new(Arc::new(InMemoryDriver::new()), "/scheduler-state.json");
        scheduler.start().await.unwrap();

        let blob = canonical(b"blob");
        assert!(matches!(
            scheduler
                .add_blob(&blob, Duration::from_secs(10_000_000_000_000))
                .await,
            Err(ProxyError::Scheduler(_))
        ));
        assert!(matches!(
            scheduler.add_manifest(&blob, Duration::MAX).await,
            Err(ProxyError::Scheduler(_))
        ));
        assert!(scheduler.is_empty().await);
    }
}
