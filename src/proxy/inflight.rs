//! Per-digest single-flight for remote fetches

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes fetches of the same key. The holder of the guard performs the
/// fetch; later callers wait for it and should then re-check the local store.
#[derive(Default)]
pub struct InflightFetches {
    fetches: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl InflightFetches {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut fetches = match self.fetches.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            fetches.retain(|_, fetch| fetch.strong_count() > 0);
            match fetches.get(key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    fetches.insert(key.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Keys with a fetch running or waited on
    pub fn len(&self) -> usize {
        match self.fetches.lock() {
            Ok(fetches) => fetches.values().filter(|f| f.strong_count() > 0).count(),
            Err(poisoned) => poisoned.into_inner().values().filter(|f| f.strong_count() > 0).count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_same_key_only() {
        let inflight = Arc::new(InflightFetches::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let inflight = inflight.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = inflight.acquire("sha256:aa").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());

        let _a = inflight.acquire("sha256:aa").await;
        let _b = inflight.acquire("sha256:bb").await;
        assert_eq!(inflight.len(), 2);
    }
}
