//! Remote key-value backends for backups, always reached through
//! [`RateLimitedStore`].

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use serenity::async_trait;
use tokio::{
    sync::{Mutex, Semaphore},
    time::Instant,
};
use tracing::info;

use crate::error::StoreError;

pub mod http;
pub mod sqlite;

pub use http::HttpStore;
pub use sqlite::SqliteStore;

pub const MAX_CONCURRENCY: usize = 3;
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` when the key has never been written.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Funnels calls through a fixed concurrency ceiling, spaces call starts by a
/// minimum interval and fails calls that exceed a timeout. Nothing is retried.
pub struct RateLimitedStore<S> {
    inner: S,
    permits: Semaphore,
    next_start: Mutex<Instant>,
    min_interval: Duration,
    timeout: Duration,
}

impl<S: KeyValueStore> RateLimitedStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_limits(inner, MAX_CONCURRENCY, MIN_INTERVAL, CALL_TIMEOUT)
    }

    pub fn with_limits(inner: S, concurrency: usize, min_interval: Duration, timeout: Duration) -> Self {
        Self {
            inner,
            permits: Semaphore::new(concurrency),
            next_start: Mutex::new(Instant::now()),
            min_interval,
            timeout,
        }
    }

    async fn pace(&self) {
        let start = {
            let mut next = self.next_start.lock().await;
            let start = (*next).max(Instant::now());
            *next = start + self.min_interval;
            start
        };
        tokio::time::sleep_until(start).await;
    }

    async fn run<T>(&self, call: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        let _permit = self.permits.acquire().await.map_err(|_| StoreError::Closed)?;
        self.pace().await;
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

#[async_trait]
impl<S: KeyValueStore> KeyValueStore for RateLimitedStore<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run(self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.run(self.inner.set(key, value)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.run(self.inner.delete(key)).await
    }
}

/// Builds the backend named by `url`: `http(s)://…` or `sqlite://path`.
pub fn open(url: &str) -> Result<Arc<dyn KeyValueStore>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        info!("Backing up to key-value endpoint {url}");
        return Ok(Arc::new(RateLimitedStore::new(HttpStore::new(url)?)));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        info!("Backing up to sqlite database {path}");
        return Ok(Arc::new(RateLimitedStore::new(SqliteStore::open(path)?)));
    }
    bail!("unsupported backup url {url}; expected http(s):// or sqlite://")
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::*;

    /// In-memory store; keys listed in `failing` reject writes.
    #[derive(Default)]
    pub struct MemoryStore {
        pub data: StdMutex<HashMap<String, String>>,
        pub failing: StdMutex<HashSet<String>>,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
        active: AtomicUsize,
        pub max_active: AtomicUsize,
    }

    impl MemoryStore {
        pub fn fail_on(&self, key: &str) {
            self.failing.lock().unwrap().insert(key.to_string());
        }

        pub fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        pub fn value(&self, key: &str) -> Option<String> {
            self.data.lock().unwrap().get(key).cloned()
        }

        async fn enter(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl KeyValueStore for MemoryStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.enter().await;
            Ok(self.value(key))
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.enter().await;
            if self.failing.lock().unwrap().contains(key) {
                return Err(StoreError::Status(503));
            }
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.enter().await;
            if self.failing.lock().unwrap().contains(key) {
                return Err(StoreError::Status(503));
            }
            self.data.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let store = RateLimitedStore::with_limits(
            MemoryStore {
                delay: Some(Duration::from_secs(30)),
                ..Default::default()
            },
            MAX_CONCURRENCY,
            MIN_INTERVAL,
            CALL_TIMEOUT,
        );
        let err = store.set("status:1", "{}").await;
        assert!(matches!(err, Err(StoreError::Timeout)));
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_capped() {
        let store = Arc::new(RateLimitedStore::new(MemoryStore {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        }));
        let calls = (0..8).map(|n| {
            let store = store.clone();
            async move { store.set(&format!("queue:{n}"), "[]").await }
        });
        for result in futures_util::future::join_all(calls).await {
            result.unwrap();
        }
        assert_eq!(store.inner.max_active.load(Ordering::SeqCst), MAX_CONCURRENCY);
    }

    #[tokio::test(start_paused = true)]
    async fn call_starts_are_spaced() {
        let store = RateLimitedStore::new(MemoryStore::default());
        let begin = Instant::now();
        for n in 0..5 {
            store.get(&format!("status:{n}")).await.unwrap();
        }
        assert!(begin.elapsed() >= MIN_INTERVAL * 4);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(open("ftp://example.com").is_err());
    }
}
