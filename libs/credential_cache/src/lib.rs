//! Per-`(userID, storageID)` credential cache with single-flight fetch and
//! three refresh layers (proactive, periodic, error-driven), modeled on the
//! teacher's `dashmap`-keyed caches rather than a single global mutex so
//! unrelated storages never contend on each other's fetch.
#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use cloud_model::{Credentials, PlatformApi, StorageDescriptor};
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Strictly shorter than the server-side expiry (15 minutes) so a cached
/// credential is always rotated out before the backend would reject it.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
/// Transfers at or above this size get a periodic background refresher in
/// addition to the proactive pre-operation fetch.
pub const LARGE_FILE_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;
/// Interval between periodic refreshes for large-file transfers.
pub const PERIODIC_REFRESH_INTERVAL: Duration = Duration::from_secs(8 * 60);
/// Client-side timeout for a single `GetStorageCredentials` round-trip,
/// independent of the outer transfer's own retry/cancellation budget.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    user_id: String,
    storage_id: String,
}

#[derive(Clone)]
struct CacheEntry {
    credentials: Credentials,
    fetched_at: Instant,
}

/// Caches credential bundles and de-duplicates concurrent fetches for the
/// same key behind a per-key async mutex, so only one API round-trip is
/// ever in flight for a given `(userID, storageID)`.
pub struct CredentialCache<A: PlatformApi> {
    api: Arc<A>,
    ttl: Duration,
    api_timeout: Duration,
    entries: DashMap<CacheKey, CacheEntry>,
    locks: DashMap<CacheKey, Arc<AsyncMutex<()>>>,
}

impl<A: PlatformApi> CredentialCache<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self::with_ttl(api, DEFAULT_TTL)
    }

    pub fn with_ttl(api: Arc<A>, ttl: Duration) -> Self {
        Self::with_ttl_and_timeout(api, ttl, DEFAULT_API_TIMEOUT)
    }

    pub fn with_ttl_and_timeout(api: Arc<A>, ttl: Duration, api_timeout: Duration) -> Self {
        Self {
            api,
            ttl,
            api_timeout,
            entries: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn fresh_entry(&self, key: &CacheKey) -> Option<Credentials> {
        let entry = self.entries.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.credentials.clone())
        } else {
            None
        }
    }

    /// Returns a cached credential if still fresh, otherwise performs a
    /// single-flight fetch: concurrent callers for the same key block on
    /// the same in-flight request rather than each issuing their own.
    pub async fn get_credentials(
        &self,
        user_id: &str,
        storage: &StorageDescriptor,
        file: Option<&cloud_model::CloudFile>,
    ) -> anyhow::Result<Credentials> {
        let key = CacheKey {
            user_id: user_id.to_string(),
            storage_id: storage.storage_id.clone(),
        };

        if let Some(creds) = self.fresh_entry(&key) {
            return Ok(creds);
        }

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(creds) = self.fresh_entry(&key) {
            return Ok(creds);
        }

        debug!(user_id, storage_id = %storage.storage_id, "fetching fresh credentials");
        let credentials = tokio::time::timeout(self.api_timeout, self.api.get_storage_credentials(user_id, storage, file))
            .await
            .map_err(|_| anyhow::anyhow!("GetStorageCredentials timed out after {:?}", self.api_timeout))??;
        self.entries.insert(
            key,
            CacheEntry {
                credentials: credentials.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(credentials)
    }

    /// Error-driven refresh: evicts the cached entry for this key so the
    /// next `get_credentials` call is forced to perform a fresh fetch.
    /// Called by the retry wrapper after classifying an auth error.
    pub fn invalidate(&self, user_id: &str, storage_id: &str) {
        self.entries.remove(&CacheKey {
            user_id: user_id.to_string(),
            storage_id: storage_id.to_string(),
        });
    }

    /// Spawns the periodic refresher for a large-payload transfer: calls
    /// `get_credentials` every [`PERIODIC_REFRESH_INTERVAL`] until `cancel`
    /// fires or the transfer completes. Refresh failures are logged but not
    /// propagated — the error-driven layer covers the case where a stale
    /// credential actually gets used and rejected.
    pub fn spawn_periodic_refresh(
        self: &Arc<Self>,
        user_id: String,
        storage: StorageDescriptor,
        cancel: CancellationToken,
    ) where
        A: 'static,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PERIODIC_REFRESH_INTERVAL) => {}
                }
                if cancel.is_cancelled() {
                    break;
                }
                cache.invalidate(&user_id, &storage.storage_id);
                if let Err(err) = cache.get_credentials(&user_id, &storage, None).await {
                    warn!(user_id, storage_id = %storage.storage_id, %err, "periodic credential refresh failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_model::{CloudFileRequest, MockPlatformApi, UserProfile};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingApi {
        inner: MockPlatformApi,
        fetch_count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PlatformApi for CountingApi {
        async fn get_user_profile(&self) -> anyhow::Result<UserProfile> {
            self.inner.get_user_profile().await
        }
        async fn get_root_folders(&self) -> anyhow::Result<cloud_model::RootFolders> {
            self.inner.get_root_folders().await
        }
        async fn get_storage_credentials(
            &self,
            user_id: &str,
            storage: &StorageDescriptor,
            file: Option<&cloud_model::CloudFile>,
        ) -> anyhow::Result<Credentials> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            self.inner.get_storage_credentials(user_id, storage, file).await
        }
        async fn get_file_info(&self, file_id: &str) -> anyhow::Result<cloud_model::CloudFile> {
            self.inner.get_file_info(file_id).await
        }
        async fn register_file(&self, request: CloudFileRequest) -> anyhow::Result<cloud_model::CloudFile> {
            self.inner.register_file(request).await
        }
    }

    fn sample_storage() -> StorageDescriptor {
        StorageDescriptor::s3("s1", "us-east-1", "bucket", None)
    }

    fn make_api() -> Arc<CountingApi> {
        Arc::new(CountingApi {
            inner: MockPlatformApi::new(
                UserProfile {
                    user_id: "u1".into(),
                    default_storage: sample_storage(),
                },
                Credentials::S3 {
                    access_key: "a".into(),
                    secret_key: "b".into(),
                    session_token: "c".into(),
                },
            ),
            fetch_count: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn second_call_within_ttl_hits_cache() {
        let api = make_api();
        let cache = CredentialCache::new(Arc::clone(&api));
        let storage = sample_storage();
        cache.get_credentials("u1", &storage, None).await.unwrap();
        cache.get_credentials("u1", &storage, None).await.unwrap();
        assert_eq!(api.fetch_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let api = make_api();
        let cache = CredentialCache::new(Arc::clone(&api));
        let storage = sample_storage();
        cache.get_credentials("u1", &storage, None).await.unwrap();
        cache.invalidate("u1", &storage.storage_id);
        cache.get_credentials("u1", &storage, None).await.unwrap();
        assert_eq!(api.fetch_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_single_flight() {
        let api = make_api();
        let cache = Arc::new(CredentialCache::new(Arc::clone(&api)));
        let storage = sample_storage();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                cache.get_credentials("u1", &storage, None).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(api.fetch_count.load(Ordering::SeqCst), 1);
    }

    struct HangingApi;

    #[async_trait::async_trait]
    impl PlatformApi for HangingApi {
        async fn get_user_profile(&self) -> anyhow::Result<UserProfile> {
            anyhow::bail!("not used in this test")
        }
        async fn get_root_folders(&self) -> anyhow::Result<cloud_model::RootFolders> {
            anyhow::bail!("not used in this test")
        }
        async fn get_storage_credentials(
            &self,
            _user_id: &str,
            _storage: &StorageDescriptor,
            _file: Option<&cloud_model::CloudFile>,
        ) -> anyhow::Result<Credentials> {
            std::future::pending().await
        }
        async fn get_file_info(&self, _file_id: &str) -> anyhow::Result<cloud_model::CloudFile> {
            anyhow::bail!("not used in this test")
        }
        async fn register_file(&self, _request: CloudFileRequest) -> anyhow::Result<cloud_model::CloudFile> {
            anyhow::bail!("not used in this test")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn credential_fetch_past_the_api_timeout_fails_fast() {
        let cache = CredentialCache::with_ttl_and_timeout(Arc::new(HangingApi), DEFAULT_TTL, Duration::from_secs(5));
        let storage = sample_storage();
        let err = cache.get_credentials("u1", &storage, None).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn expired_entry_triggers_refetch() {
        let api = make_api();
        let cache = CredentialCache::with_ttl(Arc::clone(&api), Duration::from_millis(10));
        let storage = sample_storage();
        cache.get_credentials("u1", &storage, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get_credentials("u1", &storage, None).await.unwrap();
        assert_eq!(api.fetch_count.load(Ordering::SeqCst), 2);
    }
}
