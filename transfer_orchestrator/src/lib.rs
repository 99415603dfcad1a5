//! Transfer orchestrator (C6): the engine's two public entry points,
//! `upload_file` and `download_file`, wiring every other component (C1-C5,
//! C7, C8) into the pipelined upload/download flows. Grounded on how the
//! teacher's top-level services wire their own shared resources
//! (`page_cache`, a credential/auth cache, a work queue) into one struct
//! created once at startup and handed to per-request driver functions.
#![deny(unsafe_code)]

pub mod config;
pub mod download;
pub mod error;
pub mod retry;
pub mod upload;

use std::sync::Arc;
use std::time::{Duration, Instant};

use cloud_model::{Credentials, PlatformApi, RootFolders, StorageDescriptor, UserProfile};
use parking_lot::Mutex;
use remote_storage::Provider;
use tracing::instrument;

pub use config::EngineConfig;
pub use download::DownloadRequest;
pub use error::TransferError;
pub use upload::UploadRequest;

/// How long `profile_and_folders` trusts its cache before re-fetching
/// (spec §4.6.1 step 2).
const PROFILE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CachedProfile {
    profile: UserProfile,
    root_folders: RootFolders,
    fetched_at: Instant,
}

/// How the engine turns a `(StorageDescriptor, Credentials)` pair into a
/// live provider. Defaults to `remote_storage::build_provider`; overridden
/// in tests via [`Engine::with_provider_factory`] to plug in an in-memory
/// double instead of a real S3/Azure client.
pub type ProviderFactory = Arc<dyn Fn(StorageDescriptor, &Credentials) -> anyhow::Result<Arc<dyn Provider>> + Send + Sync>;

/// Owns every process-wide shared resource (the C1 worker budget and
/// buffer pool, the C3 credential cache, the C8 transfer queue) plus
/// engine config, and drives the upload/download pipelines against one
/// `PlatformApi` implementation.
pub struct Engine<A: PlatformApi> {
    pub(crate) api: Arc<A>,
    pub(crate) credentials: Arc<credential_cache::CredentialCache<A>>,
    pub(crate) budget: resource_budget::ResourceBudget,
    pub(crate) buffers: resource_budget::BufferPool,
    pub(crate) queue: transfer_queue::TransferQueue,
    pub(crate) config: EngineConfig,
    pub(crate) provider_factory: ProviderFactory,
    profile_cache: Mutex<Option<CachedProfile>>,
}

impl<A: PlatformApi> Engine<A> {
    pub fn new(api: Arc<A>, config: EngineConfig) -> Self {
        Self::with_provider_factory(api, config, Arc::new(|storage, credentials| remote_storage::build_provider(storage, credentials)))
    }

    /// Like [`Engine::new`], but with the storage-provider construction
    /// seam exposed so callers (namely this crate's own tests) can inject
    /// an in-memory provider instead of a real S3/Azure client.
    pub fn with_provider_factory(api: Arc<A>, config: EngineConfig, provider_factory: ProviderFactory) -> Self {
        let credentials = Arc::new(credential_cache::CredentialCache::with_ttl_and_timeout(
            Arc::clone(&api),
            Duration::from_secs(config.credential_ttl_secs),
            Duration::from_secs(config.credential_api_timeout_secs),
        ));
        Self {
            api,
            credentials,
            budget: resource_budget::ResourceBudget::new_default(),
            buffers: resource_budget::BufferPool::new_default(),
            queue: transfer_queue::TransferQueue::new(),
            config,
            provider_factory,
            profile_cache: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &transfer_queue::TransferQueue {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fetches the user's profile and root folders, caching both for
    /// [`PROFILE_CACHE_TTL`] so a burst of small-file uploads doesn't
    /// re-hit the platform API for metadata that rarely changes.
    pub(crate) async fn profile_and_folders(&self) -> Result<(UserProfile, RootFolders), TransferError> {
        {
            let cached = self.profile_cache.lock();
            if let Some(c) = cached.as_ref() {
                if c.fetched_at.elapsed() < PROFILE_CACHE_TTL {
                    return Ok((c.profile.clone(), c.root_folders.clone()));
                }
            }
        }
        let profile = self
            .api
            .get_user_profile()
            .await
            .map_err(|e| TransferError::Other(e.context("fetching user profile")))?;
        let root_folders = self
            .api
            .get_root_folders()
            .await
            .map_err(|e| TransferError::Other(e.context("fetching root folders")))?;
        *self.profile_cache.lock() = Some(CachedProfile {
            profile: profile.clone(),
            root_folders: root_folders.clone(),
            fetched_at: Instant::now(),
        });
        Ok((profile, root_folders))
    }

    #[instrument(skip(self, request), fields(local_path = %request.local_path.display()))]
    pub async fn upload_file(&self, request: UploadRequest) -> Result<cloud_model::CloudFile, TransferError> {
        upload::run(self, request).await
    }

    #[instrument(skip(self, request), fields(local_path = %request.local_path.display()))]
    pub async fn download_file(&self, request: DownloadRequest) -> Result<String, TransferError> {
        download::run(self, request).await
    }
}
