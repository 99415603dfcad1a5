//! Shared data model for the cloud transfer engine.
//!
//! These types cross the boundaries of several crates (the credential
//! cache, the provider adapters, the orchestrator), so they live in one
//! place rather than being duplicated or re-exported awkwardly, mirroring
//! how the teacher splits thin schema crates (`pageserver_api`,
//! `safekeeper_api`) away from the logic crates that consume them.
#![deny(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which object-store family a [`StorageDescriptor`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    S3Compatible,
    AzureBlob,
}

/// Platform-issued handle identifying one object-store location.
///
/// Invariant: `path_parts_base` equals `path_base` only for S3; for Azure
/// `path_parts_base` is typically empty while `path_base` names the
/// container.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub storage_id: String,
    pub backend: BackendKind,
    pub region_or_account_hint: Option<String>,
    pub container: String,
    pub path_base: Option<String>,
    pub path_parts_base: Option<String>,
}

impl fmt::Debug for StorageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDescriptor")
            .field("storage_id", &self.storage_id)
            .field("backend", &self.backend)
            .field("container", &self.container)
            .field("path_base", &self.path_base)
            .field("path_parts_base", &self.path_parts_base)
            .finish()
    }
}

impl StorageDescriptor {
    /// Constructs an S3-compatible descriptor, where `path_base` and
    /// `path_parts_base` are kept equal by construction.
    pub fn s3(
        storage_id: impl Into<String>,
        region: impl Into<String>,
        bucket: impl Into<String>,
        path_base: Option<String>,
    ) -> Self {
        Self {
            storage_id: storage_id.into(),
            backend: BackendKind::S3Compatible,
            region_or_account_hint: Some(region.into()),
            container: bucket.into(),
            path_parts_base: path_base.clone(),
            path_base,
        }
    }

    /// Constructs an Azure Blob descriptor. `path_parts_base` is left empty
    /// by convention: Azure reports paths relative to the container, while
    /// `path_base` still names the container for key composition.
    pub fn azure(
        storage_id: impl Into<String>,
        account: impl Into<String>,
        container: impl Into<String>,
        path_base: Option<String>,
    ) -> Self {
        Self {
            storage_id: storage_id.into(),
            backend: BackendKind::AzureBlob,
            region_or_account_hint: Some(account.into()),
            container: container.into(),
            path_base,
            path_parts_base: None,
        }
    }
}

/// A file's path decomposed the way the platform API reports it, kept
/// separate from the key used to address the object-store API because the
/// two can use different prefixes (see `path_parts_base` above).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathParts {
    pub container: String,
    pub path_base: Option<String>,
    pub object_key: String,
}

/// A content hash the platform API either asserts during registration or
/// expects to verify after download. Only `Sha512` is implemented; any
/// other declared algorithm surfaces a "not implemented" error at
/// verification time (see `integrity` crate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hashFunction", content = "hashValue")]
pub enum HashFunction {
    Sha512(String),
    Other { name: String, value: String },
}

impl HashFunction {
    pub fn value(&self) -> &str {
        match self {
            HashFunction::Sha512(v) => v,
            HashFunction::Other { value, .. } => value,
        }
    }
}

/// Platform-side record of a registered file. Read-only from the engine's
/// perspective once it has been created by `RegisterFile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudFile {
    pub id: String,
    pub name: String,
    pub parent_folder_id: String,
    pub decrypted_size: u64,
    /// Overrides the user's default storage, e.g. for job-output files
    /// that live in a different backend than the user's uploads.
    pub storage: Option<StorageDescriptor>,
    pub path: String,
    pub path_parts: PathParts,
    pub encryption_key_b64: String,
    pub iv_b64: Option<String>,
    pub checksums: Vec<HashFunction>,
}

impl CloudFile {
    pub fn declared_sha512(&self) -> Option<&str> {
        self.checksums.iter().find_map(|c| match c {
            HashFunction::Sha512(v) => Some(v.as_str()),
            _ => None,
        })
    }
}

/// Short-lived credential tuple for one backend. Never logged: `Debug` is
/// hand-written to redact every secret field.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Credentials {
    S3 {
        access_key: String,
        secret_key: String,
        session_token: String,
    },
    Azure {
        sas_token: String,
        paths: Vec<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::S3 { .. } => f
                .debug_struct("Credentials::S3")
                .field("access_key", &"***")
                .field("secret_key", &"***")
                .field("session_token", &"***")
                .finish(),
            Credentials::Azure { paths, .. } => f
                .debug_struct("Credentials::Azure")
                .field("sas_token", &"***")
                .field("paths", paths)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub default_storage: StorageDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RootFolders {
    pub my_library_folder_id: String,
    #[serde(flatten)]
    pub other: HashMap<String, String>,
}

/// Request body for `RegisterFile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudFileRequest {
    pub container: String,
    pub storage_path: String,
    pub encryption_key_b64: String,
    pub decrypted_size: u64,
    pub checksums: Vec<HashFunction>,
}

/// The narrow interface the engine calls through to reach the platform
/// API. The real client (auth, HTTP transport, retries at the API layer)
/// is an external collaborator and out of scope here; this trait is all
/// the orchestrator and credential cache depend on.
#[async_trait]
pub trait PlatformApi: Send + Sync + 'static {
    async fn get_user_profile(&self) -> anyhow::Result<UserProfile>;

    async fn get_root_folders(&self) -> anyhow::Result<RootFolders>;

    /// `file` is supplied when credentials should be scoped to a specific
    /// file's (possibly overridden) storage, e.g. for downloads.
    async fn get_storage_credentials(
        &self,
        user_id: &str,
        storage: &StorageDescriptor,
        file: Option<&CloudFile>,
    ) -> anyhow::Result<Credentials>;

    async fn get_file_info(&self, file_id: &str) -> anyhow::Result<CloudFile>;

    async fn register_file(&self, request: CloudFileRequest) -> anyhow::Result<CloudFile>;
}

/// In-memory test double used by the orchestrator's own tests and by
/// downstream crates that need a `PlatformApi` without a real backend.
pub struct MockPlatformApi {
    profile: UserProfile,
    root_folders: RootFolders,
    files: tokio::sync::Mutex<HashMap<String, CloudFile>>,
    credentials: Credentials,
    next_file_seq: std::sync::atomic::AtomicU64,
}

impl MockPlatformApi {
    pub fn new(profile: UserProfile, credentials: Credentials) -> Self {
        Self {
            profile,
            root_folders: RootFolders {
                my_library_folder_id: "mock-library".to_string(),
                other: HashMap::new(),
            },
            files: tokio::sync::Mutex::new(HashMap::new()),
            credentials,
            next_file_seq: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub async fn seed_file(&self, file: CloudFile) {
        self.files.lock().await.insert(file.id.clone(), file);
    }
}

#[async_trait]
impl PlatformApi for MockPlatformApi {
    async fn get_user_profile(&self) -> anyhow::Result<UserProfile> {
        Ok(self.profile.clone())
    }

    async fn get_root_folders(&self) -> anyhow::Result<RootFolders> {
        Ok(self.root_folders.clone())
    }

    async fn get_storage_credentials(
        &self,
        _user_id: &str,
        _storage: &StorageDescriptor,
        _file: Option<&CloudFile>,
    ) -> anyhow::Result<Credentials> {
        Ok(self.credentials.clone())
    }

    async fn get_file_info(&self, file_id: &str) -> anyhow::Result<CloudFile> {
        self.files
            .lock()
            .await
            .get(file_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such file: {file_id}"))
    }

    async fn register_file(&self, request: CloudFileRequest) -> anyhow::Result<CloudFile> {
        use std::sync::atomic::Ordering;
        let seq = self.next_file_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-file-{seq}");
        let file = CloudFile {
            id: id.clone(),
            name: request
                .storage_path
                .rsplit('/')
                .next()
                .unwrap_or(&request.storage_path)
                .to_string(),
            parent_folder_id: self.root_folders.my_library_folder_id.clone(),
            decrypted_size: request.decrypted_size,
            storage: None,
            path: request.storage_path.clone(),
            path_parts: PathParts {
                container: request.container,
                path_base: None,
                object_key: request.storage_path,
            },
            encryption_key_b64: request.encryption_key_b64,
            iv_b64: None,
            checksums: request.checksums,
        };
        self.files.lock().await.insert(id, file.clone());
        Ok(file)
    }
}
