use async_trait::async_trait;
use cloud_model::Credentials;

use crate::error::StorageError;
use crate::types::{DownloadParams, StreamingUploadInit, UploadOutcome, UploadParams, UploadedPart};

/// Contract both backends implement; the orchestrator talks to whichever
/// one the storage factory returns without knowing which backend it is.
#[async_trait]
pub trait CloudTransfer: Send + Sync {
    async fn upload(&self, params: UploadParams) -> Result<UploadOutcome, StorageError>;

    /// Downloads to `params.local_path`, returning the SHA-512 hex digest
    /// computed while writing plaintext bytes.
    async fn download(&self, params: DownloadParams) -> Result<String, StorageError>;

    async fn refresh_credentials(&self) -> Result<(), StorageError>;

    /// Swaps in a freshly-fetched credential bundle, reusing the existing
    /// HTTP transport so the TLS connection pool survives the rotation
    /// (spec §4.3: "provider adapters rebuild their backend clients
    /// reusing the existing HTTP transport").
    fn rotate_credentials(&self, credentials: &Credentials) -> anyhow::Result<()>;

    fn storage_type(&self) -> &'static str;
}

/// The multipart/block-staging half of the contract, used by the
/// orchestrator's pipelined upload path. `EncryptStreamingPart` is
/// deliberately not part of this trait: encryption is `encryption_core`'s
/// job, called directly by the orchestrator between `UploadStreamingPart`
/// calls, not a storage concern.
#[async_trait]
pub trait StreamingConcurrentUploader: Send + Sync {
    async fn init_streaming_upload(&self, plaintext_size: u64) -> Result<StreamingUploadInit, StorageError>;

    /// Uploads one already-encrypted part (`UploadCiphertext` in the
    /// narrower single-part sense); `part_index` is zero-based and must be
    /// called in order for backends (Azure) whose block IDs are derived
    /// from it.
    async fn upload_streaming_part(
        &self,
        init: &StreamingUploadInit,
        part_index: u64,
        ciphertext: Vec<u8>,
    ) -> Result<UploadedPart, StorageError>;

    async fn complete_streaming_upload(
        &self,
        init: &StreamingUploadInit,
        parts: Vec<UploadedPart>,
        iv_b64: &str,
    ) -> Result<String, StorageError>;

    async fn abort_streaming_upload(&self, init: &StreamingUploadInit) -> Result<(), StorageError>;

    /// Confirms a resume target found in a local journal still exists
    /// remotely before the orchestrator trusts it (spec §4.6.1 step 5: "S3:
    /// `ListParts` succeeds; Azure: uncommitted blocks present"). `Err(
    /// StorageError::NoSuchUpload)` tells the caller the journal is stale and
    /// must be discarded rather than resumed from.
    async fn confirm_resume_target(&self, init: &StreamingUploadInit, completed_parts: &[UploadedPart]) -> Result<(), StorageError>;
}

/// The legacy pre-encrypt path: the whole file is already ciphertext on
/// disk before this is called.
#[async_trait]
pub trait PreEncryptUploader: Send + Sync {
    async fn upload_encrypted_file(
        &self,
        encrypted_temp_path: &std::path::Path,
        storage_path: &str,
        iv_b64: &str,
    ) -> Result<(), StorageError>;
}
