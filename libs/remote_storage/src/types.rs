//! Shared request/response types for the provider adapters, plus the
//! concurrency limiter both adapters use to cap in-flight requests per
//! request class — grounded on the teacher's own `ConcurrencyLimiter`
//! (a `tokio::sync::Semaphore` pair for reads vs writes).
use std::sync::Arc;

use cloud_model::{BackendKind, Credentials, StorageDescriptor};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_CREDENTIAL_REFRESH_WINDOW_SECS: u64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct UploadParams {
    pub local_path: std::path::PathBuf,
    pub plaintext_size: u64,
    pub storage: StorageDescriptor,
    pub object_key: String,
}

/// Invoked by an adapter's `download` after each chunk lands on disk, with
/// the new total byte offset and the CBC cursor at that point, so a caller
/// can persist a resume journal entry without waiting for the whole
/// transfer to finish.
pub type DownloadProgressHook = Arc<dyn Fn(u64, [u8; 16]) + Send + Sync>;

/// Invoked once, right after the adapter's initial HEAD/`get_properties`
/// call, with the object's current ETag — the value a caller persists into
/// a fresh resume journal so a later resume attempt can detect drift via
/// `DownloadParams::expected_etag`.
pub type EtagObservedHook = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct DownloadParams {
    pub local_path: std::path::PathBuf,
    pub storage: StorageDescriptor,
    pub object_key: String,
    pub declared_size: Option<u64>,
    pub encryption_key_b64: String,
    /// Byte offset to resume writing from, and the matching CBC cursor
    /// (the last ciphertext block already consumed) for a resumed
    /// streaming-format download. `None` starts from the beginning.
    pub resume_from: Option<ResumeCursor>,
    /// The ETag recorded the first time this download's resume journal was
    /// written. Checked against the object's current ETag before resuming;
    /// a mismatch means the object was overwritten mid-flight and resume
    /// must be refused rather than risk concatenating incompatible bytes.
    /// Ignored (no check performed) on a fresh, non-resumed download.
    pub expected_etag: Option<String>,
    pub on_progress: Option<DownloadProgressHook>,
    pub on_etag_observed: Option<EtagObservedHook>,
    /// Checked at the head of every chunk-fetch loop iteration (spec §5:
    /// "Workers check the token at every loop head"), so a cancelled
    /// download stops issuing further ranged GETs instead of running the
    /// whole object to completion before the retry wrapper gets a chance
    /// to see the cancellation.
    pub cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for DownloadParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadParams")
            .field("local_path", &self.local_path)
            .field("storage", &self.storage)
            .field("object_key", &self.object_key)
            .field("declared_size", &self.declared_size)
            .field("resume_from", &self.resume_from)
            .field("expected_etag", &self.expected_etag)
            .field("on_progress", &self.on_progress.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ResumeCursor {
    pub byte_offset: u64,
    pub current_iv: [u8; 16],
}

/// What `Upload`/`UploadEncryptedFile` return once the object fully exists
/// remotely: enough to populate both the platform's `RegisterFile` call and
/// the upload resume journal.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub storage_path: String,
    pub encryption_key_b64: String,
    pub iv_b64: String,
    pub format_version: u8,
    pub part_size: Option<u64>,
}

/// Returned by `InitStreamingUpload`: everything the orchestrator needs to
/// start encrypting and uploading parts, plus enough state to persist in
/// the upload resume journal immediately.
#[derive(Debug, Clone)]
pub struct StreamingUploadInit {
    /// S3 multipart upload ID; empty for Azure, which defers identity
    /// until `CompleteStreamingUpload` commits the block list.
    pub upload_id: String,
    pub storage_path: String,
    pub master_key: [u8; 32],
    pub initial_iv: [u8; 16],
    pub part_size: u64,
    pub total_parts: u64,
}

/// One part that has landed remotely: an S3 ETag or an Azure staged block
/// ID, kept backend-tagged so `CompleteStreamingUpload` can build the right
/// commit request without the orchestrator needing to know which backend
/// it's talking to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadedPart {
    S3 { part_number: u32, e_tag: String },
    AzureBlock { block_id: String },
}

/// Handed to a provider's constructor; credentials are never logged (see
/// `cloud_model::Credentials`'s redacted `Debug`).
#[derive(Clone)]
pub struct ProviderContext {
    pub storage: StorageDescriptor,
    pub credentials: Credentials,
}

impl ProviderContext {
    pub fn backend(&self) -> BackendKind {
        self.storage.backend
    }
}

/// Caps concurrent requests per class so a single large transfer can't
/// starve every other transfer's credential refreshes and small reads.
pub struct ConcurrencyLimiter {
    read: Arc<Semaphore>,
    write: Arc<Semaphore>,
}

pub enum RequestKind {
    Read,
    Write,
}

impl ConcurrencyLimiter {
    pub fn new(max_reads: usize, max_writes: usize) -> Self {
        Self {
            read: Arc::new(Semaphore::new(max_reads)),
            write: Arc::new(Semaphore::new(max_writes)),
        }
    }

    pub async fn acquire(&self, kind: RequestKind) -> SemaphorePermit<'_> {
        let semaphore = match kind {
            RequestKind::Read => &self.read,
            RequestKind::Write => &self.write,
        };
        semaphore
            .acquire()
            .await
            .expect("concurrency limiter semaphore is never closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limiter_caps_concurrent_writes() {
        let limiter = ConcurrencyLimiter::new(4, 1);
        let _first = limiter.acquire(RequestKind::Write).await;
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            limiter.acquire(RequestKind::Write),
        )
        .await;
        assert!(second.is_err(), "second writer should have blocked");
    }

    #[tokio::test]
    async fn read_and_write_pools_are_independent() {
        let limiter = ConcurrencyLimiter::new(1, 1);
        let _write_permit = limiter.acquire(RequestKind::Write).await;
        let read_permit = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            limiter.acquire(RequestKind::Read),
        )
        .await;
        assert!(read_permit.is_ok());
    }
}
