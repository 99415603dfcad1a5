//! Provider adapters (C5): a uniform `CloudTransfer` contract over
//! S3-compatible and Azure Blob backends, plus the two narrower streaming
//! sub-contracts the orchestrator drives directly
//! (`StreamingConcurrentUploader`, `PreEncryptUploader`).
//!
//! Grounded on the teacher's `remote_storage` crate: same per-backend
//! module split (`s3.rs`, `azure.rs`), the same `ConcurrencyLimiter` over
//! `tokio::sync::Semaphore` pairs, and the same "one adapter per backend,
//! dispatched through a factory" shape as `GenericRemoteStorage`.
#![deny(unsafe_code)]

mod azure;
mod error;
pub mod memory;
mod s3;
mod traits;
mod types;

use std::sync::Arc;

use cloud_model::{BackendKind, Credentials, StorageDescriptor};

pub use azure::AzureAdapter;
pub use error::StorageError;
pub use memory::InMemoryProvider;
pub use s3::S3Adapter;
pub use traits::{CloudTransfer, PreEncryptUploader, StreamingConcurrentUploader};
pub use types::{
    ConcurrencyLimiter, DownloadParams, DownloadProgressHook, EtagObservedHook, ProviderContext, RequestKind,
    ResumeCursor, StreamingUploadInit, UploadOutcome, UploadParams, UploadedPart,
    DEFAULT_CREDENTIAL_REFRESH_WINDOW_SECS, DEFAULT_DOWNLOAD_CHUNK_SIZE, DEFAULT_MULTIPART_THRESHOLD,
};

/// Bundles the three contracts the orchestrator needs from one provider
/// instance, so the factory can hand back a single trait object instead of
/// three separately-dispatched ones.
pub trait Provider: CloudTransfer + StreamingConcurrentUploader + PreEncryptUploader {}
impl<T: CloudTransfer + StreamingConcurrentUploader + PreEncryptUploader> Provider for T {}

/// Builds the adapter matching `descriptor.backend`. This is the "factory"
/// §4.6.1 step 3 refers to ("Select provider via the factory").
pub fn build_provider(descriptor: StorageDescriptor, credentials: &Credentials) -> anyhow::Result<Arc<dyn Provider>> {
    match descriptor.backend {
        BackendKind::S3Compatible => Ok(Arc::new(S3Adapter::new(descriptor, credentials)?)),
        BackendKind::AzureBlob => Ok(Arc::new(AzureAdapter::new(descriptor, credentials)?)),
    }
}

/// Default minimum part size used by the two real backends and by
/// [`part_size_for`]. Tests that need to exercise multi-part chunking on a
/// small file go through [`part_size_for_with_min`] instead.
pub const DEFAULT_MIN_PART_SIZE: u64 = 8 * 1024 * 1024;

const MAX_PARTS: u64 = 10_000;

/// Chooses a part size keeping the part count within S3's 10,000-part
/// multipart ceiling (Azure has no equivalent limit but shares the same
/// part size for simplicity), doubling up from `min_part`.
///
/// Public so the orchestrator can recompute a resumed upload's part size
/// deterministically from `declared_plaintext_size` alone: the resume
/// journal doesn't persist `part_size`/`total_parts` since they're always
/// a pure function of the plaintext size and this floor.
pub fn part_size_for_with_min(plaintext_size: u64, min_part: u64) -> u64 {
    let mut part_size = min_part.max(1);
    while plaintext_size.div_ceil(part_size) > MAX_PARTS {
        part_size *= 2;
    }
    part_size
}

/// [`part_size_for_with_min`] at the default 8 MiB floor; used by the S3
/// and Azure adapters' own `init_streaming_upload`, which don't have
/// visibility into `EngineConfig::min_part_size_bytes`.
pub fn part_size_for(plaintext_size: u64) -> u64 {
    part_size_for_with_min(plaintext_size, DEFAULT_MIN_PART_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_size_stays_within_s3s_part_count_limit() {
        let huge = 5 * 1024 * 1024 * 1024 * 1024; // 5 TiB
        let size = part_size_for(huge);
        assert!(huge.div_ceil(size) <= 10_000);
    }

    #[test]
    fn small_file_gets_minimum_part_size() {
        assert_eq!(part_size_for(1024), 8 * 1024 * 1024);
    }

    #[test]
    fn part_size_for_with_min_honors_a_tiny_floor() {
        assert_eq!(part_size_for_with_min(250, 100), 100);
    }

    #[test]
    fn part_size_for_with_min_still_caps_part_count() {
        let size = part_size_for_with_min(2_000_000, 1);
        assert!(2_000_000u64.div_ceil(size) <= 10_000);
    }

    #[test]
    fn build_provider_dispatches_on_backend_kind() {
        let s3_desc = StorageDescriptor::s3("s1", "us-east-1", "bucket", None);
        let s3_creds = Credentials::S3 {
            access_key: "a".into(),
            secret_key: "b".into(),
            session_token: "c".into(),
        };
        let provider = build_provider(s3_desc, &s3_creds).unwrap();
        assert_eq!(provider.storage_type(), "s3-compatible");
    }
}
