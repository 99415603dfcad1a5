use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Translated from an OS-level "no space left on device" error, the
    /// way the download worker pool and the pre-encrypt temp writer both
    /// need to surface it to the integrity layer's pre-flight check.
    #[error("insufficient disk space at {path}: need {required_bytes}, have {available_bytes}")]
    InsufficientSpace {
        path: PathBuf,
        required_bytes: u64,
        available_bytes: u64,
    },
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("credentials for this provider are no longer valid")]
    CredentialsExpired,
    /// The remote object's ETag changed between the initial HEAD that
    /// started the download and the HEAD issued at resume time: the
    /// object was overwritten mid-flight, so concatenating newly-fetched
    /// bytes onto what's already on disk would produce a corrupt file.
    #[error("remote object changed during download: expected etag {expected}, found {found}")]
    EtagDrift { expected: String, found: String },
    #[error("transfer cancelled")]
    Cancelled,
    /// The remote upload session a resume journal points at is gone: an S3
    /// `ListParts`/`UploadPart`/`CompleteMultipartUpload` call came back
    /// `NoSuchUpload`, or an Azure `GetBlockList`/`PutBlockList` call came
    /// back 404 for a block the journal expected still staged. Distinct from
    /// `Other` so the orchestrator can discard the journal and restart
    /// instead of retrying (spec §7).
    #[error("upload session no longer exists remotely")]
    NoSuchUpload,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Best-effort classification of a raw I/O error as a disk-space
    /// failure, consulting `available_bytes` to fill in the domain error.
    pub fn from_io_error(err: &std::io::Error, path: PathBuf, required_bytes: u64, available_bytes: u64) -> Option<Self> {
        use std::io::ErrorKind;
        // `StorageFull` is stable since Rust 1.70; older targets the kernel
        // still reports ENOSPC but io::Error maps it to `Other`, so we fall
        // back to the availability check the caller already did.
        if err.kind() == ErrorKind::StorageFull || available_bytes < required_bytes {
            Some(StorageError::InsufficientSpace {
                path,
                required_bytes,
                available_bytes,
            })
        } else {
            None
        }
    }
}
