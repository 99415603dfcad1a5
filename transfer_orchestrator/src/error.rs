//! The error taxonomy the retry wrapper and callers match on: transient vs.
//! credential vs. resource vs. integrity vs. protocol vs. cancelled vs.
//! fatal, mirroring how `remote_storage::error::DownloadError` is a leaf
//! type that callers wrap in their own context.
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transient network error: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("credential error for storage {storage_id}: {source}")]
    Credential {
        storage_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("insufficient disk space at {path}: required {required_bytes}, available {available_bytes}")]
    InsufficientSpace {
        path: PathBuf,
        required_bytes: u64,
        available_bytes: u64,
    },

    #[error(transparent)]
    Integrity(#[from] integrity::IntegrityError),

    #[error("remote ETag changed during resume: expected {expected}, found {found}")]
    EtagDrift { expected: String, found: String },

    #[error("protocol error: {0}")]
    Protocol(#[source] anyhow::Error),

    #[error("upload session no longer exists remotely; resume journal discarded")]
    NoSuchUpload,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invariant violated: {0}")]
    Fatal(String),

    #[error(transparent)]
    Journal(#[from] resume_journal::JournalError),

    #[error(transparent)]
    JournalValidation(#[from] resume_journal::ValidationError),

    #[error(transparent)]
    Storage(remote_storage::StorageError),

    #[error(transparent)]
    Encryption(#[from] encryption_core::EncryptionError),

    #[error("directory given where a file was expected: {0}")]
    IsDirectory(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The coarse class the retry wrapper dispatches on. Only `Transient` and
/// `Credential` are retried; every other class is surfaced immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Credential,
    Resource,
    Integrity,
    Protocol,
    Cancelled,
    Fatal,
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Transient(_) => ErrorClass::Transient,
            TransferError::Credential { .. } => ErrorClass::Credential,
            TransferError::InsufficientSpace { .. } => ErrorClass::Resource,
            TransferError::Integrity(_) | TransferError::EtagDrift { .. } => ErrorClass::Integrity,
            TransferError::Protocol(_) | TransferError::NoSuchUpload => ErrorClass::Protocol,
            TransferError::Cancelled => ErrorClass::Cancelled,
            TransferError::Fatal(_) | TransferError::IsDirectory(_) => ErrorClass::Fatal,
            TransferError::Journal(_) | TransferError::JournalValidation(_) => ErrorClass::Fatal,
            TransferError::Encryption(_) => ErrorClass::Fatal,
            TransferError::Storage(source) => classify_storage_error(source),
            TransferError::Other(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Credential)
    }
}

fn classify_storage_error(err: &remote_storage::StorageError) -> ErrorClass {
    match err {
        remote_storage::StorageError::InsufficientSpace { .. } => ErrorClass::Resource,
        remote_storage::StorageError::NotFound(_) => ErrorClass::Protocol,
        remote_storage::StorageError::CredentialsExpired => ErrorClass::Credential,
        remote_storage::StorageError::EtagDrift { .. } => ErrorClass::Integrity,
        remote_storage::StorageError::Cancelled => ErrorClass::Cancelled,
        remote_storage::StorageError::NoSuchUpload => ErrorClass::Protocol,
        remote_storage::StorageError::Other(_) => ErrorClass::Transient,
    }
}

/// `StorageError::NoSuchUpload` maps to its own `TransferError` variant
/// instead of the generic `Storage(..)` wrapper, so callers can match on it
/// directly (spec §7: discard the journal and let the caller restart)
/// without reaching through a nested storage error.
impl From<remote_storage::StorageError> for TransferError {
    fn from(err: remote_storage::StorageError) -> Self {
        match err {
            remote_storage::StorageError::NoSuchUpload => TransferError::NoSuchUpload,
            other => TransferError::Storage(other),
        }
    }
}
