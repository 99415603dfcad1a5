//! Crash-safe resume journals for uploads and downloads: atomic sidecar
//! JSON files next to the local file they describe, re-read on restart to
//! decide how much of a transfer can be skipped.
pub mod atomic;
pub mod download;
pub mod error;
pub mod ranges;
pub mod upload;

use serde::{Deserialize, Serialize};

pub use atomic::MAX_JOURNAL_AGE;
pub use download::{DownloadResumeJournal, FormatVersion};
pub use error::{JournalError, ValidationError};
pub use ranges::{ByteRange, RangeSet};
pub use upload::{CompletedPart, UploadResumeJournal};

/// Which backend an upload journal's parts belong to, so `Validate` and
/// reconciliation know whether `completed_parts` holds S3 ETags or Azure
/// block IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendTag {
    S3Compatible,
    AzureBlob,
}
