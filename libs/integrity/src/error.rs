use std::path::PathBuf;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("insufficient disk space at {path}: need {required_bytes}, have {available_bytes}")]
    InsufficientSpace {
        path: PathBuf,
        required_bytes: u64,
        available_bytes: u64,
    },
    /// A zero-byte downloaded file is always an error, even when the
    /// platform API declared no checksum at all (spec §4.7).
    #[error("downloaded file {0} is zero bytes")]
    ZeroByteFile(PathBuf),
    #[error("size mismatch: declared {expected}, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("checksum mismatch: declared {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    /// A declared hash algorithm other than SHA-512 produces this rather
    /// than silently passing verification.
    #[error("checksum algorithm {0} is not implemented")]
    UnimplementedAlgorithm(String),
}
