use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("failed to write resume journal at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to rename temp journal {temp} to {path}: {source}")]
    Rename {
        temp: PathBuf,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize resume journal: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to parse resume journal at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reasons a journal is rejected at resume time (spec §4.2 `Validate`).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source file {0} no longer exists")]
    SourceMissing(PathBuf),
    #[error("source file size changed: journal expects {expected} bytes, found {actual}")]
    SizeChanged { expected: u64, actual: u64 },
    #[error("journal is older than the 7 day resume window")]
    Stale,
    #[error("journal local path {journal} does not match requested path {requested}")]
    PathMismatch { journal: PathBuf, requested: PathBuf },
    #[error("encrypted temp file {0} referenced by journal is missing")]
    EncryptedTempMissing(PathBuf),
}
