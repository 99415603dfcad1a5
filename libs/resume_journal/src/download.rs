//! Download-side resume journal (`<localPath>.download.resume`).
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic;
use crate::error::{JournalError, ValidationError};
use crate::ranges::{ByteRange, RangeSet};

pub const KIND: &str = "download";

/// `0` is the legacy whole-file HKDF format (decrypted via a side
/// `.encrypted` temp); `1` is the streaming multipart format that writes
/// plaintext directly as each part lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FormatVersion {
    Legacy = 0,
    Streaming = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResumeJournal {
    pub local_path: PathBuf,
    /// Legacy format only: decryption target before the final rename.
    pub encrypted_temp_path: Option<PathBuf>,
    pub object_key: String,
    pub total_size: u64,
    pub bytes_downloaded: u64,
    /// Used to detect the remote object changing underneath a resumed
    /// download; a mismatch forces a restart from scratch.
    pub remote_etag: Option<String>,
    pub chunk_size: u64,
    pub completed_chunks: Vec<u64>,
    pub completed_ranges: RangeSet,
    pub format_version: FormatVersion,
    /// v1 only.
    pub master_key_b64: Option<String>,
    /// v1 only: identifies the streaming upload this object was produced
    /// by, needed to reconstruct per-part IVs.
    pub streaming_file_id: Option<String>,
    /// v1 only: plaintext bytes per part.
    pub plaintext_part_size: Option<u64>,
    /// v1 only.
    pub completed_part_indices: Vec<u64>,
    /// The CBC chain cursor after the last byte range written to disk: the
    /// last ciphertext block already consumed, base64-encoded. `None` until
    /// the first range completes. Decryption is chunk-boundary agnostic —
    /// a chunk only needs the immediately preceding ciphertext block as its
    /// IV regardless of how the upload side partitioned parts — so this one
    /// cursor resumes both the legacy whole-file format and the primary
    /// streaming format.
    pub current_iv_b64: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DownloadResumeJournal {
    pub fn new_legacy(
        local_path: PathBuf,
        object_key: String,
        total_size: u64,
        remote_etag: Option<String>,
        chunk_size: u64,
    ) -> Self {
        let now = atomic::now_unix();
        Self {
            local_path,
            encrypted_temp_path: None,
            object_key,
            total_size,
            bytes_downloaded: 0,
            remote_etag,
            chunk_size,
            completed_chunks: Vec::new(),
            completed_ranges: RangeSet::new(),
            format_version: FormatVersion::Legacy,
            master_key_b64: None,
            streaming_file_id: None,
            plaintext_part_size: None,
            completed_part_indices: Vec::new(),
            current_iv_b64: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builds a journal for the CBC chain resume cursor the orchestrator
    /// uses for every download regardless of which upload mode produced
    /// the object (see `current_iv_b64`'s doc comment). `format_version` is
    /// set to `Streaming` since this is the path taken for every modern
    /// transfer; the v1 HKDF-specific fields stay `None` here and are only
    /// populated by callers reading truly legacy per-part-HKDF uploads.
    pub fn new_cbc_streaming(local_path: PathBuf, object_key: String, total_size: u64, remote_etag: Option<String>, chunk_size: u64) -> Self {
        let now = atomic::now_unix();
        Self {
            local_path,
            encrypted_temp_path: None,
            object_key,
            total_size,
            bytes_downloaded: 0,
            remote_etag,
            chunk_size,
            completed_chunks: Vec::new(),
            completed_ranges: RangeSet::new(),
            format_version: FormatVersion::Streaming,
            master_key_b64: None,
            streaming_file_id: None,
            plaintext_part_size: None,
            completed_part_indices: Vec::new(),
            current_iv_b64: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_streaming(
        local_path: PathBuf,
        object_key: String,
        total_size: u64,
        remote_etag: Option<String>,
        chunk_size: u64,
        master_key_b64: String,
        streaming_file_id: String,
        plaintext_part_size: u64,
    ) -> Self {
        let now = atomic::now_unix();
        Self {
            local_path,
            encrypted_temp_path: None,
            object_key,
            total_size,
            bytes_downloaded: 0,
            remote_etag,
            chunk_size,
            completed_chunks: Vec::new(),
            completed_ranges: RangeSet::new(),
            format_version: FormatVersion::Streaming,
            master_key_b64: Some(master_key_b64),
            streaming_file_id: Some(streaming_file_id),
            plaintext_part_size: Some(plaintext_part_size),
            completed_part_indices: Vec::new(),
            current_iv_b64: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = atomic::now_unix();
    }

    /// Records a completed byte range and keeps `bytes_downloaded` in sync
    /// with the merged range set rather than a running sum, so duplicate
    /// or overlapping completions (retried chunks) don't double-count.
    pub fn record_range(&mut self, chunk_index: u64, start: u64, end: u64) {
        if !self.completed_chunks.contains(&chunk_index) {
            self.completed_chunks.push(chunk_index);
        }
        self.completed_ranges.insert(ByteRange::new(start, end));
        self.bytes_downloaded = self.completed_ranges.total_covered();
    }

    pub fn record_part(&mut self, part_index: u64) {
        if !self.completed_part_indices.contains(&part_index) {
            self.completed_part_indices.push(part_index);
        }
    }

    /// Records one completed ciphertext range and the CBC cursor
    /// immediately after it, using the next unused chunk index. Unlike
    /// `record_part`, the caller doesn't need to track chunk indices itself
    /// — ranges are assumed to complete in the orchestrator's single
    /// sequential download pass.
    pub fn record_cbc_progress(&mut self, start: u64, end: u64, current_iv_b64: String) {
        let chunk_index = self.completed_chunks.len() as u64;
        self.record_range(chunk_index, start, end);
        self.current_iv_b64 = Some(current_iv_b64);
        self.touch();
    }

    pub fn remaining_ranges(&self) -> Vec<ByteRange> {
        self.completed_ranges.complement(self.total_size)
    }

    pub async fn save(&self) -> Result<(), JournalError> {
        atomic::save(self, &self.local_path, KIND).await
    }

    pub async fn load(local_path: &Path) -> Result<Option<Self>, JournalError> {
        atomic::load(local_path, KIND).await
    }

    pub async fn delete(local_path: &Path) -> Result<(), JournalError> {
        atomic::delete(local_path, KIND).await
    }

    pub async fn validate(&self, requested_path: &Path) -> Result<(), ValidationError> {
        if self.local_path != requested_path {
            return Err(ValidationError::PathMismatch {
                journal: self.local_path.clone(),
                requested: requested_path.to_path_buf(),
            });
        }

        let age = atomic::now_unix().saturating_sub(self.created_at);
        if age > atomic::MAX_JOURNAL_AGE.as_secs() {
            return Err(ValidationError::Stale);
        }

        if let Some(temp) = &self.encrypted_temp_path {
            if tokio::fs::metadata(temp).await.is_err() {
                return Err(ValidationError::EncryptedTempMissing(temp.clone()));
            }
        }

        Ok(())
    }

    pub async fn cleanup_directory(dir: &Path) -> Result<usize, JournalError> {
        atomic::cleanup_directory(dir, KIND, |bytes| {
            let j: DownloadResumeJournal = serde_json::from_slice(bytes).ok()?;
            Some((j.created_at, j.encrypted_temp_path))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn record_range_merges_and_tracks_total() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("file.bin").into_std_path_buf();
        let mut journal =
            DownloadResumeJournal::new_legacy(local, "obj".into(), 100, Some("etag1".into()), 40);
        journal.record_range(0, 0, 40);
        journal.record_range(1, 40, 80);
        assert_eq!(journal.bytes_downloaded, 80);
        assert_eq!(journal.remaining_ranges(), vec![ByteRange::new(80, 100)]);
    }

    #[tokio::test]
    async fn record_range_is_idempotent_on_retry() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("file.bin").into_std_path_buf();
        let mut journal =
            DownloadResumeJournal::new_legacy(local, "obj".into(), 100, None, 40);
        journal.record_range(0, 0, 40);
        journal.record_range(0, 0, 40);
        assert_eq!(journal.completed_chunks, vec![0]);
        assert_eq!(journal.bytes_downloaded, 40);
    }

    #[tokio::test]
    async fn streaming_journal_save_load_round_trips() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("file.bin").into_std_path_buf();
        let mut journal = DownloadResumeJournal::new_streaming(
            local.clone(),
            "obj".into(),
            250,
            Some("etag1".into()),
            100,
            "a2V5".into(),
            "stream-id".into(),
            100,
        );
        journal.record_part(0);
        journal.record_range(0, 0, 100);
        journal.save().await.unwrap();

        let loaded = DownloadResumeJournal::load(&local).await.unwrap().unwrap();
        assert_eq!(loaded.format_version, FormatVersion::Streaming);
        assert_eq!(loaded.completed_part_indices, vec![0]);
        assert_eq!(loaded.master_key_b64.as_deref(), Some("a2V5"));
    }

    #[tokio::test]
    async fn record_cbc_progress_tracks_cursor_and_ranges() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("file.bin").into_std_path_buf();
        let mut journal = DownloadResumeJournal::new_cbc_streaming(local, "obj".into(), 100, Some("etag1".into()), 40);
        journal.record_cbc_progress(0, 40, "aXYx".into());
        journal.record_cbc_progress(40, 80, "aXYy".into());
        assert_eq!(journal.bytes_downloaded, 80);
        assert_eq!(journal.current_iv_b64.as_deref(), Some("aXYy"));
        assert_eq!(journal.remaining_ranges(), vec![ByteRange::new(80, 100)]);
    }

    #[tokio::test]
    async fn validate_rejects_path_mismatch() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("file.bin").into_std_path_buf();
        let other = dir.path().join("other.bin").into_std_path_buf();
        let journal = DownloadResumeJournal::new_legacy(local, "obj".into(), 100, None, 40);
        let err = journal.validate(&other).await.unwrap_err();
        assert!(matches!(err, ValidationError::PathMismatch { .. }));
    }
}
