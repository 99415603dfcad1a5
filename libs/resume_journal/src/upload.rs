//! Upload-side resume journal (`<localPath>.upload.resume`).
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic;
use crate::error::{JournalError, ValidationError};

pub const KIND: &str = "upload";

/// One completed S3 multipart part. Azure instead accumulates staged block
/// IDs, which share the same `completed_parts` slot via `CompletedPart::Azure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "backend")]
pub enum CompletedPart {
    S3 { part_number: u32, e_tag: String },
    Azure { block_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResumeJournal {
    pub local_path: PathBuf,
    /// Only present in pre-encrypt mode, where the whole file is encrypted
    /// to a temp before any bytes are sent.
    pub encrypted_temp_path: Option<PathBuf>,
    pub object_key: String,
    /// S3 multipart upload ID; empty string for Azure, which has no
    /// equivalent upload-session identifier until the final commit.
    pub upload_id: String,
    pub backend: super::BackendTag,
    pub declared_encrypted_size: u64,
    pub declared_plaintext_size: u64,
    pub bytes_uploaded: u64,
    pub completed_parts: Vec<CompletedPart>,
    pub encryption_key_b64: String,
    pub initial_iv_b64: String,
    /// The CBC chain cursor after the last completed part: the last
    /// ciphertext block already uploaded, or `initial_iv_b64` if no part has
    /// completed yet. Required to reconstruct a `StreamingEncryptor` at the
    /// right point in the chain on resume (the cursor cannot be recomputed
    /// locally once its ciphertext has left the machine).
    pub current_iv_b64: String,
    pub object_name_suffix: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl UploadResumeJournal {
    pub fn new(
        local_path: PathBuf,
        object_key: String,
        backend: super::BackendTag,
        declared_plaintext_size: u64,
        declared_encrypted_size: u64,
        encryption_key_b64: String,
        initial_iv_b64: String,
        object_name_suffix: String,
    ) -> Self {
        let now = atomic::now_unix();
        Self {
            local_path,
            encrypted_temp_path: None,
            object_key,
            upload_id: String::new(),
            backend,
            declared_encrypted_size,
            declared_plaintext_size,
            bytes_uploaded: 0,
            completed_parts: Vec::new(),
            encryption_key_b64,
            current_iv_b64: initial_iv_b64.clone(),
            initial_iv_b64,
            object_name_suffix,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = atomic::now_unix();
    }

    /// Records a part completion in the journal: appends the completed
    /// part, advances `bytes_uploaded`, and updates the CBC cursor to the
    /// value the encryptor reports right after encrypting that part.
    pub fn record_part(&mut self, part: CompletedPart, part_plaintext_len: u64, current_iv_b64: String) {
        self.completed_parts.push(part);
        self.bytes_uploaded += part_plaintext_len;
        self.current_iv_b64 = current_iv_b64;
        self.touch();
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

    /// Rejects journals whose source file has disappeared, changed size,
    /// gone stale, or whose encrypted temp (pre-encrypt mode) is missing.
    pub async fn validate(&self, requested_path: &Path) -> Result<(), ValidationError> {
        if self.local_path != requested_path {
            return Err(ValidationError::PathMismatch {
                journal: self.local_path.clone(),
                requested: requested_path.to_path_buf(),
            });
        }

        let metadata = tokio::fs::metadata(requested_path)
            .await
            .map_err(|_| ValidationError::SourceMissing(requested_path.to_path_buf()))?;
        if metadata.len() != self.declared_plaintext_size {
            return Err(ValidationError::SizeChanged {
                expected: self.declared_plaintext_size,
                actual: metadata.len(),
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
            let j: UploadResumeJournal = serde_json::from_slice(bytes).ok()?;
            Some((j.created_at, j.encrypted_temp_path))
        })
        .await
    }
}
