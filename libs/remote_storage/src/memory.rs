//! In-memory test double for the three provider contracts. Grounded on the
//! `MockPlatformApi` idiom already used for the platform API
//! (`cloud_model::MockPlatformApi`): a minimal, fully in-process stand-in
//! so the orchestrator's pipelines can be driven end-to-end in a unit test
//! without a real S3/Azure backend, matching the spec's "streaming upload
//! against an in-memory provider" testable scenarios.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cloud_model::Credentials;
use parking_lot::Mutex;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::StorageError;
use crate::traits::{CloudTransfer, PreEncryptUploader, StreamingConcurrentUploader};
use crate::types::{DownloadParams, StreamingUploadInit, UploadOutcome, UploadParams, UploadedPart, DEFAULT_DOWNLOAD_CHUNK_SIZE};

struct StoredObject {
    ciphertext: Vec<u8>,
    iv_b64: String,
    etag: String,
}

struct StagedUpload {
    storage_path: String,
    parts: HashMap<u64, Vec<u8>>,
}

/// Call counters a test can inspect after driving an upload/download
/// through [`InMemoryProvider`], matching the spec's end-to-end scenario
/// assertions ("exactly one `UploadCiphertext` call", "no
/// `AbortStreamingUpload`", ...).
#[derive(Default)]
pub struct CallCounts {
    pub small_upload: AtomicU64,
    pub upload_streaming_part: AtomicU64,
    pub complete_streaming_upload: AtomicU64,
    pub abort_streaming_upload: AtomicU64,
    pub upload_encrypted_file: AtomicU64,
    pub download: AtomicU64,
}

pub struct InMemoryProvider {
    objects: Mutex<HashMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, StagedUpload>>,
    next_etag: AtomicU64,
    download_chunk_size: u64,
    /// Artificial per-chunk pause in `download`, off by default. Tests that
    /// exercise mid-transfer cancellation set this so the cancellation has
    /// a real window to land between chunks instead of racing a loop that
    /// would otherwise run to completion in a handful of microseconds.
    chunk_delay: std::time::Duration,
    pub calls: Arc<CallCounts>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_etag: AtomicU64::new(1),
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
            chunk_delay: std::time::Duration::ZERO,
            calls: Arc::new(CallCounts::default()),
        }
    }

    /// Overrides the chunk size used by [`CloudTransfer::download`], so
    /// tests can force multiple ranged reads against a small object
    /// instead of waiting for a multi-gigabyte fixture.
    pub fn with_download_chunk_size(chunk_size: u64) -> Self {
        Self {
            download_chunk_size: chunk_size.max(1),
            ..Self::new()
        }
    }

    pub fn with_chunk_delay(mut self, delay: std::time::Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn next_etag(&self) -> String {
        format!("mem-etag-{}", self.next_etag.fetch_add(1, Ordering::SeqCst))
    }

    /// Seeds an already-encrypted object directly, bypassing `upload`, for
    /// download-only test fixtures.
    pub fn seed_object(&self, key: impl Into<String>, ciphertext: Vec<u8>, iv_b64: impl Into<String>) -> String {
        let etag = self.next_etag();
        self.objects.lock().insert(
            key.into(),
            StoredObject {
                ciphertext,
                iv_b64: iv_b64.into(),
                etag: etag.clone(),
            },
        );
        etag
    }

    /// True iff `upload_id` still has a staged upload session — the
    /// in-memory analogue of an S3 `ListParts`/Azure uncommitted-block-list
    /// check, used by [`confirm_resume_target`](StreamingConcurrentUploader::confirm_resume_target)
    /// to decide whether a resume journal still points at something real.
    pub fn upload_session_exists(&self, upload_id: &str) -> bool {
        self.uploads.lock().contains_key(upload_id)
    }

    /// Returns the raw ciphertext physically stored under `object_key`, for
    /// tests that want to compare it byte-for-byte against an independently
    /// computed whole-file encryption rather than round-tripping through
    /// `download`.
    pub fn object_ciphertext(&self, object_key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(object_key).map(|o| o.ciphertext.clone())
    }

    /// Returns the base64 IV recorded against `object_key` at commit time.
    pub fn object_iv_b64(&self, object_key: &str) -> Option<String> {
        self.objects.lock().get(object_key).map(|o| o.iv_b64.clone())
    }

    /// Overwrites the stored ETag for an already-seeded object, simulating
    /// the remote object having been replaced out from under an in-flight
    /// download so a resume's `expected_etag` check observes drift. Returns
    /// `false` if no object is stored under `object_key`.
    pub fn mutate_etag(&self, object_key: &str, new_etag: impl Into<String>) -> bool {
        match self.objects.lock().get_mut(object_key) {
            Some(object) => {
                object.etag = new_etag.into();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CloudTransfer for InMemoryProvider {
    async fn upload(&self, params: UploadParams) -> Result<UploadOutcome, StorageError> {
        self.calls.small_upload.fetch_add(1, Ordering::SeqCst);
        let plaintext = tokio::fs::read(&params.local_path)
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        let mut enc = encryption_core::StreamingEncryptor::new_random();
        let ciphertext = enc
            .encrypt_part(&plaintext, true)
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        let iv_b64 = encryption_core::to_base64(&enc.get_initial_iv());
        self.objects
            .lock()
            .insert(params.object_key.clone(), StoredObject {
                ciphertext,
                iv_b64: iv_b64.clone(),
                etag: self.next_etag(),
            });
        Ok(UploadOutcome {
            storage_path: params.object_key,
            encryption_key_b64: encryption_core::to_base64(&enc.get_key()),
            iv_b64,
            format_version: 0,
            part_size: None,
        })
    }

    async fn download(&self, params: DownloadParams) -> Result<String, StorageError> {
        self.calls.download.fetch_add(1, Ordering::SeqCst);
        let (ciphertext, iv_b64, etag) = {
            let objects = self.objects.lock();
            let object = objects.get(&params.object_key).ok_or_else(|| StorageError::NotFound(params.object_key.clone()))?;
            (object.ciphertext.clone(), object.iv_b64.clone(), object.etag.clone())
        };

        if let Some(expected) = &params.expected_etag {
            if expected != &etag {
                return Err(StorageError::EtagDrift {
                    expected: expected.clone(),
                    found: etag,
                });
            }
        }
        if let Some(hook) = &params.on_etag_observed {
            hook(etag);
        }

        let key_bytes = encryption_core::from_base64(&params.encryption_key_b64).map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        let total_size = ciphertext.len() as u64;

        let mut open_options = tokio::fs::OpenOptions::new();
        open_options.create(true).write(true);
        let mut file = open_options
            .open(&params.local_path)
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

        let mut hasher = encryption_core::StreamingSha512::new();
        let mut offset;
        let mut decryptor = match &params.resume_from {
            Some(cursor) => {
                offset = cursor.byte_offset;
                file.seek(std::io::SeekFrom::Start(offset))
                    .await
                    .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
                encryption_core::StreamingDecryptor::resume_from(&key_bytes, &cursor.current_iv)
                    .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?
            }
            None => {
                offset = 0;
                let iv_bytes = encryption_core::from_base64(&iv_b64).map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
                encryption_core::StreamingDecryptor::new(&key_bytes, &iv_bytes).map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?
            }
        };

        while offset < total_size {
            if params.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                file.flush().await.map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
                return Err(StorageError::Cancelled);
            }
            let end = (offset + self.download_chunk_size).min(total_size);
            let is_final = end >= total_size;
            let chunk = &ciphertext[offset as usize..end as usize];

            let plaintext = decryptor.decrypt_part(chunk, is_final).map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

            hasher.update(&plaintext);
            file.write_all(&plaintext).await.map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

            offset = end;
            if let Some(hook) = &params.on_progress {
                hook(offset, decryptor.get_current_iv());
            }
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }
        file.flush().await.map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        Ok(hasher.finalize_hex())
    }

    async fn refresh_credentials(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn rotate_credentials(&self, _credentials: &Credentials) -> anyhow::Result<()> {
        Ok(())
    }

    fn storage_type(&self) -> &'static str {
        "in-memory"
    }
}

#[async_trait]
impl StreamingConcurrentUploader for InMemoryProvider {
    async fn init_streaming_upload(&self, plaintext_size: u64) -> Result<StreamingUploadInit, StorageError> {
        let object_key = format!("mem-{}.bin", uuid::Uuid::new_v4());
        let encryptor = encryption_core::StreamingEncryptor::new_random();
        let part_size = crate::part_size_for(plaintext_size);
        let total_parts = plaintext_size.div_ceil(part_size).max(1);
        let upload_id = object_key.clone();
        self.uploads.lock().insert(
            upload_id.clone(),
            StagedUpload {
                storage_path: object_key.clone(),
                parts: HashMap::new(),
            },
        );
        Ok(StreamingUploadInit {
            upload_id,
            storage_path: object_key,
            master_key: encryptor.get_key(),
            initial_iv: encryptor.get_initial_iv(),
            part_size,
            total_parts,
        })
    }

    async fn upload_streaming_part(&self, init: &StreamingUploadInit, part_index: u64, ciphertext: Vec<u8>) -> Result<UploadedPart, StorageError> {
        self.calls.upload_streaming_part.fetch_add(1, Ordering::SeqCst);
        let mut uploads = self.uploads.lock();
        let staged = uploads
            .get_mut(&init.upload_id)
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("no such upload id: {}", init.upload_id)))?;
        staged.parts.insert(part_index, ciphertext);
        Ok(UploadedPart::S3 {
            part_number: (part_index + 1) as u32,
            e_tag: format!("mem-part-etag-{part_index}"),
        })
    }

    async fn complete_streaming_upload(&self, init: &StreamingUploadInit, parts: Vec<UploadedPart>, iv_b64: &str) -> Result<String, StorageError> {
        self.calls.complete_streaming_upload.fetch_add(1, Ordering::SeqCst);
        let staged = self
            .uploads
            .lock()
            .remove(&init.upload_id)
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("no such upload id: {}", init.upload_id)))?;

        let mut indices: Vec<u64> = parts
            .iter()
            .filter_map(|p| match p {
                UploadedPart::S3 { part_number, .. } => Some((*part_number - 1) as u64),
                UploadedPart::AzureBlock { .. } => None,
            })
            .collect();
        indices.sort_unstable();

        let mut ciphertext = Vec::new();
        for index in indices {
            let part = staged
                .parts
                .get(&index)
                .ok_or_else(|| StorageError::Other(anyhow::anyhow!("missing staged part {index}")))?;
            ciphertext.extend_from_slice(part);
        }

        self.objects.lock().insert(
            staged.storage_path.clone(),
            StoredObject {
                ciphertext,
                iv_b64: iv_b64.to_string(),
                etag: self.next_etag(),
            },
        );
        Ok(staged.storage_path)
    }

    async fn abort_streaming_upload(&self, init: &StreamingUploadInit) -> Result<(), StorageError> {
        self.calls.abort_streaming_upload.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().remove(&init.upload_id);
        Ok(())
    }

    async fn confirm_resume_target(&self, init: &StreamingUploadInit, completed_parts: &[UploadedPart]) -> Result<(), StorageError> {
        if !self.upload_session_exists(&init.upload_id) {
            return Err(StorageError::NoSuchUpload);
        }
        let uploads = self.uploads.lock();
        let staged = uploads.get(&init.upload_id).ok_or(StorageError::NoSuchUpload)?;
        for part in completed_parts {
            if let UploadedPart::S3 { part_number, .. } = part {
                let index = (*part_number - 1) as u64;
                if !staged.parts.contains_key(&index) {
                    return Err(StorageError::NoSuchUpload);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PreEncryptUploader for InMemoryProvider {
    async fn upload_encrypted_file(&self, encrypted_temp_path: &std::path::Path, storage_path: &str, iv_b64: &str) -> Result<(), StorageError> {
        self.calls.upload_encrypted_file.fetch_add(1, Ordering::SeqCst);
        let ciphertext = tokio::fs::read(encrypted_temp_path)
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        self.objects.lock().insert(
            storage_path.to_string(),
            StoredObject {
                ciphertext,
                iv_b64: iv_b64.to_string(),
                etag: self.next_etag(),
            },
        );
        Ok(())
    }
}
