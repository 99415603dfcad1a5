//! Azure Blob adapter: block blobs staged with fixed-length block IDs then
//! committed in one `CommitBlockList` call, where the IV metadata is
//! finally attached (SAS tokens often can't write metadata separately).
//! Grounded on the teacher's own (partial) `azure_blob.rs`: `ContainerClient`
//! / `BlobClient`, `put_block_blob`, and `Metadata` conversion.
use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use azure_core::error::ErrorKind as AzureErrorKind;
use azure_core::request_options::Metadata as AzureMetadata;
use azure_core::StatusCode;
use azure_storage::prelude::StorageCredentials;
use azure_storage_blobs::blob::BlockListType;
use azure_storage_blobs::prelude::{BlobClient, ClientBuilder, ContainerClient};
use cloud_model::{Credentials, StorageDescriptor};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::traits::{CloudTransfer, PreEncryptUploader, StreamingConcurrentUploader};
use crate::types::{
    ConcurrencyLimiter, DownloadParams, RequestKind, StreamingUploadInit, UploadOutcome, UploadParams,
    UploadedPart, DEFAULT_DOWNLOAD_CHUNK_SIZE, DEFAULT_MULTIPART_THRESHOLD,
};

const IV_METADATA_KEY: &str = "iv";

/// Deterministic, uniform-length block ID, mandatory so every ID in one
/// blob's block list sorts and compares consistently: `base64("block-%010d")`.
fn block_id(index: u64) -> String {
    base64::encode(format!("block-{index:010}"))
}

/// Classifies an Azure SDK error by HTTP status rather than string-matching
/// `Display` output: a 404 means the blob/block the caller asked about is
/// gone, the Azure analogue of S3's `NoSuchUpload`.
fn classify_azure_error(err: azure_core::Error, context: &'static str) -> StorageError {
    match err.kind() {
        AzureErrorKind::HttpResponse { status: StatusCode::NotFound, .. } => StorageError::NoSuchUpload,
        _ => StorageError::Other(anyhow::anyhow!(err).context(context)),
    }
}

fn sas_credentials(creds: &Credentials) -> anyhow::Result<StorageCredentials> {
    match creds {
        Credentials::Azure { sas_token, .. } => Ok(StorageCredentials::sas_token(sas_token.clone())?),
        Credentials::S3 { .. } => anyhow::bail!("Azure adapter received S3 credentials"),
    }
}

pub struct AzureAdapter {
    container_client: RwLock<ContainerClient>,
    account: String,
    container: String,
    limiter: ConcurrencyLimiter,
    multipart_threshold: u64,
    download_chunk_size: u64,
}

impl AzureAdapter {
    pub fn new(descriptor: StorageDescriptor, credentials: &Credentials) -> anyhow::Result<Self> {
        let account = descriptor
            .region_or_account_hint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Azure descriptor is missing the storage account name"))?;
        let container_client = Self::build_client(&account, &descriptor.container, credentials)?;
        Ok(Self {
            container_client: RwLock::new(container_client),
            account,
            container: descriptor.container,
            limiter: ConcurrencyLimiter::new(32, 16),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
        })
    }

    fn build_client(account: &str, container: &str, credentials: &Credentials) -> anyhow::Result<ContainerClient> {
        let sas = sas_credentials(credentials)?;
        Ok(ClientBuilder::new(account, sas).container_client(container))
    }

    fn blob_client(&self, blob_name: &str) -> BlobClient {
        self.container_client.read().blob_client(blob_name)
    }
}

#[async_trait]
impl CloudTransfer for AzureAdapter {
    async fn upload(&self, params: UploadParams) -> Result<UploadOutcome, StorageError> {
        if params.plaintext_size > self.multipart_threshold {
            // Large file via a direct `CloudTransfer::upload` call (rather
            // than the orchestrator's pipelined driver): stage blocks one
            // whole-file-sized part and commit, mirroring the small-file
            // path's single-shot ciphertext but through the block-staging
            // call sequence so the object's identity still lands on commit.
            let init = self.init_streaming_upload(params.plaintext_size).await?;
            let plaintext = tokio::fs::read(&params.local_path)
                .await
                .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
            let mut enc = encryption_core::StreamingEncryptor::new(&init.master_key, &init.initial_iv)
                .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
            let ciphertext = enc
                .encrypt_part(&plaintext, true)
                .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
            let part = self.upload_streaming_part(&init, 0, ciphertext).await?;
            let iv_b64 = encryption_core::to_base64(&init.initial_iv);
            self.complete_streaming_upload(&init, vec![part], &iv_b64).await?;
            return Ok(UploadOutcome {
                storage_path: init.storage_path,
                encryption_key_b64: encryption_core::to_base64(&init.master_key),
                iv_b64,
                format_version: 1,
                part_size: Some(init.part_size),
            });
        }

        let plaintext = tokio::fs::read(&params.local_path)
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

        let mut enc = encryption_core::StreamingEncryptor::new_random();
        let ciphertext = enc
            .encrypt_part(&plaintext, true)
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        let iv_b64 = encryption_core::to_base64(&enc.get_initial_iv());

        let _permit = self.limiter.acquire(RequestKind::Write).await;
        let blob_client = self.blob_client(&params.object_key);
        let mut metadata = AzureMetadata::new();
        metadata.insert(IV_METADATA_KEY, iv_b64.clone());
        blob_client
            .put_block_blob(ciphertext)
            .metadata(metadata)
            .into_future()
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e).context("put_block_blob failed")))?;

        Ok(UploadOutcome {
            storage_path: params.object_key,
            encryption_key_b64: encryption_core::to_base64(&enc.get_key()),
            iv_b64,
            format_version: 0,
            part_size: None,
        })
    }

    async fn download(&self, params: DownloadParams) -> Result<String, StorageError> {
        let _permit = self.limiter.acquire(RequestKind::Read).await;
        let blob_client = self.blob_client(&params.object_key);
        let properties = blob_client
            .get_properties()
            .into_future()
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e).context("get_properties failed")))?;
        let total_size = properties.blob.properties.content_length;
        let observed_etag = properties.blob.properties.etag.to_string();
        let iv_b64 = properties
            .blob
            .metadata
            .and_then(|m| m.get(IV_METADATA_KEY).cloned())
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("blob is missing iv metadata")))?;

        if let Some(expected) = &params.expected_etag {
            if expected != &observed_etag {
                return Err(StorageError::EtagDrift {
                    expected: expected.clone(),
                    found: observed_etag,
                });
            }
        }
        if let Some(hook) = &params.on_etag_observed {
            hook(observed_etag);
        }

        let key_bytes = encryption_core::from_base64(&params.encryption_key_b64)
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

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
                use tokio::io::AsyncSeekExt;
                file.seek(std::io::SeekFrom::Start(offset))
                    .await
                    .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
                encryption_core::StreamingDecryptor::resume_from(&key_bytes, &cursor.current_iv)
                    .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?
            }
            None => {
                offset = 0;
                let iv_bytes = encryption_core::from_base64(&iv_b64)
                    .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
                encryption_core::StreamingDecryptor::new(&key_bytes, &iv_bytes)
                    .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?
            }
        };

        while offset < total_size {
            if params.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                file.flush().await.map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
                return Err(StorageError::Cancelled);
            }
            let end = (offset + self.download_chunk_size).min(total_size);
            let is_final = end >= total_size;
            let range = azure_core::request_options::Range::new(offset, end);
            let mut stream = blob_client.get().range(range).into_stream();
            let mut bytes = Vec::new();
            use futures::stream::StreamExt;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| StorageError::Other(anyhow::anyhow!(e).context("blob GET failed")))?;
                let data = chunk
                    .data
                    .collect()
                    .await
                    .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
                bytes.extend_from_slice(&data);
            }

            let plaintext = decryptor
                .decrypt_part(&bytes, is_final)
                .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

            hasher.update(&plaintext);
            file.write_all(&plaintext)
                .await
                .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

            offset = end;
            if let Some(hook) = &params.on_progress {
                hook(offset, decryptor.get_current_iv());
            }
        }
        file.flush().await.map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        Ok(hasher.finalize_hex())
    }

    async fn refresh_credentials(&self) -> Result<(), StorageError> {
        debug!(account = %self.account, container = %self.container, "Azure adapter credential refresh requested");
        Ok(())
    }

    fn rotate_credentials(&self, credentials: &Credentials) -> anyhow::Result<()> {
        let rebuilt = Self::build_client(&self.account, &self.container, credentials)?;
        *self.container_client.write() = rebuilt;
        Ok(())
    }

    fn storage_type(&self) -> &'static str {
        "azure-blob"
    }
}

#[async_trait]
impl StreamingConcurrentUploader for AzureAdapter {
    async fn init_streaming_upload(&self, plaintext_size: u64) -> Result<StreamingUploadInit, StorageError> {
        let object_key = uuid::Uuid::new_v4().to_string();
        let encryptor = encryption_core::StreamingEncryptor::new_random();
        let part_size = crate::part_size_for(plaintext_size);
        let total_parts = plaintext_size.div_ceil(part_size).max(1);

        info!(object_key, total_parts, "starting Azure block blob staging");
        Ok(StreamingUploadInit {
            // Azure has no upload-session identifier until CommitBlockList;
            // the object key itself is the only identity until then.
            upload_id: String::new(),
            storage_path: object_key,
            master_key: encryptor.get_key(),
            initial_iv: encryptor.get_initial_iv(),
            part_size,
            total_parts,
        })
    }

    async fn upload_streaming_part(
        &self,
        init: &StreamingUploadInit,
        part_index: u64,
        ciphertext: Vec<u8>,
    ) -> Result<UploadedPart, StorageError> {
        let _permit = self.limiter.acquire(RequestKind::Write).await;
        let id = block_id(part_index);
        let blob_client = self.blob_client(&init.storage_path);
        blob_client
            .put_block(id.clone(), ciphertext)
            .into_future()
            .await
            .map_err(|e| classify_azure_error(e, "StageBlock failed"))?;
        Ok(UploadedPart::AzureBlock { block_id: id })
    }

    async fn complete_streaming_upload(
        &self,
        init: &StreamingUploadInit,
        parts: Vec<UploadedPart>,
        iv_b64: &str,
    ) -> Result<String, StorageError> {
        let block_ids: Vec<String> = parts
            .into_iter()
            .filter_map(|p| match p {
                UploadedPart::AzureBlock { block_id } => Some(block_id),
                UploadedPart::S3 { .. } => None,
            })
            .collect();

        let mut metadata = AzureMetadata::new();
        metadata.insert(IV_METADATA_KEY, iv_b64.to_string());

        let blob_client = self.blob_client(&init.storage_path);
        blob_client
            .put_block_list(azure_storage_blobs::blob::BlockList {
                blocks: block_ids
                    .into_iter()
                    .map(azure_storage_blobs::blob::BlobBlockType::Uncommitted)
                    .collect(),
            })
            .metadata(metadata)
            .into_future()
            .await
            .map_err(|e| classify_azure_error(e, "CommitBlockList failed"))?;

        Ok(init.storage_path.clone())
    }

    async fn abort_streaming_upload(&self, init: &StreamingUploadInit) -> Result<(), StorageError> {
        // Uncommitted blocks that are never committed expire on their own
        // (Azure's 7-day uncommitted-block garbage collection); there is no
        // explicit abort call to make, unlike S3's multipart upload.
        warn!(object_key = %init.storage_path, "abandoning uncommitted Azure blocks (will expire in 7 days)");
        Ok(())
    }

    async fn confirm_resume_target(&self, init: &StreamingUploadInit, completed_parts: &[UploadedPart]) -> Result<(), StorageError> {
        let _permit = self.limiter.acquire(RequestKind::Read).await;
        let blob_client = self.blob_client(&init.storage_path);
        let response = blob_client
            .get_block_list()
            .block_list_type(BlockListType::Uncommitted)
            .into_future()
            .await
            .map_err(|e| classify_azure_error(e, "GetBlockList failed"))?;

        let staged: HashSet<String> = response.block_with_size_list.uncommitted_blocks.into_iter().map(|b| b.block_id).collect();

        for part in completed_parts {
            if let UploadedPart::AzureBlock { block_id } = part {
                if !staged.contains(block_id) {
                    return Err(StorageError::NoSuchUpload);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PreEncryptUploader for AzureAdapter {
    async fn upload_encrypted_file(
        &self,
        encrypted_temp_path: &Path,
        storage_path: &str,
        iv_b64: &str,
    ) -> Result<(), StorageError> {
        let body = tokio::fs::read(encrypted_temp_path)
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

        let mut metadata = AzureMetadata::new();
        metadata.insert(IV_METADATA_KEY, iv_b64.to_string());

        let _permit = self.limiter.acquire(RequestKind::Write).await;
        self.blob_client(storage_path)
            .put_block_blob(body)
            .metadata(metadata)
            .into_future()
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e).context("put_block_blob failed")))?;
        Ok(())
    }
}
