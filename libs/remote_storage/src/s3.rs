//! S3-compatible adapter: multipart upload for large files, single
//! `PutObject` for small ones, ranged `GetObject` for large downloads.
//! Grounded on the multipart call sequence in the pack's
//! `aws_s3::storage::S3Upload` (`create_multipart_upload` →
//! `upload_part`* → `complete_multipart_upload`, with a best-effort abort on
//! drop).
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_credential_types::provider::{self, ProvideCredentials};
use aws_credential_types::Credentials as AwsCredentials;
use aws_sdk_s3::config::{Credentials as S3ConfigCredentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use cloud_model::{Credentials, StorageDescriptor};
use parking_lot::RwLock;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::traits::{CloudTransfer, PreEncryptUploader, StreamingConcurrentUploader};
use crate::types::{
    ConcurrencyLimiter, DownloadParams, RequestKind, StreamingUploadInit, UploadOutcome, UploadParams,
    UploadedPart, DEFAULT_DOWNLOAD_CHUNK_SIZE, DEFAULT_MULTIPART_THRESHOLD,
};

const IV_METADATA_KEY: &str = "iv";

/// Classifies an S3 SDK error via its structured error code rather than
/// string-matching `Display` output: a `NoSuchUpload` response means the
/// multipart session is gone and any resume journal pointing at it must be
/// discarded, not retried like a generic service error.
fn classify_s3_error<E>(err: E, context: &'static str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if err.code() == Some("NoSuchUpload") {
        StorageError::NoSuchUpload
    } else {
        StorageError::Other(anyhow::anyhow!(err).context(context))
    }
}

/// Wraps a fixed `(access_key, secret_key, session_token)` tuple behind
/// `ProvideCredentials` so the SDK client refreshes through the same
/// interface it would use for an STS-backed provider; rotation happens by
/// swapping the `RwLock` contents rather than rebuilding the client, so the
/// underlying HTTP connection pool survives it.
#[derive(Debug)]
struct RotatingCredentialsProvider {
    current: RwLock<AwsCredentials>,
}

impl RotatingCredentialsProvider {
    fn new(creds: &Credentials) -> anyhow::Result<Self> {
        Ok(Self {
            current: RwLock::new(to_aws_credentials(creds)?),
        })
    }

    fn rotate(&self, creds: &Credentials) -> anyhow::Result<()> {
        *self.current.write() = to_aws_credentials(creds)?;
        Ok(())
    }
}

fn to_aws_credentials(creds: &Credentials) -> anyhow::Result<AwsCredentials> {
    match creds {
        Credentials::S3 {
            access_key,
            secret_key,
            session_token,
        } => Ok(S3ConfigCredentials::new(
            access_key.clone(),
            secret_key.clone(),
            Some(session_token.clone()).filter(|t| !t.is_empty()),
            None,
            "cloud-transfer-engine",
        )),
        Credentials::Azure { .. } => {
            anyhow::bail!("S3 adapter received Azure credentials")
        }
    }
}

impl ProvideCredentials for RotatingCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> provider::future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        provider::future::ProvideCredentials::ready(Ok(self.current.read().clone()))
    }
}

pub struct S3Adapter {
    client: Client,
    credentials_provider: Arc<RotatingCredentialsProvider>,
    descriptor: StorageDescriptor,
    limiter: ConcurrencyLimiter,
    multipart_threshold: u64,
    download_chunk_size: u64,
}

impl S3Adapter {
    pub fn new(descriptor: StorageDescriptor, credentials: &Credentials) -> anyhow::Result<Self> {
        let provider = Arc::new(RotatingCredentialsProvider::new(credentials)?);
        let client = Self::build_client(&descriptor, provider.clone());
        Ok(Self {
            client,
            credentials_provider: provider,
            descriptor,
            limiter: ConcurrencyLimiter::new(32, 16),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
        })
    }

    fn build_client(descriptor: &StorageDescriptor, provider: Arc<RotatingCredentialsProvider>) -> Client {
        let region = descriptor
            .region_or_account_hint
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());
        let config = aws_sdk_s3::Config::builder()
            .region(Region::new(region))
            .credentials_provider(provider)
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        Client::from_conf(config)
    }

    fn bucket(&self) -> &str {
        &self.descriptor.container
    }

    async fn put_small_object(
        &self,
        key: &str,
        body: Vec<u8>,
        iv_b64: &str,
    ) -> Result<(), StorageError> {
        let _permit = self.limiter.acquire(RequestKind::Write).await;
        let mut metadata = HashMap::new();
        metadata.insert(IV_METADATA_KEY.to_string(), iv_b64.to_string());
        self.client
            .put_object()
            .bucket(self.bucket())
            .key(key)
            .body(ByteStream::from(body))
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e).context("PutObject failed")))?;
        Ok(())
    }
}

#[async_trait]
impl CloudTransfer for S3Adapter {
    async fn upload(&self, params: UploadParams) -> Result<UploadOutcome, StorageError> {
        let encryptor = encryption_core::StreamingEncryptor::new_random();
        let plaintext = tokio::fs::read(&params.local_path)
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

        if params.plaintext_size <= self.multipart_threshold {
            let mut enc = encryptor;
            let ciphertext = enc
                .encrypt_part(&plaintext, true)
                .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
            let iv_b64 = encryption_core::to_base64(&enc.get_initial_iv());
            self.put_small_object(&params.object_key, ciphertext, &iv_b64).await?;
            return Ok(UploadOutcome {
                storage_path: params.object_key,
                encryption_key_b64: encryption_core::to_base64(&enc.get_key()),
                iv_b64,
                format_version: 0,
                part_size: None,
            });
        }

        // Large file: delegate to the streaming multipart path with a
        // single part covering the whole file, for callers that only have
        // the `CloudTransfer::upload` entry point rather than the
        // orchestrator's pipelined driver.
        let init = self.init_streaming_upload(params.plaintext_size).await?;
        let mut enc = encryption_core::StreamingEncryptor::new(&init.master_key, &init.initial_iv)
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        let ciphertext = enc
            .encrypt_part(&plaintext, true)
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;
        let part = self.upload_streaming_part(&init, 0, ciphertext).await?;
        let iv_b64 = encryption_core::to_base64(&init.initial_iv);
        self.complete_streaming_upload(&init, vec![part], &iv_b64).await?;

        Ok(UploadOutcome {
            storage_path: init.storage_path,
            encryption_key_b64: encryption_core::to_base64(&init.master_key),
            iv_b64,
            format_version: 1,
            part_size: Some(init.part_size),
        })
    }

    async fn download(&self, params: DownloadParams) -> Result<String, StorageError> {
        let _permit = self.limiter.acquire(RequestKind::Read).await;
        let head = self
            .client
            .head_object()
            .bucket(self.bucket())
            .key(&params.object_key)
            .send()
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e).context("HeadObject failed")))?;
        let total_size = head.content_length().unwrap_or(0).max(0) as u64;
        let iv_b64 = head
            .metadata()
            .and_then(|m| m.get(IV_METADATA_KEY))
            .cloned()
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("object is missing iv metadata")))?;
        let observed_etag = head.e_tag().unwrap_or_default().to_string();

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
            let output = self
                .client
                .get_object()
                .bucket(self.bucket())
                .key(&params.object_key)
                .range(format!("bytes={}-{}", offset, end - 1))
                .send()
                .await
                .map_err(|e| StorageError::Other(anyhow::anyhow!(e).context("GetObject failed")))?;
            let bytes = output
                .body
                .collect()
                .await
                .map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?
                .into_bytes();

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
        debug!(storage_id = %self.descriptor.storage_id, "S3 adapter credential refresh requested");
        Ok(())
    }

    fn rotate_credentials(&self, credentials: &Credentials) -> anyhow::Result<()> {
        self.credentials_provider.rotate(credentials)
    }

    fn storage_type(&self) -> &'static str {
        "s3-compatible"
    }
}

#[async_trait]
impl StreamingConcurrentUploader for S3Adapter {
    async fn init_streaming_upload(&self, plaintext_size: u64) -> Result<StreamingUploadInit, StorageError> {
        let object_key = format!("{}.{}", uuid::Uuid::new_v4(), "part");
        let encryptor = encryption_core::StreamingEncryptor::new_random();

        // The IV is fixed before `CreateMultipartUpload` goes out so it can
        // ride along as object metadata on the call that establishes the
        // object's identity: `CompleteMultipartUpload` carries no metadata
        // parameter of its own, but metadata set at create time is applied
        // to the final object once the upload completes.
        let mut metadata = HashMap::new();
        metadata.insert(IV_METADATA_KEY.to_string(), encryption_core::to_base64(&encryptor.get_initial_iv()));

        let output = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket())
            .key(&object_key)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| classify_s3_error(e, "CreateMultipartUpload failed"))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("multipart upload missing upload_id")))?
            .to_string();

        let part_size = crate::part_size_for(plaintext_size);
        let total_parts = plaintext_size.div_ceil(part_size).max(1);

        info!(upload_id, object_key, total_parts, "initiated S3 multipart upload");
        Ok(StreamingUploadInit {
            upload_id,
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
        let part_number = (part_index + 1) as i32; // S3 part numbers are 1-based.
        let output = self
            .client
            .upload_part()
            .bucket(self.bucket())
            .key(&init.storage_path)
            .upload_id(&init.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(ciphertext))
            .send()
            .await
            .map_err(|e| classify_s3_error(e, "UploadPart failed"))?;
        let e_tag = output
            .e_tag()
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("UploadPart response missing e_tag")))?
            .to_string();
        Ok(UploadedPart::S3 {
            part_number: part_number as u32,
            e_tag,
        })
    }

    async fn complete_streaming_upload(
        &self,
        init: &StreamingUploadInit,
        parts: Vec<UploadedPart>,
        _iv_b64: &str,
    ) -> Result<String, StorageError> {
        let mut completed: Vec<S3CompletedPart> = parts
            .into_iter()
            .filter_map(|p| match p {
                UploadedPart::S3 { part_number, e_tag } => Some(
                    S3CompletedPart::builder()
                        .part_number(part_number as i32)
                        .e_tag(e_tag)
                        .build(),
                ),
                UploadedPart::AzureBlock { .. } => None,
            })
            .collect();
        completed.sort_by_key(|p| p.part_number());

        // The IV already rode along as metadata on `CreateMultipartUpload`
        // (see `init_streaming_upload`); nothing further to attach here.
        self.client
            .complete_multipart_upload()
            .bucket(self.bucket())
            .key(&init.storage_path)
            .upload_id(&init.upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(completed)).build())
            .send()
            .await
            .map_err(|e| classify_s3_error(e, "CompleteMultipartUpload failed"))?;

        Ok(init.storage_path.clone())
    }

    async fn abort_streaming_upload(&self, init: &StreamingUploadInit) -> Result<(), StorageError> {
        warn!(upload_id = %init.upload_id, "aborting S3 multipart upload");
        self.client
            .abort_multipart_upload()
            .bucket(self.bucket())
            .key(&init.storage_path)
            .upload_id(&init.upload_id)
            .send()
            .await
            .map_err(|e| classify_s3_error(e, "AbortMultipartUpload failed"))?;
        Ok(())
    }

    async fn confirm_resume_target(&self, init: &StreamingUploadInit, completed_parts: &[UploadedPart]) -> Result<(), StorageError> {
        if init.upload_id.is_empty() {
            return Ok(());
        }
        let _permit = self.limiter.acquire(RequestKind::Read).await;
        let output = self
            .client
            .list_parts()
            .bucket(self.bucket())
            .key(&init.storage_path)
            .upload_id(&init.upload_id)
            .send()
            .await
            .map_err(|e| classify_s3_error(e, "ListParts failed"))?;

        let remote: HashMap<i32, String> = output
            .parts()
            .iter()
            .filter_map(|p| Some((p.part_number()?, p.e_tag()?.to_string())))
            .collect();

        for part in completed_parts {
            if let UploadedPart::S3 { part_number, e_tag } = part {
                match remote.get(&(*part_number as i32)) {
                    Some(remote_etag) if remote_etag == e_tag => {}
                    _ => return Err(StorageError::NoSuchUpload),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PreEncryptUploader for S3Adapter {
    async fn upload_encrypted_file(
        &self,
        encrypted_temp_path: &Path,
        storage_path: &str,
        iv_b64: &str,
    ) -> Result<(), StorageError> {
        let body = ByteStream::read_from().path(encrypted_temp_path).build().await;
        let body = body.map_err(|e| StorageError::Other(anyhow::anyhow!(e)))?;

        let mut metadata = HashMap::new();
        metadata.insert(IV_METADATA_KEY.to_string(), iv_b64.to_string());

        let _permit = self.limiter.acquire(RequestKind::Write).await;
        self.client
            .put_object()
            .bucket(self.bucket())
            .key(storage_path)
            .body(body)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!(e).context("PutObject failed")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_aws_credentials_rejects_azure_creds() {
        let azure = Credentials::Azure {
            sas_token: "sv=...".into(),
            paths: vec![],
        };
        assert!(to_aws_credentials(&azure).is_err());
    }
}
