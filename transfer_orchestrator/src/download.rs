//! Download pipeline (spec §4.6.2): resolve file metadata, pick the file's
//! own storage over the user's default, pre-flight a disk-space check,
//! consult the download resume journal, and drive the provider's single
//! `CloudTransfer::download` call with progress/ETag hooks that feed the
//! journal and the transfer queue. Grounded on the same shape as
//! `upload::run` — queue lifecycle, retry-with-credential-refresh wrapper,
//! journal discard on a detected-corrupt resume — generalized from a
//! multi-worker pipeline to a single adapter call, since `CloudTransfer::
//! download` already drives its own ranged-GET loop (the worker pool spec
//! §4.6.2 step 3 describes lives inside the adapter here; see
//! `remote_storage::s3`/`azure`).
use std::path::PathBuf;
use std::sync::Arc;

use cloud_model::{CloudFile, PlatformApi, StorageDescriptor};
use remote_storage::{DownloadParams, DownloadProgressHook, EtagObservedHook, Provider, ResumeCursor};
use resume_journal::DownloadResumeJournal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::Engine;

/// Caller-supplied parameters for [`Engine::download_file`].
pub struct DownloadRequest {
    pub local_path: PathBuf,
    /// Either supply the already-fetched record, or a file ID for the
    /// orchestrator to resolve through `GetFileInfo` (spec §4.6.2 step 1).
    pub cloud_file: Option<CloudFile>,
    pub file_id: Option<String>,
    /// Demotes a checksum mismatch to a logged warning instead of a hard
    /// failure; overrides `EngineConfig::skip_checksum` when set.
    pub skip_checksum: Option<bool>,
    pub cancel: CancellationToken,
}

impl DownloadRequest {
    pub fn by_file_id(local_path: impl Into<PathBuf>, file_id: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            cloud_file: None,
            file_id: Some(file_id.into()),
            skip_checksum: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cloud_file(local_path: impl Into<PathBuf>, file: CloudFile) -> Self {
        Self {
            local_path: local_path.into(),
            cloud_file: Some(file),
            file_id: None,
            skip_checksum: None,
            cancel: CancellationToken::new(),
        }
    }
}

enum DownloadEvent {
    EtagObserved(String),
    Progress { end: u64, current_iv: [u8; 16] },
}

pub(crate) async fn run<A: PlatformApi>(engine: &Engine<A>, request: DownloadRequest) -> Result<String, TransferError> {
    let file = resolve_file(engine, &request).await?;
    let (profile, _root_folders) = engine.profile_and_folders().await?;

    // Step 2: prefer the file's own storage over the user's default (spec
    // §4.6.2 step 2 — cross-backend job outputs).
    let storage = file.storage.clone().unwrap_or_else(|| profile.default_storage.clone());

    let credentials = engine
        .credentials
        .get_credentials(&profile.user_id, &storage, Some(&file))
        .await
        .map_err(|source| TransferError::Credential {
            storage_id: storage.storage_id.clone(),
            source,
        })?;
    let provider = (engine.provider_factory)(storage.clone(), &credentials)?;

    if file.decrypted_size >= engine.config.large_file_threshold_bytes {
        engine
            .credentials
            .spawn_periodic_refresh(profile.user_id.clone(), storage.clone(), request.cancel.clone());
    }

    let object_key = file.path_parts.object_key.clone();
    let task_id = engine.queue.track_transfer(
        transfer_queue::Direction::Download,
        file.name.clone(),
        object_key.clone(),
        request.local_path.display().to_string(),
        file.decrypted_size,
    );
    {
        let cancel = request.cancel.clone();
        engine.queue.set_cancel(task_id, Arc::new(move || cancel.cancel()));
    }
    engine.queue.activate(task_id);

    let result = download_inner(
        engine,
        &request,
        &provider,
        &storage,
        &profile.user_id,
        &file,
        &object_key,
        task_id,
    )
    .await;

    match result {
        Ok(hash) => {
            engine.queue.complete(task_id);
            Ok(hash)
        }
        Err(err) => {
            if !matches!(err, TransferError::Cancelled) {
                engine.queue.fail(task_id, err.to_string());
            }
            Err(err)
        }
    }
}

async fn resolve_file<A: PlatformApi>(engine: &Engine<A>, request: &DownloadRequest) -> Result<CloudFile, TransferError> {
    if let Some(file) = &request.cloud_file {
        return Ok(file.clone());
    }
    let file_id = request
        .file_id
        .as_ref()
        .ok_or_else(|| TransferError::Fatal("download request supplied neither a CloudFile nor a file ID".into()))?;
    engine
        .api
        .get_file_info(file_id)
        .await
        .map_err(|e| TransferError::Other(e.context("fetching file metadata")))
}

#[allow(clippy::too_many_arguments)]
async fn download_inner<A: PlatformApi>(
    engine: &Engine<A>,
    request: &DownloadRequest,
    provider: &Arc<dyn Provider>,
    storage: &StorageDescriptor,
    user_id: &str,
    file: &CloudFile,
    object_key: &str,
    task_id: transfer_queue::TaskId,
) -> Result<String, TransferError> {
    let skip_checksum = request.skip_checksum.unwrap_or(engine.config.skip_checksum);

    integrity::check_available_space(&request.local_path, file.decrypted_size, engine.config.download_safety_margin)
        .map_err(integrity_to_transfer_error)?;

    let (journal, resume_from, expected_etag) = load_or_create_journal(request, object_key, file, engine).await?;

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<DownloadEvent>();

    let on_etag_observed: EtagObservedHook = {
        let event_tx = event_tx.clone();
        Arc::new(move |etag: String| {
            let _ = event_tx.send(DownloadEvent::EtagObserved(etag));
        })
    };
    let on_progress: DownloadProgressHook = {
        let event_tx = event_tx.clone();
        Arc::new(move |offset: u64, current_iv: [u8; 16]| {
            let _ = event_tx.send(DownloadEvent::Progress { end: offset, current_iv });
        })
    };
    drop(event_tx);

    let queue = engine.queue.clone();
    let total_chunks = file
        .decrypted_size
        .div_ceil(engine.config.download_chunk_size_bytes.max(1))
        .max(1);
    let save_interval_bytes = engine
        .config
        .journal_save_interval(total_chunks)
        .saturating_mul(engine.config.download_chunk_size_bytes.max(1));
    let total_size = file.decrypted_size.max(1);
    let journal_task = tokio::spawn(async move {
        let mut journal = journal;
        let mut prev_offset = journal.bytes_downloaded;
        let mut last_saved_offset = journal.bytes_downloaded;
        let mut started = false;
        while let Some(event) = event_rx.recv().await {
            match event {
                DownloadEvent::EtagObserved(etag) => {
                    if journal.remote_etag.is_none() {
                        journal.remote_etag = Some(etag);
                    }
                }
                DownloadEvent::Progress { end, current_iv } => {
                    if !started {
                        queue.start_transfer(task_id);
                        started = true;
                    }
                    let start = prev_offset;
                    journal.record_cbc_progress(start, end, encryption_core::to_base64(&current_iv));
                    prev_offset = end;
                    queue.update_progress(task_id, end as f64 / total_size as f64);
                    if end.saturating_sub(last_saved_offset) >= save_interval_bytes || end >= total_size {
                        if let Err(err) = journal.save().await {
                            warn!(%err, "failed to persist download resume journal");
                        } else {
                            last_saved_offset = end;
                        }
                    }
                }
            }
        }
        journal
    });

    let download_params = DownloadParams {
        local_path: request.local_path.clone(),
        storage: storage.clone(),
        object_key: object_key.to_string(),
        declared_size: Some(file.decrypted_size),
        encryption_key_b64: file.encryption_key_b64.clone(),
        resume_from,
        expected_etag,
        on_progress: Some(on_progress),
        on_etag_observed: Some(on_etag_observed),
        cancel: Some(request.cancel.clone()),
    };

    let credentials = Arc::clone(&engine.credentials);
    let storage_for_refresh = storage.clone();
    let user_id_for_refresh = user_id.to_string();
    let provider_for_refresh = Arc::clone(provider);

    let download_result = crate::retry::with_retry(
        &engine.config,
        &request.cancel,
        |_attempt| {
            let provider = Arc::clone(provider);
            let params = download_params.clone();
            async move { provider.download(params).await.map_err(TransferError::from) }
        },
        || {
            let credentials = Arc::clone(&credentials);
            let storage = storage_for_refresh.clone();
            let user_id = user_id_for_refresh.clone();
            let provider = Arc::clone(&provider_for_refresh);
            async move {
                credentials.invalidate(&user_id, &storage.storage_id);
                let fresh = credentials.get_credentials(&user_id, &storage, None).await?;
                provider.rotate_credentials(&fresh)
            }
        },
    )
    .await;

    // `download_params` (and the per-attempt clones the retry closure made)
    // hold the `on_progress`/`on_etag_observed` hook Arcs, which in turn hold
    // `event_tx` clones. Drop it before waiting on `journal_task` — otherwise
    // the sender never goes fully out of scope, `event_rx.recv()` never sees
    // the channel close, and the journal task hangs forever.
    drop(download_params);

    journal_task
        .await
        .map_err(|e| TransferError::Fatal(format!("download journal task panicked: {e}")))?;

    let in_flight_hash = match download_result {
        Ok(hash) => hash,
        Err(TransferError::Storage(remote_storage::StorageError::EtagDrift { expected, found })) => {
            warn!(path = %request.local_path.display(), expected, found, "remote object changed mid-flight, discarding resume journal");
            DownloadResumeJournal::delete(&request.local_path).await?;
            return Err(TransferError::EtagDrift { expected, found });
        }
        Err(TransferError::Storage(remote_storage::StorageError::Cancelled)) => {
            debug!(path = %request.local_path.display(), "download cancelled, resume journal preserved");
            return Err(TransferError::Cancelled);
        }
        Err(err) => {
            warn!(path = %request.local_path.display(), %err, "download failed, leaving resume journal in place");
            return Err(err);
        }
    };

    let actual_size = tokio::fs::metadata(&request.local_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    if let Err(err) = integrity::verify_download(
        &request.local_path,
        file.decrypted_size,
        actual_size,
        &file.checksums,
        &in_flight_hash,
        skip_checksum,
    )
    .await
    {
        return Err(integrity_to_transfer_error(err));
    }

    DownloadResumeJournal::delete(&request.local_path).await?;
    info!(path = %request.local_path.display(), object_key, "download completed and verified");
    Ok(in_flight_hash)
}

fn integrity_to_transfer_error(err: integrity::IntegrityError) -> TransferError {
    match err {
        integrity::IntegrityError::InsufficientSpace {
            path,
            required_bytes,
            available_bytes,
        } => TransferError::InsufficientSpace {
            path,
            required_bytes,
            available_bytes,
        },
        other => TransferError::Integrity(other),
    }
}

/// Loads and validates an existing download journal, falling back to a
/// fresh one. A journal that claims completion but whose on-disk size
/// disagrees with the declared total is treated as corrupt (spec §4.6.2
/// "Resume correctness"): discarded, and the download restarts from zero.
async fn load_or_create_journal<A: PlatformApi>(
    request: &DownloadRequest,
    object_key: &str,
    file: &CloudFile,
    engine: &Engine<A>,
) -> Result<(DownloadResumeJournal, Option<ResumeCursor>, Option<String>), TransferError> {
    if let Some(existing) = DownloadResumeJournal::load(&request.local_path).await? {
        match existing.validate(&request.local_path).await {
            Ok(()) => {
                let on_disk = tokio::fs::metadata(&request.local_path).await.map(|m| m.len()).unwrap_or(0);
                let claims_complete = existing.bytes_downloaded >= existing.total_size;
                if claims_complete && on_disk != existing.total_size {
                    warn!(
                        path = %request.local_path.display(),
                        declared = existing.total_size,
                        on_disk,
                        "download journal claims completion but on-disk size disagrees; restarting from zero"
                    );
                    DownloadResumeJournal::delete(&request.local_path).await?;
                } else if existing.bytes_downloaded > 0 {
                    debug!(path = %request.local_path.display(), bytes = existing.bytes_downloaded, "resuming download from journal");
                    let current_iv: [u8; 16] = match &existing.current_iv_b64 {
                        Some(iv_b64) => {
                            let bytes = encryption_core::from_base64(iv_b64)?;
                            bytes
                                .try_into()
                                .map_err(|_| TransferError::Fatal("malformed download journal IV cursor".into()))?
                        }
                        None => return Err(TransferError::Fatal("download journal has progress but no IV cursor".into())),
                    };
                    let resume_from = Some(ResumeCursor {
                        byte_offset: existing.bytes_downloaded,
                        current_iv,
                    });
                    let expected_etag = existing.remote_etag.clone();
                    return Ok((existing, resume_from, expected_etag));
                }
            }
            Err(err) => {
                warn!(path = %request.local_path.display(), %err, "discarding invalid download resume journal");
                DownloadResumeJournal::delete(&request.local_path).await?;
            }
        }
    }

    let journal = DownloadResumeJournal::new_cbc_streaming(
        request.local_path.clone(),
        object_key.to_string(),
        file.decrypted_size,
        None,
        engine.config.download_chunk_size_bytes,
    );
    journal.save().await?;
    Ok((journal, None, None))
}
