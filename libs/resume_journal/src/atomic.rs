//! Atomic sidecar file operations shared by the upload and download
//! journals: write-to-temp-then-rename, best-effort cleanup, and the
//! 7-day staleness window.
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::JournalError;

/// Sidecars older than this are discarded rather than resumed from,
/// matching the 7-day cap S3 multipart uploads and Azure uncommitted
/// blocks both enforce server-side.
pub const MAX_JOURNAL_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn sidecar_path(local_path: &Path, kind: &str) -> PathBuf {
    let mut s = local_path.as_os_str().to_owned();
    s.push(format!(".{kind}.resume"));
    PathBuf::from(s)
}

fn temp_path(sidecar: &Path) -> PathBuf {
    let mut s = sidecar.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

/// Writes `state` to `<localPath>.<kind>.resume.tmp`, fsyncs it, then
/// renames it over the final sidecar name. On rename failure the temp
/// file is removed and an `IOError`-equivalent is returned; readers of
/// the sidecar never observe a torn write because the rename is the only
/// operation that changes what the final path resolves to.
pub async fn save<T: Serialize>(
    state: &T,
    local_path: &Path,
    kind: &str,
) -> Result<(), JournalError> {
    let sidecar = sidecar_path(local_path, kind);
    let tmp = temp_path(&sidecar);

    let bytes = serde_json::to_vec_pretty(state).map_err(JournalError::Serialize)?;

    let write_result: Result<(), JournalError> = async {
        let mut file = tokio::fs::File::create(&tmp).await.map_err(|source| JournalError::Io {
            path: tmp.clone(),
            source,
        })?;
        file.write_all(&bytes).await.map_err(|source| JournalError::Io {
            path: tmp.clone(),
            source,
        })?;
        file.sync_all().await.map_err(|source| JournalError::Io {
            path: tmp.clone(),
            source,
        })?;
        Ok(())
    }
    .await;

    if let Err(e) = write_result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    if let Err(source) = tokio::fs::rename(&tmp, &sidecar).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(JournalError::Rename {
            temp: tmp,
            path: sidecar,
            source,
        });
    }

    debug!(path = %sidecar.display(), "wrote resume journal");
    Ok(())
}

/// Reads and parses the sidecar for `local_path`. Returns `Ok(None)`
/// without error when the sidecar does not exist — a missing journal is
/// the normal "nothing to resume" case, not a failure.
pub async fn load<T: DeserializeOwned>(
    local_path: &Path,
    kind: &str,
) -> Result<Option<T>, JournalError> {
    let sidecar = sidecar_path(local_path, kind);
    let bytes = match tokio::fs::read(&sidecar).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(JournalError::Io {
                path: sidecar,
                source,
            })
        }
    };
    let state = serde_json::from_slice(&bytes).map_err(|source| JournalError::Parse {
        path: sidecar,
        source,
    })?;
    Ok(Some(state))
}

/// Removes the sidecar; succeeds if it is already gone.
pub async fn delete(local_path: &Path, kind: &str) -> Result<(), JournalError> {
    let sidecar = sidecar_path(local_path, kind);
    match tokio::fs::remove_file(&sidecar).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(JournalError::Io {
            path: sidecar,
            source,
        }),
    }
}

/// For every `*.<kind>.resume` in `dir` whose `created_at` is older than
/// the 7-day window, removes both the sidecar and (subject to safety
/// checks) the referenced encrypted temp. `created_at` and
/// `encrypted_temp` are extracted by the caller-supplied closure since
/// the upload and download journal schemas differ.
pub async fn cleanup_directory<F>(
    dir: &Path,
    kind: &str,
    extract: F,
) -> Result<usize, JournalError>
where
    F: Fn(&[u8]) -> Option<(u64, Option<PathBuf>)>,
{
    let suffix = format!(".{kind}.resume");
    let mut removed = 0usize;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(JournalError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    while let Some(entry) = entries.next_entry().await.map_err(|source| JournalError::Io {
        path: dir.to_path_buf(),
        source,
    })? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(&suffix) {
            continue;
        }
        // Never touch files outside the directory we were asked to scan.
        if path.parent() != Some(dir) {
            continue;
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(_) => continue,
        };
        let Some((created_at, encrypted_temp)) = extract(&bytes) else {
            continue;
        };
        let age = now_unix().saturating_sub(created_at);
        if age <= MAX_JOURNAL_AGE.as_secs() {
            continue;
        }

        if tokio::fs::remove_file(&path).await.is_ok() {
            removed += 1;
        }
        if let Some(temp) = encrypted_temp {
            if temp.parent() == Some(dir) {
                let _ = tokio::fs::remove_file(&temp).await;
            } else {
                warn!(
                    path = %temp.display(),
                    "refusing to delete encrypted temp outside journal directory"
                );
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("file.bin").into_std_path_buf();
        save(&serde_json::json!({"a": 1}), &local, "upload").await.unwrap();
        let loaded: Option<serde_json::Value> = load(&local, "upload").await.unwrap();
        assert_eq!(loaded.unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn load_missing_sidecar_returns_none() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("missing.bin").into_std_path_buf();
        let loaded: Option<serde_json::Value> = load(&local, "upload").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_twice_leaves_no_temp_file_and_same_bytes() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("file.bin").into_std_path_buf();
        save(&serde_json::json!({"a": 1}), &local, "upload").await.unwrap();
        let sidecar = sidecar_path(&local, "upload");
        let first = tokio::fs::read(&sidecar).await.unwrap();
        save(&serde_json::json!({"a": 1}), &local, "upload").await.unwrap();
        let second = tokio::fs::read(&sidecar).await.unwrap();
        assert_eq!(first, second);
        assert!(!temp_path(&sidecar).exists());
    }

    /// Simulates a crash between the temp write and the rename: a
    /// leftover temp file (from a process that died mid-`save`) must not
    /// disturb a previously committed sidecar, and the committed version
    /// must still load cleanly.
    #[tokio::test]
    async fn leftover_temp_from_a_crashed_write_does_not_corrupt_committed_journal() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("file.bin").into_std_path_buf();

        save(&serde_json::json!({"a": 1}), &local, "upload").await.unwrap();
        let sidecar = sidecar_path(&local, "upload");
        let committed = tokio::fs::read(&sidecar).await.unwrap();

        // Simulate the crash: a temp file is left behind mid-write, but the
        // rename that would have replaced the sidecar never happened.
        let tmp = temp_path(&sidecar);
        tokio::fs::write(&tmp, b"{ truncated garbage from a killed proc").await.unwrap();

        let loaded: Option<serde_json::Value> = load(&local, "upload").await.unwrap();
        assert_eq!(loaded.unwrap()["a"], 1);
        let still_committed = tokio::fs::read(&sidecar).await.unwrap();
        assert_eq!(still_committed, committed);

        // A subsequent successful save still replaces the temp cleanly.
        save(&serde_json::json!({"a": 2}), &local, "upload").await.unwrap();
        assert!(!tmp.exists());
        let reloaded: Option<serde_json::Value> = load(&local, "upload").await.unwrap();
        assert_eq!(reloaded.unwrap()["a"], 2);
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("file.bin").into_std_path_buf();
        delete(&local, "upload").await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_directory_removes_stale_entries_only() {
        let dir = tempdir().unwrap();
        let fresh_local = dir.path().join("fresh.bin").into_std_path_buf();
        let stale_local = dir.path().join("stale.bin").into_std_path_buf();

        #[derive(serde::Serialize)]
        struct J {
            created_at: u64,
        }
        save(&J { created_at: now_unix() }, &fresh_local, "upload").await.unwrap();
        save(
            &J {
                created_at: now_unix() - MAX_JOURNAL_AGE.as_secs() - 10,
            },
            &stale_local,
            "upload",
        )
        .await
        .unwrap();

        let removed = cleanup_directory(dir.path().as_std_path(), "upload", |bytes| {
            let v: serde_json::Value = serde_json::from_slice(bytes).ok()?;
            Some((v["created_at"].as_u64()?, None))
        })
        .await
        .unwrap();

        assert_eq!(removed, 1);
        assert!(sidecar_path(&fresh_local, "upload").exists());
        assert!(!sidecar_path(&stale_local, "upload").exists());
    }
}
