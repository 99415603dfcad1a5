//! Shared retry-and-refresh wrapper: full-jitter exponential backoff over
//! `tokio::time::sleep`, an error classifier, and an optional
//! credential-refresh hook invoked before the next attempt on auth errors.
//! Hand-rolled because the teacher has no retry-wrapper crate of its own
//! (`rand` is already a teacher workspace dependency; no other retry crate
//! appears anywhere in the pack).
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::TransferError;

/// Runs `op` under the retry policy in `config`. `refresh_credentials` is
/// called (and awaited) once before a retried attempt if the failing
/// attempt classified as a credential error; its own failure is logged but
/// does not abort the retry (the next attempt simply reuses stale
/// credentials and may fail again, exhausting attempts normally).
pub async fn with_retry<T, F, Fut, R, RFut>(
    config: &EngineConfig,
    cancel: &CancellationToken,
    mut op: F,
    mut refresh_credentials: R,
) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
    R: FnMut() -> RFut,
    RFut: Future<Output = anyhow::Result<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let result = op(attempt).await;
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt + 1 >= config.max_retry_attempts {
            return Err(err);
        }

        if matches!(err.class(), crate::error::ErrorClass::Credential) {
            if let Err(refresh_err) = refresh_credentials().await {
                warn!(%refresh_err, "credential refresh before retry failed");
            }
        }

        let delay = backoff_delay(config, attempt);
        debug!(attempt, ?delay, %err, "retrying after backoff");

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

/// Full-jitter exponential backoff: `random(0, min(max_delay, initial *
/// 2^attempt))`, matching the AWS-recommended jitter strategy.
fn backoff_delay(config: &EngineConfig, attempt: u32) -> Duration {
    let initial = config.retry_initial_delay();
    let max = config.retry_max_delay();
    let factor = 1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX);
    let exp = initial.saturating_mul(factor);
    let capped = exp.min(max);
    if capped.is_zero() {
        return capped;
    }
    let jittered_millis = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
    Duration::from_millis(jittered_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_ok() {
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, TransferError> = with_retry(
            &config,
            &cancel,
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42u32) }
            },
            || async { Ok(()) },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let mut config = EngineConfig::default();
        config.retry_initial_delay_ms = 1;
        config.retry_max_delay_ms = 2;
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, TransferError> = with_retry(
            &config,
            &cancel,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(TransferError::Transient(anyhow::anyhow!("flaky")))
                    } else {
                        Ok(7u32)
                    }
                }
            },
            || async { Ok(()) },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_fatal_errors() {
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, TransferError> = with_retry(
            &config,
            &cancel,
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransferError::Fatal("bad state".into())) }
            },
            || async { Ok(()) },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn credential_errors_invoke_refresh_hook_before_retry() {
        let mut config = EngineConfig::default();
        config.retry_initial_delay_ms = 1;
        config.retry_max_delay_ms = 2;
        let cancel = CancellationToken::new();
        let refreshes = AtomicU32::new(0);
        let result: Result<u32, TransferError> = with_retry(
            &config,
            &cancel,
            |attempt| async move {
                if attempt == 0 {
                    Err(TransferError::Credential {
                        storage_id: "s1".into(),
                        source: anyhow::anyhow!("expired"),
                    })
                } else {
                    Ok(1u32)
                }
            },
            || {
                refreshes.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_short_circuits() {
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u32, TransferError> =
            with_retry(&config, &cancel, |_| async { Ok(1u32) }, || async { Ok(()) }).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }
}
