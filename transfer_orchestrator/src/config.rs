//! Engine-wide tunables, loaded from TOML the way the teacher's
//! `RemoteStorageConfig::from_toml` parses its own config section.
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_worker_pool_cap() -> usize {
    resource_budget::DEFAULT_MAX_WORKERS_PER_TRANSFER
}

fn default_credential_ttl_secs() -> u64 {
    credential_cache::DEFAULT_TTL.as_secs()
}

fn default_journal_max_age_secs() -> u64 {
    resume_journal::MAX_JOURNAL_AGE.as_secs()
}

fn default_multipart_threshold() -> u64 {
    remote_storage::DEFAULT_MULTIPART_THRESHOLD
}

fn default_min_part_size() -> u64 {
    remote_storage::DEFAULT_MIN_PART_SIZE
}

fn default_download_chunk_size() -> u64 {
    remote_storage::DEFAULT_DOWNLOAD_CHUNK_SIZE
}

fn default_ciphertext_channel_capacity() -> usize {
    3
}

fn default_journal_save_divisor() -> u64 {
    4
}

fn default_min_journal_save_interval() -> u64 {
    5
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_retry_initial_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_per_part_timeout_secs() -> u64 {
    10 * 60
}

fn default_credential_api_timeout_secs() -> u64 {
    5
}

fn default_progress_publish_interval_ms() -> u64 {
    300
}

fn default_large_file_threshold() -> u64 {
    credential_cache::LARGE_FILE_THRESHOLD
}

fn default_download_safety_margin() -> f64 {
    integrity::DOWNLOAD_SAFETY_MARGIN
}

fn default_upload_safety_margin() -> f64 {
    integrity::UPLOAD_TEMP_SAFETY_MARGIN
}

/// Every numeric default named across the component design sections,
/// gathered into one serde-deserializable struct so a caller can tune the
/// whole engine from a single TOML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(default = "default_worker_pool_cap")]
    pub max_workers_per_transfer: usize,
    #[serde(default = "default_credential_ttl_secs")]
    pub credential_ttl_secs: u64,
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold_bytes: u64,
    #[serde(default = "default_journal_max_age_secs")]
    pub journal_max_age_secs: u64,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    /// Floor passed to `remote_storage::part_size_for_with_min` when
    /// chunking a streaming upload. Kept overridable (rather than hardcoded
    /// at the 8 MiB production default) so tests can exercise multi-part
    /// chunking against a file too small to reach several 8 MiB parts.
    #[serde(default = "default_min_part_size")]
    pub min_part_size_bytes: u64,
    #[serde(default = "default_download_chunk_size")]
    pub download_chunk_size_bytes: u64,
    #[serde(default = "default_ciphertext_channel_capacity")]
    pub ciphertext_channel_capacity: usize,
    #[serde(default = "default_min_journal_save_interval")]
    pub min_journal_save_interval: u64,
    #[serde(default = "default_journal_save_divisor")]
    pub journal_save_divisor: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_per_part_timeout_secs")]
    pub per_part_timeout_secs: u64,
    #[serde(default = "default_credential_api_timeout_secs")]
    pub credential_api_timeout_secs: u64,
    #[serde(default = "default_progress_publish_interval_ms")]
    pub progress_publish_interval_ms: u64,
    #[serde(default = "default_download_safety_margin")]
    pub download_safety_margin: f64,
    #[serde(default = "default_upload_safety_margin")]
    pub upload_temp_safety_margin: f64,
    #[serde(default)]
    pub skip_checksum: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers_per_transfer: default_worker_pool_cap(),
            credential_ttl_secs: default_credential_ttl_secs(),
            large_file_threshold_bytes: default_large_file_threshold(),
            journal_max_age_secs: default_journal_max_age_secs(),
            multipart_threshold_bytes: default_multipart_threshold(),
            min_part_size_bytes: default_min_part_size(),
            download_chunk_size_bytes: default_download_chunk_size(),
            ciphertext_channel_capacity: default_ciphertext_channel_capacity(),
            min_journal_save_interval: default_min_journal_save_interval(),
            journal_save_divisor: default_journal_save_divisor(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            per_part_timeout_secs: default_per_part_timeout_secs(),
            credential_api_timeout_secs: default_credential_api_timeout_secs(),
            progress_publish_interval_ms: default_progress_publish_interval_ms(),
            download_safety_margin: default_download_safety_margin(),
            upload_temp_safety_margin: default_upload_safety_margin(),
            skip_checksum: false,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(input: &str) -> anyhow::Result<Self> {
        let doc = input.parse::<toml_edit::DocumentMut>()?;
        let value = toml_edit::de::from_document(doc)?;
        Ok(value)
    }

    pub fn per_part_timeout(&self) -> Duration {
        Duration::from_secs(self.per_part_timeout_secs)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Journal writes are capped to this many parts apart, bounding I/O
    /// amplification on very large uploads.
    pub fn journal_save_interval(&self, total_parts: u64) -> u64 {
        self.min_journal_save_interval.max(total_parts / self.journal_save_divisor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_retry_attempts, 5);
        assert_eq!(cfg.retry_initial_delay_ms, 1_000);
        assert_eq!(cfg.retry_max_delay_ms, 30_000);
        assert_eq!(cfg.credential_ttl_secs, 600);
        assert_eq!(cfg.large_file_threshold_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(cfg.multipart_threshold_bytes, 100 * 1024 * 1024);
        assert_eq!(cfg.min_part_size_bytes, 8 * 1024 * 1024);
        assert_eq!(cfg.download_chunk_size_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn journal_save_interval_has_floor_of_five() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.journal_save_interval(4), 5);
        assert_eq!(cfg.journal_save_interval(40), 10);
    }

    #[test]
    fn from_toml_overrides_selected_fields() {
        let cfg = EngineConfig::from_toml("max_retry_attempts = 8\nskip_checksum = true\n").unwrap();
        assert_eq!(cfg.max_retry_attempts, 8);
        assert!(cfg.skip_checksum);
        assert_eq!(cfg.retry_initial_delay_ms, 1_000);
    }
}
