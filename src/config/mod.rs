use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Upload and processing configuration
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Directory holding merged artifacts (default: "./data/uploads")
    pub upload_dir: PathBuf,

    /// Directory holding per-upload chunk staging dirs (default: "./data/tmp")
    pub temp_dir: PathBuf,

    /// Maximum declared total size in bytes (default: 50 MB)
    pub max_file_size: u64,

    /// Lowercase extensions accepted at chunk-save time (default: txt, epub, pdf)
    pub allowed_extensions: Vec<String>,

    /// Number of tasks allowed to run at the same time (default: 4)
    pub worker_count: usize,

    /// Retry budget handed to every processing task (default: 3)
    pub max_retries: u32,

    /// First retry delay, doubled per failure (default: 200 ms)
    pub retry_base_delay_ms: u64,

    /// Upper bound for the retry delay (default: 5 s)
    pub retry_max_delay_ms: u64,

    /// Capacity of the progress broadcast ring (default: 1024)
    pub progress_buffer: usize,

    /// Chunk staging dirs untouched for this long are swept (default: 24)
    pub staging_cleanup_age_hours: u64,

    /// How long COMPLETED/FAILED outcomes stay queryable (default: 1 hour)
    pub outcome_retention_secs: u64,

    /// Interval between maintenance sweeps (default: 1 hour)
    pub maintenance_interval_secs: u64,

    /// Number of characters kept in a generated text preview (default: 2000)
    pub preview_chars: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./data/uploads"),
            temp_dir: PathBuf::from("./data/tmp"),
            max_file_size: 50 * 1024 * 1024, // 50 MB
            allowed_extensions: vec!["txt".to_string(), "epub".to_string(), "pdf".to_string()],
            worker_count: 4,
            max_retries: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            progress_buffer: 1024,
            staging_cleanup_age_hours: 24,
            outcome_retention_secs: 3600,
            maintenance_interval_secs: 3600,
            preview_chars: 2000,
        }
    }
}

impl UploadConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.upload_dir),

            temp_dir: env::var("UPLOAD_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.temp_dir),

            max_file_size: parse_var("MAX_FILE_SIZE").unwrap_or(default.max_file_size),

            allowed_extensions: env::var("ALLOWED_EXTENSIONS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().trim_start_matches('.').to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(default.allowed_extensions),

            worker_count: parse_var("WORKER_COUNT")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.worker_count),

            max_retries: parse_var("MAX_RETRIES").unwrap_or(default.max_retries),

            retry_base_delay_ms: parse_var("RETRY_BASE_DELAY_MS")
                .unwrap_or(default.retry_base_delay_ms),

            retry_max_delay_ms: parse_var("RETRY_MAX_DELAY_MS")
                .unwrap_or(default.retry_max_delay_ms),

            progress_buffer: parse_var("PROGRESS_BUFFER")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.progress_buffer),

            staging_cleanup_age_hours: parse_var("STAGING_CLEANUP_AGE_HOURS")
                .unwrap_or(default.staging_cleanup_age_hours),

            outcome_retention_secs: parse_var("OUTCOME_RETENTION_SECS")
                .unwrap_or(default.outcome_retention_secs),

            maintenance_interval_secs: parse_var("MAINTENANCE_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .unwrap_or(default.maintenance_interval_secs),

            preview_chars: parse_var("PREVIEW_CHARS").unwrap_or(default.preview_chars),
        }
    }

    /// Config for local development and tests: no retry delay, frequent sweeps
    pub fn development() -> Self {
        Self {
            worker_count: 2,
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 0,
            maintenance_interval_secs: 60,
            ..Self::default()
        }
    }

    /// Delay before re-enqueueing a task that has failed `failures` times.
    /// Doubles from `retry_base_delay_ms` and is capped at `retry_max_delay_ms`.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn staging_max_age(&self) -> Duration {
        Duration::from_secs(self.staging_cleanup_age_hours * 3600)
    }

    pub fn outcome_retention(&self) -> Duration {
        Duration::from_secs(self.outcome_retention_secs)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
