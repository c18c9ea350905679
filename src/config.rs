use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Application-level constants
pub const APP_NAME: &str = "Loanprint";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix for environment overrides (`LOANPRINT_WORKER_COUNT=30`).
const ENV_PREFIX: &str = "LOANPRINT_";

/// Floor for the stale-run lease; runs heartbeat far more often than this.
const MIN_RUN_LEASE_SECS: u64 = 60;

/// Get the application data directory
/// ~/.loanprint/ on all platforms, falling back to the working directory.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".loanprint")
}

/// Default SQLite database location
pub fn database_path() -> PathBuf {
    app_data_dir().join("loanprint.db")
}

/// Default tracing filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,loanprint_lib=info,pdfium_render=warn,reqwest=warn"
}

/// Tunables for a deduplication run.
///
/// The Hamming threshold and the page-majority ratio are calibration values
/// rather than fixed constants: override them per deployment once validation
/// data is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Extraction worker pool size (network-bound).
    pub worker_count: usize,
    /// Fingerprint/probe fan-out (CPU-bound).
    pub fingerprint_workers: usize,
    /// Pages per extractor call on the first attempt.
    pub page_batch_size: usize,
    /// Pages per extractor call on retry.
    pub retry_page_batch_size: usize,
    /// DPI for page images sent to the extractor on the first attempt.
    pub render_dpi: u32,
    /// DPI for page images on retry.
    pub retry_render_dpi: u32,
    /// DPI used when rasterizing pages for perceptual hashing.
    pub fingerprint_dpi: u32,
    pub request_timeout_secs: u64,
    pub retry_timeout_secs: u64,
    /// Attempts per job, first try included.
    pub max_attempts: u32,
    /// Below this many extracted characters per page a document counts as scanned.
    pub min_chars_per_page: usize,
    /// Maximum phash Hamming distance (bits) for two pages to match.
    pub phash_threshold: u32,
    /// Fraction of compared pages that must match; compared strictly (`>`).
    pub page_match_ratio: f64,
    /// Side length of the perceptual hash grid (8 → 64-bit hashes).
    pub hash_size: u32,
    pub extractor_url: String,
    pub extractor_model: String,
    /// A `running` loan whose heartbeat is older than this is treated as
    /// abandoned by a crashed process.
    pub stale_run_lease_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            worker_count: 24,
            fingerprint_workers: num_cpus::get().max(1),
            page_batch_size: 3,
            retry_page_batch_size: 1,
            render_dpi: 150,
            retry_render_dpi: 100,
            fingerprint_dpi: 72,
            request_timeout_secs: 120,
            retry_timeout_secs: 240,
            max_attempts: 2,
            min_chars_per_page: 40,
            phash_threshold: 10,
            page_match_ratio: 0.5,
            hash_size: 8,
            extractor_url: "http://localhost:8088".into(),
            extractor_model: "loan-docs-v1".into(),
            stale_run_lease_secs: 600,
        }
    }
}

impl DedupConfig {
    /// Defaults overlaid with `LOANPRINT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (testable without touching the process env).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        override_parsed(&mut config.worker_count, "WORKER_COUNT", get("WORKER_COUNT"));
        override_parsed(
            &mut config.fingerprint_workers,
            "FINGERPRINT_WORKERS",
            get("FINGERPRINT_WORKERS"),
        );
        override_parsed(&mut config.page_batch_size, "PAGE_BATCH_SIZE", get("PAGE_BATCH_SIZE"));
        override_parsed(
            &mut config.retry_page_batch_size,
            "RETRY_PAGE_BATCH_SIZE",
            get("RETRY_PAGE_BATCH_SIZE"),
        );
        override_parsed(&mut config.render_dpi, "RENDER_DPI", get("RENDER_DPI"));
        override_parsed(&mut config.retry_render_dpi, "RETRY_RENDER_DPI", get("RETRY_RENDER_DPI"));
        override_parsed(&mut config.fingerprint_dpi, "FINGERPRINT_DPI", get("FINGERPRINT_DPI"));
        override_parsed(
            &mut config.request_timeout_secs,
            "REQUEST_TIMEOUT_SECS",
            get("REQUEST_TIMEOUT_SECS"),
        );
        override_parsed(
            &mut config.retry_timeout_secs,
            "RETRY_TIMEOUT_SECS",
            get("RETRY_TIMEOUT_SECS"),
        );
        override_parsed(&mut config.max_attempts, "MAX_ATTEMPTS", get("MAX_ATTEMPTS"));
        override_parsed(
            &mut config.min_chars_per_page,
            "MIN_CHARS_PER_PAGE",
            get("MIN_CHARS_PER_PAGE"),
        );
        override_parsed(&mut config.phash_threshold, "PHASH_THRESHOLD", get("PHASH_THRESHOLD"));
        override_parsed(&mut config.page_match_ratio, "PAGE_MATCH_RATIO", get("PAGE_MATCH_RATIO"));
        override_parsed(&mut config.hash_size, "HASH_SIZE", get("HASH_SIZE"));
        override_parsed(
            &mut config.stale_run_lease_secs,
            "STALE_RUN_LEASE_SECS",
            get("STALE_RUN_LEASE_SECS"),
        );

        if let Some(url) = get("EXTRACTOR_URL") {
            config.extractor_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("EXTRACTOR_MODEL") {
            config.extractor_model = model;
        }

        config.sanitized()
    }

    /// Clamp values that would stall or break a run.
    pub fn sanitized(mut self) -> Self {
        self.worker_count = self.worker_count.max(1);
        self.fingerprint_workers = self.fingerprint_workers.max(1);
        self.page_batch_size = self.page_batch_size.max(1);
        self.retry_page_batch_size = self.retry_page_batch_size.clamp(1, self.page_batch_size);
        self.max_attempts = self.max_attempts.max(1);
        self.hash_size = self.hash_size.clamp(4, 32);
        self.page_match_ratio = self.page_match_ratio.clamp(0.0, 1.0);
        self.stale_run_lease_secs = self.stale_run_lease_secs.max(MIN_RUN_LEASE_SECS);
        self
    }

    pub fn stale_run_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_run_lease_secs as i64)
    }
}

fn override_parsed<T: FromStr>(slot: &mut T, name: &str, raw: Option<String>) {
    let Some(raw) = raw else { return };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(
            variable = %format!("{ENV_PREFIX}{name}"),
            value = %raw,
            "Ignoring unparseable configuration override"
        ),
    }
}
