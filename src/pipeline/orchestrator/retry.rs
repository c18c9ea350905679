//! Retry policy: how many attempts a job gets and what each attempt uses.

use std::sync::Arc;
use std::time::Duration;

use super::job::{batch_pages, ExtractionJob, JobIds, JobStatus};
use crate::config::DedupConfig;

/// Render and transport parameters for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptParams {
    pub dpi: u32,
    pub batch_size: usize,
    pub timeout: Duration,
}

/// Bounded, per-job retry with degraded parameters.
///
/// Attempt 1 uses the base parameters; every later attempt uses the retry
/// parameters (lower DPI, smaller batch, longer timeout). A retried job is
/// split into batches of the retry size; each split job inherits the
/// attempt count, so retries never compound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: AttemptParams,
    pub retry: AttemptParams,
}

impl RetryPolicy {
    pub fn from_config(config: &DedupConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: AttemptParams {
                dpi: config.render_dpi,
                batch_size: config.page_batch_size.max(1),
                timeout: Duration::from_secs(config.request_timeout_secs),
            },
            retry: AttemptParams {
                dpi: config.retry_render_dpi,
                batch_size: config.retry_page_batch_size.max(1),
                timeout: Duration::from_secs(config.retry_timeout_secs),
            },
        }
    }

    pub fn params_for(&self, attempt: u32) -> AttemptParams {
        if attempt <= 1 {
            self.base
        } else {
            self.retry
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Jobs replacing a failed job, or empty once the budget is spent.
    pub fn retry_jobs(&self, failed: &ExtractionJob, ids: &mut JobIds) -> Vec<ExtractionJob> {
        if !self.should_retry(failed.attempt) {
            return Vec::new();
        }
        let attempt = failed.attempt + 1;
        batch_pages(&failed.pages, self.params_for(attempt).batch_size)
            .into_iter()
            .map(|pages| ExtractionJob {
                id: ids.next(),
                source: Arc::clone(&failed.source),
                attempt,
                pages,
                status: JobStatus::Queued,
            })
            .collect()
    }
}
