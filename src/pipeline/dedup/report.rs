use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary of one finished deduplication run, persisted as JSON on the loan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupReport {
    pub loan_id: Uuid,
    pub documents: usize,
    /// Documents flagged for manual review (unreadable or unrenderable).
    pub unreadable: usize,
    /// Documents (re)fingerprinted during this run.
    pub fingerprinted: usize,
    pub jobs_queued: usize,
    pub jobs_succeeded: usize,
    pub jobs_retried: usize,
    pub jobs_failed: usize,
    pub extraction_succeeded: usize,
    pub extraction_failed: usize,
    pub duplicate_clusters: usize,
    pub duplicates: usize,
    pub version_groups: usize,
    pub ambiguous_groups: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStage {
    Fingerprinting,
    Extracting,
    Resolving,
    Completed,
}

/// Progress notification emitted while a run advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupProgressEvent {
    pub loan_id: Uuid,
    pub stage: DedupStage,
    pub completed: usize,
    pub total: usize,
}
